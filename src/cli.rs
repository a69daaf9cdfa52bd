//! # Command line interface
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::annotation::tagger::AnnoVersion;
use crate::pipeline::PipelineConfig;
use crate::umi::UmiConfig;
use crate::utils;

#[derive(Parser)]
#[command(
    name = "sctag",
    author,
    version,
    about = "Mapping quality filter, deduplication, gene annotation, and expression counting for barcoded BAMs",
    long_about = None
)]
pub struct Cli {
    /// Input bam filename or file list separated by comma
    #[arg(short = 'i', short_alias = 'I', required = true)]
    pub input: String,

    /// Output bam filename
    #[arg(short = 'o', short_alias = 'O', required = true)]
    pub output: PathBuf,

    /// Input annotation filename (.gtf or .gff)
    #[arg(short = 'a', short_alias = 'A', required = true)]
    pub annotation: PathBuf,

    /// Output summary filename
    #[arg(short = 's', short_alias = 'S', required = true)]
    pub summary: PathBuf,

    /// Output barcode gene expression filename
    #[arg(short = 'e', short_alias = 'E', required = true)]
    pub expression: PathBuf,

    /// Mapping quality threshold
    #[arg(short = 'q', short_alias = 'Q', default_value_t = 10)]
    pub quality: u8,

    /// Worker threads
    #[arg(short = 'c', short_alias = 'C', default_value_t = num_threads_default(), value_parser = threads_in_range)]
    pub cores: usize,

    /// Save low quality reads with the QC-fail flag set
    #[arg(long = "save_lq")]
    pub save_lq: bool,

    /// Save duplicate reads with the duplicate flag set
    #[arg(long = "save_dup")]
    pub save_dup: bool,

    /// Annotation policy: 0 and 1 are the strand-aware exon policies, 2 the base-count majority policy
    #[arg(long = "anno_mode", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub anno_mode: u8,

    /// Enable UMI correction
    #[arg(long = "umi_on")]
    pub umi_on: bool,

    /// Minimum UMI count in a (barcode, gene) group for correction
    #[arg(long = "umi_min_num", default_value_t = 5)]
    pub umi_min_num: usize,

    /// Maximum mismatch for merging two UMIs
    #[arg(long = "umi_mismatch", default_value_t = 1)]
    pub umi_mismatch: u32,

    /// Output sequencing saturation file
    #[arg(long = "sat_file", requires = "umi_on")]
    pub sat_file: Option<PathBuf>,

    /// Single-cell mode: read counts in the expression table and a sparse matrix output
    #[arg(long, visible_aliases = ["scRNA", "SCRNA"])]
    pub scrna: bool,

    /// Do not filter the gene expression matrix
    #[arg(long = "no_filter_matrix", requires = "scrna")]
    pub no_filter_matrix: bool,
}

fn num_threads_default() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn threads_in_range(s: &str) -> Result<usize> {
    let threads = s
        .parse()
        .context("Could not parse value passed to --cores to integer")?;
    if threads < 1 {
        bail!("worker threads must be at least 1");
    }
    Ok(threads)
}

impl Cli {
    /// Validate the input files and assemble the pipeline configuration.
    pub fn into_config(self) -> Result<PipelineConfig> {
        let input_bams: Vec<PathBuf> = utils::split_list(&self.input)
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if input_bams.is_empty() {
            bail!("Invalid parameter of -i: {}", self.input);
        }
        for input in &input_bams {
            if !input.exists() {
                bail!("Not exists bam file: {}", input.display());
            }
        }
        if !self.annotation.exists() {
            bail!("Not exists annotation file: {}", self.annotation.display());
        }

        Ok(PipelineConfig {
            input_bams,
            output_bam: self.output,
            annotation_file: self.annotation,
            metrics_file: self.summary,
            exp_file: self.expression,
            mapping_quality_threshold: self.quality,
            save_lq: self.save_lq,
            save_dup: self.save_dup,
            anno_version: AnnoVersion::from_mode(self.anno_mode),
            umi: UmiConfig {
                on: self.umi_on,
                min_num: self.umi_min_num,
                mismatch: self.umi_mismatch,
            },
            sat_file: self.sat_file,
            filter_matrix: !self.no_filter_matrix,
            cpu_cores: self.cores,
            scrna: self.scrna,
        })
    }
}
