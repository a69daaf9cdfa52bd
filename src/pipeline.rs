//! # Per-contig processing pipeline
//!
//! The main work of the tool happens here. One worker runs per contig,
//! dispatched through a bounded rayon pool; each worker filters, tags,
//! and deduplicates the reads of its contig into a shard BAM plus a shard
//! expression table. With UMIs enabled a worker makes a second pass over
//! its shard after UMI correction. At the end the shards are spliced into
//! the final BAM, the expression shards are concatenated, and the metrics
//! file is written.
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rust_htslib::bam::{self, Read as _, Record};

use crate::annotation::index::GeneIndex;
use crate::annotation::tagger::{AnnoVersion, GeneTagger};
use crate::bam::cat;
use crate::bam::io as bamio;
use crate::bam::record::{
    dedup_marker, get_int_tag, get_str_tag, is_duplicate, is_qc_fail, parse_qname,
    qname_fields_to_tags, set_duplicate, set_qc_fail, update_str_tag, BARCODE_TAG, GENE_TAG,
    HIT_INDEX_TAG, UMI_CORRECTED_TAG, UMI_TAG,
};
use crate::matrix;
use crate::saturation::Saturation;
use crate::umi::{dedup_umis, UmiConfig, UmiCorrections, UmiHistogram, UmiMetrics, KEY_SEP, NO_GENE};

/// Contigs that never carry usable reads and are skipped in per-contig
/// mode.
const EXCLUDE_REFS: [&str; 7] = ["chrGL", "chrNC", "chrhs", "random", "chrU", "chrEK", "chrAQ"];
/// Above this contig count the per-contig fan-out costs more than it
/// gains and a single whole-file worker takes over.
const EXCESS_CONTIGS_NUM: usize = 10_000;
const WHOLE_CONTIG: &str = "whole";

/// (total, filtered, annotated, unique) counts of one worker.
type Stats = (u64, u64, u64, u64);

/// Everything the run needs, assembled by the command line front-end.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_bams: Vec<PathBuf>,
    pub output_bam: PathBuf,
    pub annotation_file: PathBuf,
    pub metrics_file: PathBuf,
    pub exp_file: PathBuf,
    pub mapping_quality_threshold: u8,
    pub save_lq: bool,
    pub save_dup: bool,
    pub anno_version: AnnoVersion,
    pub umi: UmiConfig,
    pub sat_file: Option<PathBuf>,
    pub filter_matrix: bool,
    pub cpu_cores: usize,
    pub scrna: bool,
}

pub struct Pipeline {
    config: PipelineConfig,
    tmp_bam_path: PathBuf,
    tmp_exp_path: PathBuf,
    umi_metrics: UmiMetrics,
    saturation: Option<Saturation>,
    umi_len: usize,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.tmp_bam_path);
        let _ = fs::remove_dir_all(&self.tmp_exp_path);
    }
}

enum ReadSource {
    Contig(bam::IndexedReader),
    Whole(bam::Reader),
}

impl ReadSource {
    /// Open `input` for this worker. In per-contig mode the reader is
    /// positioned on `ctg`; inputs that do not know the contig yield
    /// `None`.
    fn open(input: &Path, ctg: &str, whole: bool) -> Result<Option<ReadSource>> {
        if whole {
            return Ok(Some(ReadSource::Whole(bamio::open_sequential(input)?)));
        }
        let mut reader = bamio::open_indexed(input)?;
        let Some(tid) = reader.header().tid(ctg.as_bytes()) else {
            return Ok(None);
        };
        if let Err(e) = reader.fetch(tid as i32) {
            debug!("no reads for ref {ctg}: {e}");
            return Ok(None);
        }
        Ok(Some(ReadSource::Contig(reader)))
    }

    fn read_into(&mut self, record: &mut Record) -> Option<rust_htslib::errors::Result<()>> {
        match self {
            ReadSource::Contig(reader) => reader.read(record),
            ReadSource::Whole(reader) => reader.read(record),
        }
    }

    fn header(&self) -> &bam::HeaderView {
        match self {
            ReadSource::Contig(reader) => reader.header(),
            ReadSource::Whole(reader) => reader.header(),
        }
    }
}

impl Pipeline {
    /// Set up the run: shard directories next to the output BAM and the
    /// saturation accumulator matching the barcode technology.
    pub fn new(config: PipelineConfig) -> Result<Pipeline> {
        let parent = config
            .output_bam
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let tmp_bam_path = parent.join("_bam");
        let tmp_exp_path = parent.join("_exp");
        fs::create_dir_all(&tmp_bam_path)
            .with_context(|| format!("Failed to create {}", tmp_bam_path.display()))?;
        fs::create_dir_all(&tmp_exp_path)
            .with_context(|| format!("Failed to create {}", tmp_exp_path.display()))?;

        let saturation = config.sat_file.as_ref().map(|_| {
            if config.scrna {
                Saturation::sequence()
            } else {
                Saturation::coordinate()
            }
        });

        Ok(Pipeline {
            config,
            tmp_bam_path,
            tmp_exp_path,
            umi_metrics: UmiMetrics::default(),
            saturation,
            umi_len: 0,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let index = GeneIndex::from_annotation(&self.config.annotation_file)?;
        let tagger = GeneTagger::new(index, self.config.anno_version);

        // All inputs must agree on the contig table of the first one.
        let contigs = bamio::contigs_of(&self.config.input_bams[0])?;
        for input in &self.config.input_bams[1..] {
            if bamio::contigs_of(input)? != contigs {
                bail!(
                    "Different header of bam files: {} {}",
                    self.config.input_bams[0].display(),
                    input.display()
                );
            }
        }
        debug!("bam contigs num: {}", contigs.len());

        self.probe_barcode_layout()?;

        // Indexes are built once here so the per-contig workers never race
        // on index creation.
        if self.config.cpu_cores > 1 && contigs.len() <= EXCESS_CONTIGS_NUM {
            for input in &self.config.input_bams {
                bamio::ensure_index(input)?;
            }
        }

        info!("using threads num: {}", self.config.cpu_cores);
        let started = Instant::now();

        let contig_names: Vec<String> =
            if self.config.cpu_cores == 1 || contigs.len() > EXCESS_CONTIGS_NUM {
                vec![WHOLE_CONTIG.to_string()]
            } else {
                contigs
                    .iter()
                    .map(|(name, _)| name.clone())
                    .filter(|name| !EXCLUDE_REFS.contains(&name.as_str()))
                    .collect()
            };

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.cpu_cores)
            .build()
            .context("Failed to build worker thread pool")?;

        let this = &*self;
        let stats: Vec<Stats> = pool.install(|| {
            contig_names
                .par_iter()
                .map(|ctg| {
                    if this.config.umi.on {
                        this.process_contig_umi(ctg, &tagger)
                    } else {
                        this.process_contig(ctg, &tagger)
                    }
                })
                .collect::<Result<Vec<Stats>>>()
        })?;

        let mut total = 0u64;
        let mut filtered = 0u64;
        let mut annotated = 0u64;
        let mut unique = 0u64;
        for (t, f, a, u) in stats {
            total += t;
            filtered += f;
            annotated += a;
            unique += u;
        }
        info!("process time(s): {:.2}", started.elapsed().as_secs_f64());

        self.merge_shards(&contig_names)?;
        info!(
            "merge bam and gene expression file time(s): {:.2}",
            started.elapsed().as_secs_f64()
        );

        let rate = |part: u64, whole: u64| {
            if whole != 0 {
                (whole - part) as f64 * 100.0 / whole as f64
            } else {
                0.0
            }
        };
        let filter_rate = rate(filtered, total);
        let fail_annotate_rate = rate(annotated, filtered);
        let dup_rate = rate(unique, annotated);
        info!(
            "Total reads:{total} Pass filter reads:{filtered} Annotated reads:{annotated} Unique reads:{unique}"
        );
        info!("Failed filter rate:{filter_rate:.2}%");
        info!("Failed annotate rate:{fail_annotate_rate:.2}%");
        info!("Duplication rate:{dup_rate:.2}%");

        self.write_metrics(
            &tagger,
            total,
            filtered,
            annotated,
            unique,
            filter_rate,
            fail_annotate_rate,
            dup_rate,
        )?;

        if let (Some(saturation), Some(sat_file)) = (&self.saturation, &self.config.sat_file) {
            saturation.calculate_saturation(sat_file)?;
        }

        if self.config.scrna {
            matrix::transform_to_mtx(&self.config.exp_file, self.config.filter_matrix)?;
            info!("success transform expression table to matrix market file");
        }

        Ok(())
    }

    /// Probe the first record's qname for barcode and UMI fields. The UMI
    /// length bounds the mismatch-position metrics; a missing barcode, or
    /// a missing UMI with correction requested, aborts the run.
    fn probe_barcode_layout(&mut self) -> Result<()> {
        let input = &self.config.input_bams[0];
        let mut reader = bamio::open_sequential(input)?;
        let mut record = Record::new();
        let mut barcode_len = 0usize;
        let mut umi_len = 0usize;
        if let Some(result) = reader.read(&mut record) {
            result.with_context(|| format!("Faulty first record in {}", input.display()))?;
            let fields = parse_qname(&String::from_utf8_lossy(record.qname()));
            barcode_len = fields.barcode.len();
            umi_len = fields.umi.len();
        }

        if barcode_len == 0 {
            bail!("No barcode found in {}", input.display());
        }
        if umi_len != 0 {
            info!("barcode length:{barcode_len} umi length:{umi_len}");
        } else if self.config.umi.on {
            bail!("No umi found in {}", input.display());
        }
        self.umi_len = umi_len;
        Ok(())
    }

    /// Worker without UMIs: positional deduplication within the contig.
    fn process_contig(&self, ctg: &str, tagger: &GeneTagger) -> Result<Stats> {
        let started = Instant::now();
        let whole = ctg == WHOLE_CONTIG;
        let (mut total, mut filtered, mut annotated, mut unique) = (0u64, 0u64, 0u64, 0u64);

        let mut read_set: HashSet<String> = HashSet::new();
        let mut barcode_gene_exp: HashMap<String, u64> = HashMap::new();

        let shard_bam = self.tmp_bam_path.join(format!("{ctg}.bam"));
        let mut writer = bamio::open_writer_like(&shard_bam, &self.config.input_bams[0])?;

        for input in &self.config.input_bams {
            let Some(mut reader) = ReadSource::open(input, ctg, whole)? else {
                continue;
            };
            let mut record = Record::new();
            while let Some(result) = reader.read_into(&mut record) {
                result.with_context(|| format!("Faulty read in {}", input.display()))?;

                // Secondary hits were already counted by the aligner.
                if get_int_tag(&record, HIT_INDEX_TAG).is_some_and(|hi| hi != 1) {
                    continue;
                }
                total += 1;

                let fields = qname_fields_to_tags(&mut record);

                if record.mapq() < self.config.mapping_quality_threshold {
                    if self.config.save_lq {
                        set_qc_fail(&mut record);
                        writer.write(&record)?;
                    }
                    continue;
                }
                filtered += 1;

                if whole {
                    let name = bamio::ref_name(reader.header(), &record);
                    tagger.set_annotation(&mut record, &name);
                } else {
                    tagger.set_annotation(&mut record, ctg);
                }
                let Some(ge_value) = get_str_tag(&record, GENE_TAG) else {
                    writer.write(&record)?;
                    continue;
                };
                annotated += 1;

                let marker = format!("{}{}", dedup_marker(&record), fields.barcode);
                if read_set.contains(&marker) {
                    if self.config.save_dup {
                        set_duplicate(&mut record);
                        writer.write(&record)?;
                    }
                    continue;
                }
                read_set.insert(marker);
                unique += 1;

                *barcode_gene_exp
                    .entry(format!("{}\t{}", fields.barcode, ge_value))
                    .or_insert(0) += 1;

                writer.write(&record)?;
            }
        }
        drop(writer);

        if !barcode_gene_exp.is_empty() {
            let exp_path = self.tmp_exp_path.join(format!("{ctg}.txt"));
            let mut out = BufWriter::new(
                File::create(&exp_path)
                    .with_context(|| format!("Error opening file: {}", exp_path.display()))?,
            );
            for (key, count) in &barcode_gene_exp {
                writeln!(out, "{key}\t{count}")?;
            }
        }

        info!(
            "chr:{ctg} total:{total} filtered:{filtered} annotated:{annotated} unique:{unique} time(s):{:.2}",
            started.elapsed().as_secs_f64()
        );
        Ok((total, filtered, annotated, unique))
    }

    /// Worker with UMIs: two passes. The first pass tags reads, builds the
    /// per-(barcode, gene) UMI histograms, and drops exact UMI duplicates;
    /// after UMI correction the second pass re-reads the shard, demotes
    /// reads whose UMI was merged away, and tallies the final counts.
    fn process_contig_umi(&self, ctg: &str, tagger: &GeneTagger) -> Result<Stats> {
        let started = Instant::now();
        let whole = ctg == WHOLE_CONTIG;
        let (mut total, mut filtered, mut annotated) = (0u64, 0u64, 0u64);
        let mut unique = 0i64;

        let mut umi_histogram = UmiHistogram::new();

        for (index, input) in self.config.input_bams.iter().enumerate() {
            let Some(mut reader) = ReadSource::open(input, ctg, whole)? else {
                continue;
            };
            let shard_bam = self.tmp_bam_path.join(format!("{ctg}_{}.bam", index + 1));
            let mut writer = bamio::open_writer(&shard_bam, reader.header())?;

            let mut record = Record::new();
            while let Some(result) = reader.read_into(&mut record) {
                result.with_context(|| format!("Faulty read in {}", input.display()))?;

                if get_int_tag(&record, HIT_INDEX_TAG).is_some_and(|hi| hi != 1) {
                    continue;
                }
                total += 1;

                let fields = qname_fields_to_tags(&mut record);

                if record.mapq() < self.config.mapping_quality_threshold {
                    // Still counted towards sequencing saturation.
                    bump_umi(&mut umi_histogram, &fields.barcode, NO_GENE, &fields.umi);
                    if self.config.save_lq {
                        set_qc_fail(&mut record);
                        writer.write(&record)?;
                    }
                    continue;
                }
                filtered += 1;

                // UMIs with undetermined bases cannot be corrected.
                if fields.umi.contains('N') {
                    continue;
                }

                if whole {
                    let name = bamio::ref_name(reader.header(), &record);
                    tagger.set_annotation(&mut record, &name);
                } else {
                    tagger.set_annotation(&mut record, ctg);
                }

                if let Some(ge_value) = get_str_tag(&record, GENE_TAG) {
                    annotated += 1;
                    let count =
                        bump_umi(&mut umi_histogram, &fields.barcode, &ge_value, &fields.umi);
                    if count > 1 {
                        if self.config.save_dup {
                            set_duplicate(&mut record);
                        } else {
                            continue;
                        }
                    } else {
                        unique += 1;
                    }
                } else {
                    // No gene: kept in the output and counted for
                    // saturation, but never deduplicated or corrected.
                    bump_umi(&mut umi_histogram, &fields.barcode, NO_GENE, &fields.umi);
                }

                writer.write(&record)?;
            }
        }

        if total == 0 {
            info!(
                "chr:{ctg} total:{total} filtered:{filtered} annotated:{annotated} unique:{unique} time(s):{:.2}",
                started.elapsed().as_secs_f64()
            );
            return Ok((total, filtered, annotated, 0));
        }

        let mut corrections = UmiCorrections::new();
        dedup_umis(
            &mut umi_histogram,
            &mut corrections,
            &self.config.umi,
            &self.umi_metrics,
        );

        let mut barcode_gene_exp: HashMap<String, (u64, u64)> = HashMap::new();
        let final_shard = self.tmp_bam_path.join(format!("{ctg}.bam"));
        let mut writer = bamio::open_writer_like(&final_shard, &self.config.input_bams[0])?;

        for index in 1..=self.config.input_bams.len() {
            let shard_bam = self.tmp_bam_path.join(format!("{ctg}_{index}.bam"));
            if !shard_bam.exists() {
                continue;
            }
            let mut reader = bamio::open_sequential(&shard_bam)?;
            let mut record = Record::new();
            while let Some(result) = reader.read(&mut record) {
                result.with_context(|| format!("Faulty read in {}", shard_bam.display()))?;

                if (self.config.save_lq && is_qc_fail(&record))
                    || (self.config.save_dup && is_duplicate(&record))
                {
                    writer.write(&record)?;
                    continue;
                }

                let barcode = get_str_tag(&record, BARCODE_TAG).unwrap_or_default();
                let umi = get_str_tag(&record, UMI_TAG).unwrap_or_default();

                if let Some(ge_value) = get_str_tag(&record, GENE_TAG) {
                    let key = format!("{barcode}{KEY_SEP}{ge_value}");
                    let count = umi_histogram
                        .get(&key)
                        .and_then(|umis| umis.get(&umi))
                        .copied()
                        .unwrap_or(0);
                    if count == 0 {
                        unique -= 1;
                        if self.config.save_dup {
                            if let Some(correct) =
                                corrections.get(&key).and_then(|c| c.get(&umi))
                            {
                                update_str_tag(&mut record, UMI_CORRECTED_TAG, correct);
                            }
                            set_duplicate(&mut record);
                        } else {
                            continue;
                        }
                    } else {
                        let cell = barcode_gene_exp
                            .entry(format!("{barcode}\t{ge_value}"))
                            .or_insert((0, 0));
                        cell.0 += 1;
                        cell.1 += count;
                    }
                }

                writer.write(&record)?;
            }
        }
        drop(writer);

        if !barcode_gene_exp.is_empty() {
            let exp_path = self.tmp_exp_path.join(format!("{ctg}.txt"));
            let mut out = BufWriter::new(
                File::create(&exp_path)
                    .with_context(|| format!("Error opening file: {}", exp_path.display()))?,
            );
            for (key, (umi_count, read_count)) in &barcode_gene_exp {
                if self.config.scrna {
                    writeln!(out, "{key}\t{umi_count}\t{read_count}")?;
                } else {
                    writeln!(out, "{key}\t{umi_count}")?;
                }
            }
        }

        if let Some(saturation) = &self.saturation {
            saturation.add_data(&umi_histogram)?;
        }

        info!(
            "chr:{ctg} total:{total} filtered:{filtered} annotated:{annotated} unique:{unique} time(s):{:.2}",
            started.elapsed().as_secs_f64()
        );
        Ok((total, filtered, annotated, unique.max(0) as u64))
    }

    /// Splice the shard BAMs and concatenate the shard expression tables,
    /// both in contig order.
    fn merge_shards(&self, contig_names: &[String]) -> Result<()> {
        let mut bam_files: Vec<PathBuf> = Vec::new();
        let mut exp_out = BufWriter::new(File::create(&self.config.exp_file).with_context(
            || format!("Could not create {}", self.config.exp_file.display()),
        )?);
        for ctg in contig_names {
            let shard_bam = self.tmp_bam_path.join(format!("{ctg}.bam"));
            if shard_bam.exists() {
                bam_files.push(shard_bam);
            }
            let shard_exp = self.tmp_exp_path.join(format!("{ctg}.txt"));
            if shard_exp.exists() {
                let mut input = File::open(&shard_exp)?;
                io::copy(&mut input, &mut exp_out)?;
            }
        }
        exp_out.flush()?;

        cat::cat(&bam_files, &self.config.output_bam)?;
        info!("merge bam file success");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_metrics(
        &self,
        tagger: &GeneTagger,
        total: u64,
        filtered: u64,
        annotated: u64,
        unique: u64,
        filter_rate: f64,
        fail_annotate_rate: f64,
        dup_rate: f64,
    ) -> Result<()> {
        let mut out = String::new();
        out.push_str(
            "## FILTER & DEDUPLICATION METRICS\n\
             TOTAL_READS\tPASS_FILTER\tANNOTATED_READS\tUNIQUE_READS\tFAIL_FILTER_RATE\t\
             FAIL_ANNOTATE_RATE\tDUPLICATION_RATE\n",
        );
        let _ = writeln!(
            out,
            "{total}\t{filtered}\t{annotated}\t{unique}\t{filter_rate:.2}\t{fail_annotate_rate:.2}\t{dup_rate:.2}"
        );
        out.push_str(&tagger.dump_metrics());
        if self.config.umi.on {
            out.push_str(&self.umi_metrics.dump(self.umi_len));
        }

        fs::write(&self.config.metrics_file, out).with_context(|| {
            format!("Error opening file: {}", self.config.metrics_file.display())
        })?;
        info!(
            "success dump metrics file: {}",
            self.config.metrics_file.display()
        );
        Ok(())
    }
}

/// Increment the histogram count for (barcode, gene, umi) and return the
/// new count.
fn bump_umi(histogram: &mut UmiHistogram, barcode: &str, gene: &str, umi: &str) -> u64 {
    let count = histogram
        .entry(format!("{barcode}{KEY_SEP}{gene}"))
        .or_default()
        .entry(umi.to_string())
        .or_insert(0);
    *count += 1;
    *count
}

/// Run the whole pipeline with the given configuration.
pub fn run(config: PipelineConfig) -> Result<()> {
    let mut pipeline = Pipeline::new(config)?;
    pipeline.run()
}
