//! # Expression matrix output
//!
//! Re-loads the merged `barcode\tgene\tumi[\treads]` table, optionally
//! drops ambient barcodes below the KDE threshold, and renders the result
//! as a gzipped MatrixMarket triplet plus barcode and gene name files.
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::Deserialize;

use crate::kde::{density_threshold, ThresholdKind};

const MTX_SEP: char = ' ';

/// One line of the merged expression table. The read count column only
/// exists in scrna mode.
#[derive(Debug, Deserialize)]
struct ExpressionRow {
    barcode: String,
    gene: String,
    umi_count: u64,
    #[serde(default)]
    read_count: Option<u64>,
}

type ExpressionData = BTreeMap<String, BTreeMap<String, (u64, u64)>>;

fn load_expression(exp_file: &Path) -> Result<ExpressionData> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .from_path(exp_file)
        .with_context(|| format!("Could not read expression file {}", exp_file.display()))?;

    let mut data = ExpressionData::new();
    for result in reader.deserialize() {
        let row: ExpressionRow = result.with_context(|| {
            format!("Failed to deserialize expression row in {}", exp_file.display())
        })?;
        let cell = data
            .entry(row.barcode)
            .or_default()
            .entry(row.gene)
            .or_insert((0, 0));
        cell.0 += row.umi_count;
        cell.1 += row.read_count.unwrap_or(0);
    }
    Ok(data)
}

/// Apply the KDE threshold to the per-barcode UMI totals and return the
/// barcodes below it.
fn ambient_barcodes(data: &ExpressionData) -> Result<HashSet<String>> {
    let mut totals: Vec<(&String, u64)> = Vec::with_capacity(data.len());
    for (barcode, genes) in data {
        totals.push((barcode, genes.values().map(|(umi, _)| umi).sum()));
    }
    let counts: Vec<f64> = totals.iter().map(|(_, count)| *count as f64).collect();

    let (min_barcode_frags, _) = density_threshold(&counts, ThresholdKind::Bead)?;
    info!("barcode threshold of filtering matrix: {min_barcode_frags}");

    Ok(totals
        .into_iter()
        .filter(|(_, count)| (*count as f64) < min_barcode_frags)
        .map(|(barcode, _)| barcode.clone())
        .collect())
}

fn write_expression(
    exp_file: &Path,
    data: &ExpressionData,
    discard: &HashSet<String>,
) -> Result<()> {
    let mut out: Box<dyn Write> = if exp_file.extension().is_some_and(|e| e == "gz") {
        Box::new(GzEncoder::new(
            BufWriter::new(File::create(exp_file)?),
            Compression::default(),
        ))
    } else {
        Box::new(BufWriter::new(File::create(exp_file)?))
    };

    for (barcode, genes) in data {
        if discard.contains(barcode) {
            continue;
        }
        for (gene, (umi_count, read_count)) in genes {
            if *read_count != 0 {
                writeln!(out, "{barcode}\t{gene}\t{umi_count}\t{read_count}")?;
            } else {
                writeln!(out, "{barcode}\t{gene}\t{umi_count}")?;
            }
        }
    }
    Ok(())
}

fn gz_writer(path: &Path) -> Result<GzEncoder<BufWriter<File>>> {
    Ok(GzEncoder::new(
        BufWriter::new(
            File::create(path).with_context(|| format!("Could not create {}", path.display()))?,
        ),
        Compression::default(),
    ))
}

/// Transform the merged expression table into a MatrixMarket triplet next
/// to it. With `filter_matrix` set, ambient barcodes are removed first and
/// the expression table itself is rewritten without them.
pub fn transform_to_mtx(exp_file: &Path, filter_matrix: bool) -> Result<()> {
    let data = load_expression(exp_file)?;
    let output_path = exp_file.parent().unwrap_or_else(|| Path::new("."));

    let mut discard_barcodes: HashSet<String> = HashSet::new();
    if filter_matrix {
        discard_barcodes = ambient_barcodes(&data)?;
        if !discard_barcodes.is_empty() {
            write_expression(exp_file, &data, &discard_barcodes)?;
            info!("dump filtered gene expression file");
        }
    }

    // Assign barcode and gene indices in insertion order and collect the
    // triplets.
    let mut barcode_ids: BTreeMap<&str, usize> = BTreeMap::new();
    let mut gene_ids: BTreeMap<&str, usize> = BTreeMap::new();
    let mut barcodes: Vec<&str> = Vec::new();
    let mut genes: Vec<&str> = Vec::new();
    let mut triplets: Vec<(usize, usize, u64)> = Vec::new();
    for (barcode, gene_counts) in &data {
        if discard_barcodes.contains(barcode) {
            continue;
        }
        let barcode_id = *barcode_ids.entry(barcode.as_str()).or_insert_with(|| {
            barcodes.push(barcode.as_str());
            barcodes.len()
        });
        for (gene, (umi_count, _)) in gene_counts {
            let gene_id = *gene_ids.entry(gene.as_str()).or_insert_with(|| {
                genes.push(gene.as_str());
                genes.len()
            });
            triplets.push((barcode_id, gene_id, *umi_count));
        }
    }

    let mut out_barcodes = gz_writer(&output_path.join("barcodes.tsv.gz"))?;
    for barcode in &barcodes {
        writeln!(out_barcodes, "{barcode}")?;
    }
    out_barcodes.finish()?;

    let mut out_genes = gz_writer(&output_path.join("genes.tsv.gz"))?;
    for gene in &genes {
        writeln!(out_genes, "{gene}")?;
    }
    out_genes.finish()?;

    let mut out_matrix = gz_writer(&output_path.join("matrix.mtx.gz"))?;
    writeln!(out_matrix, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(out_matrix, "%")?;
    writeln!(
        out_matrix,
        "{}{MTX_SEP}{}{MTX_SEP}{}",
        barcodes.len(),
        genes.len(),
        triplets.len()
    )?;
    for (barcode_id, gene_id, count) in &triplets {
        writeln!(out_matrix, "{barcode_id}{MTX_SEP}{gene_id}{MTX_SEP}{count}")?;
    }
    out_matrix.finish()?;

    Ok(())
}
