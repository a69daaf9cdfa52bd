//! # Sequencing saturation
//!
//! Estimates library complexity by subsampling the accumulated reads at
//! increasing fractions and recomputing the per-barcode gene/UMI
//! histogram each time. Two accumulator shapes exist: coordinate barcodes
//! (spatial grid positions, additionally reported on a coarse bin grid)
//! and sequence barcodes (single-cell mode). Workers feed both through a
//! mutex; the sweep itself runs once at the end of the run.
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{info, warn};
use rand::seq::SliceRandom;

use crate::umi::{UmiHistogram, KEY_SEP, NO_GENE};

const BARCODE_SEP: char = '_';
const BIN_SIZE: u32 = 150;
const SAMPLE_FRACTIONS: [f64; 12] = [
    0.0, 0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0,
];

/// Gene-name interning and UMI encoding shared by both accumulators.
#[derive(Debug, Default)]
struct GeneEncoder {
    gene_to_id: HashMap<String, u32>,
    next_id: u32,
}

impl GeneEncoder {
    fn encode_gene(&mut self, gene: &str) -> u32 {
        if let Some(id) = self.gene_to_id.get(gene) {
            return *id;
        }
        let id = self.next_id;
        self.gene_to_id.insert(gene.to_string(), id);
        self.next_id += 1;
        id
    }

    fn nogene_id(&self) -> u32 {
        self.gene_to_id.get(NO_GENE).copied().unwrap_or(u32::MAX)
    }
}

/// Encode a UMI base-4 over {A, C, G, T}.
fn encode_umi(umi: &str) -> u32 {
    umi.bytes().fold(0u32, |acc, base| {
        let code = match base {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => 0,
        };
        acc.wrapping_mul(4) + code
    })
}

/// Decode a base-4 encoded UMI of known length.
#[cfg(test)]
fn decode_umi(mut encoded: u32, len: usize) -> String {
    let mut bases = vec![b'A'; len];
    for slot in bases.iter_mut().rev() {
        *slot = b"ACGT"[(encoded & 3) as usize];
        encoded >>= 2;
    }
    String::from_utf8(bases).unwrap()
}

#[derive(Debug, Clone, Copy)]
struct CoordRecord {
    b1: u32,
    b2: u32,
    gene: u32,
    umi: u32,
}

#[derive(Debug, Clone)]
struct SeqRecord {
    barcode: String,
    gene: u32,
    umi: u32,
}

/// Metrics of one subsample sweep step.
#[derive(Debug, Default)]
struct SweepMetrics {
    reads: u64,
    reads_with_gene: u64,
    unique: u64,
    median_genes: u64,
}

fn sweep<B: std::hash::Hash + Eq>(
    data: &HashMap<B, HashMap<u64, u64>>,
    nogene_id: u32,
) -> SweepMetrics {
    let mut metrics = SweepMetrics::default();
    let mut genes_per_barcode: Vec<usize> = Vec::with_capacity(data.len());
    let mut genes: BTreeSet<u32> = BTreeSet::new();
    for pairs in data.values() {
        genes.clear();
        for (key, count) in pairs {
            metrics.reads += count;
            let gene = (key >> 32) as u32;
            if gene != nogene_id {
                genes.insert(gene);
                metrics.unique += 1;
                metrics.reads_with_gene += count;
            }
        }
        genes_per_barcode.push(genes.len());
    }
    if metrics.reads == 0 {
        return metrics;
    }

    let mid = genes_per_barcode.len() / 2;
    let (_, median, _) = genes_per_barcode.select_nth_unstable(mid);
    metrics.median_genes = *median as u64;
    metrics
}

fn saturation_columns(metrics: &SweepMetrics, barcodes: usize) -> String {
    let saturation = 1.0 - metrics.unique as f64 / metrics.reads_with_gene as f64;
    format!(
        "{} {} {}",
        metrics.reads / barcodes as u64,
        saturation,
        metrics.median_genes
    )
}

/// Coordinate-barcode accumulator: barcodes are `.._row_col` grid
/// positions, sampled both at full resolution and on a 150-unit bin grid.
#[derive(Debug, Default)]
struct CoordinateBarcode {
    encoder: GeneEncoder,
    records: Vec<CoordRecord>,
    nreads: u64,
}

impl CoordinateBarcode {
    fn add_data(&mut self, raw: &UmiHistogram) -> Result<()> {
        for (key, pairs) in raw {
            let (barcode, gene) = key
                .split_once(KEY_SEP)
                .with_context(|| format!("Malformed histogram key {key}"))?;
            let mut parts = barcode.rsplit(BARCODE_SEP);
            let col: u32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .with_context(|| format!("Malformed coordinate barcode {barcode}"))?;
            let row: u32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .with_context(|| format!("Malformed coordinate barcode {barcode}"))?;
            let gene = self.encoder.encode_gene(gene);
            for (umi, count) in pairs {
                if *count == 0 {
                    continue;
                }
                let record = CoordRecord {
                    b1: col,
                    b2: row,
                    gene,
                    umi: encode_umi(umi),
                };
                for _ in 0..*count {
                    self.records.push(record);
                }
                self.nreads += count;
            }
        }
        Ok(())
    }

    fn sample(&mut self) -> String {
        let mut out = String::from("#sample bar_x bar_y1 bar_y2 bin_x bin_y1 bin_y2\n");
        self.records.shuffle(&mut rand::thread_rng());
        let nogene_id = self.encoder.nogene_id();

        let mut data: HashMap<u64, HashMap<u64, u64>> = HashMap::new();
        let mut data_bin: HashMap<u32, HashMap<u64, u64>> = HashMap::new();
        let mut p = 0usize;
        for fraction in SAMPLE_FRACTIONS.iter().skip(1) {
            info!("saturation sample: {fraction}");
            let size = (fraction * self.nreads as f64) as usize;
            while p < size {
                let record = self.records[p];
                let barcode = (u64::from(record.b1) << 32) + u64::from(record.b2);
                let value = (u64::from(record.gene) << 32) + u64::from(record.umi);
                *data.entry(barcode).or_default().entry(value).or_insert(0) += 1;

                let bin_key = ((record.b2 / BIN_SIZE) << 16) + record.b1 / BIN_SIZE;
                *data_bin.entry(bin_key).or_default().entry(value).or_insert(0) += 1;
                p += 1;
            }

            let metrics = sweep(&data, nogene_id);
            if metrics.reads == 0 {
                warn!("invalid saturation data: no reads in sample");
                continue;
            }
            let bin_metrics = sweep(&data_bin, nogene_id);
            let _ = writeln!(
                out,
                "{fraction} {} {}",
                saturation_columns(&metrics, data.len()),
                saturation_columns(&bin_metrics, data_bin.len())
            );
        }
        out
    }
}

/// Sequence-barcode accumulator for single-cell libraries.
#[derive(Debug, Default)]
struct SequenceBarcode {
    encoder: GeneEncoder,
    records: Vec<SeqRecord>,
    nreads: u64,
}

impl SequenceBarcode {
    fn add_data(&mut self, raw: &UmiHistogram) -> Result<()> {
        for (key, pairs) in raw {
            let (barcode, gene) = key
                .split_once(KEY_SEP)
                .with_context(|| format!("Malformed histogram key {key}"))?;
            let gene = self.encoder.encode_gene(gene);
            for (umi, count) in pairs {
                if *count == 0 {
                    continue;
                }
                let record = SeqRecord {
                    barcode: barcode.to_string(),
                    gene,
                    umi: encode_umi(umi),
                };
                for _ in 0..*count {
                    self.records.push(record.clone());
                }
                self.nreads += count;
            }
        }
        Ok(())
    }

    fn sample(&mut self) -> String {
        let mut out = String::from("#sample bar_x bar_y1 bar_y2\n");
        self.records.shuffle(&mut rand::thread_rng());
        let nogene_id = self.encoder.nogene_id();

        let mut data: HashMap<String, HashMap<u64, u64>> = HashMap::new();
        let mut p = 0usize;
        for fraction in SAMPLE_FRACTIONS.iter().skip(1) {
            info!("saturation sample: {fraction}");
            let size = (fraction * self.nreads as f64) as usize;
            while p < size {
                let record = &self.records[p];
                let value = (u64::from(record.gene) << 32) + u64::from(record.umi);
                *data
                    .entry(record.barcode.clone())
                    .or_default()
                    .entry(value)
                    .or_insert(0) += 1;
                p += 1;
            }

            let metrics = sweep(&data, nogene_id);
            if metrics.reads == 0 {
                warn!("invalid saturation data: no reads in sample");
                continue;
            }
            let _ = writeln!(
                out,
                "{fraction} {}",
                saturation_columns(&metrics, data.len())
            );
        }
        out
    }
}

enum Accumulator {
    Coordinate(CoordinateBarcode),
    Sequence(SequenceBarcode),
}

/// Thread-safe saturation accumulator; the barcode shape is fixed at
/// construction.
pub struct Saturation {
    inner: Mutex<Accumulator>,
}

impl Saturation {
    pub fn coordinate() -> Saturation {
        Saturation {
            inner: Mutex::new(Accumulator::Coordinate(CoordinateBarcode::default())),
        }
    }

    pub fn sequence() -> Saturation {
        Saturation {
            inner: Mutex::new(Accumulator::Sequence(SequenceBarcode::default())),
        }
    }

    /// Fold one contig's (possibly UMI-corrected) histogram in. Zero
    /// counts mark merged-away UMIs and are skipped.
    pub fn add_data(&self, raw: &UmiHistogram) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Accumulator::Coordinate(acc) => acc.add_data(raw),
            Accumulator::Sequence(acc) => acc.add_data(raw),
        }
    }

    /// Run the subsample sweep and write the saturation table.
    pub fn calculate_saturation(&self, out_file: &Path) -> Result<()> {
        info!("calculate sequencing saturation");
        let mut inner = self.inner.lock().unwrap();
        let result = match &mut *inner {
            Accumulator::Coordinate(acc) => acc.sample(),
            Accumulator::Sequence(acc) => acc.sample(),
        };
        fs::write(out_file, result)
            .with_context(|| format!("Error opening file {}", out_file.display()))?;
        info!("success dump saturation file: {}", out_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umi_encoding_is_bijective() {
        for umi in ["ACGT", "TTTT", "AAAA", "GATTACA", "CCCCCCCCCC"] {
            assert_eq!(umi, decode_umi(encode_umi(umi), umi.len()));
        }
    }

    #[test]
    fn gene_ids_auto_increment() {
        let mut encoder = GeneEncoder::default();
        assert_eq!(0, encoder.encode_gene("G1"));
        assert_eq!(1, encoder.encode_gene("G2"));
        assert_eq!(0, encoder.encode_gene("G1"));
        assert_eq!(u32::MAX, encoder.nogene_id());
        assert_eq!(2, encoder.encode_gene(NO_GENE));
        assert_eq!(2, encoder.nogene_id());
    }

    fn histogram(entries: &[(&str, &str, u64)]) -> UmiHistogram {
        let mut raw = UmiHistogram::new();
        for (key, umi, count) in entries {
            raw.entry((*key).to_string())
                .or_default()
                .insert((*umi).to_string(), *count);
        }
        raw
    }

    #[test]
    fn unique_umis_saturate_to_zero() {
        let saturation = Saturation::sequence();
        // Every read is its own UMI: no duplication at full depth.
        let raw = histogram(&[
            ("AAA|G1", "ACGT", 1),
            ("AAA|G1", "ACGA", 1),
            ("AAA|G2", "TTTT", 1),
            ("CCC|G1", "GGGG", 1),
        ]);
        saturation.add_data(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("saturation.tsv");
        saturation.calculate_saturation(&out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let last = text.lines().last().unwrap();
        let fields: Vec<&str> = last.split(' ').collect();
        assert_eq!("1", fields[0]);
        // reads per barcode: 4 reads over 2 barcodes.
        assert_eq!("2", fields[1]);
        let sat: f64 = fields[2].parse().unwrap();
        assert!(sat.abs() < 1e-9);
    }

    #[test]
    fn duplicated_umis_raise_saturation() {
        let saturation = Saturation::sequence();
        let raw = histogram(&[("AAA|G1", "ACGT", 10)]);
        saturation.add_data(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("saturation.tsv");
        saturation.calculate_saturation(&out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let last = text.lines().last().unwrap();
        let fields: Vec<&str> = last.split(' ').collect();
        let sat: f64 = fields[2].parse().unwrap();
        assert!((sat - 0.9).abs() < 1e-9);
    }

    #[test]
    fn nogene_reads_count_towards_depth_but_not_genes() {
        let saturation = Saturation::sequence();
        let raw = histogram(&[("AAA|G1", "ACGT", 1), ("AAA|NOGENE", "TTTT", 3)]);
        saturation.add_data(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("saturation.tsv");
        saturation.calculate_saturation(&out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let last = text.lines().last().unwrap();
        let fields: Vec<&str> = last.split(' ').collect();
        // 4 reads on one barcode.
        assert_eq!("4", fields[1]);
        // Median genes per barcode excludes NOGENE.
        assert_eq!("1", fields[3]);
    }

    #[test]
    fn coordinate_barcodes_parse_the_grid_position() {
        let saturation = Saturation::coordinate();
        let raw = histogram(&[("39_19_58583_28608|G1", "ACGT", 2)]);
        saturation.add_data(&raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("saturation.tsv");
        saturation.calculate_saturation(&out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("#sample bar_x bar_y1 bar_y2 bin_x bin_y1 bin_y2"));
        let last = text.lines().last().unwrap();
        let fields: Vec<&str> = last.split(' ').collect();
        assert_eq!(7, fields.len());
        let sat: f64 = fields[2].parse().unwrap();
        assert!((sat - 0.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_coordinate_barcode_is_an_error() {
        let saturation = Saturation::coordinate();
        let raw = histogram(&[("notacoordinate|G1", "ACGT", 1)]);
        assert!(saturation.add_data(&raw).is_err());
    }
}
