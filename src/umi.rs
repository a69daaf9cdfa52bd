//! # UMI correction
//!
//! Collapses near-duplicate UMIs per (barcode, gene) key. Within a key the
//! UMIs are compared pairwise from the most to the least abundant; a UMI
//! within the allowed Hamming distance of a more abundant live UMI is
//! merged into it: its count moves over, its own count drops to zero, and
//! the correction is recorded so duplicate reads can be re-tagged with the
//! canonical sequence. Mismatch positions and base substitution types are
//! accumulated for the summary file.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use log::warn;

/// Key separator and placeholder gene for unannotated reads.
pub const KEY_SEP: char = '|';
pub const NO_GENE: &str = "NOGENE";

const BASES_NUM: usize = 4;
const BASES_DECODE: [char; BASES_NUM] = ['A', 'C', 'G', 'T'];
/// Large enough for any realistic UMI length.
const MAX_UMI_LEN: usize = 64;

/// Per-(barcode|gene) UMI read counts. A zero count marks a UMI that was
/// merged away during correction.
pub type UmiHistogram = HashMap<String, HashMap<String, u64>>;

/// Per-(barcode|gene) map from a merged-away UMI to its canonical UMI.
pub type UmiCorrections = HashMap<String, HashMap<String, String>>;

/// UMI correction settings.
#[derive(Debug, Clone, Copy)]
pub struct UmiConfig {
    /// Whether UMI correction runs at all.
    pub on: bool,
    /// Minimum number of UMIs in a key for correction to be attempted.
    pub min_num: usize,
    /// Maximum Hamming distance for merging two UMIs.
    pub mismatch: u32,
}

impl Default for UmiConfig {
    fn default() -> Self {
        UmiConfig {
            on: false,
            min_num: 5,
            mismatch: 1,
        }
    }
}

/// Aggregated correction metrics across all workers.
#[derive(Debug)]
pub struct UmiMetricsInner {
    pub uniq_barcode_gene_nums: u64,
    pub umi_cnt_raw: u64,
    pub umi_cnt_dedup: u64,
    pub umi_mis_types: [u64; MAX_UMI_LEN],
    pub umi_mis_positions: [u64; MAX_UMI_LEN],
}

impl Default for UmiMetricsInner {
    fn default() -> Self {
        UmiMetricsInner {
            uniq_barcode_gene_nums: 0,
            umi_cnt_raw: 0,
            umi_cnt_dedup: 0,
            umi_mis_types: [0; MAX_UMI_LEN],
            umi_mis_positions: [0; MAX_UMI_LEN],
        }
    }
}

/// Shared metrics accumulator; workers fold their per-contig results in
/// under a single lock at the end of each correction run.
#[derive(Debug, Default)]
pub struct UmiMetrics {
    inner: Mutex<UmiMetricsInner>,
}

impl UmiMetrics {
    /// Render the UMI sections of the summary file. `umi_len` bounds the
    /// mismatch position table; positions are reported 1-based.
    pub fn dump(&self, umi_len: usize) -> String {
        let metrics = self.inner.lock().unwrap();
        let mut out = String::new();

        out.push_str(
            "## UMI CORRECTIONS METRICS\nBARCODE_GENE_NUM\tUMI_CNT_RAW\tUMI_CNT_DEDUP\tRAW_PCT DEDUP_PCT\n",
        );
        let keys = metrics.uniq_barcode_gene_nums;
        let mean = |v: u64| {
            if keys != 0 {
                v as f64 * 100.0 / keys as f64
            } else {
                0.0
            }
        };
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{:.2}\t{:.2}",
            keys,
            metrics.umi_cnt_raw,
            metrics.umi_cnt_dedup,
            mean(metrics.umi_cnt_raw),
            mean(metrics.umi_cnt_dedup)
        );

        let mut total_cnt: u64 = metrics.umi_mis_positions[..umi_len].iter().sum();
        if total_cnt == 0 {
            total_cnt = 1;
        }
        out.push_str("## UMI MISMATCH POSITIONS METRICS\nPOSITION\tCNT\tPCT\n");
        for (i, cnt) in metrics.umi_mis_positions[..umi_len].iter().enumerate() {
            let _ = writeln!(
                out,
                "{}\t{}\t{:.2}",
                i + 1,
                cnt,
                *cnt as f64 * 100.0 / total_cnt as f64
            );
        }

        out.push_str("## UMI MISMATCH TYPES METRICS\nTYPE\tCNT\tPCT\n");
        for (i, from) in BASES_DECODE.iter().enumerate() {
            for (j, to) in BASES_DECODE.iter().enumerate() {
                let cnt = metrics.umi_mis_types[i * BASES_NUM + j];
                let _ = writeln!(
                    out,
                    "{from}_{to}\t{cnt}\t{:.2}",
                    cnt as f64 * 100.0 / total_cnt as f64
                );
            }
        }
        out
    }
}

fn encode_base(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 0,
    }
}

/// Hamming distance of two equal-length UMIs, also reporting the mismatch
/// positions (0-based) and substitution types (`from * 4 + to`).
fn umi_distance(s1: &str, s2: &str, types: &mut Vec<usize>, positions: &mut Vec<usize>) -> u32 {
    types.clear();
    positions.clear();
    let mut distance = 0;
    for (i, (b1, b2)) in s1.bytes().zip(s2.bytes()).enumerate() {
        if b1 != b2 {
            distance += 1;
            types.push(encode_base(b1) * BASES_NUM + encode_base(b2));
            positions.push(i);
        }
    }
    distance
}

/// Mark duplicate UMIs by zeroing their counts in the histogram and record
/// the canonical UMI for each merged one. Keys with fewer than
/// `config.min_num` UMIs and keys without a gene are left untouched.
pub fn dedup_umis(
    histogram: &mut UmiHistogram,
    corrections: &mut UmiCorrections,
    config: &UmiConfig,
    metrics: &UmiMetrics,
) {
    if histogram.is_empty() {
        return;
    }

    let mut umi_total_nums: u64 = 0;
    let mut umi_dedup_nums: u64 = 0;
    let mut mis_types = [0u64; MAX_UMI_LEN];
    let mut mis_positions = [0u64; MAX_UMI_LEN];
    let mut types: Vec<usize> = Vec::new();
    let mut positions: Vec<usize> = Vec::new();

    for (key, counts) in histogram.iter_mut() {
        umi_total_nums += counts.len() as u64;
        umi_dedup_nums += counts.len() as u64;
        if counts.len() < config.min_num {
            continue;
        }
        match key.split_once(KEY_SEP) {
            Some((_, gene)) if gene != NO_GENE => {}
            _ => continue,
        }

        // Sort by count, most abundant first.
        let mut array: Vec<(String, u64)> =
            counts.iter().map(|(umi, cnt)| (umi.clone(), *cnt)).collect();
        array.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for i in 1..array.len() {
            for j in 0..i {
                // Skip UMIs that were already merged away.
                if counts[&array[j].0] == 0 {
                    continue;
                }
                if array[i].0.len() != array[j].0.len() {
                    warn!("UMI length mismatch in key {key}");
                    continue;
                }
                if umi_distance(&array[i].0, &array[j].0, &mut types, &mut positions)
                    <= config.mismatch
                {
                    let moved = counts[&array[i].0];
                    *counts.get_mut(&array[j].0).unwrap() += moved;
                    *counts.get_mut(&array[i].0).unwrap() = 0;
                    umi_dedup_nums -= 1;

                    corrections
                        .entry(key.clone())
                        .or_default()
                        .insert(array[i].0.clone(), array[j].0.clone());

                    for t in &types {
                        mis_types[*t] += 1;
                    }
                    for p in positions.iter().filter(|p| **p < MAX_UMI_LEN) {
                        mis_positions[*p] += 1;
                    }
                    break;
                }
            }
        }
    }

    let mut inner = metrics.inner.lock().unwrap();
    for i in 0..MAX_UMI_LEN {
        inner.umi_mis_positions[i] += mis_positions[i];
        inner.umi_mis_types[i] += mis_types[i];
    }
    inner.uniq_barcode_gene_nums += histogram.len() as u64;
    inner.umi_cnt_raw += umi_total_nums;
    inner.umi_cnt_dedup += umi_dedup_nums;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_of(key: &str, umis: &[(&str, u64)]) -> UmiHistogram {
        let mut histogram = UmiHistogram::new();
        let inner = histogram.entry(key.to_string()).or_default();
        for (umi, cnt) in umis {
            inner.insert((*umi).to_string(), *cnt);
        }
        histogram
    }

    #[test]
    fn near_duplicates_merge_into_the_abundant_umi() {
        let mut histogram = histogram_of("BC|G1", &[("ACGT", 5), ("ACGA", 2), ("TTTT", 1)]);
        let mut corrections = UmiCorrections::new();
        let config = UmiConfig {
            on: true,
            min_num: 2,
            mismatch: 1,
        };
        let metrics = UmiMetrics::default();

        dedup_umis(&mut histogram, &mut corrections, &config, &metrics);

        let counts = &histogram["BC|G1"];
        assert_eq!(7, counts["ACGT"]);
        assert_eq!(0, counts["ACGA"]);
        assert_eq!(1, counts["TTTT"]);
        assert_eq!("ACGT", corrections["BC|G1"]["ACGA"]);

        let inner = metrics.inner.lock().unwrap();
        assert_eq!(3, inner.umi_cnt_raw);
        assert_eq!(2, inner.umi_cnt_dedup);
        assert_eq!(1, inner.uniq_barcode_gene_nums);
        // One A->T mismatch at position 3.
        assert_eq!(1, inner.umi_mis_positions[3]);
        assert_eq!(1, inner.umi_mis_types[3]);
    }

    #[test]
    fn counts_are_preserved_by_correction() {
        let mut histogram = histogram_of(
            "BC|G1",
            &[("AAAA", 9), ("AAAT", 3), ("AATT", 2), ("GGGG", 4)],
        );
        let before: u64 = histogram["BC|G1"].values().sum();
        let mut corrections = UmiCorrections::new();
        let config = UmiConfig {
            on: true,
            min_num: 2,
            mismatch: 1,
        };
        dedup_umis(&mut histogram, &mut corrections, &config, &UmiMetrics::default());
        let after: u64 = histogram["BC|G1"].values().sum();
        assert_eq!(before, after);
    }

    #[test]
    fn merged_umis_no_longer_absorb_others() {
        // AAAT merges into AAAA; AATT is distance 1 from AAAT but 2 from
        // AAAA, so it survives on its own.
        let mut histogram = histogram_of("BC|G1", &[("AAAA", 9), ("AAAT", 3), ("AATT", 2)]);
        let mut corrections = UmiCorrections::new();
        let config = UmiConfig {
            on: true,
            min_num: 2,
            mismatch: 1,
        };
        dedup_umis(&mut histogram, &mut corrections, &config, &UmiMetrics::default());

        let counts = &histogram["BC|G1"];
        assert_eq!(12, counts["AAAA"]);
        assert_eq!(0, counts["AAAT"]);
        assert_eq!(2, counts["AATT"]);
    }

    #[test]
    fn small_and_nogene_keys_are_skipped() {
        let mut histogram = histogram_of("BC|G1", &[("ACGT", 5), ("ACGA", 2)]);
        histogram.extend(histogram_of(
            "BC|NOGENE",
            &[("TTTT", 5), ("TTTA", 2), ("TTAA", 1)],
        ));
        let mut corrections = UmiCorrections::new();
        let config = UmiConfig {
            on: true,
            min_num: 3,
            mismatch: 1,
        };
        let metrics = UmiMetrics::default();
        dedup_umis(&mut histogram, &mut corrections, &config, &metrics);

        // Below min_num: untouched.
        assert_eq!(2, histogram["BC|G1"]["ACGA"]);
        // NOGENE: untouched even though large enough.
        assert_eq!(2, histogram["BC|NOGENE"]["TTTA"]);
        assert!(corrections.is_empty());
        assert_eq!(2, metrics.inner.lock().unwrap().uniq_barcode_gene_nums);
    }
}
