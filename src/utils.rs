//! # Miscellaneous utility functions
//!
//! Small helpers shared across the annotation index and the per-contig
//! pipeline: closed-range overlap, list splitting for comma-separated
//! command line values, and file-age comparison for index staleness checks.
use std::{cmp, fs, path::Path, time::SystemTime};

use anyhow::{bail, Result};

/// Number of bases shared by two closed ranges, e.g. an alignment block
/// and an exon. Both ranges are 1-based inclusive; disjoint ranges
/// overlap by zero.
///
/// # Examples
///
/// ```
/// // A 100 bp block at 150 against an exon spanning 200..=260.
/// let overlap = sctag::utils::range_overlap(150, 249, 200, 260).unwrap();
/// assert_eq!(50, overlap);
/// ```
pub fn range_overlap(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> Result<i64> {
    if (a_start > a_end) | (b_start > b_end) {
        bail!("a or b range not correctly specified")
    }
    Ok(cmp::max(
        0,
        cmp::min(a_end, b_end) - cmp::max(a_start, b_start) + 1,
    ))
}

/// Check whether two closed ranges intersect at all.
pub fn ranges_intersect(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    a_start <= b_end && b_start <= a_end
}

/// Split a comma-separated list into its non-empty items.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

/// Return true if `first` was last modified at or before `second`.
/// Used to decide whether a BAM index is stale relative to its BAM.
pub fn file_older(first: impl AsRef<Path>, second: impl AsRef<Path>) -> Result<bool> {
    let t1 = modified_time(first.as_ref())?;
    let t2 = modified_time(second.as_ref())?;
    Ok(t1 <= t2)
}

fn modified_time(path: &Path) -> Result<SystemTime> {
    Ok(fs::metadata(path)?.modified()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_of_closed_ranges() {
        // Block partially inside, fully outside, and fully inside an exon.
        assert_eq!(50, range_overlap(150, 249, 200, 260).unwrap());
        assert_eq!(0, range_overlap(150, 249, 250, 400).unwrap());
        assert_eq!(100, range_overlap(150, 249, 100, 300).unwrap());
        assert!(range_overlap(249, 150, 100, 300).is_err());
    }

    #[test]
    fn intersection_is_symmetric() {
        assert!(ranges_intersect(1, 10, 10, 20));
        assert!(ranges_intersect(10, 20, 1, 10));
        assert!(!ranges_intersect(1, 9, 10, 20));
    }

    #[test]
    fn split_skips_empty_items() {
        assert_eq!(vec!["a.bam", "b.bam"], split_list("a.bam,,b.bam"));
        assert!(split_list("").is_empty());
    }
}
