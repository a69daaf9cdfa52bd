//! # CIGAR utilities
//!
//! Derives [`AlignmentBlock`]s from a CIGAR string and computes the
//! reference span of an alignment. An alignment block says that read
//! bases from `read_start` align (matching or mismatching) to the
//! reference from `reference_start` for `length` bases; clipped,
//! inserted, and deleted bases are not represented.
use rust_htslib::bam::record::Cigar;

/// A contiguous run of read bases aligned to the reference.
/// Both start positions are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentBlock {
    pub read_start: i64,
    pub reference_start: i64,
    pub length: i64,
}

/// Build the alignment blocks for a CIGAR, starting at the 1-based
/// reference position `alignment_start`.
pub fn alignment_blocks(cigars: &[Cigar], alignment_start: i64) -> Vec<AlignmentBlock> {
    if cigars.is_empty() {
        return Vec::new();
    }
    let mut blocks = Vec::new();
    let mut read_base: i64 = 1;
    let mut ref_base = alignment_start;
    for op in cigars {
        let len = i64::from(op.len());
        match op {
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
            Cigar::SoftClip(_) | Cigar::Ins(_) => read_base += len,
            Cigar::RefSkip(_) | Cigar::Del(_) => ref_base += len,
            Cigar::Match(_) | Cigar::Equal(_) | Cigar::Diff(_) => {
                blocks.push(AlignmentBlock {
                    read_start: read_base,
                    reference_start: ref_base,
                    length: len,
                });
                read_base += len;
                ref_base += len;
            }
        }
    }
    blocks
}

/// Number of reference bases consumed by the alignment.
pub fn reference_length(cigars: &[Cigar]) -> i64 {
    cigars
        .iter()
        .map(|op| match op {
            Cigar::Match(_)
            | Cigar::Del(_)
            | Cigar::RefSkip(_)
            | Cigar::Equal(_)
            | Cigar::Diff(_) => i64::from(op.len()),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_only_is_one_block() {
        let cigars = vec![Cigar::Match(100)];
        let blocks = alignment_blocks(&cigars, 21);
        assert_eq!(
            vec![AlignmentBlock {
                read_start: 1,
                reference_start: 21,
                length: 100
            }],
            blocks
        );
        assert_eq!(100, reference_length(&cigars));
    }

    #[test]
    fn skips_split_the_alignment() {
        let cigars = vec![Cigar::Match(30), Cigar::RefSkip(200), Cigar::Match(70)];
        let blocks = alignment_blocks(&cigars, 1);
        assert_eq!(2, blocks.len());
        assert_eq!(1, blocks[0].reference_start);
        assert_eq!(231, blocks[1].reference_start);
        assert_eq!(31, blocks[1].read_start);
        assert_eq!(300, reference_length(&cigars));
    }

    #[test]
    fn soft_clips_advance_the_read_only() {
        let cigars = vec![Cigar::SoftClip(10), Cigar::Match(50), Cigar::Ins(5), Cigar::Match(20)];
        let blocks = alignment_blocks(&cigars, 100);
        assert_eq!(2, blocks.len());
        assert_eq!(11, blocks[0].read_start);
        assert_eq!(100, blocks[0].reference_start);
        assert_eq!(66, blocks[1].read_start);
        assert_eq!(150, blocks[1].reference_start);
        assert_eq!(70, reference_length(&cigars));
    }

    #[test]
    fn deletions_advance_the_reference_only() {
        let cigars = vec![Cigar::Match(20), Cigar::Del(5), Cigar::Match(30)];
        let blocks = alignment_blocks(&cigars, 1);
        assert_eq!(2, blocks.len());
        assert_eq!(26, blocks[1].reference_start);
        assert_eq!(21, blocks[1].read_start);
        assert_eq!(55, reference_length(&cigars));
    }
}
