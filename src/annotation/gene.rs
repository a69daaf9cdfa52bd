//! # Gene model
//!
//! In-memory representation of a gene as assembled from GTF/GFF records:
//! a [`Gene`] owns its [`Transcript`]s, each transcript owns its sorted
//! [`Exon`]s. All coordinates are 1-based inclusive. The per-base locus
//! classification used by the read tagger lives on [`Transcript`] so the
//! exon scan can exit early once a coding base is found.
use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::utils;

/// Functional class of a reference locus, ordered by informativeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocusFunction {
    None,
    Intergenic,
    Ribosomal,
    Intronic,
    Utr,
    Coding,
}

impl LocusFunction {
    /// Tag value written into the XF field. `None` renders empty and is
    /// never emitted.
    pub fn as_str(&self) -> &'static str {
        match self {
            LocusFunction::None => "",
            LocusFunction::Intergenic => "INTERGENIC",
            LocusFunction::Ribosomal => "RIBOSOMAL",
            LocusFunction::Intronic => "INTRONIC",
            LocusFunction::Utr => "UTR",
            LocusFunction::Coding => "EXONIC",
        }
    }
}

/// Summarize base-level locus functions to a single annotation.
///
/// With `conservative` set, a function is only returned if all inputs
/// agree, otherwise `None`. Without it, the "best" annotation wins, where
/// classes like coding are preferred over intronic and intergenic.
pub fn summarize(locus_functions: &[LocusFunction], conservative: bool) -> LocusFunction {
    if locus_functions.is_empty() {
        return LocusFunction::Intergenic;
    }
    if conservative {
        let first = locus_functions[0];
        if locus_functions.iter().any(|f| *f != first) {
            return LocusFunction::None;
        }
        return first;
    }
    locus_functions
        .iter()
        .fold(LocusFunction::Intergenic, |best, f| best.max(*f))
}

/// A single exon, 1-based inclusive coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Exon {
    pub start: i64,
    pub end: i64,
}

/// One transcript of a gene: transcription and coding bounds plus the
/// ordered exon list.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub transcription_start: i64,
    pub transcription_end: i64,
    pub coding_start: i64,
    pub coding_end: i64,
    transcript_name: String,
    transcript_id: String,
    exons: Vec<Exon>,
    /// Number of bases in the transcript, summed over exons.
    length: i64,
}

impl Transcript {
    pub fn new(
        transcription_start: i64,
        transcription_end: i64,
        coding_start: i64,
        coding_end: i64,
        transcript_name: String,
        transcript_id: String,
    ) -> Self {
        Transcript {
            transcription_start,
            transcription_end,
            coding_start,
            coding_end,
            transcript_name,
            transcript_id,
            exons: Vec::new(),
            length: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.transcript_name
    }

    pub fn id(&self) -> &str {
        &self.transcript_id
    }

    pub fn exons(&self) -> &[Exon] {
        &self.exons
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    /// Attach the (already sorted) exon list.
    pub fn add_exons(&mut self, exons: Vec<Exon>) {
        self.length = exons.iter().map(|e| e.end - e.start + 1).sum();
        self.exons = exons;
    }

    /// Fold the locus functions of the `len` reference bases starting at
    /// `start` into `best`, exiting early once a coding base is seen.
    pub fn assign_locus_function(&self, start: i64, len: i64, best: &mut LocusFunction) {
        let begin = start.max(self.transcription_start);
        let end = (start + len - 1).min(self.transcription_end);
        for locus in begin..=end {
            let function = if self.in_exon(locus) {
                if in_range(self.coding_start, self.coding_end, locus) {
                    LocusFunction::Coding
                } else {
                    LocusFunction::Utr
                }
            } else {
                LocusFunction::Intronic
            };
            if function > *best {
                *best = function;
            }
            if *best == LocusFunction::Coding {
                break;
            }
        }
    }

    /// Count exonic vs non-exonic bases of the block of `len` reference
    /// bases starting at `start` and keep the per-gene maximum in
    /// `max_counts` (exon count first, ties broken by the larger intron
    /// count). Exons within a transcript never overlap, so summing the
    /// per-exon overlaps counts every base once.
    pub fn count_block_bases(&self, start: i64, len: i64, max_counts: &mut (i64, i64)) {
        let begin = start.max(self.transcription_start);
        let end = (start + len - 1).min(self.transcription_end);
        let mut exon_bases = 0;
        let mut intron_bases = 0;
        if begin <= end {
            exon_bases = self
                .exons
                .iter()
                .map(|e| utils::range_overlap(begin, end, e.start, e.end).unwrap_or(0))
                .sum();
            intron_bases = end - begin + 1 - exon_bases;
        }
        if exon_bases > max_counts.0 {
            *max_counts = (exon_bases, intron_bases);
        } else if exon_bases == max_counts.0 {
            max_counts.1 = max_counts.1.max(intron_bases);
        }
    }

    /// Scan the sorted exon list for `locus`. Exons are sorted by start,
    /// so the scan stops at the first exon beginning past the locus.
    pub fn in_exon(&self, locus: i64) -> bool {
        for exon in &self.exons {
            if exon.start > locus {
                return false;
            }
            if in_range(exon.start, exon.end, locus) {
                return true;
            }
        }
        false
    }
}

#[inline]
fn in_range(start: i64, end: i64, locus: i64) -> bool {
    locus >= start && locus <= end
}

/// A gene on a single contig with its transcripts keyed by transcript name.
#[derive(Debug, Clone)]
pub struct Gene {
    contig: String,
    start: i64,
    end: i64,
    negative_strand: bool,
    gene_name: String,
    gene_id: String,
    feature_type: String,
    gene_version: i32,
    transcripts: HashMap<String, Transcript>,
}

impl Gene {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contig: String,
        start: i64,
        end: i64,
        negative_strand: bool,
        gene_name: String,
        gene_id: String,
        feature_type: String,
        gene_version: i32,
    ) -> Self {
        Gene {
            contig,
            start,
            end,
            negative_strand,
            gene_name,
            gene_id,
            feature_type,
            gene_version,
            transcripts: HashMap::new(),
        }
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn is_negative_strand(&self) -> bool {
        self.negative_strand
    }

    pub fn name(&self) -> &str {
        &self.gene_name
    }

    pub fn id(&self) -> &str {
        &self.gene_id
    }

    pub fn feature_type(&self) -> &str {
        &self.feature_type
    }

    pub fn version(&self) -> i32 {
        self.gene_version
    }

    pub fn transcripts(&self) -> &HashMap<String, Transcript> {
        &self.transcripts
    }

    /// Register a transcript under its name. Transcript names are unique
    /// per gene.
    pub fn add_transcript(&mut self, transcript: Transcript) -> Result<&mut Transcript> {
        let name = transcript.name().to_string();
        if self.transcripts.contains_key(&name) {
            bail!(
                "Transcript {name} for gene {} appears more than once",
                self.gene_name
            );
        }
        Ok(self.transcripts.entry(name).or_insert(transcript))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript_with_exons(exons: Vec<Exon>, coding: (i64, i64)) -> Transcript {
        let tx_start = exons.iter().map(|e| e.start).min().unwrap();
        let tx_end = exons.iter().map(|e| e.end).max().unwrap();
        let mut tx = Transcript::new(
            tx_start,
            tx_end,
            coding.0,
            coding.1,
            "T1".to_string(),
            "T1".to_string(),
        );
        tx.add_exons(exons);
        tx
    }

    #[test]
    fn exon_scan_respects_sorted_order() {
        let tx = transcript_with_exons(
            vec![Exon { start: 100, end: 200 }, Exon { start: 300, end: 400 }],
            (100, 400),
        );
        assert!(tx.in_exon(100));
        assert!(tx.in_exon(350));
        assert!(!tx.in_exon(250));
        assert!(!tx.in_exon(401));
        assert_eq!(202, tx.length());
    }

    #[test]
    fn coding_beats_utr_beats_intronic() {
        let tx = transcript_with_exons(
            vec![Exon { start: 100, end: 200 }, Exon { start: 300, end: 400 }],
            (150, 350),
        );

        let mut best = LocusFunction::Intergenic;
        tx.assign_locus_function(100, 20, &mut best);
        assert_eq!(LocusFunction::Utr, best);

        let mut best = LocusFunction::Intergenic;
        tx.assign_locus_function(210, 20, &mut best);
        assert_eq!(LocusFunction::Intronic, best);

        let mut best = LocusFunction::Intergenic;
        tx.assign_locus_function(140, 20, &mut best);
        assert_eq!(LocusFunction::Coding, best);
    }

    #[test]
    fn block_base_counting_tracks_the_best_transcript() {
        let tx = transcript_with_exons(vec![Exon { start: 100, end: 179 }], (100, 179));
        let mut counts = (0, 0);
        tx.count_block_bases(100, 100, &mut counts);
        assert_eq!((80, 20), counts);
    }

    #[test]
    fn summarize_best_and_conservative() {
        let funcs = vec![LocusFunction::Intronic, LocusFunction::Coding];
        assert_eq!(LocusFunction::Coding, summarize(&funcs, false));
        assert_eq!(LocusFunction::None, summarize(&funcs, true));
        assert_eq!(LocusFunction::Intergenic, summarize(&[], false));
        let same = vec![LocusFunction::Utr, LocusFunction::Utr];
        assert_eq!(LocusFunction::Utr, summarize(&same, true));
    }

    #[test]
    fn duplicate_transcript_name_is_rejected() {
        let mut gene = Gene::new(
            "chr1".to_string(),
            100,
            400,
            false,
            "G1".to_string(),
            "ENSG1".to_string(),
            "gene".to_string(),
            -1,
        );
        let tx = transcript_with_exons(vec![Exon { start: 100, end: 200 }], (100, 200));
        gene.add_transcript(tx.clone()).unwrap();
        assert!(gene.add_transcript(tx).is_err());
    }
}
