//! # Read tagger
//!
//! Assigns the XF (locus function), GE (gene names), and GS (gene
//! strands) tags to aligned reads by intersecting their alignment blocks
//! with the gene interval index, under one of three annotation policies.
//! All counters are atomics so any number of per-contig workers can tag
//! concurrently against the shared immutable index.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info};
use rust_htslib::bam::record::{Cigar, Record};

use crate::annotation::gene::{summarize, Gene, LocusFunction};
use crate::annotation::index::GeneIndex;
use crate::bam::cigar::{alignment_blocks, reference_length, AlignmentBlock};
use crate::bam::record::{update_str_tag, FUNCTION_TAG, GENE_STRAND_TAG, GENE_TAG};
use crate::utils;

const RECORD_SEP: &str = ",";

/// Annotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnoVersion {
    DropSeqV1,
    DropSeqV2,
    TenX,
}

impl AnnoVersion {
    /// Numeric command line encoding: 0, 1, 2.
    pub fn from_mode(mode: u8) -> AnnoVersion {
        match mode {
            0 => AnnoVersion::DropSeqV1,
            1 => AnnoVersion::DropSeqV2,
            _ => AnnoVersion::TenX,
        }
    }
}

/// Tags reads with gene/exon annotations and accumulates run metrics.
pub struct GeneTagger {
    index: GeneIndex,
    anno_version: AnnoVersion,
    allow_multi_gene_reads: bool,
    use_strand_info: bool,

    total_reads: AtomicU64,
    reads_right_strand: AtomicU64,
    reads_wrong_strand: AtomicU64,
    ambiguous_reads_rejected: AtomicU64,
    read_ambiguous_gene_fixed: AtomicU64,

    map_reads: AtomicU64,
    exonic_reads: AtomicU64,
    intronic_reads: AtomicU64,
    intergenic_reads: AtomicU64,
    transcriptome_reads: AtomicU64,
    nogene_reads: AtomicU64,
}

impl GeneTagger {
    pub fn new(index: GeneIndex, anno_version: AnnoVersion) -> GeneTagger {
        GeneTagger {
            index,
            anno_version,
            allow_multi_gene_reads: false,
            use_strand_info: true,
            total_reads: AtomicU64::new(0),
            reads_right_strand: AtomicU64::new(0),
            reads_wrong_strand: AtomicU64::new(0),
            ambiguous_reads_rejected: AtomicU64::new(0),
            read_ambiguous_gene_fixed: AtomicU64::new(0),
            map_reads: AtomicU64::new(0),
            exonic_reads: AtomicU64::new(0),
            intronic_reads: AtomicU64::new(0),
            intergenic_reads: AtomicU64::new(0),
            transcriptome_reads: AtomicU64::new(0),
            nogene_reads: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &GeneIndex {
        &self.index
    }

    /// Annotate one record. `contig` is the record's reference name.
    pub fn set_annotation(&self, record: &mut Record, contig: &str) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        if self.anno_version == AnnoVersion::TenX {
            self.set_annotation_tenx(record, contig);
        } else {
            self.set_annotation_dropseq(record, contig);
        }
    }

    fn overlapping_genes<'a>(
        &'a self,
        contig: &str,
        begin_pos: i64,
        cigars: &[Cigar],
    ) -> Vec<&'a Gene> {
        let query_end = begin_pos + reference_length(cigars) - 1;
        self.index.query(contig, begin_pos, query_end)
    }

    fn set_annotation_dropseq(&self, record: &mut Record, contig: &str) {
        let cigars: Vec<Cigar> = record.cigar().iter().copied().collect();
        // Change begin position from 0-based to 1-based.
        let begin_pos = record.pos() + 1;
        let result = self.overlapping_genes(contig, begin_pos, &cigars);
        if result.is_empty() {
            self.nogene_reads.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let blocks = alignment_blocks(&cigars, begin_pos);
        let locus_map = self.locus_functions_by_gene(&result, &blocks);

        // Genes whose exons the alignment blocks touch.
        let mut exons_for_read: BTreeSet<usize> = BTreeSet::new();
        for block in &blocks {
            let block_genes = genes_on_block_exons(&result, &locus_map, block, contig);
            match self.anno_version {
                AnnoVersion::DropSeqV2 => exons_for_read.extend(block_genes),
                AnnoVersion::DropSeqV1 => {
                    if !exons_for_read.is_empty() && !block_genes.is_empty() {
                        if !self.allow_multi_gene_reads {
                            // Intersect the per-block gene sets.
                            exons_for_read.retain(|g| block_genes.contains(g));
                        } else {
                            exons_for_read.extend(block_genes);
                        }
                    } else {
                        exons_for_read = block_genes;
                    }
                }
                AnnoVersion::TenX => unreachable!(),
            }
        }
        if self.anno_version == AnnoVersion::DropSeqV2
            && !self.allow_multi_gene_reads
            && exons_for_read.len() > 1
        {
            exons_for_read.clear();
        }

        // Genes that can contribute to expression: coding or UTR overlap.
        let mut genes: Vec<usize> = exons_for_read
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    locus_map[id],
                    LocusFunction::Coding | LocusFunction::Utr
                )
            })
            .collect();

        let mut all_passing: Vec<LocusFunction> = Vec::new();
        if self.use_strand_info {
            genes = self.genes_consistent_with_read_strand(&result, genes, record.is_reverse());
            if self.anno_version == AnnoVersion::DropSeqV2 {
                // Only retain functional map entries on the correct strand.
                for (id, function) in &locus_map {
                    if result[*id].is_negative_strand() == record.is_reverse() {
                        all_passing.push(*function);
                    }
                }
            }
        }
        match self.anno_version {
            AnnoVersion::DropSeqV2 => {
                if !self.use_strand_info {
                    all_passing.extend(locus_map.values().copied());
                }
                // With strand info, only add values for passing genes.
                all_passing.extend(genes.iter().map(|g| locus_map[g]));
            }
            AnnoVersion::DropSeqV1 => {
                all_passing.clear();
                all_passing.extend(locus_map.values().copied());
            }
            AnnoVersion::TenX => unreachable!(),
        }

        let function = summarize(&all_passing, false);

        if genes.len() > 1 && !self.allow_multi_gene_reads {
            error!("There should only be 1 gene assigned to a read for DGE purposes.");
        }

        if function != LocusFunction::None {
            update_str_tag(record, FUNCTION_TAG, function.as_str());
        }

        let (name, strand) = compound_name_and_strand(&result, &genes);
        if !name.is_empty() && !strand.is_empty() {
            update_str_tag(record, GENE_TAG, &name);
            update_str_tag(record, GENE_STRAND_TAG, &strand);
        }
    }

    fn set_annotation_tenx(&self, record: &mut Record, contig: &str) {
        let confidently = record.mapq() == u8::MAX;
        if confidently {
            self.map_reads.fetch_add(1, Ordering::Relaxed);
        }

        let cigars: Vec<Cigar> = record.cigar().iter().copied().collect();
        let begin_pos = record.pos() + 1;
        let result = self.overlapping_genes(contig, begin_pos, &cigars);
        if result.is_empty() {
            self.nogene_reads.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let blocks = alignment_blocks(&cigars, begin_pos);
        let locus_map = self.locus_functions_by_gene(&result, &blocks);

        let mut genes: Vec<usize> = locus_map.keys().copied().collect();
        if genes.is_empty() {
            self.intergenic_reads.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let anno_negative = result[genes[0]].is_negative_strand();
        let strand_check = anno_negative == record.is_reverse();
        if strand_check {
            self.reads_right_strand.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads_wrong_strand.fetch_add(1, Ordering::Relaxed);
        }

        let function = locus_map[&genes[0]];
        update_str_tag(record, FUNCTION_TAG, function.as_str());

        if confidently {
            match function {
                LocusFunction::Coding => {
                    self.exonic_reads.fetch_add(1, Ordering::Relaxed);
                    if strand_check {
                        self.transcriptome_reads.fetch_add(1, Ordering::Relaxed);
                    }
                }
                LocusFunction::Intergenic => {
                    self.intergenic_reads.fetch_add(1, Ordering::Relaxed);
                }
                LocusFunction::Intronic => {
                    self.intronic_reads.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }

        // Only dump gene names when the locus is exonic or intronic.
        if function == LocusFunction::Intergenic {
            genes.clear();
        }
        let (name, strand) = compound_name_and_strand(&result, &genes);
        if !name.is_empty() && !strand.is_empty() {
            update_str_tag(record, GENE_TAG, &name);
            update_str_tag(record, GENE_STRAND_TAG, &strand);
        }
    }

    /// The locus function each overlapping gene implies for this read.
    /// For the TenX policy the per-gene exon/intron base counts decide,
    /// and only the most confident gene survives.
    fn locus_functions_by_gene(
        &self,
        result: &[&Gene],
        blocks: &[AlignmentBlock],
    ) -> BTreeMap<usize, LocusFunction> {
        let mut locus_map: BTreeMap<usize, LocusFunction> = BTreeMap::new();

        if self.anno_version == AnnoVersion::TenX {
            let total_len: i64 = blocks.iter().map(|b| b.length).sum();
            let mut total_counts: Vec<(i64, i64)> = vec![(0, 0); result.len()];
            for (j, gene) in result.iter().enumerate() {
                let mut gene_counts = (0i64, 0i64);
                for block in blocks {
                    let mut counts = (0i64, 0i64);
                    for transcript in gene.transcripts().values() {
                        transcript.count_block_bases(
                            block.reference_start,
                            block.length,
                            &mut counts,
                        );
                    }
                    gene_counts.0 += counts.0;
                    gene_counts.1 += counts.1;
                }

                let function = if gene_counts.0 >= (total_len as f64 * 0.5) as i64 {
                    LocusFunction::Coding
                } else if gene_counts.1 > 0 {
                    LocusFunction::Intronic
                } else {
                    LocusFunction::Intergenic
                };
                locus_map.insert(j, function);
                total_counts[j] = gene_counts;
            }

            // Pick the most confident gene.
            if result.len() > 1 {
                let mut best: Vec<usize> = Vec::new();
                for (&id, &function) in &locus_map {
                    if best.is_empty() {
                        best.push(id);
                    } else if function > locus_map[&best[0]] {
                        best.clear();
                        best.push(id);
                    } else if function == locus_map[&best[0]] {
                        best.push(id);
                    }
                }

                let winner = if best.len() == 1 {
                    best[0]
                } else {
                    // Tie on function, decide by exon then intron counts.
                    let mut pos = 0usize;
                    for (j, counts) in total_counts.iter().enumerate() {
                        if *counts > total_counts[pos] {
                            pos = j;
                        }
                    }
                    pos
                };
                let function = locus_map[&winner];
                locus_map.clear();
                locus_map.insert(winner, function);
            }
        } else {
            for (j, gene) in result.iter().enumerate() {
                let mut function = LocusFunction::Intergenic;
                'blocks: for block in blocks {
                    for transcript in gene.transcripts().values() {
                        transcript.assign_locus_function(
                            block.reference_start,
                            block.length,
                            &mut function,
                        );
                        if function == LocusFunction::Coding {
                            break 'blocks;
                        }
                    }
                }
                locus_map.insert(j, function);
            }
        }
        locus_map
    }

    /// Constrain candidate genes to the read strand, recording the strand
    /// metrics along the way. At most one same-strand gene may remain.
    fn genes_consistent_with_read_strand(
        &self,
        result: &[&Gene],
        ids: Vec<usize>,
        record_negative: bool,
    ) -> Vec<usize> {
        let mut same_strand = Vec::new();
        let mut opposite_strand = Vec::new();
        for id in ids {
            if result[id].is_negative_strand() == record_negative {
                same_strand.push(id);
            } else {
                opposite_strand.push(id);
            }
        }

        if same_strand.is_empty() && !opposite_strand.is_empty() {
            self.reads_wrong_strand.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
        if same_strand.len() > 1 {
            self.ambiguous_reads_rejected.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
        // The read is now unambiguously assigned to a gene on the correct
        // strand, or to no gene at all.
        if !opposite_strand.is_empty() {
            self.read_ambiguous_gene_fixed.fetch_add(1, Ordering::Relaxed);
        }
        self.reads_right_strand.fetch_add(1, Ordering::Relaxed);
        same_strand
    }

    /// Render the `## ANNOTATION METRICS` section of the summary file.
    pub fn dump_metrics(&self) -> String {
        let total = self.total_reads.load(Ordering::Relaxed);
        let right = self.reads_right_strand.load(Ordering::Relaxed);
        let wrong = self.reads_wrong_strand.load(Ordering::Relaxed);
        let fixed = self.read_ambiguous_gene_fixed.load(Ordering::Relaxed);
        let rejected = self.ambiguous_reads_rejected.load(Ordering::Relaxed);

        info!(
            "TOTAL READS [{total}] CORRECT_STRAND [{right}] WRONG_STRAND [{wrong}] \
             AMBIGUOUS_STRAND_FIXED [{fixed}] AMBIGUOUS REJECTED READS [{rejected}]"
        );

        let mut out = String::from("## ANNOTATION METRICS\n");
        if self.anno_version != AnnoVersion::TenX {
            out.push_str(
                "TOTAL_READS\tREADS_WRONG_STRAND\tREADS_RIGHT_STRAND\t\
                 READ_AMBIGUOUS_GENE_FIXED\tAMBIGUOUS_READS_REJECTED\n",
            );
            let _ = writeln!(out, "{total}\t{wrong}\t{right}\t{fixed}\t{rejected}");
        } else {
            let map = self.map_reads.load(Ordering::Relaxed);
            let exonic = self.exonic_reads.load(Ordering::Relaxed);
            let intronic = self.intronic_reads.load(Ordering::Relaxed);
            let intergenic = self.intergenic_reads.load(Ordering::Relaxed)
                + self.nogene_reads.load(Ordering::Relaxed);
            let transcriptome = self.transcriptome_reads.load(Ordering::Relaxed);

            out.push_str(
                "TOTAL_READS\tMAP\tEXONIC\tINTRONIC\tINTERGENIC\tTRANSCRIPTOME\tANTISENSE\n",
            );
            let _ = writeln!(
                out,
                "{total}\t{map}\t{exonic}\t{intronic}\t{intergenic}\t{transcriptome}\t{wrong}"
            );
            let pct = |v: u64| {
                if total != 0 {
                    v as f64 * 100.0 / total as f64
                } else {
                    0.0
                }
            };
            let _ = writeln!(
                out,
                "{:.1}\t{:.1}\t{:.1}\t{:.1}\t{:.1}\t{:.1}\t{:.1}",
                100.0,
                pct(map),
                pct(exonic),
                pct(intronic),
                pct(intergenic),
                pct(transcriptome),
                pct(wrong)
            );
        }
        out
    }
}

/// Genes in `locus_map` with at least one exon intersecting the block.
fn genes_on_block_exons(
    result: &[&Gene],
    locus_map: &BTreeMap<usize, LocusFunction>,
    block: &AlignmentBlock,
    contig: &str,
) -> BTreeSet<usize> {
    let block_end = block.reference_start + block.length - 1;
    locus_map
        .keys()
        .copied()
        .filter(|id| {
            let gene = result[*id];
            contig == gene.contig()
                && gene.transcripts().values().any(|tx| {
                    tx.exons().iter().any(|e| {
                        utils::ranges_intersect(block.reference_start, block_end, e.start, e.end)
                    })
                })
        })
        .collect()
}

/// Comma-joined gene names and strands for the chosen genes.
fn compound_name_and_strand(result: &[&Gene], ids: &[usize]) -> (String, String) {
    let mut names = String::new();
    let mut strands = String::new();
    for id in ids {
        if !names.is_empty() {
            names.push_str(RECORD_SEP);
            strands.push_str(RECORD_SEP);
        }
        names.push_str(result[*id].name());
        strands.push(if result[*id].is_negative_strand() { '-' } else { '+' });
    }
    (names, strands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam::record::get_str_tag;
    use rust_htslib::bam::record::CigarString;
    use std::io::Write;

    fn annotation_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn aligned_record(pos: i64, len: u32, reverse: bool, mapq: u8) -> Record {
        let mut record = Record::new();
        let cigar = CigarString(vec![Cigar::Match(len)]);
        let seq = vec![b'A'; len as usize];
        let qual = vec![30u8; len as usize];
        record.set(b"read1", Some(&cigar), &seq, &qual);
        record.set_pos(pos);
        record.set_mapq(mapq);
        if reverse {
            record.set_reverse();
        }
        record
    }

    fn plus_gene_tagger(version: AnnoVersion) -> GeneTagger {
        let file = annotation_file(&[
            "chr1\tsrc\texon\t50\t300\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
            "chr1\tsrc\tCDS\t50\t300\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
        ]);
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        GeneTagger::new(index, version)
    }

    #[test]
    fn dropseq_v2_tags_a_coding_read() {
        let tagger = plus_gene_tagger(AnnoVersion::DropSeqV2);
        let mut record = aligned_record(99, 100, false, 30);
        tagger.set_annotation(&mut record, "chr1");

        assert_eq!(Some("EXONIC".to_string()), get_str_tag(&record, FUNCTION_TAG));
        assert_eq!(Some("G1".to_string()), get_str_tag(&record, GENE_TAG));
        assert_eq!(Some("+".to_string()), get_str_tag(&record, GENE_STRAND_TAG));
        assert_eq!(1, tagger.reads_right_strand.load(Ordering::Relaxed));
    }

    #[test]
    fn wrong_strand_read_gets_no_gene() {
        let tagger = plus_gene_tagger(AnnoVersion::DropSeqV2);
        let mut record = aligned_record(99, 100, true, 30);
        tagger.set_annotation(&mut record, "chr1");

        assert_eq!(None, get_str_tag(&record, GENE_TAG));
        assert_eq!(None, get_str_tag(&record, GENE_STRAND_TAG));
        assert_eq!(1, tagger.reads_wrong_strand.load(Ordering::Relaxed));
    }

    #[test]
    fn read_outside_all_genes_counts_as_nogene() {
        let tagger = plus_gene_tagger(AnnoVersion::DropSeqV2);
        let mut record = aligned_record(5000, 100, false, 30);
        tagger.set_annotation(&mut record, "chr1");

        assert_eq!(None, get_str_tag(&record, GENE_TAG));
        assert_eq!(1, tagger.nogene_reads.load(Ordering::Relaxed));
        assert_eq!(1, tagger.total_reads.load(Ordering::Relaxed));
    }

    #[test]
    fn ambiguous_same_strand_genes_are_rejected() {
        let file = annotation_file(&[
            "chr1\tsrc\texon\t50\t300\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
            "chr1\tsrc\texon\t80\t320\t.\t+\t.\tgene_id \"E2\"; gene_name \"G2\"; transcript_id \"T2\";",
        ]);
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        // Multi-gene reads allowed so both genes survive to the strand check.
        let mut tagger = GeneTagger::new(index, AnnoVersion::DropSeqV2);
        tagger.allow_multi_gene_reads = true;

        let mut record = aligned_record(99, 100, false, 30);
        tagger.set_annotation(&mut record, "chr1");
        assert_eq!(None, get_str_tag(&record, GENE_TAG));
        assert_eq!(1, tagger.ambiguous_reads_rejected.load(Ordering::Relaxed));
    }

    #[test]
    fn multi_gene_read_is_dropped_without_allowance() {
        let file = annotation_file(&[
            "chr1\tsrc\texon\t50\t300\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
            "chr1\tsrc\texon\t80\t320\t.\t+\t.\tgene_id \"E2\"; gene_name \"G2\"; transcript_id \"T2\";",
        ]);
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        let tagger = GeneTagger::new(index, AnnoVersion::DropSeqV2);

        let mut record = aligned_record(99, 100, false, 30);
        tagger.set_annotation(&mut record, "chr1");
        // The exon set is cleared, so no GE and in particular no comma list.
        assert_eq!(None, get_str_tag(&record, GENE_TAG));
    }

    #[test]
    fn tenx_exon_majority_wins() {
        let file = annotation_file(&[
            "chr1\tsrc\texon\t100\t179\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
        ]);
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        let tagger = GeneTagger::new(index, AnnoVersion::TenX);

        // 80 of 100 aligned bases fall into the exon.
        let mut record = aligned_record(99, 100, false, 255);
        tagger.set_annotation(&mut record, "chr1");

        assert_eq!(Some("EXONIC".to_string()), get_str_tag(&record, FUNCTION_TAG));
        assert_eq!(Some("G1".to_string()), get_str_tag(&record, GENE_TAG));
        assert_eq!(1, tagger.map_reads.load(Ordering::Relaxed));
        assert_eq!(1, tagger.exonic_reads.load(Ordering::Relaxed));
        assert_eq!(1, tagger.transcriptome_reads.load(Ordering::Relaxed));
    }

    #[test]
    fn tenx_minor_exon_overlap_is_intronic() {
        let file = annotation_file(&[
            "chr1\tsrc\texon\t100\t139\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
            "chr1\tsrc\texon\t400\t500\t.\t+\t.\tgene_id \"E1\"; gene_name \"G1\"; transcript_id \"T1\";",
        ]);
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        let tagger = GeneTagger::new(index, AnnoVersion::TenX);

        // 40 exonic bases of 100: below the majority, inside the gene body.
        let mut record = aligned_record(99, 100, false, 255);
        tagger.set_annotation(&mut record, "chr1");

        assert_eq!(
            Some("INTRONIC".to_string()),
            get_str_tag(&record, FUNCTION_TAG)
        );
        assert_eq!(1, tagger.intronic_reads.load(Ordering::Relaxed));
        assert_eq!(0, tagger.transcriptome_reads.load(Ordering::Relaxed));
    }

    #[test]
    fn annotation_is_idempotent() {
        let tagger = plus_gene_tagger(AnnoVersion::DropSeqV2);
        let mut record = aligned_record(99, 100, false, 30);
        tagger.set_annotation(&mut record, "chr1");
        let first = (
            get_str_tag(&record, FUNCTION_TAG),
            get_str_tag(&record, GENE_TAG),
            get_str_tag(&record, GENE_STRAND_TAG),
        );
        tagger.set_annotation(&mut record, "chr1");
        let second = (
            get_str_tag(&record, FUNCTION_TAG),
            get_str_tag(&record, GENE_TAG),
            get_str_tag(&record, GENE_STRAND_TAG),
        );
        assert_eq!(first, second);
    }
}
