//! # Gene builder
//!
//! Folds the raw records of one gene name into [`Gene`] values. When a
//! gene is annotated in several versions only the highest version is kept,
//! and a gene whose records span several contigs is split into one entry
//! per contiguous same-contig run. Structural problems (missing transcript
//! ids, overlapping exons, disagreeing gene ids) surface as errors so the
//! caller can skip the offending gene and keep going.
use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Result};

use crate::annotation::gene::{Exon, Gene, Transcript};
use crate::annotation::reader::GtfRecord;

/// Build the gene entries for the records of a single gene name.
pub fn make_genes(records: &[GtfRecord]) -> Result<Vec<Gene>> {
    let mut by_version: HashMap<i32, Vec<&GtfRecord>> = HashMap::new();
    for record in records {
        by_version.entry(record.gene_version).or_default().push(record);
    }
    let max_version = by_version.keys().copied().max().unwrap_or(-1);
    make_genes_from_records(&by_version[&max_version])
}

/// Split the records into per-contig runs (preserving record order) and
/// build one gene per run.
fn make_genes_from_records(records: &[&GtfRecord]) -> Result<Vec<Gene>> {
    if !gene_in_multiple_contigs(records) {
        return Ok(vec![make_gene_with_transcripts(records)?]);
    }

    let mut genes = Vec::new();
    let mut run: Vec<&GtfRecord> = Vec::new();
    for record in records {
        if !run.is_empty() && record.contig != run[0].contig {
            genes.push(make_gene_with_transcripts(&run)?);
            run.clear();
        }
        run.push(*record);
    }
    if !run.is_empty() {
        genes.push(make_gene_with_transcripts(&run)?);
    }
    Ok(genes)
}

fn gene_in_multiple_contigs(records: &[&GtfRecord]) -> bool {
    records.iter().any(|r| r.contig != records[0].contig)
}

fn make_gene_with_transcripts(records: &[&GtfRecord]) -> Result<Gene> {
    let mut gene = make_gene(records)?;

    let mut by_transcript: HashMap<&str, Vec<&GtfRecord>> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for record in records {
        // Gene records carry no transcript.
        if record.feature_type == "gene" {
            continue;
        }
        if record.transcript_id.is_empty() {
            bail!(
                "Annotation record does not have a transcript id: {}",
                record.gene_name
            );
        }
        let entry = by_transcript.entry(record.transcript_id.as_str()).or_default();
        if entry.is_empty() {
            order.push(record.transcript_id.as_str());
        }
        entry.push(*record);
    }

    for transcript_id in order {
        add_transcript_to_gene(&mut gene, &by_transcript[transcript_id])?;
    }

    if gene.transcripts().is_empty() {
        bail!("No transcript in annotation for gene {}", gene.name());
    }
    Ok(gene)
}

fn make_gene(records: &[&GtfRecord]) -> Result<Gene> {
    let gene_record = records[0];

    let mut start = i64::MAX;
    let mut end = i64::MIN;
    let mut gene_ids: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        start = start.min(record.start);
        end = end.max(record.end);
        gene_ids.insert(&record.gene_id);
    }
    if gene_ids.len() > 1 {
        bail!(
            "Multiple gene IDs for gene {}: {}",
            gene_record.gene_name,
            gene_ids.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    let gene = Gene::new(
        gene_record.contig.clone(),
        start,
        end,
        gene_record.negative_strand,
        gene_record.gene_name.clone(),
        gene_record.gene_id.clone(),
        gene_record.feature_type.clone(),
        gene_record.gene_version,
    );

    for record in records {
        validate_record(record, &gene)?;
    }
    Ok(gene)
}

fn validate_record(record: &GtfRecord, gene: &Gene) -> Result<()> {
    if gene.contig() != record.contig {
        bail!("Strand disagreement in annotation for gene {}", gene.name());
    }
    if record.feature_type == "gene"
        && (record.start != gene.start() || record.end != gene.end())
    {
        bail!(
            "Gene record extent differs from computed extent for gene {}",
            gene.name()
        );
    }
    Ok(())
}

fn add_transcript_to_gene(gene: &mut Gene, records: &[&GtfRecord]) -> Result<()> {
    let first = records[0];
    let description = format!("{}:{}", gene.name(), first.transcript_name);

    let mut exons: Vec<Exon> = Vec::new();
    let mut transcription_start = i64::MAX;
    let mut transcription_end = i64::MIN;
    let mut coding_start = i64::MAX;
    let mut coding_end = i64::MIN;
    for record in records {
        match record.feature_type.as_str() {
            "exon" => {
                exons.push(Exon {
                    start: record.start,
                    end: record.end,
                });
                transcription_start = transcription_start.min(record.start);
                transcription_end = transcription_end.max(record.end);
            }
            "CDS" => {
                coding_start = coding_start.min(record.start);
                coding_end = coding_end.max(record.end);
            }
            _ => {}
        }
    }

    exons.sort_by_key(|e| e.start);
    if coding_start == i64::MAX {
        coding_start = transcription_start;
    }
    if coding_end == i64::MIN {
        coding_end = transcription_end;
    }

    for (i, exon) in exons.iter().enumerate() {
        if exon.start > exon.end {
            bail!("Exon has 0 or negative extent for {description}");
        }
        if i > 0 && exons[i - 1].end > exon.start {
            bail!("Exons overlap for {description}");
        }
    }

    let transcript = gene.add_transcript(Transcript::new(
        transcription_start,
        transcription_end,
        coding_start,
        coding_end,
        first.transcript_name.clone(),
        first.transcript_id.clone(),
    ))?;
    transcript.add_exons(exons);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        contig: &str,
        feature: &str,
        start: i64,
        end: i64,
        transcript: &str,
    ) -> GtfRecord {
        GtfRecord {
            contig: contig.to_string(),
            start,
            end,
            negative_strand: false,
            feature_type: feature.to_string(),
            gene_id: "ENSG01".to_string(),
            gene_name: "G1".to_string(),
            gene_version: -1,
            transcript_id: transcript.to_string(),
            transcript_name: transcript.to_string(),
        }
    }

    #[test]
    fn single_contig_gene_with_cds() {
        let records = vec![
            record("chr1", "gene", 100, 400, ""),
            record("chr1", "exon", 100, 200, "T1"),
            record("chr1", "exon", 300, 400, "T1"),
            record("chr1", "CDS", 150, 350, "T1"),
        ];
        let genes = make_genes(&records).unwrap();
        assert_eq!(1, genes.len());
        let gene = &genes[0];
        assert_eq!(100, gene.start());
        assert_eq!(400, gene.end());
        let tx = &gene.transcripts()["T1"];
        assert_eq!(100, tx.transcription_start);
        assert_eq!(400, tx.transcription_end);
        assert_eq!(150, tx.coding_start);
        assert_eq!(350, tx.coding_end);
        assert_eq!(2, tx.exons().len());
    }

    #[test]
    fn coding_bounds_default_to_transcription_bounds() {
        let records = vec![record("chr1", "exon", 100, 200, "T1")];
        let genes = make_genes(&records).unwrap();
        let tx = &genes[0].transcripts()["T1"];
        assert_eq!(100, tx.coding_start);
        assert_eq!(200, tx.coding_end);
    }

    #[test]
    fn gene_across_two_contigs_is_split() {
        let records = vec![
            record("chr1", "exon", 100, 200, "T1"),
            record("chr2", "exon", 500, 600, "T2"),
        ];
        let genes = make_genes(&records).unwrap();
        assert_eq!(2, genes.len());
        assert_eq!("chr1", genes[0].contig());
        assert_eq!("chr2", genes[1].contig());
    }

    #[test]
    fn only_the_highest_gene_version_is_kept() {
        let mut old = record("chr1", "exon", 100, 200, "T1");
        old.gene_version = 1;
        let mut new = record("chr1", "exon", 150, 260, "T2");
        new.gene_version = 2;
        let genes = make_genes(&[old, new]).unwrap();
        assert_eq!(1, genes.len());
        assert_eq!(150, genes[0].start());
        assert_eq!(260, genes[0].end());
        assert!(genes[0].transcripts().contains_key("T2"));
        assert!(!genes[0].transcripts().contains_key("T1"));
    }

    #[test]
    fn structural_errors_are_reported() {
        // Missing transcript id on a non-gene record.
        let records = vec![record("chr1", "exon", 100, 200, "")];
        assert!(make_genes(&records).is_err());

        // Overlapping exons within one transcript.
        let records = vec![
            record("chr1", "exon", 100, 250, "T1"),
            record("chr1", "exon", 200, 300, "T1"),
        ];
        assert!(make_genes(&records).is_err());

        // Disagreeing gene ids.
        let mut other = record("chr1", "exon", 300, 400, "T2");
        other.gene_id = "ENSG02".to_string();
        let records = vec![record("chr1", "exon", 100, 200, "T1"), other];
        assert!(make_genes(&records).is_err());

        // No transcripts at all.
        let records = vec![record("chr1", "gene", 100, 200, "")];
        assert!(make_genes(&records).is_err());
    }
}
