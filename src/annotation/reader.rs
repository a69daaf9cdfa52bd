//! # GTF/GFF record loader
//!
//! Reads an annotation file line by line and gathers the records by gene
//! name. Only the handful of attributes needed downstream is kept. The
//! format is dispatched on the file extension: `.gtf` uses space-separated
//! attribute pairs, `.gff` uses `key=value` pairs with rolling gene and
//! transcript carryovers propagated to descendant features.
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{bail, Context, Result};
use log::info;

/// One parsed annotation line, trimmed to the fields the gene builder needs.
#[derive(Debug, Clone, Default)]
pub struct GtfRecord {
    pub contig: String,
    pub start: i64,
    pub end: i64,
    pub negative_strand: bool,
    pub feature_type: String,
    pub gene_id: String,
    pub gene_name: String,
    pub gene_version: i32,
    pub transcript_id: String,
    pub transcript_name: String,
}

/// Records gathered by gene name, plus the set of contigs seen.
pub type GtfMap = HashMap<String, Vec<GtfRecord>>;

const GTF_COLUMNS: usize = 9;
const COL_CHROMOSOME: usize = 0;
const COL_FEATURE: usize = 2;
const COL_START: usize = 3;
const COL_END: usize = 4;
const COL_STRAND: usize = 6;
const COL_ATTRIBUTE: usize = 8;

/// Load an annotation file and gather its records by gene name. Records
/// without a gene name (e.g. pseudo genes in sparse annotations) are
/// dropped.
pub fn load<P: AsRef<Path>>(path: P) -> Result<(GtfMap, HashSet<String>)> {
    let path = path.as_ref();
    let is_gff = match path.extension().and_then(|e| e.to_str()) {
        Some("gtf") => false,
        Some("gff") => true,
        _ => bail!("Invalid gtf/gff file format: {}", path.display()),
    };

    let file = File::open(path)
        .with_context(|| format!("Could not open annotation file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut gtf_map: GtfMap = HashMap::new();
    let mut contigs: HashSet<String> = HashSet::new();
    let mut carryover = GffCarryover::default();
    let mut num = 0usize;

    for line in reader.lines() {
        let line = line.with_context(|| format!("Failed reading {}", path.display()))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record = if is_gff {
            parse_tabbed_line_gff(&line, &mut carryover)?
        } else {
            parse_tabbed_line(&line)?
        };
        let Some(record) = record else { continue };

        num += 1;
        if num % 100_000 == 0 {
            info!(
                "read {num:10} annotation records, last position {}:{}",
                record.contig, record.start
            );
        }

        contigs.insert(record.contig.clone());
        if !record.gene_name.is_empty() {
            gtf_map
                .entry(record.gene_name.clone())
                .or_default()
                .push(record);
        }
    }

    Ok((gtf_map, contigs))
}

/// Split a tab line into the standard nine columns and fill the shared
/// coordinate fields.
fn parse_columns(line: &str) -> Result<(Vec<&str>, GtfRecord)> {
    let fields: Vec<&str> = line.split('\t').filter(|f| !f.is_empty()).collect();
    if fields.len() < GTF_COLUMNS {
        bail!("Annotation line has fewer than {GTF_COLUMNS} columns: {line}");
    }
    let record = GtfRecord {
        contig: fields[COL_CHROMOSOME].to_string(),
        start: fields[COL_START]
            .parse()
            .with_context(|| format!("Bad start coordinate in line: {line}"))?,
        end: fields[COL_END]
            .parse()
            .with_context(|| format!("Bad end coordinate in line: {line}"))?,
        negative_strand: fields[COL_STRAND] == "-",
        feature_type: fields[COL_FEATURE].to_string(),
        gene_version: -1,
        ..GtfRecord::default()
    };
    Ok((fields, record))
}

fn parse_tabbed_line(line: &str) -> Result<Option<GtfRecord>> {
    let (fields, mut record) = parse_columns(line)?;
    let attrs = parse_attributes(fields[COL_ATTRIBUTE]);

    record.gene_id = attrs.gene_id;
    record.gene_name = attrs.gene_name;
    if record.feature_type != "gene" {
        record.transcript_id = attrs.transcript_id;
        record.transcript_name = if attrs.transcript_name.is_empty() {
            record.transcript_id.clone()
        } else {
            attrs.transcript_name
        };
    }
    Ok(Some(record))
}

fn parse_tabbed_line_gff(line: &str, carryover: &mut GffCarryover) -> Result<Option<GtfRecord>> {
    let (fields, mut record) = parse_columns(line)?;
    let attrs = parse_attributes_gff(fields[COL_ATTRIBUTE]);

    match record.feature_type.as_str() {
        "region" => {
            *carryover = GffCarryover::default();
            return Ok(None);
        }
        "gene" => {
            if let Some(id) = attrs.get("ID") {
                carryover.gene_id = id.clone();
            }
            if let Some(name) = attrs.get("Name") {
                carryover.gene_name = name.clone();
            }
        }
        "mRNA" => {
            if let Some(id) = attrs.get("ID") {
                carryover.transcript_id = id.clone();
            }
            if let Some(name) = attrs.get("Name") {
                carryover.transcript_name = name.clone();
            }
        }
        _ => {}
    }

    record.gene_id = carryover.gene_id.clone();
    record.gene_name = carryover.gene_name.clone();
    if record.feature_type != "gene" {
        record.transcript_id = carryover.transcript_id.clone();
        record.transcript_name = carryover.transcript_name.clone();
    }
    Ok(Some(record))
}

/// Gene and transcript identifiers carried from `gene`/`mRNA` features to
/// their descendants. A `region` feature resets all of them.
#[derive(Debug, Default)]
struct GffCarryover {
    gene_id: String,
    gene_name: String,
    transcript_id: String,
    transcript_name: String,
}

#[derive(Debug, Default)]
struct GtfAttributes {
    gene_id: String,
    gene_name: String,
    transcript_id: String,
    transcript_name: String,
}

/// Parse the GTF attribute column: whitespace-separated key/value pairs,
/// values quoted and terminated by `";`. Unknown keys are skipped; the
/// scan stops as soon as all wanted keys were seen.
fn parse_attributes(s: &str) -> GtfAttributes {
    let mut attrs = GtfAttributes::default();
    let mut found = 0usize;
    let mut tokens = s.split_whitespace();
    while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
        let slot = match key {
            "gene_id" => &mut attrs.gene_id,
            "gene_name" => &mut attrs.gene_name,
            "transcript_id" => &mut attrs.transcript_id,
            "transcript_name" => &mut attrs.transcript_name,
            _ => continue,
        };
        *slot = strip_attribute_value(value);
        found += 1;
        if found == 4 {
            break;
        }
    }
    attrs
}

/// Remove the surrounding quotes and the trailing `;` from an attribute
/// value token, e.g. `"DDX11L1";` becomes `DDX11L1`.
fn strip_attribute_value(token: &str) -> String {
    token
        .trim_end_matches(';')
        .trim_matches('"')
        .to_string()
}

/// Parse a GFF attribute column: `;`-separated `key=value` pairs.
fn parse_attributes_gff(s: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for item in s.split(';') {
        if item.is_empty() {
            continue;
        }
        if let Some((key, value)) = item.split_once('=') {
            attrs.insert(key.to_string(), value.to_string());
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn attribute_values_are_unquoted() {
        let attrs = parse_attributes(
            r#"gene_id "ENSG01"; gene_name "DDX11L1"; transcript_id "ENST01"; level 2;"#,
        );
        assert_eq!("ENSG01", attrs.gene_id);
        assert_eq!("DDX11L1", attrs.gene_name);
        assert_eq!("ENST01", attrs.transcript_id);
        assert_eq!("", attrs.transcript_name);
        assert_eq!("X", strip_attribute_value(r#""X""#));
    }

    #[test]
    fn gtf_lines_gather_by_gene_name() {
        let mut file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();
        writeln!(file, "#comment").unwrap();
        writeln!(
            file,
            "chr1\tHAVANA\tgene\t100\t400\t.\t+\t.\tgene_id \"ENSG01\"; gene_name \"G1\";"
        )
        .unwrap();
        writeln!(
            file,
            "chr1\tHAVANA\texon\t100\t200\t.\t+\t.\tgene_id \"ENSG01\"; gene_name \"G1\"; transcript_id \"T1\";"
        )
        .unwrap();
        writeln!(
            file,
            "chr1\tHAVANA\texon\t300\t400\t.\t+\t.\tgene_id \"ENSG01\"; gene_name \"\"; transcript_id \"T1\";"
        )
        .unwrap();

        let (map, contigs) = load(file.path()).unwrap();
        // The empty gene_name record is dropped.
        assert_eq!(2, map["G1"].len());
        assert!(contigs.contains("chr1"));
        assert_eq!("T1", map["G1"][1].transcript_id);
        assert_eq!("T1", map["G1"][1].transcript_name);
        assert!(map["G1"][0].transcript_id.is_empty());
    }

    #[test]
    fn gff_carryovers_propagate_and_reset() {
        let mut file = tempfile::Builder::new().suffix(".gff").tempfile().unwrap();
        writeln!(
            file,
            "chr2\tRefSeq\tgene\t100\t500\t.\t-\t.\tID=gene1;Name=NG1"
        )
        .unwrap();
        writeln!(
            file,
            "chr2\tRefSeq\tmRNA\t100\t500\t.\t-\t.\tID=rna1;Name=NM1"
        )
        .unwrap();
        writeln!(file, "chr2\tRefSeq\texon\t100\t200\t.\t-\t.\tID=exon1").unwrap();
        writeln!(file, "chr2\tRefSeq\tregion\t1\t9999\t.\t+\t.\tID=chr2").unwrap();
        writeln!(file, "chr2\tRefSeq\texon\t300\t400\t.\t-\t.\tID=exon2").unwrap();

        let (map, _) = load(file.path()).unwrap();
        let records = &map["NG1"];
        assert_eq!(3, records.len());
        let exon = &records[2];
        assert_eq!("exon", exon.feature_type);
        assert_eq!("gene1", exon.gene_id);
        assert_eq!("rna1", exon.transcript_id);
        assert_eq!("NM1", exon.transcript_name);
        assert!(exon.negative_strand);
        // The record after the region reset carries no gene name and is gone.
        assert!(!map.values().flatten().any(|r| r.start == 300));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".bed").tempfile().unwrap();
        assert!(load(file.path()).is_err());
    }
}
