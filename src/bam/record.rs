//! # BAM record helpers
//!
//! Thin layer over `rust_htslib::bam::Record`: typed tag access, the
//! structured qname convention used by the upstream barcode demultiplexer,
//! flag manipulation, and the positional fingerprint used for read
//! deduplication when no UMI is available.
use log::warn;
use rust_htslib::bam::record::{Aux, Record};
use rust_htslib::htslib;

/// Separator of qname fields, e.g.
/// `V300062757_T67L3C006R0070857078|||CB:Z:39_19_58583_28608|||UR:Z:TTGGCGGGT|||UY:Z:E*5)<E0+(`
pub const QNAME_SEP: &str = "|||";
const PREFIX_LEN: usize = 5;

pub const FUNCTION_TAG: &[u8; 2] = b"XF";
pub const GENE_TAG: &[u8; 2] = b"GE";
pub const GENE_STRAND_TAG: &[u8; 2] = b"GS";
pub const BARCODE_TAG: &[u8; 2] = b"CB";
pub const UMI_TAG: &[u8; 2] = b"UR";
pub const UMI_QUAL_TAG: &[u8; 2] = b"UY";
pub const UMI_CORRECTED_TAG: &[u8; 2] = b"UB";
pub const HIT_INDEX_TAG: &[u8; 2] = b"HI";

/// Barcode, UMI, and UMI quality parsed out of a structured qname.
#[derive(Debug, Default, Clone)]
pub struct QnameFields {
    pub barcode: String,
    pub umi: String,
    pub umi_qual: String,
}

/// Parse the `|||`-separated qname fields by their 5-character tag prefix.
pub fn parse_qname(qname: &str) -> QnameFields {
    let mut fields = QnameFields::default();
    for part in qname.split(QNAME_SEP) {
        if part.len() < PREFIX_LEN {
            continue;
        }
        let (prefix, value) = part.split_at(PREFIX_LEN);
        match prefix {
            "CB:Z:" => fields.barcode = value.to_string(),
            "UR:Z:" => fields.umi = value.to_string(),
            "UY:Z:" => fields.umi_qual = value.to_string(),
            _ => {}
        }
    }
    fields
}

/// Move the qname fields into auxiliary tags and truncate the qname at
/// the first separator. The barcode tag is always appended; UMI and UMI
/// quality only when present. Append failures are logged and the record
/// proceeds without that tag.
pub fn qname_fields_to_tags(record: &mut Record) -> QnameFields {
    let qname = String::from_utf8_lossy(record.qname()).into_owned();
    let fields = parse_qname(&qname);

    append_str_tag(record, BARCODE_TAG, &fields.barcode);
    if !fields.umi.is_empty() {
        append_str_tag(record, UMI_TAG, &fields.umi);
    }
    if !fields.umi_qual.is_empty() {
        append_str_tag(record, UMI_QUAL_TAG, &fields.umi_qual);
    }

    if let Some(pos) = qname.find(QNAME_SEP) {
        record.set_qname(qname[..pos].as_bytes());
    }
    fields
}

/// Append a `Z`-typed string tag, logging a warning if htslib refuses.
pub fn append_str_tag(record: &mut Record, tag: &[u8; 2], value: &str) {
    if let Err(e) = record.push_aux(tag, Aux::String(value)) {
        warn!(
            "appending tag {} failed: {e}",
            String::from_utf8_lossy(tag)
        );
    }
}

/// Replace a string tag, appending it if not present yet.
pub fn update_str_tag(record: &mut Record, tag: &[u8; 2], value: &str) {
    let _ = record.remove_aux(tag);
    append_str_tag(record, tag, value);
}

/// Fetch a `Z`-typed string tag.
pub fn get_str_tag(record: &Record, tag: &[u8; 2]) -> Option<String> {
    match record.aux(tag) {
        Ok(Aux::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Fetch an integer tag of any width.
pub fn get_int_tag(record: &Record, tag: &[u8; 2]) -> Option<i64> {
    match record.aux(tag) {
        Ok(Aux::I8(v)) => Some(i64::from(v)),
        Ok(Aux::U8(v)) => Some(i64::from(v)),
        Ok(Aux::I16(v)) => Some(i64::from(v)),
        Ok(Aux::U16(v)) => Some(i64::from(v)),
        Ok(Aux::I32(v)) => Some(i64::from(v)),
        Ok(Aux::U32(v)) => Some(i64::from(v)),
        _ => None,
    }
}

/// Positional fingerprint used for deduplication when no UMI is present.
/// Forward reads use (pos, pos + isize), reverse mates (mpos − isize, mpos).
pub fn dedup_marker(record: &Record) -> String {
    let isize = record.insert_size();
    if isize < 0 {
        format!("{}{}", record.mpos() - isize, record.mpos())
    } else {
        format!("{}{}", record.pos(), record.pos() + isize)
    }
}

pub fn set_qc_fail(record: &mut Record) {
    record.set_flags(record.flags() | htslib::BAM_FQCFAIL as u16);
}

pub fn set_duplicate(record: &mut Record) {
    record.set_flags(record.flags() | htslib::BAM_FDUP as u16);
}

pub fn is_qc_fail(record: &Record) -> bool {
    record.flags() & htslib::BAM_FQCFAIL as u16 != 0
}

pub fn is_duplicate(record: &Record) -> bool {
    record.flags() & htslib::BAM_FDUP as u16 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::CigarString;

    fn record_with_qname(qname: &str) -> Record {
        let mut record = Record::new();
        let cigar = CigarString(vec![rust_htslib::bam::record::Cigar::Match(4)]);
        record.set(qname.as_bytes(), Some(&cigar), b"ACGT", b"IIII");
        record
    }

    #[test]
    fn qname_fields_are_parsed_by_prefix() {
        let fields =
            parse_qname("read1|||CB:Z:39_19_58583_28608|||UR:Z:TTGGCGGGT|||UY:Z:E*5)<E0+(");
        assert_eq!("39_19_58583_28608", fields.barcode);
        assert_eq!("TTGGCGGGT", fields.umi);
        assert_eq!("E*5)<E0+(", fields.umi_qual);

        let fields = parse_qname("plain_read_name");
        assert!(fields.barcode.is_empty());
        assert!(fields.umi.is_empty());
    }

    #[test]
    fn qname_fields_move_into_tags() {
        let mut record = record_with_qname("read1|||CB:Z:AAACCC|||UR:Z:ACGT");
        let fields = qname_fields_to_tags(&mut record);
        assert_eq!("AAACCC", fields.barcode);
        assert_eq!(b"read1", record.qname());
        assert_eq!(Some("AAACCC".to_string()), get_str_tag(&record, BARCODE_TAG));
        assert_eq!(Some("ACGT".to_string()), get_str_tag(&record, UMI_TAG));
        assert_eq!(None, get_str_tag(&record, UMI_QUAL_TAG));
    }

    #[test]
    fn string_tags_can_be_replaced() {
        let mut record = record_with_qname("read1");
        update_str_tag(&mut record, GENE_TAG, "G1");
        assert_eq!(Some("G1".to_string()), get_str_tag(&record, GENE_TAG));
        update_str_tag(&mut record, GENE_TAG, "G2");
        assert_eq!(Some("G2".to_string()), get_str_tag(&record, GENE_TAG));
    }

    #[test]
    fn marker_uses_the_leftmost_mate() {
        let mut record = record_with_qname("read1");
        record.set_pos(100);
        record.set_insert_size(150);
        assert_eq!("100250", dedup_marker(&record));

        record.set_insert_size(-150);
        record.set_mpos(100);
        assert_eq!("250100", dedup_marker(&record));
    }

    #[test]
    fn flags_are_orred_in() {
        let mut record = record_with_qname("read1");
        assert!(!is_qc_fail(&record));
        set_qc_fail(&mut record);
        set_duplicate(&mut record);
        assert!(is_qc_fail(&record));
        assert!(is_duplicate(&record));
    }
}
