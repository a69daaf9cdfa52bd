//! # BAM open/index helpers
//!
//! Opening readers and writers, keeping the accompanying index fresh, and
//! extracting the contig table from a header. Random access goes through
//! `IndexedReader`, whole-file scans through the plain `Reader`; both are
//! opened per worker thread so no htslib handle is ever shared.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use rust_htslib::bam::{self, Read};

use crate::utils;

/// Make sure `path` has a usable index that is not older than the BAM
/// itself. A BAI is attempted first; when htslib refuses (e.g. the BAM
/// exceeds the BAI-addressable region) a CSI is built instead.
pub fn ensure_index<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let bai = with_suffix(path, ".bai");
    let csi = with_suffix(path, ".csi");

    if bai.exists() && !utils::file_older(&bai, path)? {
        return Ok(());
    }
    if csi.exists() && !utils::file_older(&csi, path)? {
        return Ok(());
    }

    debug!("building index for {}", path.display());
    if bam::index::build(path, Some(bai.as_path()), bam::index::Type::Bai, 4).is_ok() {
        return Ok(());
    }
    bam::index::build(path, Some(csi.as_path()), bam::index::Type::Csi(14), 4)
        .with_context(|| format!("Failed to create index for {}", path.display()))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Open a BAM for random access, building the index first if needed.
pub fn open_indexed<P: AsRef<Path>>(path: P) -> Result<bam::IndexedReader> {
    let path = path.as_ref();
    ensure_index(path)?;
    bam::IndexedReader::from_path(path)
        .with_context(|| format!("Could not open {}", path.display()))
}

/// Open a BAM for sequential reading.
pub fn open_sequential<P: AsRef<Path>>(path: P) -> Result<bam::Reader> {
    let path = path.as_ref();
    bam::Reader::from_path(path).with_context(|| format!("Could not open {}", path.display()))
}

/// Open a shard writer carrying the template header.
pub fn open_writer<P: AsRef<Path>>(path: P, template: &bam::HeaderView) -> Result<bam::Writer> {
    let path = path.as_ref();
    bam::Writer::from_path(path, &bam::Header::from_template(template), bam::Format::Bam)
        .with_context(|| format!("Could not create {}", path.display()))
}

/// Open a shard writer whose header is copied from another BAM file.
pub fn open_writer_like<P: AsRef<Path>>(path: P, template_bam: P) -> Result<bam::Writer> {
    let reader = open_sequential(template_bam)?;
    open_writer(path, reader.header())
}

/// The (name, length) contig table of a BAM header, in header order.
pub fn contigs(header: &bam::HeaderView) -> Result<Vec<(String, u64)>> {
    let mut result = Vec::new();
    for (tid, name) in header.target_names().iter().enumerate() {
        let name = std::str::from_utf8(name)
            .context("Contig name is not valid UTF-8")?
            .to_string();
        let len = header
            .target_len(tid as u32)
            .context("Could not get target length from header")?;
        result.push((name, len));
    }
    Ok(result)
}

/// Contig name of a record, empty for unmapped reads.
pub fn ref_name(header: &bam::HeaderView, record: &bam::Record) -> String {
    let tid = record.tid();
    if tid < 0 {
        return String::new();
    }
    String::from_utf8_lossy(header.tid2name(tid as u32)).into_owned()
}

/// Read the contig table of a BAM file.
pub fn contigs_of<P: AsRef<Path>>(path: P) -> Result<Vec<(String, u64)>> {
    let reader = open_sequential(path)?;
    contigs(reader.header())
}
