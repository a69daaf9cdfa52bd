//! # Shard concatenation by raw BGZF block splicing
//!
//! Merges per-contig shard BAMs into the final output without
//! recompressing: the first shard's header is written once, then each
//! shard's compressed blocks are copied verbatim. The 28-byte empty BGZF
//! block terminating each shard is held back and only written when it
//! turns out not to be the shard's last block, so exactly one terminator
//! ends the merged file. Uses the raw htslib `bgzf_*` entry points since
//! rust_htslib's safe wrappers do not expose raw block I/O.
use std::ffi::CString;
use std::os::raw::c_void;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::warn;
use rust_htslib::htslib;

const BUF_SIZE: usize = 0x10000;
const GZIP_ID1: u8 = 31;
const GZIP_ID2: u8 = 139;
const BGZF_EMPTY_BLOCK_SIZE: usize = 28;

struct Bgzf(*mut htslib::BGZF);

impl Bgzf {
    fn open(path: &Path, mode: &str) -> Result<Bgzf> {
        let cpath = CString::new(path.as_os_str().to_str().context("Non-UTF-8 path")?)?;
        let cmode = CString::new(mode)?;
        let fp = unsafe { htslib::bgzf_open(cpath.as_ptr(), cmode.as_ptr()) };
        if fp.is_null() {
            bail!("Could not open {} for BGZF {mode}", path.display());
        }
        Ok(Bgzf(fp))
    }
}

impl Drop for Bgzf {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                htslib::bgzf_close(self.0);
            }
            self.0 = std::ptr::null_mut();
        }
    }
}

/// Concatenate `shards` into `out`. The header of the first shard becomes
/// the header of the merged file; all shards were written from the same
/// template so the headers agree by construction.
pub fn cat(shards: &[impl AsRef<Path>], out: &Path) -> Result<()> {
    let fp = Bgzf::open(out, "w")?;

    let mut buf = vec![0u8; BUF_SIZE];
    let mut ebuf = [0u8; BGZF_EMPTY_BLOCK_SIZE];
    let es = BGZF_EMPTY_BLOCK_SIZE;

    for (i, shard) in shards.iter().enumerate() {
        let shard = shard.as_ref();
        let input = Bgzf::open(shard, "r")?;

        let header = unsafe { htslib::bam_hdr_read(input.0) };
        if header.is_null() {
            bail!("Couldn't read header of shard {}", shard.display());
        }
        if i == 0 {
            let ret = unsafe { htslib::bam_hdr_write(fp.0, header) };
            if ret < 0 {
                unsafe { htslib::sam_hdr_destroy(header) };
                bail!("Couldn't write header to {}", out.display());
            }
        }
        unsafe { htslib::sam_hdr_destroy(header) };

        // Flush any data htslib buffered past the header before switching
        // to raw block copies.
        unsafe {
            let block_offset = (*input.0).block_offset as usize;
            let block_length = (*input.0).block_length as usize;
            if block_offset < block_length {
                let pending = (*input.0).uncompressed_block as *const u8;
                let slice = std::slice::from_raw_parts(
                    pending.add(block_offset),
                    block_length - block_offset,
                );
                if htslib::bgzf_write(fp.0, slice.as_ptr() as *const c_void, slice.len()) < 0 {
                    bail!("Error writing to {}", out.display());
                }
                if htslib::bgzf_flush(fp.0) != 0 {
                    bail!("Error flushing {}", out.display());
                }
            }
        }

        let mut wrote_any = false;
        loop {
            let len = unsafe {
                htslib::bgzf_raw_read(input.0, buf.as_mut_ptr() as *mut c_void, BUF_SIZE)
            };
            if len <= 0 {
                break;
            }
            let len = len as usize;
            if len < es {
                // Shorter than one empty block: shift the holdback window.
                if !wrote_any {
                    bail!("Truncated shard file {}", shard.display());
                }
                raw_write(&fp, &ebuf[..len], out)?;
                ebuf.copy_within(len.., 0);
                ebuf[es - len..].copy_from_slice(&buf[..len]);
            } else {
                if wrote_any {
                    raw_write(&fp, &ebuf, out)?;
                }
                let keep = len - es;
                ebuf.copy_from_slice(&buf[keep..len]);
                raw_write(&fp, &buf[..keep], out)?;
            }
            wrote_any = true;
        }

        // The held-back block must be the empty terminator: gzip magic and
        // zero ISIZE. Anything else is passed through with a warning.
        let isize_field = u32::from_le_bytes([ebuf[es - 4], ebuf[es - 3], ebuf[es - 2], ebuf[es - 1]]);
        if ebuf[0] != GZIP_ID1 || ebuf[1] != GZIP_ID2 || isize_field != 0 {
            warn!(
                "unexpected block structure in shard {}; possible output corruption",
                shard.display()
            );
            raw_write(&fp, &ebuf, out)?;
        }
    }

    drop(fp);
    Ok(())
}

fn raw_write(fp: &Bgzf, data: &[u8], out: &Path) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let ret = unsafe {
        htslib::bgzf_raw_write(fp.0, data.as_ptr() as *const c_void, data.len())
    };
    if ret < 0 {
        bail!("Error writing to {}", out.display());
    }
    Ok(())
}
