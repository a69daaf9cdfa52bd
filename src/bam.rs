//! # BAM adapter
//!
//! Everything that touches alignment files directly: open/index helpers,
//! CIGAR block derivation, record/tag utilities, and the raw BGZF shard
//! merge.
pub mod cat;
pub mod cigar;
pub mod io;
pub mod record;
