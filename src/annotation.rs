//! # Annotation index
//!
//! Loads a GTF/GFF annotation into an immutable per-contig interval index
//! and tags reads against it: `reader` parses the raw records, `builder`
//! folds them into the gene model in `gene`, `index` arranges the genes
//! for overlap queries, and `tagger` runs the locus-function policies.
pub mod builder;
pub mod gene;
pub mod index;
pub mod reader;
pub mod tagger;
