//! # sctag
//!
//! Post-alignment processing for single-cell and spatially barcoded
//! sequencing libraries: filters aligned reads by mapping quality, tags
//! them with gene and locus-function annotations from a GTF/GFF gene
//! model, removes PCR duplicates (positionally or by UMI correction), and
//! writes a deduplicated BAM, a barcode-by-gene expression table, a
//! metrics summary, and optionally a sequencing saturation curve and a
//! sparse expression matrix.
pub mod annotation;
pub mod bam;
pub mod cli;
pub mod kde;
pub mod matrix;
pub mod pipeline;
pub mod saturation;
pub mod umi;
pub mod utils;
