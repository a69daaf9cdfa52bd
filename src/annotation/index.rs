//! # Per-contig gene interval index
//!
//! All genes live in one flat arena; each contig gets an interval tree
//! whose entries hold arena indices. The index is built once at startup
//! and is immutable afterwards, so overlap queries are safe from any
//! number of worker threads without locking.
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use bio::data_structures::interval_tree::ArrayBackedIntervalTree;
use log::{debug, info};

use crate::annotation::builder;
use crate::annotation::gene::Gene;
use crate::annotation::reader;

type IntervalTree = ArrayBackedIntervalTree<i64, u32>;

/// Immutable gene lookup: a flat gene arena plus one interval tree per
/// contig holding arena indices.
pub struct GeneIndex {
    genes: Vec<Gene>,
    trees: HashMap<String, IntervalTree>,
}

impl GeneIndex {
    /// Load an annotation file and build the index. Genes with structural
    /// problems are skipped with a debug log line; the rest of the
    /// annotation is used as-is.
    pub fn from_annotation<P: AsRef<Path>>(path: P) -> Result<GeneIndex> {
        let started = Instant::now();
        let (gtf_map, contigs) = reader::load(&path)?;
        info!(
            "loaded annotation records for {} genes on {} contigs in {:.2}s",
            gtf_map.len(),
            contigs.len(),
            started.elapsed().as_secs_f64()
        );

        let mut genes: Vec<Gene> = Vec::new();
        for records in gtf_map.values() {
            match builder::make_genes(records) {
                Ok(mut built) => genes.append(&mut built),
                Err(e) => {
                    debug!("{e} -- skipping");
                    continue;
                }
            }
        }

        let mut trees: HashMap<String, IntervalTree> = HashMap::new();
        for (i, gene) in genes.iter().enumerate() {
            trees
                .entry(gene.contig().to_string())
                .or_insert_with(IntervalTree::new)
                // Gene extents are 1-based inclusive, the tree is half-open.
                .insert(gene.start()..gene.end() + 1, i as u32);
        }
        for tree in trees.values_mut() {
            tree.index();
        }

        info!(
            "gene count: {} (index built in {:.2}s)",
            genes.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(GeneIndex { genes, trees })
    }

    /// All genes whose extent overlaps the closed range `[lo, hi]` on
    /// `contig`.
    pub fn query(&self, contig: &str, lo: i64, hi: i64) -> Vec<&Gene> {
        let Some(tree) = self.trees.get(contig) else {
            return Vec::new();
        };
        tree.find(lo..hi + 1)
            .iter()
            .map(|entry| &self.genes[*entry.data() as usize])
            .collect()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_annotation() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();
        for (name, contig, start, end) in [
            ("GA", "chr1", 100, 500),
            ("GB", "chr1", 450, 900),
            ("GC", "chr2", 100, 500),
        ] {
            writeln!(
                file,
                "{contig}\tsrc\texon\t{start}\t{end}\t.\t+\t.\tgene_id \"{name}\"; gene_name \"{name}\"; transcript_id \"{name}.t\";"
            )
            .unwrap();
        }
        file
    }

    #[test]
    fn query_returns_overlapping_genes_only() {
        let file = write_annotation();
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        assert_eq!(3, index.num_genes());

        let mut names: Vec<&str> = index.query("chr1", 440, 460).iter().map(|g| g.name()).collect();
        names.sort_unstable();
        assert_eq!(vec!["GA", "GB"], names);

        let names: Vec<&str> = index.query("chr1", 600, 700).iter().map(|g| g.name()).collect();
        assert_eq!(vec!["GB"], names);

        assert!(index.query("chr1", 901, 1000).is_empty());
        assert!(index.query("chr3", 100, 200).is_empty());
    }

    #[test]
    fn boundary_overlap_is_inclusive() {
        let file = write_annotation();
        let index = GeneIndex::from_annotation(file.path()).unwrap();
        let names: Vec<&str> = index.query("chr2", 500, 500).iter().map(|g| g.name()).collect();
        assert_eq!(vec!["GC"], names);
        let names: Vec<&str> = index.query("chr2", 1, 100).iter().map(|g| g.name()).collect();
        assert_eq!(vec!["GC"], names);
    }
}
