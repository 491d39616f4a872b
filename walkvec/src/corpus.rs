//! Pre-generated random walks, one per line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{ensure, Context, Result};

/// A set of equal-length walks over densely numbered nodes.
#[derive(Debug, Clone, Default)]
pub struct WalkCorpus {
    /// `node_ids[k]` is the original id of node `k`.
    node_ids: Vec<String>,
    node_index: HashMap<String, usize>,
    /// `walks[i * walk_length..][..walk_length]` is walk `i`.
    walks: Vec<usize>,
    walk_length: usize,
}

impl WalkCorpus {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path)
            .with_context(|| format!("error opening walk file {}", path.display()))?;
        Self::read(BufReader::new(f))
    }

    /// Parse walks from text: whitespace-separated node ids, one walk per
    /// line. Blank lines are skipped. Node numbers are assigned in order of
    /// first appearance.
    pub fn read<R: BufRead>(input: R) -> Result<Self> {
        let mut corpus = WalkCorpus::default();
        let mut skipped = 0;
        for (line_num, line) in input.lines().enumerate() {
            let line = line.context("error reading walk file")?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                skipped += 1;
                continue;
            }
            if corpus.walk_length == 0 {
                corpus.walk_length = fields.len();
            }
            ensure!(
                fields.len() == corpus.walk_length,
                "walk on line {} has {} nodes, but earlier walks have {}",
                line_num + 1,
                fields.len(),
                corpus.walk_length
            );
            for id in fields {
                let node = corpus.intern(id);
                corpus.walks.push(node);
            }
        }
        if skipped > 0 {
            log::warn!("skipped {skipped} blank lines in walk file");
        }
        ensure!(!corpus.walks.is_empty(), "walk file contains no walks");
        log::info!(
            "read {} walks of length {} over {} nodes",
            corpus.num_walks(),
            corpus.walk_length,
            corpus.vocab_size()
        );
        Ok(corpus)
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&node) = self.node_index.get(id) {
            return node;
        }
        let node = self.node_ids.len();
        self.node_ids.push(id.to_string());
        self.node_index.insert(id.to_string(), node);
        node
    }

    pub fn walk_length(&self) -> usize {
        self.walk_length
    }

    pub fn num_walks(&self) -> usize {
        if self.walk_length == 0 {
            0
        } else {
            self.walks.len() / self.walk_length
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.node_ids.len()
    }

    pub fn walk(&self, i: usize) -> &[usize] {
        &self.walks[i * self.walk_length..][..self.walk_length]
    }

    pub fn walks(&self) -> impl Iterator<Item = &[usize]> + '_ {
        self.walks.chunks_exact(self.walk_length.max(1))
    }

    /// Walks `start..end` as a slice of walk slices.
    pub fn slice(&self, start: usize, end: usize) -> Vec<&[usize]> {
        (start..end).map(|i| self.walk(i)).collect()
    }

    /// The original id of every node, indexed by node number.
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    /// Get the node number for an original id. Exact match only.
    pub fn lookup(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }
}
