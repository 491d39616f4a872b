//! Writing trained embeddings out, and reading them back.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Index;
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use ndarray::prelude::*;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::model::ModelConfig;
use crate::store::{EmbeddingStore, Role};
use crate::{dot, normalize, real};

/// Text format: a `<num_nodes> <dim>` header, then per node its original id
/// followed by `dim` space-separated values.
pub fn write_text<W: Write>(out: &mut W, store: &EmbeddingStore, node_ids: &[String]) -> Result<()> {
    check_ids(store, node_ids)?;
    let matrix = store.to_array(Role::Source);
    writeln!(out, "{} {}", store.vocab_size(), store.dim()).context("error writing output file")?;
    for (id, row) in node_ids.iter().zip(matrix.rows()) {
        write!(out, "{id}").context("error writing output file")?;
        for x in row {
            write!(out, " {x}").context("error writing output file")?;
        }
        writeln!(out).context("error writing output file")?;
    }
    Ok(())
}

/// Binary format: the text header, then per node `<id> ` followed by `dim`
/// native-endian f32 values and a newline.
pub fn write_binary<W: Write>(out: &mut W, store: &EmbeddingStore, node_ids: &[String]) -> Result<()> {
    check_ids(store, node_ids)?;
    let matrix = store.to_array(Role::Source);
    writeln!(out, "{} {}", store.vocab_size(), store.dim()).context("error writing output file")?;
    for (id, row) in node_ids.iter().zip(matrix.rows()) {
        write!(out, "{id} ").context("error writing output file")?;
        let row = row.to_vec();
        out.write_all(bytemuck::cast_slice::<real, u8>(&row))
            .context("error writing output file")?;
        writeln!(out).context("error writing output file")?;
    }
    Ok(())
}

fn check_ids(store: &EmbeddingStore, node_ids: &[String]) -> Result<()> {
    ensure!(
        node_ids.len() == store.vocab_size(),
        "{} node ids for {} embedding rows",
        node_ids.len(),
        store.vocab_size()
    );
    Ok(())
}

/// Everything needed to resume training: both matrices, the configuration
/// and the node id mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub config: ModelConfig,
    pub node_ids: Vec<String>,
    /// Row-major `(vocab_size, dim)` source-role matrix.
    pub source: Vec<real>,
    /// Row-major `(vocab_size, dim)` context-role matrix.
    pub context: Vec<real>,
}

impl Snapshot {
    pub fn capture(config: &ModelConfig, store: &EmbeddingStore, node_ids: &[String]) -> Result<Self> {
        check_ids(store, node_ids)?;
        Ok(Snapshot {
            config: config.clone(),
            node_ids: node_ids.to_vec(),
            source: store.to_array(Role::Source).into_raw_vec(),
            context: store.to_array(Role::Context).into_raw_vec(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let fo = BufWriter::new(File::create(path).context("error creating snapshot file")?);
        bincode::serialize_into(fo, self).context("error writing snapshot file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let fi = BufReader::new(File::open(path).context("error opening snapshot file")?);
        bincode::deserialize_from(fi).context("error reading snapshot file")
    }

    pub fn to_store(&self) -> Result<EmbeddingStore> {
        let shape = (self.config.vocab_size, self.config.dim);
        let source = ArrayView2::from_shape(shape, &self.source)
            .context("snapshot source matrix has the wrong size")?;
        let context = ArrayView2::from_shape(shape, &self.context)
            .context("snapshot context matrix has the wrong size")?;
        EmbeddingStore::from_arrays(source, context)
    }
}

/// Unit-length embeddings read back from a text export.
pub struct Vectors {
    /// Embedding vector length (number of dimensions).
    size: usize,

    /// Original node ids.
    ids: Vec<String>,

    /// `embeddings[k * size..(k+1) * size]` is the normalized vector for node `k`.
    embeddings: Vec<real>,
}

impl Index<usize> for Vectors {
    type Output = [real];

    fn index(&self, i: usize) -> &[real] {
        &self.embeddings[i * self.size..][..self.size]
    }
}

impl Vectors {
    pub fn load_text(file_name: &Path) -> Result<Self> {
        let f = BufReader::new(File::open(file_name).context("error opening input file")?);
        Self::read_text(f)
    }

    pub fn read_text<R: BufRead>(input: R) -> Result<Self> {
        let mut lines = input.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("invalid input file: missing header"))?
            .context("error reading input file")?;
        let mut fields = header.split_whitespace();
        let num_nodes: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid input file"))?
            .parse()
            .context("invalid input file")?;
        let size: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid input file"))?
            .parse()
            .context("invalid input file")?;

        let mut ids = Vec::with_capacity(num_nodes);
        let mut embeddings = Vec::with_capacity(num_nodes * size);
        for (n, line) in lines.enumerate() {
            let line = line.context("error reading input file")?;
            let mut fields = line.split_whitespace();
            let Some(id) = fields.next() else {
                continue;
            };
            let start = embeddings.len();
            for field in fields {
                let x: real = field
                    .parse()
                    .with_context(|| format!("invalid number on line {}", n + 2))?;
                embeddings.push(x);
            }
            ensure!(
                embeddings.len() - start == size,
                "line {} has {} values, expected {size}",
                n + 2,
                embeddings.len() - start
            );
            normalize(&mut embeddings[start..]);
            ids.push(id.to_string());
        }
        ensure!(
            ids.len() == num_nodes,
            "header promises {num_nodes} nodes, file has {}",
            ids.len()
        );
        Ok(Vectors {
            size,
            ids,
            embeddings,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.ids.len()
    }

    /// Returns the vector size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the index for an original node id. Exact match only.
    pub fn lookup(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|v| v == id)
    }

    /// Get the original id for a node index. Panics if `node` is out of range.
    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    /// The `n` nodes most cosine-similar to the sum of `query` nodes, best
    /// first. Query nodes themselves are left out.
    pub fn nearest(&self, query: &[usize], n: usize) -> Vec<(usize, real)> {
        let mut target = vec![0.0; self.size];
        for &q in query {
            for (t, &x) in target.iter_mut().zip(&self[q]) {
                *t += x;
            }
        }
        normalize(&mut target);

        let mut best: Vec<(usize, real)> = (0..self.num_nodes())
            .filter(|c| !query.contains(c))
            .map(|c| (c, dot(&target, &self[c])))
            .collect();
        best.sort_by_key(|&(_, similarity)| Reverse(OrderedFloat(similarity)));
        best.truncate(n);
        best
    }
}
