//! Source-role and context-role embedding matrices.
//!
//! Every element is a `Real`, an f32 stored in an `AtomicU32` and accessed
//! with relaxed loads and stores. Threads share the store through an `Arc` and
//! update it without locks. `Real::add` is a load followed by a store, not an
//! atomic read-modify-write, so two workers adding to the same element at the
//! same moment can lose one of the updates. That noise is the price of
//! HogWild training and is accepted.

use std::sync::atomic::{AtomicU32, Ordering};

use aligned_box::AlignedBox;
use anyhow::{anyhow, ensure, Result};
use ndarray::prelude::*;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::real;

/// Byte alignment of the embedding matrices.
const ALIGNMENT: usize = 128;

#[derive(Default)]
#[repr(transparent)]
pub struct Real {
    bits: AtomicU32,
}

impl Real {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        let a = self.get();
        self.set(a + x);
    }
}

/// Which of the two matrices an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The embeddings that get exported.
    Source,
    /// The context ("output") embeddings used only during training.
    Context,
}

pub struct EmbeddingStore {
    vocab_size: usize,
    dim: usize,
    /// `source[k * dim..(k+1) * dim]` is the source-role embedding of node `k`.
    source: AlignedBox<[Real]>,
    context: AlignedBox<[Real]>,
}

fn alloc_matrix(len: usize) -> Result<AlignedBox<[Real]>> {
    AlignedBox::slice_from_default(ALIGNMENT, len)
        .map_err(|err| anyhow!("failed to allocate {len} embedding elements: {err:?}"))
}

impl EmbeddingStore {
    /// Allocate both matrices with every element zero.
    pub fn zeros(vocab_size: usize, dim: usize) -> Result<Self> {
        ensure!(vocab_size > 0, "vocabulary size must be positive");
        ensure!(dim > 0, "embedding dimension must be positive");
        let len = vocab_size
            .checked_mul(dim)
            .ok_or_else(|| anyhow!("embedding matrix {vocab_size} x {dim} is too large"))?;
        Ok(EmbeddingStore {
            vocab_size,
            dim,
            source: alloc_matrix(len)?,
            context: alloc_matrix(len)?,
        })
    }

    /// Source matrix uniform in `[-1/dim, 1/dim]`, context matrix all zero.
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, dim: usize, rng: &mut R) -> Result<Self> {
        let store = Self::zeros(vocab_size, dim)?;
        let init_range = 1.0 / dim as real;
        let uniform = Uniform::new_inclusive(-init_range, init_range);
        for e in store.source.iter() {
            e.set(uniform.sample(rng));
        }
        log::info!("allocated embeddings for {vocab_size} nodes, {dim} dimensions");
        Ok(store)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn matrix(&self, role: Role) -> &[Real] {
        match role {
            Role::Source => &*self.source,
            Role::Context => &*self.context,
        }
    }

    fn check_node(&self, node: usize) -> Result<()> {
        ensure!(
            node < self.vocab_size,
            "node id {node} out of range for vocabulary of {} nodes",
            self.vocab_size
        );
        Ok(())
    }

    /// Copy of one row.
    pub fn row(&self, role: Role, node: usize) -> Result<Vec<real>> {
        self.check_node(node)?;
        Ok(self.matrix(role)[node * self.dim..][..self.dim]
            .iter()
            .map(Real::get)
            .collect())
    }

    /// Overwrite one row.
    pub fn set_row(&self, role: Role, node: usize, values: &[real]) -> Result<()> {
        self.check_node(node)?;
        ensure!(
            values.len() == self.dim,
            "row has {} values, expected {}",
            values.len(),
            self.dim
        );
        for (e, &v) in self.matrix(role)[node * self.dim..][..self.dim]
            .iter()
            .zip(values)
        {
            e.set(v);
        }
        Ok(())
    }

    /// Read the rows for `nodes`, in order, into a `(nodes.len(), dim)` array.
    pub fn gather(&self, role: Role, nodes: &[usize]) -> Result<Array2<real>> {
        let matrix = self.matrix(role);
        let mut out = Array2::<real>::zeros((nodes.len(), self.dim));
        for (mut row, &node) in out.rows_mut().into_iter().zip(nodes) {
            self.check_node(node)?;
            let src = &matrix[node * self.dim..][..self.dim];
            for (o, e) in row.iter_mut().zip(src) {
                *o = e.get();
            }
        }
        Ok(out)
    }

    /// Add `values.row(i)` into the row for `nodes[i]`, for every `i`.
    ///
    /// Repeated nodes accumulate. No lock is taken; concurrent callers that
    /// touch the same row race as described in the module docs.
    pub fn scatter_add(&self, role: Role, nodes: &[usize], values: ArrayView2<'_, real>) -> Result<()> {
        ensure!(
            values.nrows() == nodes.len(),
            "scatter_add got {} rows of values for {} nodes",
            values.nrows(),
            nodes.len()
        );
        ensure!(
            values.ncols() == self.dim,
            "scatter_add values have {} columns, expected {}",
            values.ncols(),
            self.dim
        );
        if let Some(&node) = nodes.iter().find(|&&node| node >= self.vocab_size) {
            self.check_node(node)?;
        }

        let matrix = self.matrix(role);
        for (row, &node) in values.rows().into_iter().zip(nodes) {
            let dst = &matrix[node * self.dim..][..self.dim];
            for (e, &v) in dst.iter().zip(row.iter()) {
                e.add(v);
            }
        }
        Ok(())
    }

    /// Snapshot of a whole matrix as a `(vocab_size, dim)` array.
    pub fn to_array(&self, role: Role) -> Array2<real> {
        let matrix = self.matrix(role);
        Array2::from_shape_fn((self.vocab_size, self.dim), |(i, j)| matrix[i * self.dim + j].get())
    }

    /// Build a store from two `(vocab_size, dim)` matrices.
    pub fn from_arrays(source: ArrayView2<'_, real>, context: ArrayView2<'_, real>) -> Result<Self> {
        ensure!(
            source.dim() == context.dim(),
            "source matrix is {:?} but context matrix is {:?}",
            source.dim(),
            context.dim()
        );
        let (vocab_size, dim) = source.dim();
        let store = Self::zeros(vocab_size, dim)?;
        for (e, &v) in store.source.iter().zip(source.iter()) {
            e.set(v);
        }
        for (e, &v) in store.context.iter().zip(context.iter()) {
            e.set(v);
        }
        Ok(store)
    }
}
