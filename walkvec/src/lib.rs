//! Skip-gram embeddings for graph nodes, trained from batches of fixed-length
//! random walks with a hand-fused forward/backward kernel.
//!
//! The embedding matrices live in a lock-free store that any number of worker
//! threads update concurrently, HogWild style.

#[allow(non_camel_case_types)]
pub type real = f32; // Precision of float numbers

pub mod sigmoid;
pub use sigmoid::SigmoidTable;

pub mod pairs;
pub use pairs::{PairIndices, WalkGeometry};

pub mod store;
pub use store::{EmbeddingStore, Real, Role};

pub mod grad;
pub use grad::GradientBuffer;

pub mod model;
pub use model::{ModelConfig, Placement, SkipGramModel};

pub mod corpus;
pub use corpus::WalkCorpus;

pub mod export;
pub use export::{Snapshot, Vectors};

/// Dot product of two equal-length rows.
pub fn dot(a: &[real], b: &[real]) -> real {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

pub fn norm(v: &[real]) -> real {
    v.iter().copied().map(|e| e * e).sum::<real>().sqrt()
}

/// Scale `v` to unit length. Zero vectors are left alone.
pub fn normalize(v: &mut [real]) {
    let len = norm(v);
    if len == 0.0 {
        return;
    }
    for e in v {
        *e /= len;
    }
}
