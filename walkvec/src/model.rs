//! The fused skip-gram training step.
//!
//! There is no autodiff here. The loss for a pair with score `s` and label
//! `y` is the logistic loss, whose gradient with respect to either embedding
//! is `(y - sigmoid(s))` times the other embedding. `step` gathers the rows a
//! batch touches, computes that coefficient for every positive and negative
//! pair from the sigmoid table, accumulates the scaled rows into a gradient
//! buffer and adds the buffer straight into the shared embedding matrices.

use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use ndarray::prelude::*;
use ndarray::Zip;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::grad::{scatter_add_scaled, GradientBuffer};
use crate::pairs::{PairIndices, WalkGeometry};
use crate::sigmoid::{clamp_score, negative_coefficient, positive_coefficient, SigmoidTable};
use crate::store::{EmbeddingStore, Role};
use crate::{dot, real};

/// Where gradient buffers sit when they are applied to the embeddings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Apply the gradient buffers directly.
    #[default]
    Host,
    /// Copy the scaled gradient buffers into a separate host staging buffer
    /// and apply that. On CPU this is only a copy, kept for parity with the
    /// `--mix` option; results match `Host` bit for bit.
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding vector length.
    pub dim: usize,
    /// Number of distinct nodes.
    pub vocab_size: usize,
    /// Nodes per walk.
    pub walk_length: usize,
    /// Max skip distance between a source and a context step.
    pub window_size: usize,
    /// Negative draws per walk.
    pub negative: usize,
    /// Multiplier on the negative-pair gradient.
    pub neg_weight: real,
    /// Walks per full batch.
    pub batch_size: usize,
    pub placement: Placement,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.dim > 0, "embedding dimension must be positive");
        ensure!(self.vocab_size > 0, "vocabulary size must be positive");
        ensure!(
            self.walk_length >= 2,
            "walk length must be at least 2, got {}",
            self.walk_length
        );
        ensure!(self.window_size > 0, "window size must be positive");
        ensure!(self.batch_size > 0, "batch size must be positive");
        ensure!(
            self.neg_weight.is_finite() && self.neg_weight >= 0.0,
            "negative weight must be a finite non-negative number, got {}",
            self.neg_weight
        );
        Ok(())
    }

    pub fn geometry(&self) -> WalkGeometry {
        WalkGeometry {
            walk_length: self.walk_length,
            window_size: self.window_size,
            negative: self.negative,
        }
    }
}

pub struct SkipGramModel {
    config: ModelConfig,
    store: Arc<EmbeddingStore>,
    table: Arc<SigmoidTable>,
    /// Index sets for a full `config.batch_size` batch.
    pairs: Arc<PairIndices>,
    /// Accumulators for a full batch, zeroed at the start of every step.
    grads: GradientBuffer,
    /// Drives the negative shuffle for trailing batches.
    rng: StdRng,
    shared: bool,
}

impl SkipGramModel {
    /// Allocate freshly initialised embeddings and the full-batch caches.
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let store = EmbeddingStore::new(config.vocab_size, config.dim, &mut rng)?;
        Self::build(config, store, rng)
    }

    /// Train on top of existing embeddings.
    pub fn with_store(config: ModelConfig, store: EmbeddingStore, seed: u64) -> Result<Self> {
        config.validate()?;
        ensure!(
            store.vocab_size() == config.vocab_size && store.dim() == config.dim,
            "store holds {} x {} embeddings but the configuration asks for {} x {}",
            store.vocab_size(),
            store.dim(),
            config.vocab_size,
            config.dim
        );
        Self::build(config, store, StdRng::seed_from_u64(seed))
    }

    fn build(config: ModelConfig, store: EmbeddingStore, mut rng: StdRng) -> Result<Self> {
        let pairs = PairIndices::generate(&config.geometry(), config.batch_size, &mut rng);
        let grads = GradientBuffer::new(pairs.rows(), config.dim);
        log::debug!(
            "{} positive and {} negative pairs per full batch",
            pairs.num_positive(),
            pairs.num_negative()
        );
        Ok(SkipGramModel {
            config,
            store: Arc::new(store),
            table: Arc::new(SigmoidTable::build()),
            pairs: Arc::new(pairs),
            grads,
            rng,
            shared: false,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    /// The cached full-batch index sets.
    pub fn cached_pairs(&self) -> &PairIndices {
        &self.pairs
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Open this model up for concurrent training.
    ///
    /// After this call, `worker` hands out models that update the same
    /// embeddings and reuse the cached index sets. Call it once, before any
    /// worker starts.
    pub fn enable_shared(&mut self) -> Result<()> {
        ensure!(!self.shared, "sharing is already enabled for this model");
        self.shared = true;
        log::info!(
            "sharing {} x {} embeddings across workers",
            self.store.vocab_size(),
            self.store.dim()
        );
        Ok(())
    }

    /// A model for one worker thread.
    ///
    /// The worker shares the embedding store, the sigmoid table and the
    /// full-batch index sets with `self`. It gets its own gradient buffer and
    /// its own random stream.
    pub fn worker(&self, seed: u64) -> Result<Self> {
        ensure!(
            self.shared,
            "enable_shared must be called before creating workers"
        );
        Ok(SkipGramModel {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            table: Arc::clone(&self.table),
            pairs: Arc::clone(&self.pairs),
            grads: GradientBuffer::new(self.grads.rows(), self.config.dim),
            rng: StdRng::seed_from_u64(seed),
            shared: true,
        })
    }

    /// Dot product of a node's source-role row with another node's
    /// context-role row, unclamped.
    pub fn score(&self, source_node: usize, context_node: usize) -> Result<real> {
        let u = self.store.row(Role::Source, source_node)?;
        let v = self.store.row(Role::Context, context_node)?;
        Ok(dot(&u, &v))
    }

    /// Lay the batch out as one row-index sequence, walk-major.
    fn flatten<W: AsRef<[usize]>>(&self, walks: &[W]) -> Result<Vec<usize>> {
        let walk_length = self.config.walk_length;
        let mut nodes = Vec::with_capacity(walks.len() * walk_length);
        for (i, walk) in walks.iter().enumerate() {
            let walk = walk.as_ref();
            ensure!(
                walk.len() == walk_length,
                "walk {i} has {} nodes, expected {walk_length}",
                walk.len()
            );
            if let Some(&node) = walk.iter().find(|&&n| n >= self.config.vocab_size) {
                bail!(
                    "walk {i} contains node id {node}, but the vocabulary has {} nodes",
                    self.config.vocab_size
                );
            }
            nodes.extend_from_slice(walk);
        }
        Ok(nodes)
    }

    /// Train on one batch of walks, updating both embedding matrices in place.
    ///
    /// A batch smaller than `config.batch_size` (the tail of a walk slice)
    /// gets its own index sets and gradient buffer; the cached full-size ones
    /// are left untouched.
    pub fn step<W: AsRef<[usize]>>(&mut self, walks: &[W], learning_rate: real) -> Result<()> {
        let batch_size = walks.len();
        ensure!(batch_size > 0, "cannot train on an empty batch");
        ensure!(
            batch_size <= self.config.batch_size,
            "batch of {batch_size} walks exceeds the configured batch size {}",
            self.config.batch_size
        );
        ensure!(
            learning_rate.is_finite(),
            "learning rate must be finite, got {learning_rate}"
        );

        let nodes = self.flatten(walks)?;
        let emb_u = self.store.gather(Role::Source, &nodes)?;
        let emb_v = self.store.gather(Role::Context, &nodes)?;

        let trailing_pairs;
        let pairs: &PairIndices = if batch_size == self.pairs.batch_size() {
            self.pairs.as_ref()
        } else {
            log::debug!("regenerating pair indices for a trailing batch of {batch_size} walks");
            trailing_pairs =
                PairIndices::generate(&self.config.geometry(), batch_size, &mut self.rng);
            &trailing_pairs
        };
        pairs.check_batch(batch_size, self.config.walk_length)?;

        let mut trailing_grads;
        let grads = if self.grads.rows() == nodes.len() {
            self.grads.reset();
            &mut self.grads
        } else {
            trailing_grads = GradientBuffer::new(nodes.len(), self.config.dim);
            &mut trailing_grads
        };

        accumulate_pairs(
            &self.table,
            grads,
            emb_u.view(),
            emb_v.view(),
            &pairs.pos_source,
            &pairs.pos_context,
            positive_coefficient,
            1.0,
        )
        .context("positive phase")?;
        accumulate_pairs(
            &self.table,
            grads,
            emb_u.view(),
            emb_v.view(),
            &pairs.neg_source,
            &pairs.neg_context,
            negative_coefficient,
            self.config.neg_weight,
        )
        .context("negative phase")?;

        grads.scale(learning_rate);

        match self.config.placement {
            Placement::Host => apply(&self.store, &nodes, grads),
            Placement::Mixed => {
                let staged = grads.clone();
                apply(&self.store, &nodes, &staged)
            }
        }
    }
}

/// Clamped dot product of corresponding rows.
fn pair_scores(u: ArrayView2<'_, real>, v: ArrayView2<'_, real>) -> Array1<real> {
    Zip::from(u.rows())
        .and(v.rows())
        .map_collect(|u, v| clamp_score(u.dot(&v)))
}

/// Add the gradient of every `(source_idx[k], context_idx[k])` pair into
/// `grads`.
///
/// Source rows receive `weight * coefficient(sigmoid(score)) * context row`
/// and context rows the same coefficient times the source row.
#[allow(clippy::too_many_arguments)]
fn accumulate_pairs(
    table: &SigmoidTable,
    grads: &mut GradientBuffer,
    emb_u: ArrayView2<'_, real>,
    emb_v: ArrayView2<'_, real>,
    source_idx: &[usize],
    context_idx: &[usize],
    coefficient: fn(real) -> real,
    weight: real,
) -> Result<()> {
    ensure!(
        source_idx.len() == context_idx.len(),
        "{} source indices but {} context indices",
        source_idx.len(),
        context_idx.len()
    );
    if source_idx.is_empty() {
        return Ok(());
    }

    let pair_u = emb_u.select(Axis(0), source_idx);
    let pair_v = emb_v.select(Axis(0), context_idx);
    let scores = pair_scores(pair_u.view(), pair_v.view());
    ensure!(
        !scores.iter().any(|s| s.is_nan()),
        "pair score is NaN; the embeddings have diverged"
    );
    let coeffs = scores.mapv(|s| coefficient(table.lookup(s)));

    scatter_add_scaled(
        grads.source.view_mut(),
        source_idx,
        pair_v.view(),
        coeffs.view(),
        weight,
    )?;
    scatter_add_scaled(
        grads.context.view_mut(),
        context_idx,
        pair_u.view(),
        coeffs.view(),
        weight,
    )
}

fn apply(store: &EmbeddingStore, nodes: &[usize], grads: &GradientBuffer) -> Result<()> {
    store.scatter_add(Role::Source, nodes, grads.source.view())?;
    store.scatter_add(Role::Context, nodes, grads.context.view())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch_size: usize) -> ModelConfig {
        ModelConfig {
            dim: 4,
            vocab_size: 10,
            walk_length: 5,
            window_size: 2,
            negative: 2,
            neg_weight: 1.0,
            batch_size,
            placement: Placement::Host,
        }
    }

    #[test]
    fn validate_config() {
        assert!(config(4).validate().is_ok());
        let mut bad = config(4);
        bad.walk_length = 1;
        assert!(bad.validate().is_err());
        let mut bad = config(4);
        bad.neg_weight = f32::NAN;
        assert!(bad.validate().is_err());
        let mut bad = config(0);
        bad.batch_size = 0;
        assert!(bad.validate().is_err());
        let mut ok = config(4);
        ok.negative = 0;
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn caches_full_batch() {
        let model = SkipGramModel::new(config(3), 1).unwrap();
        assert_eq!(model.cached_pairs().batch_size(), 3);
        assert_eq!(model.cached_pairs().rows(), 15);
        assert_eq!(model.grads.rows(), 15);
    }

    #[test]
    fn rejects_bad_batches() {
        let mut model = SkipGramModel::new(config(2), 1).unwrap();
        let too_many = vec![vec![0usize, 1, 2, 3, 4]; 3];
        assert!(model.step(&too_many, 0.1).is_err());

        let short = vec![vec![0usize, 1, 2]];
        let err = model.step(&short, 0.1).unwrap_err();
        assert!(err.to_string().contains("walk 0 has 3 nodes"));

        let out_of_range: Vec<Vec<usize>> = vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 10]];
        let err = model.step(&out_of_range, 0.1).unwrap_err();
        assert!(err.to_string().contains("node id 10"));

        let empty: Vec<Vec<usize>> = vec![];
        assert!(model.step(&empty, 0.1).is_err());
        assert!(model.step(&[vec![0usize, 1, 2, 3, 4]], f32::INFINITY).is_err());
    }

    #[test]
    fn sharing_protocol() {
        let mut model = SkipGramModel::new(config(2), 1).unwrap();
        assert!(model.worker(5).is_err());
        model.enable_shared().unwrap();
        assert!(model.enable_shared().is_err());

        let worker = model.worker(5).unwrap();
        assert!(worker.is_shared());
        assert!(Arc::ptr_eq(worker.store(), model.store()));
        assert!(Arc::ptr_eq(&worker.pairs, &model.pairs));
        assert!(!std::ptr::eq(worker.grads.source.as_ptr(), model.grads.source.as_ptr()));
    }

    #[test]
    fn with_store_checks_shape() {
        let store = EmbeddingStore::zeros(10, 3).unwrap();
        assert!(SkipGramModel::with_store(config(2), store, 0).is_err());
        let store = EmbeddingStore::zeros(10, 4).unwrap();
        assert!(SkipGramModel::with_store(config(2), store, 0).is_ok());
    }

    #[test]
    fn zero_context_moves_only_context() {
        // With the context matrix still zero, every source gradient is zero.
        let mut model = SkipGramModel::new(config(1), 3).unwrap();
        let before = model.store().to_array(Role::Source);
        model.step(&[vec![0usize, 1, 2, 3, 4]], 0.5).unwrap();
        assert_eq!(model.store().to_array(Role::Source), before);
        let context = model.store().to_array(Role::Context);
        assert!(context.slice(s![0..5, ..]).iter().any(|&x| x != 0.0));
        assert!(context.slice(s![5.., ..]).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn pair_scores_are_clamped() {
        let u = array![[10.0f32, 0.0], [0.5, 0.5], [-4.0, -4.0]];
        let v = array![[1.0f32, 0.0], [1.0, 1.0], [1.0, 1.0]];
        assert_eq!(pair_scores(u.view(), v.view()), array![6.0f32, 1.0, -6.0]);
    }

    #[test]
    fn saturated_pairs_add_nothing() {
        let table = SigmoidTable::build();
        let mut grads = GradientBuffer::new(2, 2);
        let emb_u = array![[10.0f32, 0.0], [0.0, 0.0]];
        let emb_v = array![[0.0f32, 0.0], [10.0, 0.0]];
        accumulate_pairs(
            &table,
            &mut grads,
            emb_u.view(),
            emb_v.view(),
            &[0],
            &[1],
            positive_coefficient,
            1.0,
        )
        .unwrap();
        assert!(grads.source.iter().all(|&g| g == 0.0));
        assert!(grads.context.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn diverged_embeddings_are_an_error() {
        let store = EmbeddingStore::zeros(10, 4).unwrap();
        store.set_row(Role::Source, 1, &[f32::NAN, 0.0, 0.0, 0.0]).unwrap();
        let mut model = SkipGramModel::with_store(config(1), store, 2).unwrap();
        let before = model.store().to_array(Role::Context);

        let err = model.step(&[vec![0usize, 1, 2, 3, 4]], 0.025).unwrap_err();
        assert!(format!("{err:#}").contains("NaN"));
        assert_eq!(model.store().to_array(Role::Context), before);
    }
}
