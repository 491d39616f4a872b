//! Flattened (source, context) row-index sets for a batch of walks.
//!
//! All offsets index the batch laid out as one contiguous block of
//! `batch_size * walk_length` rows, walk-major.

use anyhow::{ensure, Result};
use rand::seq::SliceRandom;
use rand::Rng;

/// Shape of the walks a model trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkGeometry {
    /// Number of nodes in every walk.
    pub walk_length: usize,
    /// Max distance between a source step and a context step.
    pub window_size: usize,
    /// Negative draws per walk.
    pub negative: usize,
}

/// Number of positive pairs contributed by a single walk.
pub fn positive_pairs_per_walk(walk_length: usize, window_size: usize) -> usize {
    (0..walk_length)
        .map(|i| i.min(window_size) + (walk_length - 1 - i).min(window_size))
        .sum()
}

/// Positive pairs for `batch_size` walks, as parallel `(source, context)`
/// offset lists.
///
/// For every step `i` and every other step `j` within `window_size` of it, the
/// pair `(j, i)` is emitted, shifted by `walk_index * walk_length`. The order
/// is: context step ascending, then the steps before it, then the steps after.
pub fn positive_pairs(
    walk_length: usize,
    window_size: usize,
    batch_size: usize,
) -> (Vec<usize>, Vec<usize>) {
    let per_walk = positive_pairs_per_walk(walk_length, window_size);
    let mut source = Vec::with_capacity(per_walk * batch_size);
    let mut context = Vec::with_capacity(per_walk * batch_size);
    for b in 0..batch_size {
        let offset = b * walk_length;
        for i in 0..walk_length {
            for j in i.saturating_sub(window_size)..i {
                source.push(j + offset);
                context.push(i + offset);
            }
            for j in (i + 1)..(i + 1 + window_size).min(walk_length) {
                source.push(j + offset);
                context.push(i + offset);
            }
        }
    }
    (source, context)
}

/// In-batch negative pairs, as parallel `(source, context)` offset lists.
///
/// Each walk's rows appear `negative` times on the source side. The context
/// side is `0..batch_size * walk_length` repeated `negative` times and then
/// shuffled once, so negatives are drawn from the current batch instead of
/// the whole vocabulary.
pub fn negative_pairs<R: Rng + ?Sized>(
    walk_length: usize,
    negative: usize,
    batch_size: usize,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let rows = batch_size * walk_length;
    let mut source = Vec::with_capacity(rows * negative);
    for b in 0..batch_size {
        let start = b * walk_length;
        for _ in 0..negative {
            source.extend(start..start + walk_length);
        }
    }

    let mut context: Vec<usize> = Vec::with_capacity(rows * negative);
    for _ in 0..negative {
        context.extend(0..rows);
    }
    context.shuffle(rng);
    (source, context)
}

/// The four index lists one training step needs, built for one batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIndices {
    batch_size: usize,
    walk_length: usize,
    pub pos_source: Vec<usize>,
    pub pos_context: Vec<usize>,
    pub neg_source: Vec<usize>,
    pub neg_context: Vec<usize>,
}

impl PairIndices {
    pub fn generate<R: Rng + ?Sized>(
        geometry: &WalkGeometry,
        batch_size: usize,
        rng: &mut R,
    ) -> Self {
        let (pos_source, pos_context) =
            positive_pairs(geometry.walk_length, geometry.window_size, batch_size);
        let (neg_source, neg_context) =
            negative_pairs(geometry.walk_length, geometry.negative, batch_size, rng);
        PairIndices {
            batch_size,
            walk_length: geometry.walk_length,
            pos_source,
            pos_context,
            neg_source,
            neg_context,
        }
    }

    /// Number of walks these indices were generated for.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of flattened rows these indices address.
    pub fn rows(&self) -> usize {
        self.batch_size * self.walk_length
    }

    pub fn num_positive(&self) -> usize {
        self.pos_source.len()
    }

    pub fn num_negative(&self) -> usize {
        self.neg_source.len()
    }

    /// Fail unless these indices were built for exactly `batch_size` walks of
    /// `walk_length` nodes.
    pub fn check_batch(&self, batch_size: usize, walk_length: usize) -> Result<()> {
        ensure!(
            self.batch_size == batch_size && self.walk_length == walk_length,
            "pair indices were generated for {} walks of length {}, but the batch has {} walks of length {}",
            self.batch_size,
            self.walk_length,
            batch_size,
            walk_length,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn positive_count_closed_form() {
        for (l, w, expected) in [(10, 5, 70), (5, 2, 14), (3, 1, 4), (4, 10, 12), (80, 5, 770)] {
            assert_eq!(positive_pairs_per_walk(l, w), expected, "L={l} W={w}");
            let (source, context) = positive_pairs(l, w, 1);
            assert_eq!(source.len(), expected);
            assert_eq!(context.len(), expected);
        }
    }

    #[test]
    fn positive_pairs_within_window() {
        let (source, context) = positive_pairs(10, 3, 1);
        for (&j, &i) in source.iter().zip(&context) {
            assert_ne!(i, j);
            assert!(i.abs_diff(j) <= 3);
            assert!(i < 10 && j < 10);
        }
    }

    #[test]
    fn positive_pairs_small_walk() {
        let (source, context) = positive_pairs(3, 1, 1);
        assert_eq!(source, vec![1, 0, 2, 1]);
        assert_eq!(context, vec![0, 1, 1, 2]);
    }

    #[test]
    fn positive_pairs_scale_with_batch() {
        let (l, w) = (7, 2);
        let (s1, c1) = positive_pairs(l, w, 1);
        let (s2, c2) = positive_pairs(l, w, 2);
        let n = s1.len();
        assert_eq!(s2.len(), 2 * n);
        assert_eq!(&s2[..n], &s1[..]);
        assert_eq!(&c2[..n], &c1[..]);
        assert!(s2[n..].iter().zip(&s1).all(|(&a, &b)| a == b + l));
        assert!(c2[n..].iter().zip(&c1).all(|(&a, &b)| a == b + l));
    }

    #[test]
    fn negative_pairs_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let (l, neg, bs) = (5, 3, 4);
        let (source, context) = negative_pairs(l, neg, bs, &mut rng);
        assert_eq!(source.len(), bs * l * neg);
        assert_eq!(context.len(), bs * l * neg);

        // walk 1, second draw
        assert_eq!(&source[l * neg + l..l * neg + 2 * l], &[5, 6, 7, 8, 9]);

        let mut sorted = context.clone();
        sorted.sort_unstable();
        let mut expected: Vec<usize> = (0..neg).flat_map(|_| 0..bs * l).collect();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn zero_negatives() {
        let mut rng = StdRng::seed_from_u64(1);
        let (source, context) = negative_pairs(5, 0, 3, &mut rng);
        assert!(source.is_empty());
        assert!(context.is_empty());
    }

    #[test]
    fn check_batch_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let geometry = WalkGeometry {
            walk_length: 4,
            window_size: 2,
            negative: 1,
        };
        let pairs = PairIndices::generate(&geometry, 8, &mut rng);
        assert_eq!(pairs.rows(), 32);
        assert!(pairs.check_batch(8, 4).is_ok());
        let err = pairs.check_batch(3, 4).unwrap_err();
        assert!(err.to_string().contains("generated for 8 walks"));
    }
}
