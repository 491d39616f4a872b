//! Table-driven approximation of the logistic function.

use crate::real;

/// Scores are clamped to `[-MAX_SCORE, MAX_SCORE]` before lookup.
pub const MAX_SCORE: real = 6.0;

/// Distance between adjacent table samples.
const RESOLUTION: f64 = 0.01;

/// Left edge of the sampled domain. One step wider than `MAX_SCORE` so that
/// both clamp bounds land strictly inside the table.
const TABLE_START: f64 = -6.01;

/// Number of samples covering `[-6.01, 6.01]`.
pub const TABLE_SIZE: usize = 1203;

/// Precomputed `1 / (1 + e^-x)` sampled every 0.01 over `[-6.01, 6.01]`.
///
/// The first entry is pinned to exactly 0.0 and the last to exactly 1.0.
#[derive(Debug, Clone)]
pub struct SigmoidTable {
    values: Vec<real>,
}

impl SigmoidTable {
    pub fn build() -> Self {
        let mut values: Vec<real> = (0..TABLE_SIZE)
            .map(|i| {
                let x = TABLE_START + i as f64 * RESOLUTION;
                (1.0 / (1.0 + (-x).exp())) as real
            })
            .collect();
        values[0] = 0.0;
        values[TABLE_SIZE - 1] = 1.0;
        SigmoidTable { values }
    }

    /// Approximate sigmoid of `score`, which the caller must already have
    /// clamped to `[-MAX_SCORE, MAX_SCORE]`.
    ///
    /// Interior scores index `floor((score + 6.01) / 0.01)`. A score sitting
    /// on either clamp bound saturates to the pinned endpoint, so fully
    /// saturated pairs contribute no gradient.
    pub fn lookup(&self, score: real) -> real {
        debug_assert!(
            (-MAX_SCORE..=MAX_SCORE).contains(&score),
            "score {score} was not clamped before sigmoid lookup"
        );
        if score <= -MAX_SCORE {
            return self.values[0];
        }
        if score >= MAX_SCORE {
            return self.values[TABLE_SIZE - 1];
        }
        let index = ((score as f64 - TABLE_START) / RESOLUTION).floor() as usize;
        self.values[index]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[real] {
        &self.values
    }
}

impl Default for SigmoidTable {
    fn default() -> Self {
        Self::build()
    }
}

/// Clamp a raw dot product into the table's domain. NaN passes through
/// unchanged; callers must reject it before `lookup`.
pub fn clamp_score(score: real) -> real {
    score.clamp(-MAX_SCORE, MAX_SCORE)
}

/// Gradient coefficient for a pair that should score high (label 1).
pub fn positive_coefficient(sigmoid: real) -> real {
    1.0 - sigmoid
}

/// Gradient coefficient for a pair that should score low (label 0).
pub fn negative_coefficient(sigmoid: real) -> real {
    -sigmoid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        let table = SigmoidTable::build();
        assert_eq!(table.len(), TABLE_SIZE);
        assert_eq!(table.values()[0], 0.0);
        assert_eq!(table.values()[TABLE_SIZE - 1], 1.0);
        assert!(table.values().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn lookup_midpoint() {
        let table = SigmoidTable::build();
        let y = table.lookup(0.0);
        assert!((y - 0.5).abs() <= 0.01, "lookup(0) = {y}");
    }

    #[test]
    fn lookup_extremes() {
        let table = SigmoidTable::build();
        assert_eq!(table.lookup(-MAX_SCORE), 0.0);
        assert_eq!(table.lookup(MAX_SCORE), 1.0);
        assert_eq!(table.lookup(clamp_score(-40.0)), 0.0);
        assert_eq!(table.lookup(clamp_score(1e9)), 1.0);
    }

    #[test]
    fn lookup_tracks_logistic() {
        let table = SigmoidTable::build();
        for i in -599..600 {
            let x = i as real / 100.0 + 0.005;
            let exact = 1.0 / (1.0 + (-x).exp());
            let approx = table.lookup(x);
            assert!(
                (exact - approx).abs() < 0.01,
                "x={x} exact={exact} approx={approx}"
            );
        }
    }

    #[test]
    fn coefficients() {
        assert_eq!(positive_coefficient(1.0), 0.0);
        assert_eq!(positive_coefficient(0.25), 0.75);
        assert_eq!(negative_coefficient(0.25), -0.25);
        assert_eq!(negative_coefficient(0.0), 0.0);
    }
}
