//! Per-step gradient accumulators, one row per flattened batch position.

use anyhow::{ensure, Result};
use ndarray::prelude::*;
use ndarray::Zip;

use crate::real;

#[derive(Debug, Clone)]
pub struct GradientBuffer {
    /// Accumulated gradient for the source-role rows, `(rows, dim)`.
    pub source: Array2<real>,
    /// Accumulated gradient for the context-role rows, `(rows, dim)`.
    pub context: Array2<real>,
}

impl GradientBuffer {
    pub fn new(rows: usize, dim: usize) -> Self {
        GradientBuffer {
            source: Array2::zeros((rows, dim)),
            context: Array2::zeros((rows, dim)),
        }
    }

    pub fn rows(&self) -> usize {
        self.source.nrows()
    }

    pub fn dim(&self) -> usize {
        self.source.ncols()
    }

    /// Zero both accumulators in place.
    pub fn reset(&mut self) {
        self.source.fill(0.0);
        self.context.fill(0.0);
    }

    /// Multiply every accumulated gradient by `factor`.
    pub fn scale(&mut self, factor: real) {
        self.source.par_mapv_inplace(|g| g * factor);
        self.context.par_mapv_inplace(|g| g * factor);
    }
}

/// `target.row(indices[k]) += scale * coeffs[k] * rows.row(k)` for every `k`.
///
/// Repeated indices accumulate.
pub fn scatter_add_scaled(
    mut target: ArrayViewMut2<'_, real>,
    indices: &[usize],
    rows: ArrayView2<'_, real>,
    coeffs: ArrayView1<'_, real>,
    scale: real,
) -> Result<()> {
    ensure!(
        indices.len() == rows.nrows() && indices.len() == coeffs.len(),
        "scatter of {} indices got {} rows and {} coefficients",
        indices.len(),
        rows.nrows(),
        coeffs.len()
    );
    ensure!(
        rows.ncols() == target.ncols(),
        "rows have {} columns, target has {}",
        rows.ncols(),
        target.ncols()
    );
    if let Some(&bad) = indices.iter().find(|&&i| i >= target.nrows()) {
        anyhow::bail!(
            "gradient row {bad} out of range for a buffer of {} rows",
            target.nrows()
        );
    }

    Zip::from(rows.rows())
        .and(&coeffs)
        .and(indices)
        .for_each(|row, &coeff, &i| {
            target.row_mut(i).scaled_add(scale * coeff, &row);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reuses_storage() {
        let mut grads = GradientBuffer::new(3, 2);
        grads.source.fill(4.0);
        grads.context[[1, 1]] = -1.0;
        let ptr = grads.source.as_ptr();
        grads.reset();
        assert_eq!(grads.source.as_ptr(), ptr);
        assert!(grads.source.iter().all(|&g| g == 0.0));
        assert!(grads.context.iter().all(|&g| g == 0.0));
        assert_eq!((grads.rows(), grads.dim()), (3, 2));
    }

    #[test]
    fn repeated_index_sums() {
        let mut grads = GradientBuffer::new(2, 2);
        let rows = array![[1.0f32, 2.0], [10.0, 20.0], [5.0, 5.0]];
        let coeffs = array![1.0f32, 0.5, 2.0];
        scatter_add_scaled(grads.source.view_mut(), &[1, 1, 0], rows.view(), coeffs.view(), 1.0)
            .unwrap();
        assert_eq!(grads.source, array![[10.0f32, 10.0], [6.0, 12.0]]);
    }

    #[test]
    fn scaled_scatter() {
        let mut grads = GradientBuffer::new(1, 3);
        let rows = array![[1.0f32, -1.0, 2.0]];
        scatter_add_scaled(
            grads.context.view_mut(),
            &[0],
            rows.view(),
            array![0.5f32].view(),
            -2.0,
        )
        .unwrap();
        assert_eq!(grads.context, array![[-1.0f32, 1.0, -2.0]]);
        grads.scale(0.5);
        assert_eq!(grads.context, array![[-0.5f32, 0.5, -1.0]]);
    }

    #[test]
    fn scatter_rejects_bad_rows() {
        let mut grads = GradientBuffer::new(2, 2);
        let rows = array![[1.0f32, 1.0]];
        let coeffs = array![1.0f32];
        assert!(
            scatter_add_scaled(grads.source.view_mut(), &[2], rows.view(), coeffs.view(), 1.0)
                .is_err()
        );
        assert!(scatter_add_scaled(
            grads.source.view_mut(),
            &[0, 1],
            rows.view(),
            coeffs.view(),
            1.0
        )
        .is_err());
    }
}
