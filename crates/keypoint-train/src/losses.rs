//! Heatmap targets and the regression loss.
//!
//! Each keypoint becomes a 2-D Gaussian on the output grid:
//!
//! ```text
//! H[y, x] = exp( -((y + 0.5 - row)² + (x + 0.5 - col)²) / (2 · σ²) )
//! ```
//!
//! The `+ 0.5` places pixel `(y, x)` at its center, so a keypoint at
//! `(row, col) = (y + 0.5, x + 0.5)` peaks exactly on that pixel.
//!
//! Targets are standardized with the mean and standard deviation of a single
//! reference Gaussian centered on the grid ([`HeatmapStats`]), and the model
//! regresses them with a mean-squared error ([`heatmap_loss`]).

use ndarray::{Array2, Array3, ArrayView2};
use tch::{Reduction, Tensor};

// ─────────────────────────────────────────────────────────────────────────────
// Gaussian synthesis
// ─────────────────────────────────────────────────────────────────────────────

/// Draw one Gaussian per keypoint.
///
/// # Arguments
/// - `coords`: `[K, 2]` keypoints as `(row, col)` in output-grid pixels
/// - `size`: output grid side (H = W)
/// - `sigma`: Gaussian spread in pixels
///
/// # Returns
/// `[K, size, size]` with values in `(0, 1]`. Not truncated.
pub fn gaussian_heatmaps(coords: ArrayView2<f32>, size: usize, sigma: f32) -> Array3<f32> {
    let num_keypoints = coords.nrows();
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut maps = Array3::zeros((num_keypoints, size, size));

    for (k, mut map) in maps.outer_iter_mut().enumerate() {
        let row = coords[[k, 0]];
        let col = coords[[k, 1]];
        for ((y, x), value) in map.indexed_iter_mut() {
            let dy = y as f32 + 0.5 - row;
            let dx = x as f32 + 0.5 - col;
            *value = (-(dy * dy + dx * dx) / two_sigma_sq).exp();
        }
    }
    maps
}

// ─────────────────────────────────────────────────────────────────────────────
// HeatmapStats
// ─────────────────────────────────────────────────────────────────────────────

/// Standardization constants of the heatmap targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatmapStats {
    /// Mean of the reference Gaussian.
    pub mean: f32,
    /// Unbiased standard deviation of the reference Gaussian.
    pub std: f32,
}

impl HeatmapStats {
    /// Statistics of a Gaussian centered at `(size / 2, size / 2)`.
    pub fn reference(size: usize, sigma: f32) -> Self {
        let center = size as f32 / 2.0;
        let coords = Array2::from_elem((1, 2), center);
        let map = gaussian_heatmaps(coords.view(), size, sigma);

        let n = map.len() as f64;
        let mean = map.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = map.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
        HeatmapStats { mean: mean as f32, std: var.sqrt() as f32 }
    }

    /// Standardize `maps` in place: `(h - mean) / std`.
    pub fn standardize(&self, maps: &mut Array3<f32>) {
        let (mean, std) = (self.mean, self.std);
        maps.mapv_inplace(|v| (v - mean) / std);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loss
// ─────────────────────────────────────────────────────────────────────────────

/// Mean-squared error between predicted and target heatmaps.
///
/// # Arguments
/// * `pred`   - Predicted heatmaps \[B, K, H, W\]
/// * `target` - Standardized Gaussian targets \[B, K, H, W\]
///
/// Returns a scalar `Tensor`.
pub fn heatmap_loss(pred: &Tensor, target: &Tensor) -> Tensor {
    pred.mse_loss(target, Reduction::Mean)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
