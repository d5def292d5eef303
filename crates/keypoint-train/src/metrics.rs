//! Pixel-distance evaluation of predicted heatmaps.
//!
//! A predicted keypoint is the argmax of its heatmap channel, placed at the
//! pixel center (`+ 0.5`). The ground truth is snapped to the center of the
//! pixel it falls in (`floor + 0.5`). The metric is the Euclidean distance
//! between the two, in output-grid pixels.
//!
//! Results are accumulated over batches via [`DistanceAccumulator`], which
//! keeps exactly one row per sample, and summarized into a
//! [`DistanceSummary`] for logging.

use ndarray::{Array2, Axis};
use tch::{Device, Kind, Tensor};

use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode `[B, K, H, W]` heatmaps into per-sample `[K, 2]` `(row, col)`
/// pixel-center coordinates of each channel's maximum.
///
/// Ties resolve to the first maximum in row-major order.
pub fn argmax_coords(heatmaps: &Tensor) -> TrainResult<Vec<Array2<f32>>> {
    let size = heatmaps.size();
    if size.len() != 4 {
        return Err(TrainError::shape_mismatch(vec![-1, -1, -1, -1], size));
    }
    let (batch, keypoints, width) = (size[0] as usize, size[1] as usize, size[3]);

    let flat = heatmaps
        .flatten(2, 3)
        .argmax(-1, false)
        .to_device(Device::Cpu)
        .to_kind(Kind::Int64)
        .flatten(0, -1);
    let indices = Vec::<i64>::try_from(&flat)?;

    Ok(indices
        .chunks(keypoints.max(1))
        .take(batch)
        .map(|sample| {
            let mut coords = Array2::zeros((keypoints, 2));
            for (k, &idx) in sample.iter().enumerate() {
                coords[[k, 0]] = (idx / width) as f32 + 0.5;
                coords[[k, 1]] = (idx % width) as f32 + 0.5;
            }
            coords
        })
        .collect())
}

/// Distance from each predicted keypoint to its pixel-snapped ground truth.
///
/// Returns `[K]` distances for one sample.
pub fn keypoint_distances(predicted: &Array2<f32>, truth: &Array2<f32>) -> Vec<f32> {
    predicted
        .rows()
        .into_iter()
        .zip(truth.rows())
        .map(|(p, t)| {
            let row = t[0].floor() + 0.5;
            let col = t[1].floor() + 0.5;
            (row - p[0]).hypot(col - p[1])
        })
        .collect()
}

// ---------------------------------------------------------------------------
// DistanceAccumulator
// ---------------------------------------------------------------------------

/// Collects per-sample keypoint distances across batches.
#[derive(Debug, Clone)]
pub struct DistanceAccumulator {
    num_keypoints: usize,
    rows: Vec<Vec<f32>>,
}

impl DistanceAccumulator {
    /// Create an empty accumulator for `num_keypoints` keypoints per sample.
    pub fn new(num_keypoints: usize) -> Self {
        DistanceAccumulator { num_keypoints, rows: Vec::new() }
    }

    /// Add one batch of predictions and their ground-truth coordinates.
    pub fn update(&mut self, predictions: &Tensor, truth: &[Array2<f32>]) -> TrainResult<()> {
        let decoded = argmax_coords(predictions)?;
        if decoded.len() != truth.len() {
            return Err(TrainError::shape_mismatch(
                vec![truth.len() as i64],
                vec![decoded.len() as i64],
            ));
        }
        let k = self.num_keypoints;
        for (p, t) in decoded.iter().zip(truth) {
            if p.nrows() != k || t.nrows() != k {
                return Err(TrainError::shape_mismatch(
                    vec![k as i64, 2],
                    vec![p.nrows().min(t.nrows()) as i64, 2],
                ));
            }
            self.rows.push(keypoint_distances(p, t));
        }
        Ok(())
    }

    /// Number of samples seen.
    pub fn num_samples(&self) -> usize {
        self.rows.len()
    }

    /// All distances as `[N, K]`.
    pub fn distances(&self) -> TrainResult<Array2<f32>> {
        let (n, k) = (self.rows.len(), self.num_keypoints);
        let flat: Vec<f32> = self.rows.iter().flatten().copied().collect();
        let len = flat.len() as i64;
        Array2::from_shape_vec((n, k), flat)
            .map_err(|_| TrainError::shape_mismatch(vec![n as i64, k as i64], vec![len]))
    }

    /// Summary over every keypoint of every sample, `None` when empty.
    pub fn summary(&self) -> Option<DistanceSummary> {
        let mut all: Vec<f32> = self.rows.iter().flatten().copied().collect();
        if all.is_empty() {
            return None;
        }
        all.sort_by(f32::total_cmp);
        let n = all.len();
        let mean = all.iter().map(|&d| d as f64).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            all[n / 2] as f64
        } else {
            (all[n / 2 - 1] as f64 + all[n / 2] as f64) / 2.0
        };
        let per_keypoint = self
            .distances()
            .ok()
            .and_then(|d| d.mean_axis(Axis(0)))
            .map(|m| m.to_vec())
            .unwrap_or_default();
        Some(DistanceSummary {
            mean,
            median,
            max: all[n - 1] as f64,
            per_keypoint,
        })
    }
}

/// Aggregated distances of one model on one split.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceSummary {
    /// Mean over samples and keypoints.
    pub mean: f64,
    /// Median over samples and keypoints.
    pub median: f64,
    /// Largest distance.
    pub max: f64,
    /// Mean per keypoint.
    pub per_keypoint: Vec<f32>,
}

impl DistanceSummary {
    /// One-line human-readable form.
    pub fn summary(&self) -> String {
        format!("mean={:.4} median={:.4} max={:.4}", self.mean, self.median, self.max)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
