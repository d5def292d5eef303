//! Integration tests for [`keypoint_train::losses`].
//!
//! All input arrays and tensors are constructed from fixed, deterministic
//! data; no `rand` crate, no OS entropy.

use approx::assert_abs_diff_eq;
use keypoint_train::losses::{gaussian_heatmaps, heatmap_loss, HeatmapStats};
use ndarray::{array, Axis};
use tch::{Device, Kind, Tensor};

// ---------------------------------------------------------------------------
// gaussian_heatmaps
// ---------------------------------------------------------------------------

/// One channel per keypoint, square output grid.
#[test]
fn heatmaps_have_one_channel_per_keypoint() {
    let coords = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
    let maps = gaussian_heatmaps(coords.view(), 16, 2.0);
    assert_eq!(maps.shape(), &[3, 16, 16]);
}

/// A keypoint at a pixel center peaks with value 1 on that pixel.
#[test]
fn peak_sits_on_the_keypoint_pixel() {
    let coords = array![[5.5f32, 9.5]];
    let maps = gaussian_heatmaps(coords.view(), 16, 2.0);
    assert_abs_diff_eq!(maps[[0, 5, 9]], 1.0, epsilon = 1e-7);
    let max = maps.iter().cloned().fold(f32::MIN, f32::max);
    assert_eq!(max, maps[[0, 5, 9]]);
}

/// A keypoint on a pixel corner spreads equally over the four neighbours.
#[test]
fn corner_keypoint_is_symmetric() {
    let coords = array![[8.0f32, 8.0]];
    let maps = gaussian_heatmaps(coords.view(), 16, 2.0);
    let v = maps[[0, 7, 7]];
    assert_abs_diff_eq!(maps[[0, 7, 8]], v, epsilon = 1e-7);
    assert_abs_diff_eq!(maps[[0, 8, 7]], v, epsilon = 1e-7);
    assert_abs_diff_eq!(maps[[0, 8, 8]], v, epsilon = 1e-7);
    assert_abs_diff_eq!(v, (-0.25f32 / 4.0).exp(), epsilon = 1e-6);
}

/// A keypoint at the grid center is radially symmetric around it.
#[test]
fn centered_keypoint_is_radially_symmetric() {
    let size = 16;
    let maps = gaussian_heatmaps(array![[8.0f32, 8.0]].view(), size, 2.0);
    let peak = maps.iter().cloned().fold(f32::MIN, f32::max);
    for y in 0..size {
        for x in 0..size {
            let v = maps[[0, y, x]];
            assert_eq!(v, maps[[0, x, y]]);
            assert_eq!(v, maps[[0, size - 1 - y, x]]);
            assert_eq!(v, maps[[0, y, size - 1 - x]]);
        }
    }
    for (y, x) in [(7, 7), (7, 8), (8, 7), (8, 8)] {
        assert_eq!(maps[[0, y, x]], peak);
    }
}

/// Values are Gaussian in the distance, never truncated to zero nearby.
#[test]
fn falloff_follows_sigma() {
    let coords = array![[0.5f32, 0.5]];
    let maps = gaussian_heatmaps(coords.view(), 8, 2.0);
    // Three pixels right: d² = 9, 2σ² = 8.
    assert_abs_diff_eq!(maps[[0, 0, 3]], (-9.0f32 / 8.0).exp(), epsilon = 1e-6);
    assert!(maps.iter().all(|&v| v > 0.0 && v <= 1.0));
}

#[test]
fn synthesis_is_deterministic() {
    let coords = array![[3.3f32, 7.1]];
    let a = gaussian_heatmaps(coords.view(), 32, 2.0);
    let b = gaussian_heatmaps(coords.view(), 32, 2.0);
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// HeatmapStats
// ---------------------------------------------------------------------------

#[test]
fn reference_stats_standardize_the_reference_map() {
    let stats = HeatmapStats::reference(64, 2.0);
    assert!(stats.mean > 0.0 && stats.mean < 0.01);
    assert!(stats.std > 0.0);

    let mut maps = gaussian_heatmaps(array![[32.0f32, 32.0]].view(), 64, 2.0);
    stats.standardize(&mut maps);
    let mean = maps.mean_axis(Axis(2)).unwrap().mean().unwrap();
    assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
    let var = maps.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / (maps.len() - 1) as f64;
    assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
}

// ---------------------------------------------------------------------------
// heatmap_loss
// ---------------------------------------------------------------------------

#[test]
fn identical_maps_have_zero_loss() {
    let t = Tensor::ones([2, 3, 8, 8], (Kind::Float, Device::Cpu));
    assert_abs_diff_eq!(heatmap_loss(&t, &t).double_value(&[]), 0.0);
}

#[test]
fn loss_is_mean_squared_error() {
    let pred = Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu));
    let target = Tensor::from_slice(&[1.0f32, 2.0, 0.0, 3.0]).view([1, 1, 2, 2]);
    // (1 + 4 + 0 + 9) / 4
    assert_abs_diff_eq!(heatmap_loss(&pred, &target).double_value(&[]), 3.5, epsilon = 1e-6);
}

#[test]
fn loss_is_differentiable() {
    let pred = Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
    let target = Tensor::ones([1, 1, 2, 2], (Kind::Float, Device::Cpu));
    heatmap_loss(&pred, &target).backward();
    let grad = pred.grad();
    // d/dp mean((p - 1)²) = 2 (p - 1) / 4
    assert_abs_diff_eq!(grad.get(0).get(0).get(0).get(0).double_value(&[]), -0.5, epsilon = 1e-6);
}
