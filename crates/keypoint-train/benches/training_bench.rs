//! Benchmarks for the keypoint training pipeline.
//!
//! Inputs are built from fixed data or a fixed-seed [`StdRng`], so benchmark
//! numbers are reproducible across runs.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p keypoint-train
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keypoint_train::augment::augment;
use keypoint_train::config::{Architecture, DatasetKind, ModelConfig};
use keypoint_train::layers::ForwardMode;
use keypoint_train::losses::{gaussian_heatmaps, HeatmapStats};
use keypoint_train::metrics::argmax_coords;
use keypoint_train::model::KeypointNet;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};

// ─────────────────────────────────────────────────────────────────────────────
// Target synthesis
// ─────────────────────────────────────────────────────────────────────────────

/// Seven touch-evoked keypoints on the 256×256 output grid.
fn bench_heatmap_synthesis(c: &mut Criterion) {
    let spec = DatasetKind::TouchEvoked.spec();
    let coords = Array2::from_shape_fn((spec.num_keypoints, 2), |(k, axis)| {
        (30 + 25 * k + 7 * axis) as f32 + 0.25
    });
    let stats = HeatmapStats::reference(spec.output_size(), spec.gaussian_sigma);

    c.bench_function("gaussian_heatmaps_7x256", |b| {
        b.iter(|| {
            let mut maps = gaussian_heatmaps(black_box(coords.view()), spec.output_size(), spec.gaussian_sigma);
            stats.standardize(&mut maps);
            maps
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Augmentation
// ─────────────────────────────────────────────────────────────────────────────

fn bench_augment(c: &mut Criterion) {
    let spec = DatasetKind::Visuomotor.spec();
    let image = Tensor::linspace(0.0, 1.0, 300 * 300, (Kind::Float, Device::Cpu)).view([1, 300, 300]);
    let coords = Array2::from_elem((1, 2), 150.0f32);
    let mut rng = StdRng::seed_from_u64(0);

    c.bench_function("augment_visuomotor", |b| {
        b.iter(|| {
            augment(
                black_box(&image),
                coords.clone(),
                spec.input_size,
                spec.output_size(),
                &mut rng,
            )
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Forward passes
// ─────────────────────────────────────────────────────────────────────────────

/// Inference of both architectures at visuomotor resolution, batch 4.
fn bench_forward(c: &mut Criterion) {
    tch::set_num_threads(1);
    let mut group = c.benchmark_group("forward_256");
    group.sample_size(10);
    let xs = Tensor::randn([4, 1, 256, 256], (Kind::Float, Device::Cpu));

    for architecture in [Architecture::Isotropic, Architecture::Hierarchical] {
        let config = ModelConfig { architecture, ..ModelConfig::default() };
        let net = KeypointNet::new(&config, 1, Device::Cpu);
        group.bench_with_input(BenchmarkId::from_parameter(architecture), &xs, |b, xs| {
            b.iter(|| net.forward_inference(black_box(xs)));
        });
    }
    group.finish();
}

/// One training-mode forward and backward pass of the default isotropic net.
fn bench_backward(c: &mut Criterion) {
    tch::set_num_threads(1);
    let mut group = c.benchmark_group("train_step_256");
    group.sample_size(10);
    let net = KeypointNet::new(&ModelConfig::default(), 1, Device::Cpu);
    let xs = Tensor::randn([4, 1, 256, 256], (Kind::Float, Device::Cpu));
    let target = Tensor::randn([4, 1, 128, 128], (Kind::Float, Device::Cpu));

    group.bench_function("isotropic", |b| {
        b.iter(|| {
            let loss = net.forward(&xs, ForwardMode::Train).mse_loss(&target, tch::Reduction::Mean);
            loss.backward();
        });
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let maps = Tensor::randn([16, 7, 256, 256], (Kind::Float, Device::Cpu));
    c.bench_function("argmax_coords_16x7x256", |b| {
        b.iter(|| argmax_coords(black_box(&maps)));
    });
}

criterion_group!(
    benches,
    bench_heatmap_synthesis,
    bench_augment,
    bench_forward,
    bench_backward,
    bench_decode,
);
criterion_main!(benches);
