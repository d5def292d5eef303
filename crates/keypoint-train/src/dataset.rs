//! Dataset discovery, sample loading and batching.
//!
//! # Directory layout
//!
//! ```text
//! <data_root>/<dataset dir>/
//!   0001.png     # grayscale image
//!   0001.csv     # header row, then `index,row,col` per keypoint
//!   0002.png
//!   0002.csv
//!   ...
//! ```
//!
//! Samples are identified by their base path (file name without extension).
//! Only `.png` files are listed; each must have a sibling `.csv`.
//!
//! This module defines the [`SampleSet`] trait with one concrete
//! implementation, [`KeypointDataset`], which serves three views of a split:
//! augmented training, non-augmented training evaluation and validation. A
//! [`DataLoader`] wraps any [`SampleSet`] and provides batched iteration whose
//! order and augmentation are driven by the caller's [`StdRng`].
//!
//! # Example
//!
//! ```rust,no_run
//! use keypoint_train::config::{Ablation, DatasetKind};
//! use keypoint_train::dataset::DatasetSplit;
//! use rand::{rngs::StdRng, SeedableRng};
//! use std::path::Path;
//!
//! let spec = DatasetKind::Visuomotor.spec();
//! let mut rng = StdRng::seed_from_u64(0);
//! let split = DatasetSplit::discover(
//!     Path::new("visuomotor-dataset"),
//!     spec.training_ratio,
//!     Ablation::None,
//!     &mut rng,
//! ).unwrap();
//! println!("{} training samples", split.training.len());
//! ```

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};
use tracing::{debug, info};

use crate::augment::{add_pixel_noise, augment, resize, scale_coords};
use crate::config::{Ablation, DatasetSpec};
use crate::error::DatasetError;
use crate::losses::{gaussian_heatmaps, HeatmapStats};

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Training and validation sample base paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    /// Training samples, ablation applied.
    pub training: Vec<PathBuf>,
    /// Validation samples.
    pub validation: Vec<PathBuf>,
}

/// List the base paths of every `.png` in `dir`, sorted and deduplicated.
pub fn list_samples(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    if !dir.is_dir() {
        return Err(DatasetError::not_found(dir, "dataset directory does not exist"));
    }
    let entries = std::fs::read_dir(dir).map_err(|e| DatasetError::io_error(dir, e))?;

    let mut bases = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| DatasetError::io_error(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("png") {
            bases.push(path.with_extension(""));
        }
    }
    bases.sort();
    bases.dedup();
    Ok(bases)
}

impl DatasetSplit {
    /// Shuffle `paths` with `rng` and partition them.
    ///
    /// The training count is `ratio · n` rounded half-to-even. The validation
    /// split is carved out before `ablation` truncates the training split.
    pub fn partition(mut paths: Vec<PathBuf>, ratio: f64, ablation: Ablation, rng: &mut StdRng) -> Self {
        paths.shuffle(rng);
        let num_training = ((ratio * paths.len() as f64).round_ties_even() as usize).min(paths.len());
        let validation = paths.split_off(num_training);
        let mut training = paths;
        training.truncate(ablation.retained(training.len()));
        DatasetSplit { training, validation }
    }

    /// List `dir` and partition its samples.
    pub fn discover(dir: &Path, ratio: f64, ablation: Ablation, rng: &mut StdRng) -> Result<Self, DatasetError> {
        let paths = list_samples(dir)?;
        let total = paths.len();
        let split = Self::partition(paths, ratio, ablation, rng);
        info!(
            dir = %dir.display(),
            total,
            training = split.training.len(),
            validation = split.validation.len(),
            %ablation,
            "split dataset"
        );
        Ok(split)
    }
}

/// The image file of a sample.
pub fn image_path(base: &Path) -> PathBuf {
    base.with_extension("png")
}

/// The coordinate table of a sample.
pub fn coords_path(base: &Path) -> PathBuf {
    base.with_extension("csv")
}

// ---------------------------------------------------------------------------
// File readers
// ---------------------------------------------------------------------------

/// Decode an image as 8-bit grayscale into a `[1, H, W]` tensor in `[0, 1]`.
pub fn read_image(path: &Path) -> Result<Tensor, DatasetError> {
    let decoded = image::open(path)
        .map_err(|source| DatasetError::Image { path: path.to_path_buf(), source })?
        .to_luma8();
    let (width, height) = decoded.dimensions();
    let pixels: Vec<f32> = decoded.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
    Ok(Tensor::from_slice(&pixels).view([1, height as i64, width as i64]))
}

/// Read a `[K, 2]` `(row, col)` table: header row, leading index column.
pub fn read_coords(path: &Path, expected: usize) -> Result<Array2<f32>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|source| DatasetError::Coordinates { path: path.to_path_buf(), source })?;

    let mut values = Vec::with_capacity(expected * 2);
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|source| DatasetError::Coordinates { path: path.to_path_buf(), source })?;
        if record.len() < 3 {
            return Err(DatasetError::invalid_format(
                path,
                format!("line {} has {} fields, expected index,row,col", rows + 2, record.len()),
            ));
        }
        for field in [&record[1], &record[2]] {
            let value: f32 = field.trim().parse().map_err(|_| {
                DatasetError::invalid_format(path, format!("`{field}` is not a number"))
            })?;
            values.push(value);
        }
        rows += 1;
    }

    if rows != expected {
        return Err(DatasetError::KeypointCount { path: path.to_path_buf(), found: rows, expected });
    }
    Array2::from_shape_vec((rows, 2), values)
        .map_err(|e| DatasetError::invalid_format(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// ImageStats
// ---------------------------------------------------------------------------

/// Standardization constants of the input images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStats {
    /// Mean of per-image means.
    pub mean: f64,
    /// Mean of per-image unbiased standard deviations.
    pub std: f64,
}

impl ImageStats {
    /// Estimate the statistics over the images of `samples`.
    pub fn estimate(samples: &[PathBuf]) -> Result<Self, DatasetError> {
        if samples.is_empty() {
            return Err(DatasetError::EmptySplit { split: "training" });
        }
        let mut mean_sum = 0.0;
        let mut std_sum = 0.0;
        for base in samples {
            let image = read_image(&image_path(base))?;
            mean_sum += image.mean(Kind::Float).double_value(&[]);
            std_sum += image.std(true).double_value(&[]);
        }
        let n = samples.len() as f64;
        let stats = ImageStats { mean: mean_sum / n, std: std_sum / n };
        debug!(mean = stats.mean, std = stats.std, images = samples.len(), "estimated image statistics");
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Sample / SampleSet
// ---------------------------------------------------------------------------

/// One ready-to-train sample.
#[derive(Debug)]
pub struct Sample {
    /// Standardized image `[1, S, S]`.
    pub image: Tensor,
    /// Standardized heatmap targets `[K, S/2, S/2]`.
    pub heatmaps: Tensor,
    /// Keypoints `[K, 2]` as `(row, col)` in output-grid pixels.
    pub coords: Array2<f32>,
}

/// Common interface of indexable sample collections.
pub trait SampleSet {
    /// Total number of samples.
    fn len(&self) -> usize;

    /// Load the sample at `idx`, drawing any randomness from `rng`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()`, and I/O or
    /// format errors of the underlying files.
    fn get(&self, idx: usize, rng: &mut StdRng) -> Result<Sample, DatasetError>;

    /// Returns `true` when the set contains no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// KeypointDataset
// ---------------------------------------------------------------------------

/// Samples of one split, with or without augmentation.
#[derive(Debug, Clone)]
pub struct KeypointDataset {
    name: String,
    samples: Vec<PathBuf>,
    spec: DatasetSpec,
    image_stats: ImageStats,
    heatmap_stats: HeatmapStats,
    augmentation: bool,
}

impl KeypointDataset {
    /// Build a dataset view.
    ///
    /// All views of one run share `image_stats`, estimated once from the
    /// training split.
    pub fn new(
        name: impl Into<String>,
        samples: Vec<PathBuf>,
        spec: DatasetSpec,
        image_stats: ImageStats,
        augmentation: bool,
    ) -> Self {
        let heatmap_stats = HeatmapStats::reference(spec.output_size(), spec.gaussian_sigma);
        KeypointDataset { name: name.into(), samples, spec, image_stats, heatmap_stats, augmentation }
    }

    /// Sample base paths in index order.
    pub fn samples(&self) -> &[PathBuf] {
        &self.samples
    }

    /// Heatmap standardization constants.
    pub fn heatmap_stats(&self) -> HeatmapStats {
        self.heatmap_stats
    }

    fn standardize_image(&self, image: &Tensor) -> Tensor {
        (image - self.image_stats.mean) / self.image_stats.std
    }
}

impl SampleSet for KeypointDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize, rng: &mut StdRng) -> Result<Sample, DatasetError> {
        let base = self
            .samples
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.samples.len() })?;
        let image = read_image(&image_path(base))?;
        let mut coords = read_coords(&coords_path(base), self.spec.num_keypoints)?;

        let input_size = self.spec.input_size;
        let output_size = self.spec.output_size();

        let (image, coords) = if self.augmentation {
            augment(&image, coords, input_size, output_size, rng)
        } else {
            let size = image.size();
            let s = input_size as i64;
            scale_coords(&mut coords, s as f32 / size[1] as f32, s as f32 / size[2] as f32);
            let to_output = output_size as f32 / input_size as f32;
            coords.mapv_inplace(|v| v * to_output);
            (resize(&image, s, s), coords)
        };

        let mut maps = gaussian_heatmaps(coords.view(), output_size, self.spec.gaussian_sigma);
        self.heatmap_stats.standardize(&mut maps);
        let o = output_size as i64;
        let heatmaps = Tensor::from_slice(&maps.into_raw_vec()).view([coords.nrows() as i64, o, o]);

        let mut image = self.standardize_image(&image);
        if self.augmentation {
            image = add_pixel_noise(&image, rng);
        }

        Ok(Sample { image, heatmaps, coords })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Batch / DataLoader
// ---------------------------------------------------------------------------

/// Stacked samples.
#[derive(Debug)]
pub struct Batch {
    /// `[B, 1, S, S]`
    pub images: Tensor,
    /// `[B, K, S/2, S/2]`
    pub heatmaps: Tensor,
    /// Per-sample keypoints in output-grid pixels.
    pub coords: Vec<Array2<f32>>,
    /// Dataset index of each sample.
    pub indices: Vec<usize>,
}

/// Batched iterator factory over a [`SampleSet`].
///
/// The permutation of a shuffled loader is drawn from the caller's RNG at the
/// start of each iteration, so the sequence of epochs is reproducible from
/// the run seed.
pub struct DataLoader<'a> {
    dataset: &'a dyn SampleSet,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl<'a> DataLoader<'a> {
    /// Create a new `DataLoader`.
    ///
    /// # Parameters
    ///
    /// - `dataset`    – the underlying samples.
    /// - `batch_size` – samples per batch, must be > 0.
    /// - `shuffle`    – draw a fresh permutation per iteration.
    /// - `drop_last`  – skip a trailing batch smaller than `batch_size`.
    pub fn new(dataset: &'a dyn SampleSet, batch_size: usize, shuffle: bool, drop_last: bool) -> Self {
        DataLoader { dataset, batch_size: batch_size.max(1), shuffle, drop_last }
    }

    /// Number of batches yielded per iteration.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Iterate over batches, drawing the order and any augmentation from `rng`.
    pub fn iter<'r>(&self, rng: &'r mut StdRng) -> DataLoaderIter<'a, 'r> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        let usable = self.num_batches() * self.batch_size;
        indices.truncate(usable.min(indices.len()));
        DataLoaderIter { dataset: self.dataset, indices, batch_size: self.batch_size, cursor: 0, rng }
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub struct DataLoaderIter<'a, 'r> {
    dataset: &'a dyn SampleSet,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    rng: &'r mut StdRng,
}

impl Iterator for DataLoaderIter<'_, '_> {
    type Item = Result<Batch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch_indices = self.indices[self.cursor..end].to_vec();
        self.cursor = end;
        Some(self.load(batch_indices))
    }
}

impl DataLoaderIter<'_, '_> {
    fn load(&mut self, indices: Vec<usize>) -> Result<Batch, DatasetError> {
        let mut images = Vec::with_capacity(indices.len());
        let mut heatmaps = Vec::with_capacity(indices.len());
        let mut coords = Vec::with_capacity(indices.len());
        for &idx in &indices {
            let sample = self.dataset.get(idx, &mut *self.rng)?;
            images.push(sample.image);
            heatmaps.push(sample.heatmaps);
            coords.push(sample.coords);
        }
        Ok(Batch {
            images: Tensor::f_stack(&images, 0)?,
            heatmaps: Tensor::f_stack(&heatmaps, 0)?,
            coords,
            indices,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
