//! # Keypoint Training Infrastructure
//!
//! This crate provides the complete training pipeline for heatmap-based
//! keypoint detection on grayscale images. It includes configuration
//! management, dataset loading with augmentation, the hierarchical and
//! isotropic network families built from one inverted-bottleneck block, an
//! exponential moving average of the weights, evaluation metrics, and the
//! training loop orchestrator.
//!
//! ## Architecture
//!
//! ```text
//! RunConfig ──► Trainer ──► KeypointNet (live) ──► EmaModel
//!     │            │
//!     │        DataLoader
//!     │            │
//!     │      KeypointDataset ──► augment
//!     │            │
//!     │      losses::gaussian_heatmaps
//!     │
//!     └──► RunRecord (CSV series, checkpoints, distances)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keypoint_train::config::{DatasetKind, RunConfig};
//! use keypoint_train::trainer::Trainer;
//!
//! let config = RunConfig { dataset: DatasetKind::Visuomotor, ..RunConfig::default() };
//! let summary = Trainer::new(config).unwrap().run(false).unwrap();
//! println!("artifacts in {}", summary.run_dir.display());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod augment;
pub mod block;
pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod record;
pub mod runtime;
pub mod stems;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::{DatasetKind, ModelConfig, RunConfig, SweepConfig, TrainingConfig};
pub use dataset::{DataLoader, DatasetSplit, KeypointDataset, SampleSet};
pub use ema::EmaModel;
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use model::KeypointNet;
pub use trainer::{RunSummary, Trainer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
