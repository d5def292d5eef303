//! Run configuration for keypoint training.
//!
//! A [`RunConfig`] is the single source of truth for one training run: the
//! seed, the dataset, the ablation mode, the [`ModelConfig`] describing the
//! network topology, and the [`TrainingConfig`] holding optimisation sizes.
//! It is serializable via [`serde`] so it can be stored next to the run's
//! artifacts and restored from JSON.
//!
//! Every string-valued toggle is a closed enumeration. Unknown spellings are
//! rejected when parsing (fail-fast), never silently mapped to a default.
//!
//! # Example
//!
//! ```rust
//! use keypoint_train::config::{Architecture, RunConfig};
//!
//! let cfg = RunConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.model.architecture, Architecture::Isotropic);
//! assert_eq!(cfg.dataset_spec().num_keypoints, 7);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Closed enumerations
// ---------------------------------------------------------------------------

/// Declares `as_str`, [`fmt::Display`] and [`FromStr`] for a fieldless enum
/// from one table of spellings.
macro_rules! spelled_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Canonical spelling used in config files and run directory names.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ConfigError::unknown_variant(
                        $kind,
                        other,
                        concat!($($text, " "),+),
                    )),
                }
            }
        }
    };
}

/// Network topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Encoder-decoder over three resolutions, ten residual blocks.
    Hierarchical,
    /// Patch embedding followed by N blocks at a single resolution.
    Isotropic,
}

spelled_enum!(Architecture, "architecture", {
    Hierarchical => "hierarchical",
    Isotropic => "isotropic",
});

/// Normalization strategy following a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// No normalization; the convolution carries its own bias.
    None,
    /// Batch normalization with running statistics.
    Batch,
    /// Group normalization with a single group.
    Layer,
    /// Group normalization with `channels / 4` groups.
    Group,
    /// Group normalization with one group per channel.
    Instance,
}

spelled_enum!(Normalization, "normalization", {
    None => "none",
    Batch => "batch",
    Layer => "layer",
    Group => "group",
    Instance => "instance",
});

impl Normalization {
    /// Whether this strategy leaves the preceding convolution without bias.
    pub fn is_enabled(self) -> bool {
        self != Normalization::None
    }
}

/// Non-linearity used inside blocks and heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activation {
    /// `x * relu6(x + 3) / 6`.
    HardSwish,
    /// Rectified linear unit.
    Relu,
}

spelled_enum!(Activation, "activation", {
    HardSwish => "hard-swish",
    Relu => "relu",
});

/// Optional channel attention inside a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attention {
    /// No attention.
    None,
    /// Squeeze-and-excitation gating.
    #[serde(rename = "squeeze")]
    SqueezeExcitation,
}

spelled_enum!(Attention, "attention", {
    None => "none",
    SqueezeExcitation => "squeeze",
});

/// Training-set reduction used for data-efficiency studies.
///
/// The divisors do not match the names: `half` keeps `n / 2` samples and
/// `three-quarters` keeps `n / 4`. Results on disk were produced with these
/// divisors, so they are preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ablation {
    /// Keep the full training split.
    None,
    /// Keep `n / 2` training samples.
    Half,
    /// Keep `n / 4` training samples.
    ThreeQuarters,
}

spelled_enum!(Ablation, "ablation", {
    None => "none",
    Half => "half",
    ThreeQuarters => "three-quarters",
});

impl Ablation {
    /// Number of training samples retained out of `num_training`.
    pub fn retained(self, num_training: usize) -> usize {
        match self {
            Ablation::None => num_training,
            Ablation::Half => num_training / 2,
            Ablation::ThreeQuarters => num_training / 4,
        }
    }
}

/// The two image datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    /// Seven keypoints on 512×512 inputs.
    TouchEvoked,
    /// One keypoint on 256×256 inputs.
    Visuomotor,
}

spelled_enum!(DatasetKind, "dataset", {
    TouchEvoked => "touch-evoked",
    Visuomotor => "visuomotor",
});

/// Fixed per-dataset constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetSpec {
    /// Directory name under the data root.
    pub directory: &'static str,
    /// Side length of the square network input.
    pub input_size: usize,
    /// Keypoints per sample.
    pub num_keypoints: usize,
    /// Gaussian sigma of the heatmap targets, in output pixels.
    pub gaussian_sigma: f32,
    /// Fraction of samples assigned to training.
    pub training_ratio: f64,
}

impl DatasetSpec {
    /// Side length of the predicted heatmaps. Always half the input.
    pub fn output_size(&self) -> usize {
        self.input_size / 2
    }
}

impl DatasetKind {
    /// Constants for this dataset.
    pub fn spec(self) -> DatasetSpec {
        match self {
            DatasetKind::TouchEvoked => DatasetSpec {
                directory: "touch-evoked-dataset",
                input_size: 512,
                num_keypoints: 7,
                gaussian_sigma: 2.0,
                training_ratio: 0.75,
            },
            DatasetKind::Visuomotor => DatasetSpec {
                directory: "visuomotor-dataset",
                input_size: 256,
                num_keypoints: 1,
                gaussian_sigma: 2.0,
                training_ratio: 0.75,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Normalization and activation resolved for one convolution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    /// Normalization applied after the convolution.
    pub norm: Normalization,
    /// Activation applied after the normalization, if any.
    pub activation: Option<Activation>,
}

/// Immutable description of a network. Fully determines the parameter count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Topology.
    pub architecture: Architecture,
    /// Patch side for the isotropic stem. Recorded but unused by the
    /// hierarchical model.
    pub patch_size: usize,
    /// Residual block count. The hierarchical model always builds ten blocks
    /// but uses this value for the projection initialisation gain.
    pub num_blocks: usize,
    /// Channel width (bottleneck width for the hierarchical model).
    pub num_features: usize,
    /// Normalization kind shared by every normalized stage.
    pub norm: Normalization,
    /// Activation kind shared by every activated stage.
    pub activation: Activation,
    /// Normalize after the 1×1 expansion.
    pub expansion_norm: bool,
    /// Activate after the 1×1 expansion.
    pub expansion_activation: bool,
    /// Odd kernel size of the depthwise convolution.
    pub depthwise_filter_size: usize,
    /// Normalize after the depthwise convolution.
    pub depthwise_norm: bool,
    /// Activate after the depthwise convolution.
    pub depthwise_activation: bool,
    /// Attention applied to the depthwise output.
    pub attention: Attention,
    /// Normalize after the 1×1 projection.
    pub projection_norm: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            architecture: Architecture::Isotropic,
            patch_size: 8,
            num_blocks: 10,
            num_features: 32,
            norm: Normalization::Batch,
            activation: Activation::HardSwish,
            expansion_norm: true,
            expansion_activation: true,
            depthwise_filter_size: 5,
            depthwise_norm: true,
            depthwise_activation: true,
            attention: Attention::None,
            projection_norm: true,
        }
    }
}

impl ModelConfig {
    fn stage(&self, norm: bool, activation: bool) -> StageConfig {
        StageConfig {
            norm: if norm { self.norm } else { Normalization::None },
            activation: if activation { Some(self.activation) } else { None },
        }
    }

    /// Expansion stage (C → 2C, 1×1).
    pub fn expansion_stage(&self) -> StageConfig {
        self.stage(self.expansion_norm, self.expansion_activation)
    }

    /// Depthwise stage (2C → 2C, k×k).
    pub fn depthwise_stage(&self) -> StageConfig {
        self.stage(self.depthwise_norm, self.depthwise_activation)
    }

    /// Projection stage (2C → C, 1×1). Never activated.
    pub fn projection_stage(&self) -> StageConfig {
        self.stage(self.projection_norm, false)
    }

    /// Validate the topology against a square input of side `input_size`.
    pub fn validate(&self, input_size: usize) -> Result<(), ConfigError> {
        if self.num_blocks == 0 {
            return Err(ConfigError::invalid_value("num_blocks", "must be > 0"));
        }
        if self.num_features == 0 {
            return Err(ConfigError::invalid_value("num_features", "must be > 0"));
        }
        if self.depthwise_filter_size == 0 || self.depthwise_filter_size % 2 == 0 {
            return Err(ConfigError::invalid_value(
                "depthwise_filter_size",
                "must be odd for same padding",
            ));
        }

        match self.architecture {
            Architecture::Isotropic => {
                if self.patch_size < 2 || self.patch_size % 2 != 0 {
                    return Err(ConfigError::invalid_value(
                        "patch_size",
                        "must be even and >= 2",
                    ));
                }
                if input_size % self.patch_size != 0 {
                    return Err(ConfigError::invalid_value(
                        "patch_size",
                        format!("must divide the input size {input_size}"),
                    ));
                }
                if self.norm == Normalization::Group && self.num_features % 4 != 0 {
                    return Err(ConfigError::invalid_value(
                        "num_features",
                        "must be divisible by 4 for group normalization",
                    ));
                }
            }
            Architecture::Hierarchical => {
                if self.num_features % 4 != 0 || self.num_features < 4 {
                    return Err(ConfigError::invalid_value(
                        "num_features",
                        "must be a positive multiple of 4 for the hierarchical model",
                    ));
                }
                if self.norm == Normalization::Group && self.num_features % 16 != 0 {
                    return Err(ConfigError::invalid_value(
                        "num_features",
                        "must be divisible by 16 for hierarchical group normalization",
                    ));
                }
                if input_size % 8 != 0 {
                    return Err(ConfigError::invalid_value(
                        "architecture",
                        format!("hierarchical model needs an input size divisible by 8, got {input_size}"),
                    ));
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Optimisation sizes and schedule length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Samples per optimizer step. Default: **16**.
    pub training_batch_size: usize,
    /// Samples per forward/backward micro-batch. Default: **16**.
    pub accumulation_size: usize,
    /// Samples per evaluation batch. Default: **16**.
    pub evaluation_batch_size: usize,
    /// Nominal AdamW learning rate. Default: **5e-4**.
    pub learning_rate: f64,
    /// Number of epochs. Zero is allowed and only writes initial checkpoints.
    pub num_epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            training_batch_size: 16,
            accumulation_size: 16,
            evaluation_batch_size: 16,
            learning_rate: 5.0e-4,
            num_epochs: 250,
        }
    }
}

impl TrainingConfig {
    /// Micro-batches per optimizer step.
    pub fn accumulation_steps(&self) -> usize {
        self.training_batch_size / self.accumulation_size
    }

    /// Validate sizes and rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.training_batch_size == 0 {
            return Err(ConfigError::invalid_value("training_batch_size", "must be > 0"));
        }
        if self.accumulation_size == 0 {
            return Err(ConfigError::invalid_value("accumulation_size", "must be > 0"));
        }
        if self.training_batch_size % self.accumulation_size != 0 {
            return Err(ConfigError::invalid_value(
                "accumulation_size",
                "must divide training_batch_size",
            ));
        }
        if self.evaluation_batch_size == 0 {
            return Err(ConfigError::invalid_value("evaluation_batch_size", "must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

fn default_data_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_root() -> PathBuf {
    PathBuf::from("generated")
}

/// Complete configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Nominal seed; see [`crate::runtime::effective_seed`].
    pub seed: u64,
    /// Which dataset to train on.
    pub dataset: DatasetKind,
    /// Training-set reduction.
    pub ablation: Ablation,
    /// Network description.
    pub model: ModelConfig,
    /// Optimisation sizes.
    pub training: TrainingConfig,
    /// Directory containing the dataset directories.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Directory under which run directories are created.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            seed: 0,
            dataset: DatasetKind::TouchEvoked,
            ablation: Ablation::None,
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            data_root: default_data_root(),
            output_root: default_output_root(),
        }
    }
}

impl RunConfig {
    /// Constants of the configured dataset.
    pub fn dataset_spec(&self) -> DatasetSpec {
        self.dataset.spec()
    }

    /// Directory holding this dataset's images and coordinate tables.
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_root.join(self.dataset_spec().directory)
    }

    /// Validate every section. Called once before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate(self.dataset_spec().input_size)?;
        self.training.validate()?;
        Ok(())
    }

    /// Every hyperparameter value joined with `;`, used as the run directory
    /// name so that each configuration writes to its own directory.
    ///
    /// Values keep the spelling of existing result directories: absent
    /// options are `None`, flags are `True`/`False`, and floats switch to
    /// exponent form outside `[1e-4, 1e16)` (`1e-05`).
    pub fn run_name(&self) -> String {
        let m = &self.model;
        let t = &self.training;
        [
            self.seed.to_string(),
            self.dataset.to_string(),
            option_label(self.ablation.to_string()),
            m.architecture.to_string(),
            m.patch_size.to_string(),
            m.num_blocks.to_string(),
            m.num_features.to_string(),
            option_label(m.norm.to_string()),
            m.activation.to_string(),
            flag_label(m.expansion_norm),
            flag_label(m.expansion_activation),
            m.depthwise_filter_size.to_string(),
            flag_label(m.depthwise_norm),
            flag_label(m.depthwise_activation),
            option_label(m.attention.to_string()),
            flag_label(m.projection_norm),
            t.training_batch_size.to_string(),
            t.accumulation_size.to_string(),
            t.evaluation_batch_size.to_string(),
            float_label(t.learning_rate),
            t.num_epochs.to_string(),
        ]
        .join(";")
    }

    /// Directory receiving this run's artifacts.
    pub fn run_dir(&self) -> PathBuf {
        self.output_root.join(self.run_name())
    }

    /// Load and validate a [`RunConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed or names an
    /// unknown variant, and any validation error.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let cfg: RunConfig = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize to pretty-printed JSON at `path`, creating parent directories.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn option_label(spelling: String) -> String {
    if spelling == "none" {
        "None".to_string()
    } else {
        spelling
    }
}

fn flag_label(flag: bool) -> String {
    if flag { "True" } else { "False" }.to_string()
}

/// Shortest round-trip decimal, in exponent form with a signed two-digit
/// exponent outside `[1e-4, 1e16)`.
pub fn float_label(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0.0".to_string();
    }
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let plain = value.to_string();
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

// ---------------------------------------------------------------------------
// SweepConfig
// ---------------------------------------------------------------------------

/// A list of runs repeated over a list of seeds.
///
/// Runs execute strictly one after another; seeds form the outer loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Nominal seeds. Each overrides the `seed` of every run.
    pub seeds: Vec<u64>,
    /// Run templates.
    pub runs: Vec<RunConfig>,
}

impl SweepConfig {
    /// Load and validate a sweep file.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let sweep: SweepConfig = read_json(path)?;
        for run in &sweep.runs {
            run.validate()?;
        }
        Ok(sweep)
    }

    /// Concrete runs in execution order.
    pub fn expand(&self) -> Vec<RunConfig> {
        self.seeds
            .iter()
            .flat_map(|&seed| {
                self.runs.iter().map(move |run| RunConfig { seed, ..run.clone() })
            })
            .collect()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
