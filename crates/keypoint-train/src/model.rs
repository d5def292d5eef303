//! Keypoint heatmap networks built with tch-rs (PyTorch Rust bindings).
//!
//! # Architectures
//!
//! ```text
//! Hierarchical                               Isotropic
//! ────────────                               ─────────
//! [B,1,S,S]                                  [B,1,S,S]
//!   intro        C/4 @ S/2                     unshuffle(P) + 1×1   C @ S/P
//!   block ×2     C/4                           block ×N             C
//!   down         C/2 @ S/4                     head + shuffle(P/2)  K @ S/2
//!   block ×2     C/2
//!   down         C   @ S/8
//!   block ×2     C
//!   up           C/2 @ S/4
//!   block ×2     C/2
//!   up           C/4 @ S/2
//!   block ×2     C/4
//!   head         K   @ S/2
//! ```
//!
//! Both produce `[B, K, S/2, S/2]` heatmaps. There are no skip connections
//! across resolutions.
//!
//! # Parameter storage
//!
//! Every parameter and batch-norm buffer of a [`KeypointNet`] lives in its own
//! [`nn::VarStore`], which is also the checkpoint format. Parameters are
//! created eagerly, so a freshly constructed net can load a checkpoint
//! directly.

use std::path::Path;
use tch::{nn, Device, Tensor};
use tracing::debug;

use crate::block::InvertedBottleneck;
use crate::config::{Architecture, ModelConfig};
use crate::error::{TrainError, TrainResult};
use crate::layers::ForwardMode;
use crate::stems::{Downsample, Head, HierarchicalIntro, IsotropicIntro, Upsample};

/// Residual blocks in the hierarchical model.
pub const HIERARCHICAL_BLOCKS: usize = 10;

// ---------------------------------------------------------------------------
// HierarchicalModel
// ---------------------------------------------------------------------------

/// Encoder-decoder over three resolutions.
#[derive(Debug)]
pub struct HierarchicalModel {
    intro: HierarchicalIntro,
    blocks: Vec<InvertedBottleneck>,
    down: [Downsample; 2],
    up: [Upsample; 2],
    head: Head,
}

impl HierarchicalModel {
    /// Register the model under `path`.
    pub fn new(path: &nn::Path, config: &ModelConfig, num_keypoints: i64) -> Self {
        let c = config.num_features as i64;
        let norm = config.norm;
        // Channel width of each block pair.
        let widths: [i64; HIERARCHICAL_BLOCKS] = [c / 4, c / 4, c / 2, c / 2, c, c, c / 2, c / 2, c / 4, c / 4];
        let blocks = widths
            .iter()
            .enumerate()
            .map(|(i, &w)| InvertedBottleneck::new(&(path / format!("block_{i}")), config, w))
            .collect();

        HierarchicalModel {
            intro: HierarchicalIntro::new(&(path / "intro"), c / 4, norm),
            blocks,
            down: [
                Downsample::new(&(path / "down_0"), c / 4, norm),
                Downsample::new(&(path / "down_1"), c / 2, norm),
            ],
            up: [
                Upsample::new(&(path / "up_0"), c, norm),
                Upsample::new(&(path / "up_1"), c / 2, norm),
            ],
            head: Head::new(&(path / "head"), c / 4, num_keypoints, config.activation, 1),
        }
    }

    /// Forward pass: intro, ten blocks interleaved with resamplers, head.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        let mut ys = self.intro.forward(xs, mode);
        for (i, block) in self.blocks.iter().enumerate() {
            ys = block.forward(&ys, mode);
            ys = match i {
                1 => self.down[0].forward(&ys, mode),
                3 => self.down[1].forward(&ys, mode),
                5 => self.up[0].forward(&ys, mode),
                7 => self.up[1].forward(&ys, mode),
                _ => ys,
            };
        }
        self.head.forward(&ys, mode)
    }
}

// ---------------------------------------------------------------------------
// IsotropicModel
// ---------------------------------------------------------------------------

/// Patch embedding followed by `N` blocks at a single resolution.
#[derive(Debug)]
pub struct IsotropicModel {
    intro: IsotropicIntro,
    blocks: Vec<InvertedBottleneck>,
    head: Head,
}

impl IsotropicModel {
    /// Register the model under `path`.
    pub fn new(path: &nn::Path, config: &ModelConfig, num_keypoints: i64) -> Self {
        let c = config.num_features as i64;
        let p = config.patch_size as i64;
        let blocks = (0..config.num_blocks)
            .map(|i| InvertedBottleneck::new(&(path / format!("block_{i}")), config, c))
            .collect();
        IsotropicModel {
            intro: IsotropicIntro::new(&(path / "intro"), p, c, config.norm),
            blocks,
            head: Head::new(&(path / "head"), c, num_keypoints, config.activation, p / 2),
        }
    }

    /// Forward pass: intro, blocks, head.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        let ys = self
            .blocks
            .iter()
            .fold(self.intro.forward(xs, mode), |ys, block| block.forward(&ys, mode));
        self.head.forward(&ys, mode)
    }
}

// ---------------------------------------------------------------------------
// KeypointNet
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Network {
    Hierarchical(HierarchicalModel),
    Isotropic(IsotropicModel),
}

/// A keypoint network together with the [`nn::VarStore`] that owns its
/// parameters.
///
/// Input: `[B, 1, S, S]` standardized grayscale images.
/// Output: `[B, K, S/2, S/2]` standardized heatmaps.
pub struct KeypointNet {
    vs: nn::VarStore,
    config: ModelConfig,
    num_keypoints: usize,
    network: Network,
}

impl KeypointNet {
    /// Create a freshly initialised net on `device`.
    ///
    /// Initialisation draws from the global torch generator, so two nets
    /// built after the same `tch::manual_seed` are identical.
    pub fn new(config: &ModelConfig, num_keypoints: usize, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let k = num_keypoints as i64;
        let network = match config.architecture {
            Architecture::Hierarchical => Network::Hierarchical(HierarchicalModel::new(&root, config, k)),
            Architecture::Isotropic => Network::Isotropic(IsotropicModel::new(&root, config, k)),
        };
        let net = KeypointNet { vs, config: config.clone(), num_keypoints, network };
        debug!(
            architecture = %config.architecture,
            parameters = net.num_parameters(),
            "built keypoint net"
        );
        net
    }

    /// Forward pass in the given mode, recording gradients.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        match &self.network {
            Network::Hierarchical(m) => m.forward(xs, mode),
            Network::Isotropic(m) => m.forward(xs, mode),
        }
    }

    /// Forward pass in [`ForwardMode::Eval`] without gradient tracking.
    pub fn forward_inference(&self, xs: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward(xs, ForwardMode::Eval))
    }

    /// The configuration the net was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Heatmap channels produced.
    pub fn num_keypoints(&self) -> usize {
        self.num_keypoints
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Count trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as usize)
            .sum()
    }

    /// Whether any layer keeps batch-norm running statistics.
    pub fn has_batch_norm(&self) -> bool {
        self.vs
            .variables()
            .keys()
            .any(|name| name.ends_with("running_mean"))
    }

    /// Reset batch-norm running statistics to mean 0 and variance 1.
    pub fn reset_running_stats(&self) -> TrainResult<()> {
        tch::no_grad(|| -> TrainResult<()> {
            for (name, mut t) in self.vs.variables() {
                if name.ends_with("running_mean") {
                    t.f_fill_(0.0)?;
                } else if name.ends_with("running_var") {
                    t.f_fill_(1.0)?;
                }
            }
            Ok(())
        })
    }

    /// Save parameters and buffers to `path`.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        self.vs
            .save(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot save: {e}"), path))
    }

    /// Overwrite parameters and buffers from a checkpoint at `path`.
    pub fn load(&mut self, path: &Path) -> TrainResult<()> {
        self.vs
            .load(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot load: {e}"), path))
    }

    /// Overwrite every parameter and buffer with those of `other`.
    pub fn copy_from(&mut self, other: &KeypointNet) -> TrainResult<()> {
        self.vs.copy(&other.vs)?;
        Ok(())
    }

    /// Access the internal `VarStore` (e.g. to create an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
