//! Input stems and output heads of the two architectures.
//!
//! | Piece | Operation |
//! |---|---|
//! | [`HierarchicalIntro`] | 4×4 stride-2 conv, 1 → C, [norm] |
//! | [`Downsample`] | 2×2 stride-2 conv, C → 2C, [norm] |
//! | [`Upsample`] | 2×2 stride-2 transposed conv, C → C/2, [norm] |
//! | [`IsotropicIntro`] | unshuffle(P), 1×1 conv P² → C, [norm] |
//! | [`Head`] | 1×1 expand C → 2C, act, dropout, zero-init 1×1 linear, [shuffle] |

use tch::{nn, Tensor};

use crate::config::{Activation, Normalization, StageConfig};
use crate::layers::{activate, activation_gain, Conv2d, ConvConfig, ConvStage, ForwardMode, WeightInit};

/// Channel-wise dropout rate of the heads.
pub const HEAD_DROPOUT: f64 = 0.05;

fn norm_only(norm: Normalization) -> StageConfig {
    StageConfig { norm, activation: None }
}

// ---------------------------------------------------------------------------
// Hierarchical pieces
// ---------------------------------------------------------------------------

/// Strided stem halving the resolution: `[B, 1, S, S] → [B, C, S/2, S/2]`.
#[derive(Debug)]
pub struct HierarchicalIntro(ConvStage);

impl HierarchicalIntro {
    /// Register the stem producing `channels` channels.
    pub fn new(path: &nn::Path, channels: i64, norm: Normalization) -> Self {
        HierarchicalIntro(ConvStage::new(
            path,
            1,
            channels,
            4,
            norm_only(norm),
            ConvConfig { stride: 2, padding: 1, ..Default::default() },
        ))
    }

    /// Apply the stem.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        self.0.forward(xs, mode)
    }
}

/// Stride-2 convolution doubling the channels.
#[derive(Debug)]
pub struct Downsample(ConvStage);

impl Downsample {
    /// Register a downsampler from `channels` to `2 * channels`.
    pub fn new(path: &nn::Path, channels: i64, norm: Normalization) -> Self {
        Downsample(ConvStage::new(
            path,
            channels,
            channels * 2,
            2,
            norm_only(norm),
            ConvConfig { stride: 2, ..Default::default() },
        ))
    }

    /// Apply the downsampler.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        self.0.forward(xs, mode)
    }
}

/// Stride-2 transposed convolution halving the channels.
#[derive(Debug)]
pub struct Upsample(ConvStage);

impl Upsample {
    /// Register an upsampler from `channels` to `channels / 2`.
    pub fn new(path: &nn::Path, channels: i64, norm: Normalization) -> Self {
        Upsample(ConvStage::new(
            path,
            channels,
            channels / 2,
            2,
            norm_only(norm),
            ConvConfig { stride: 2, transposed: true, ..Default::default() },
        ))
    }

    /// Apply the upsampler.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        self.0.forward(xs, mode)
    }
}

// ---------------------------------------------------------------------------
// Isotropic stem
// ---------------------------------------------------------------------------

/// Patch embedding: `[B, 1, S, S] → [B, C, S/P, S/P]`.
#[derive(Debug)]
pub struct IsotropicIntro {
    patch_size: i64,
    pointwise: ConvStage,
}

impl IsotropicIntro {
    /// Register the patch embedding.
    pub fn new(path: &nn::Path, patch_size: i64, channels: i64, norm: Normalization) -> Self {
        let pointwise = ConvStage::new(
            path,
            patch_size * patch_size,
            channels,
            1,
            norm_only(norm),
            ConvConfig::default(),
        );
        IsotropicIntro { patch_size, pointwise }
    }

    /// Apply the patch embedding.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        self.pointwise.forward(&xs.pixel_unshuffle(self.patch_size), mode)
    }
}

// ---------------------------------------------------------------------------
// Head
// ---------------------------------------------------------------------------

/// Output head shared by both architectures.
///
/// With `shuffle > 1` the linear layer emits `keypoints * shuffle²` channels
/// that are rearranged into a `shuffle`× finer grid.
#[derive(Debug)]
pub struct Head {
    expansion: Conv2d,
    activation: Activation,
    linear: Conv2d,
    shuffle: i64,
}

impl Head {
    /// Register a head over `channels` inputs predicting `num_keypoints` maps.
    pub fn new(
        path: &nn::Path,
        channels: i64,
        num_keypoints: i64,
        activation: Activation,
        shuffle: i64,
    ) -> Self {
        let expansion = Conv2d::new(
            &(path / "expansion"),
            channels,
            channels * 2,
            1,
            ConvConfig { init: WeightInit::Xavier { gain: activation_gain(true) }, ..Default::default() },
        );
        let linear = Conv2d::new(
            &(path / "linear"),
            channels * 2,
            num_keypoints * shuffle * shuffle,
            1,
            ConvConfig { init: WeightInit::Zeros, ..Default::default() },
        );
        Head { expansion, activation, linear, shuffle }
    }

    /// Apply the head.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        let ys = activate(&self.expansion.forward(xs), self.activation);
        let ys = ys.feature_dropout(HEAD_DROPOUT, mode.is_train());
        let ys = self.linear.forward(&ys);
        if self.shuffle > 1 {
            ys.pixel_shuffle(self.shuffle)
        } else {
            ys
        }
    }
}
