//! Inverted-bottleneck residual block and squeeze-and-excitation gate.
//!
//! ```text
//!  x ─┬─► 1×1 expand (C→2C) ─► [norm] ─► [act]
//!     │   k×k depthwise      ─► [norm] ─► [act] ─► [SE gate]
//!     │   1×1 project (2C→C) ─► [norm]
//!     └──────────────────────────────────────────► (+) ─► y
//! ```

use tch::{nn, Tensor};

use crate::config::{Attention, ModelConfig, StageConfig};
use crate::layers::{activation_gain, Conv2d, ConvConfig, ConvStage, ForwardMode, WeightInit};

// ---------------------------------------------------------------------------
// SqueezeExcitation
// ---------------------------------------------------------------------------

/// Channel gate: global average pool → 1×1 reduce to half → ReLU → 1×1
/// expand → hard-sigmoid, multiplied into the input.
#[derive(Debug)]
pub struct SqueezeExcitation {
    reduce: Conv2d,
    expand: Conv2d,
}

impl SqueezeExcitation {
    /// Register a gate over `channels` channels.
    pub fn new(path: &nn::Path, channels: i64) -> Self {
        let reduce = Conv2d::new(
            &(path / "reduce"),
            channels,
            channels / 2,
            1,
            ConvConfig { init: WeightInit::Xavier { gain: activation_gain(true) }, ..Default::default() },
        );
        let expand = Conv2d::new(&(path / "expand"), channels / 2, channels, 1, ConvConfig::default());
        SqueezeExcitation { reduce, expand }
    }

    /// Gate `xs`.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let gate = xs.adaptive_avg_pool2d([1, 1]);
        let gate = self.reduce.forward(&gate).relu();
        let gate = self.expand.forward(&gate).hardsigmoid();
        xs * gate
    }
}

// ---------------------------------------------------------------------------
// InvertedBottleneck
// ---------------------------------------------------------------------------

/// Residual block `y = x + f(x)` preserving channel count and resolution.
#[derive(Debug)]
pub struct InvertedBottleneck {
    expansion: ConvStage,
    depthwise: ConvStage,
    attention: Option<SqueezeExcitation>,
    projection: ConvStage,
}

impl InvertedBottleneck {
    /// Register a block of width `channels`.
    ///
    /// `config.num_blocks` sets the projection gain `1 / sqrt(num_blocks)`.
    pub fn new(path: &nn::Path, config: &ModelConfig, channels: i64) -> Self {
        let hidden = channels * 2;
        let kernel = config.depthwise_filter_size as i64;

        let expansion_stage = config.expansion_stage();
        let expansion = ConvStage::new(
            &(path / "expansion"),
            channels,
            hidden,
            1,
            expansion_stage,
            xavier(activation_gain(expansion_stage.activation.is_some())),
        );

        let depthwise_stage = config.depthwise_stage();
        let depthwise = ConvStage::new(
            &(path / "depthwise"),
            hidden,
            hidden,
            kernel,
            depthwise_stage,
            ConvConfig {
                padding: kernel / 2,
                groups: hidden,
                ..xavier(activation_gain(depthwise_stage.activation.is_some()))
            },
        );

        let attention = match config.attention {
            Attention::None => None,
            Attention::SqueezeExcitation => Some(SqueezeExcitation::new(&(path / "attention"), hidden)),
        };

        let projection_stage: StageConfig = config.projection_stage();
        let projection = ConvStage::new(
            &(path / "projection"),
            hidden,
            channels,
            1,
            projection_stage,
            xavier(1.0 / (config.num_blocks as f64).sqrt()),
        );

        InvertedBottleneck { expansion, depthwise, attention, projection }
    }

    /// Apply the block.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        let ys = self.expansion.forward(xs, mode);
        let ys = self.depthwise.forward(&ys, mode);
        let ys = match &self.attention {
            Some(se) => se.forward(&ys),
            None => ys,
        };
        let ys = self.projection.forward(&ys, mode);
        xs + ys
    }

    /// The three convolution stages, in order.
    pub fn stages(&self) -> [&ConvStage; 3] {
        [&self.expansion, &self.depthwise, &self.projection]
    }

    /// Whether squeeze-excitation is present.
    pub fn has_attention(&self) -> bool {
        self.attention.is_some()
    }
}

fn xavier(gain: f64) -> ConvConfig {
    ConvConfig { init: WeightInit::Xavier { gain }, ..Default::default() }
}
