//! Parameterised building blocks shared by every model.
//!
//! All learnable tensors are registered in a [`nn::VarStore`] through an
//! [`nn::Path`]. Convolution weights go into [`DECAY_GROUP`]; biases and
//! normalization affine parameters go into [`NO_DECAY_GROUP`], so that the
//! optimizer can apply weight decay per group.
//!
//! Normalization is implemented directly on top of the functional
//! `batch_norm` / `group_norm` kernels because the EMA refit needs to drive
//! batch-norm running statistics with a per-call momentum.

use tch::{nn, Tensor};

use crate::config::{Activation, Normalization, StageConfig};

/// Optimizer group for convolution weights.
pub const DECAY_GROUP: usize = 1;
/// Optimizer group for biases and normalization parameters.
pub const NO_DECAY_GROUP: usize = 0;
/// Epsilon of every normalization layer.
pub const NORM_EPS: f64 = 1.0e-3;
/// Running-statistics momentum of batch normalization during training.
pub const BATCH_NORM_MOMENTUM: f64 = 0.1;

// ---------------------------------------------------------------------------
// ForwardMode
// ---------------------------------------------------------------------------

/// How a forward pass treats dropout and normalization statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForwardMode {
    /// Dropout active, batch norm uses batch statistics and updates running
    /// statistics with [`BATCH_NORM_MOMENTUM`].
    Train,
    /// Dropout off, batch norm uses running statistics.
    Eval,
    /// Dropout off, batch norm uses batch statistics and folds them into the
    /// running statistics with the given momentum.
    Refit {
        /// Weight of the current batch in the running statistics.
        momentum: f64,
    },
}

impl ForwardMode {
    /// Whether dropout is active.
    pub fn is_train(self) -> bool {
        matches!(self, ForwardMode::Train)
    }
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Weight initialisation of a convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightInit {
    /// Xavier-uniform with the given gain.
    Xavier {
        /// Multiplier of the uniform bound.
        gain: f64,
    },
    /// All zeros.
    Zeros,
}

/// Xavier-uniform bound `gain * sqrt(6 / (fan_in + fan_out))` for a weight of
/// shape `[d0, d1, k...]`, where `fan_in = d1 * prod(k)` and
/// `fan_out = d0 * prod(k)`.
pub fn xavier_bound(shape: &[i64], gain: f64) -> f64 {
    let receptive: i64 = shape.iter().skip(2).product();
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    gain * (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Gain for a layer feeding an activation (√2) or not (1).
pub fn activation_gain(followed_by_activation: bool) -> f64 {
    if followed_by_activation {
        std::f64::consts::SQRT_2
    } else {
        1.0
    }
}

impl WeightInit {
    fn to_init(self, shape: &[i64]) -> nn::Init {
        match self {
            WeightInit::Xavier { gain } => {
                let bound = xavier_bound(shape, gain);
                nn::Init::Uniform { lo: -bound, up: bound }
            }
            WeightInit::Zeros => nn::Init::Const(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Conv2d
// ---------------------------------------------------------------------------

/// Construction options of a [`Conv2d`].
#[derive(Debug, Clone, Copy)]
pub struct ConvConfig {
    /// Stride in both dimensions. Default: **1**.
    pub stride: i64,
    /// Zero padding in both dimensions. Default: **0**.
    pub padding: i64,
    /// Channel groups. Default: **1**.
    pub groups: i64,
    /// Whether a zero-initialised bias is added. Default: **true**.
    pub bias: bool,
    /// Weight initialisation. Default: **Xavier, gain 1**.
    pub init: WeightInit,
    /// Transposed convolution instead of a regular one. Default: **false**.
    pub transposed: bool,
}

impl Default for ConvConfig {
    fn default() -> Self {
        ConvConfig {
            stride: 1,
            padding: 0,
            groups: 1,
            bias: true,
            init: WeightInit::Xavier { gain: 1.0 },
            transposed: false,
        }
    }
}

/// A 2-D convolution (or transposed convolution) over square kernels.
#[derive(Debug)]
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: ConvConfig,
}

impl Conv2d {
    /// Register a convolution under `path`.
    pub fn new(path: &nn::Path, in_channels: i64, out_channels: i64, kernel: i64, config: ConvConfig) -> Self {
        let shape = if config.transposed {
            vec![in_channels, out_channels / config.groups, kernel, kernel]
        } else {
            vec![out_channels, in_channels / config.groups, kernel, kernel]
        };
        let weight = path
            .set_group(DECAY_GROUP)
            .var("weight", &shape, config.init.to_init(&shape));
        let bias = config.bias.then(|| {
            path.set_group(NO_DECAY_GROUP)
                .var("bias", &[out_channels], nn::Init::Const(0.0))
        });
        Conv2d { weight, bias, config }
    }

    /// Whether the convolution carries a bias.
    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Apply the convolution.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let c = &self.config;
        if c.transposed {
            xs.conv_transpose2d(
                &self.weight,
                self.bias.as_ref(),
                [c.stride, c.stride],
                [c.padding, c.padding],
                [0, 0],
                c.groups,
                [1, 1],
            )
        } else {
            xs.conv2d(
                &self.weight,
                self.bias.as_ref(),
                [c.stride, c.stride],
                [c.padding, c.padding],
                [1, 1],
                c.groups,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// NormLayer
// ---------------------------------------------------------------------------

/// Normalization strategy applied after a convolution.
#[derive(Debug)]
pub enum NormLayer {
    /// No normalization.
    Identity,
    /// Batch normalization with running statistics.
    Batch {
        /// Affine scale.
        weight: Tensor,
        /// Affine shift.
        bias: Tensor,
        /// Running mean buffer.
        running_mean: Tensor,
        /// Running variance buffer.
        running_var: Tensor,
    },
    /// Group normalization (layer and instance are special cases).
    Group {
        /// Number of channel groups.
        num_groups: i64,
        /// Affine scale.
        weight: Tensor,
        /// Affine shift.
        bias: Tensor,
    },
}

/// Group count used for `kind` over `channels` channels.
pub fn norm_groups(kind: Normalization, channels: i64) -> Option<i64> {
    match kind {
        Normalization::None | Normalization::Batch => None,
        Normalization::Layer => Some(1),
        Normalization::Group => Some(channels / 4),
        Normalization::Instance => Some(channels),
    }
}

impl NormLayer {
    /// Register a normalization layer of `kind` under `path`.
    pub fn new(path: &nn::Path, kind: Normalization, channels: i64) -> Self {
        let p = path.set_group(NO_DECAY_GROUP);
        match kind {
            Normalization::None => NormLayer::Identity,
            Normalization::Batch => NormLayer::Batch {
                weight: p.var("weight", &[channels], nn::Init::Const(1.0)),
                bias: p.var("bias", &[channels], nn::Init::Const(0.0)),
                running_mean: p.zeros_no_train("running_mean", &[channels]),
                running_var: p.ones_no_train("running_var", &[channels]),
            },
            Normalization::Layer | Normalization::Group | Normalization::Instance => {
                NormLayer::Group {
                    num_groups: norm_groups(kind, channels).unwrap_or(1),
                    weight: p.var("weight", &[channels], nn::Init::Const(1.0)),
                    bias: p.var("bias", &[channels], nn::Init::Const(0.0)),
                }
            }
        }
    }

    /// Whether this layer is the identity.
    pub fn is_identity(&self) -> bool {
        matches!(self, NormLayer::Identity)
    }

    /// Whether this layer keeps batch statistics.
    pub fn is_batch(&self) -> bool {
        matches!(self, NormLayer::Batch { .. })
    }

    /// Normalize `xs`.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        match self {
            NormLayer::Identity => xs.shallow_clone(),
            NormLayer::Batch { weight, bias, running_mean, running_var } => {
                let (training, momentum) = match mode {
                    ForwardMode::Train => (true, BATCH_NORM_MOMENTUM),
                    ForwardMode::Eval => (false, BATCH_NORM_MOMENTUM),
                    ForwardMode::Refit { momentum } => (true, momentum),
                };
                Tensor::batch_norm(
                    xs,
                    Some(weight),
                    Some(bias),
                    Some(running_mean),
                    Some(running_var),
                    training,
                    momentum,
                    NORM_EPS,
                    false,
                )
            }
            NormLayer::Group { num_groups, weight, bias } => {
                xs.group_norm(*num_groups, Some(weight), Some(bias), NORM_EPS, false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Apply `activation` to `xs`.
pub fn activate(xs: &Tensor, activation: Activation) -> Tensor {
    match activation {
        Activation::HardSwish => xs.hardswish(),
        Activation::Relu => xs.relu(),
    }
}

// ---------------------------------------------------------------------------
// ConvStage
// ---------------------------------------------------------------------------

/// Convolution → optional normalization → optional activation.
#[derive(Debug)]
pub struct ConvStage {
    conv: Conv2d,
    norm: NormLayer,
    activation: Option<Activation>,
}

impl ConvStage {
    /// Register a stage. The convolution gets a bias exactly when `stage` has
    /// no normalization; `conv.bias` is overridden accordingly.
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel: i64,
        stage: StageConfig,
        conv: ConvConfig,
    ) -> Self {
        let conv = Conv2d::new(
            &(path / "conv"),
            in_channels,
            out_channels,
            kernel,
            ConvConfig { bias: !stage.norm.is_enabled(), ..conv },
        );
        let norm = NormLayer::new(&(path / "norm"), stage.norm, out_channels);
        ConvStage { conv, norm, activation: stage.activation }
    }

    /// The convolution.
    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    /// The normalization.
    pub fn norm(&self) -> &NormLayer {
        &self.norm
    }

    /// Run the stage.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Tensor {
        let ys = self.norm.forward(&self.conv.forward(xs), mode);
        match self.activation {
            Some(activation) => activate(&ys, activation),
            None => ys,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
