//! Exponential moving average of a live network's weights.
//!
//! The EMA net has three update rules, each owned here:
//!
//! 1. the first [`EmaModel::update`] copies the live parameters;
//! 2. later updates blend `ema ← ema + (1 − decay)(live − ema)`;
//! 3. [`EmaModel::refit`] recomputes batch-norm running statistics from a
//!    full pass over training batches, because averaged weights make the
//!    averaged statistics stale.
//!
//! Only trainable parameters are averaged. Batch-norm buffers of the EMA net
//! are produced by the refit alone.

use tch::Tensor;
use tracing::debug;

use crate::error::{TrainError, TrainResult};
use crate::layers::ForwardMode;
use crate::model::KeypointNet;

/// Default averaging decay.
pub const EMA_DECAY: f64 = 0.99;

/// An averaged copy of a [`KeypointNet`].
pub struct EmaModel {
    net: KeypointNet,
    decay: f64,
    num_updates: usize,
}

impl EmaModel {
    /// Wrap `net`, which must share the live net's topology.
    pub fn new(net: KeypointNet, decay: f64) -> Self {
        EmaModel { net, decay, num_updates: 0 }
    }

    /// The averaged net.
    pub fn net(&self) -> &KeypointNet {
        &self.net
    }

    /// Mutable access to the averaged net, e.g. to load a checkpoint.
    pub fn net_mut(&mut self) -> &mut KeypointNet {
        &mut self.net
    }

    /// Number of updates applied so far.
    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// Fold the current `live` parameters into the average.
    pub fn update(&mut self, live: &KeypointNet) -> TrainResult<()> {
        let live_vars = live.var_store().variables();
        let first = self.num_updates == 0;
        let weight = 1.0 - self.decay;

        tch::no_grad(|| -> TrainResult<()> {
            for (name, mut averaged) in self.net.var_store().variables() {
                if !averaged.requires_grad() {
                    continue;
                }
                let current = live_vars.get(&name).ok_or_else(|| {
                    TrainError::checkpoint(format!("live net has no parameter `{name}`"), name.as_str())
                })?;
                if first {
                    averaged.copy_(current);
                } else {
                    let delta = (current - &averaged) * weight;
                    averaged += delta;
                }
            }
            Ok(())
        })?;

        self.num_updates += 1;
        Ok(())
    }

    /// Reset and recompute batch-norm running statistics as the cumulative
    /// average over `batches`. A no-op for nets without batch norm.
    ///
    /// Returns the number of batches consumed.
    pub fn refit<I>(&self, batches: I) -> TrainResult<usize>
    where
        I: IntoIterator<Item = TrainResult<Tensor>>,
    {
        if !self.net.has_batch_norm() {
            return Ok(0);
        }
        self.net.reset_running_stats()?;

        let mut seen = 0usize;
        tch::no_grad(|| -> TrainResult<()> {
            for batch in batches {
                let xs = batch?;
                seen += 1;
                let momentum = 1.0 / seen as f64;
                let _ = self.net.forward(&xs, ForwardMode::Refit { momentum });
            }
            Ok(())
        })?;

        debug!(batches = seen, "refitted EMA batch-norm statistics");
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, Normalization};
    use approx::assert_abs_diff_eq;
    use tch::{Device, Kind};

    fn config(norm: Normalization) -> ModelConfig {
        ModelConfig { patch_size: 4, num_blocks: 1, num_features: 8, norm, ..ModelConfig::default() }
    }

    fn first_trainable(net: &KeypointNet) -> (String, Tensor) {
        let mut vars: Vec<_> = net
            .var_store()
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars.swap_remove(0)
    }

    #[test]
    fn first_update_copies_then_blends() {
        let cfg = config(Normalization::Layer);
        tch::manual_seed(1);
        let live = KeypointNet::new(&cfg, 1, Device::Cpu);
        tch::manual_seed(2);
        let mut ema = EmaModel::new(KeypointNet::new(&cfg, 1, Device::Cpu), EMA_DECAY);

        ema.update(&live).unwrap();
        let (name, averaged) = first_trainable(ema.net());
        let current = &live.var_store().variables()[&name];
        assert!(averaged.equal(current), "first update must copy `{name}`");

        // Shift the live weights by +1 and blend once.
        tch::no_grad(|| {
            for (_, mut t) in live.var_store().variables() {
                if t.requires_grad() {
                    let _ = t.f_add_scalar_(1.0).unwrap();
                }
            }
        });
        let before = averaged.copy();
        ema.update(&live).unwrap();
        let diff = (&averaged - &before).mean(Kind::Float).double_value(&[]);
        assert_abs_diff_eq!(diff, 0.01, epsilon = 1e-5);
        assert_eq!(ema.num_updates(), 2);
    }

    #[test]
    fn refit_skips_nets_without_batch_norm() {
        let ema = EmaModel::new(KeypointNet::new(&config(Normalization::Group), 1, Device::Cpu), EMA_DECAY);
        let batches = vec![Ok(Tensor::randn([2, 1, 16, 16], (Kind::Float, Device::Cpu)))];
        assert_eq!(ema.refit(batches).unwrap(), 0);
    }

    #[test]
    fn refit_averages_over_every_batch() {
        let ema = EmaModel::new(KeypointNet::new(&config(Normalization::Batch), 1, Device::Cpu), EMA_DECAY);
        let batches: Vec<TrainResult<Tensor>> = (0..3)
            .map(|_| Ok(Tensor::randn([2, 1, 16, 16], (Kind::Float, Device::Cpu))))
            .collect();
        assert_eq!(ema.refit(batches).unwrap(), 3);
        let stats_moved = ema
            .net()
            .var_store()
            .variables()
            .iter()
            .filter(|(name, _)| name.ends_with("running_mean"))
            .any(|(_, t)| t.abs().sum(Kind::Float).double_value(&[]) > 0.0);
        assert!(stats_moved, "refit should populate running means");
    }
}
