//! Training loop orchestrator.
//!
//! One [`Trainer::run`] executes a complete run:
//!
//! ```text
//! runtime::init ─► split ─► live + EMA nets ─► image stats ─► loaders
//!       │
//!       └─► for each epoch:
//!              train (accumulated AdamW steps, EMA update per step)
//!              refit EMA batch-norm statistics
//!              evaluate live / EMA on training and validation
//!              record losses + times, checkpoint on non-increasing loss
//!       └─► finalize: reload best checkpoints, write distance tables
//! ```
//!
//! Runs are strictly sequential; nothing here spawns threads.

use rand::rngs::StdRng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tch::nn::{self, OptimizerConfig};
use tch::Device;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::dataset::{DataLoader, DatasetSplit, ImageStats, KeypointDataset};
use crate::ema::{EmaModel, EMA_DECAY};
use crate::error::{TrainError, TrainResult};
use crate::layers::{ForwardMode, DECAY_GROUP, NO_DECAY_GROUP};
use crate::losses::heatmap_loss;
use crate::metrics::{DistanceAccumulator, DistanceSummary};
use crate::model::KeypointNet;
use crate::record::{PhaseValues, RunRecord};
use crate::runtime::{self, Runtime};

// ---------------------------------------------------------------------------
// Optimizer constants
// ---------------------------------------------------------------------------

/// AdamW first-moment decay.
pub const BETA1: f64 = 0.9;
/// AdamW second-moment decay.
pub const BETA2: f64 = 0.95;
/// AdamW denominator epsilon.
pub const ADAM_EPS: f64 = 1e-6;
/// Nominal weight decay. Divided by the learning rate before it reaches the
/// optimizer, so the per-step shrinkage at full rate is exactly this value.
pub const WEIGHT_DECAY: f64 = 1e-5;
/// Learning-rate factor at step 0.
pub const WARMUP_START: f64 = 1e-6;

/// Warmup length in optimizer steps: `ceil(2 / (1 − β₂))`.
pub fn warmup_steps() -> usize {
    (2.0 / (1.0 - BETA2)).ceil() as usize
}

// ---------------------------------------------------------------------------
// WarmupSchedule
// ---------------------------------------------------------------------------

/// Linear learning-rate warmup, stepped once per optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupSchedule {
    start: f64,
    total: usize,
}

impl Default for WarmupSchedule {
    fn default() -> Self {
        WarmupSchedule::new(WARMUP_START, warmup_steps())
    }
}

impl WarmupSchedule {
    /// Ramp from `start` to 1 over `total` steps.
    pub fn new(start: f64, total: usize) -> Self {
        WarmupSchedule { start, total }
    }

    /// Learning-rate multiplier after `step` optimizer steps.
    pub fn factor(&self, step: usize) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let progress = step.min(self.total) as f64 / self.total as f64;
        self.start + (1.0 - self.start) * progress
    }
}

// ---------------------------------------------------------------------------
// CheckpointPolicy
// ---------------------------------------------------------------------------

/// Save on the first epoch and whenever the validation loss did not increase
/// relative to the previous epoch.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPolicy {
    previous: Option<f64>,
}

impl CheckpointPolicy {
    /// Record this epoch's validation loss and decide whether to save.
    pub fn should_save(&mut self, validation_loss: f64) -> bool {
        let save = match self.previous {
            None => true,
            Some(previous) => validation_loss <= previous,
        };
        self.previous = Some(validation_loss);
        save
    }
}

/// Independent live and EMA checkpoint policies of one run.
#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    live: CheckpointPolicy,
    ema: CheckpointPolicy,
}

impl Checkpoints {
    /// Save each net whose validation loss did not increase since the
    /// previous epoch. Returns which of `(live, ema)` were written.
    pub fn save_improved(
        &mut self,
        record: &RunRecord,
        live: &KeypointNet,
        ema: &KeypointNet,
        live_loss: f64,
        ema_loss: f64,
    ) -> TrainResult<(bool, bool)> {
        let save_live = self.live.should_save(live_loss);
        if save_live {
            live.save(&record.model_path())?;
            debug!(loss = live_loss, "saved live checkpoint");
        }
        let save_ema = self.ema.should_save(ema_loss);
        if save_ema {
            ema.save(&record.ema_model_path())?;
            debug!(loss = ema_loss, "saved EMA checkpoint");
        }
        Ok((save_live, save_ema))
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Directory holding every artifact.
    pub run_dir: PathBuf,
    /// Seed actually used by the generators.
    pub effective_seed: u64,
    /// Trainable parameters of the live net.
    pub num_parameters: usize,
    /// One row per completed epoch.
    pub losses: Vec<PhaseValues>,
    /// Optimizer steps taken over all epochs.
    pub optimizer_steps: usize,
    /// Updates folded into the EMA net.
    pub ema_updates: usize,
    /// Learning rate last handed to the optimizer.
    pub learning_rate: f64,
    /// Live net on the training split.
    pub training: Option<DistanceSummary>,
    /// Live net on the validation split.
    pub validation: Option<DistanceSummary>,
    /// EMA net on the training split.
    pub training_ema: Option<DistanceSummary>,
    /// EMA net on the validation split.
    pub validation_ema: Option<DistanceSummary>,
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Orchestrates the full training loop: data loading, forward pass, loss
/// computation, back-propagation, validation, and checkpointing.
pub struct Trainer {
    config: RunConfig,
}

impl Trainer {
    /// Create a new `Trainer`, validating `config` up front.
    pub fn new(config: RunConfig) -> TrainResult<Self> {
        config.validate()?;
        Ok(Trainer { config })
    }

    /// Return a reference to the active run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the run and write every artifact to [`RunConfig::run_dir`].
    pub fn run(&self, use_cuda: bool) -> TrainResult<RunSummary> {
        let cfg = &self.config;
        let spec = cfg.dataset_spec();
        let training = &cfg.training;

        let mut record = RunRecord::create(cfg.run_dir())?;
        info!(run = %record.dir().display(), "starting run");
        cfg.to_json(&record.dir().join("config.json"))?;

        let Runtime { effective_seed, mut rng, device, .. } = runtime::init(cfg.seed, use_cuda);

        let split = DatasetSplit::discover(&cfg.dataset_dir(), spec.training_ratio, cfg.ablation, &mut rng)?;
        record.write_split("training_images", &split.training)?;
        record.write_split("validation_images", &split.validation)?;

        let mut live = KeypointNet::new(&cfg.model, spec.num_keypoints, device);
        let mut ema_net = KeypointNet::new(&cfg.model, spec.num_keypoints, device);
        ema_net.copy_from(&live)?;
        let mut ema = EmaModel::new(ema_net, EMA_DECAY);
        let num_parameters = live.num_parameters();
        info!(parameters = num_parameters, "built models");

        let image_stats = ImageStats::estimate(&split.training)?;
        let train_set =
            KeypointDataset::new("training", split.training.clone(), spec, image_stats, true);
        let train_eval_set =
            KeypointDataset::new("training_eval", split.training, spec, image_stats, false);
        let val_eval_set = KeypointDataset::new("validation_eval", split.validation, spec, image_stats, false);

        let train_loader = DataLoader::new(&train_set, training.accumulation_size, true, true);
        let train_eval_loader = DataLoader::new(&train_eval_set, training.evaluation_batch_size, false, false);
        let val_eval_loader = DataLoader::new(&val_eval_set, training.evaluation_batch_size, false, false);

        let lr = training.learning_rate;
        let mut opt = nn::AdamW { beta1: BETA1, beta2: BETA2, wd: 0.0, eps: ADAM_EPS, amsgrad: false }
            .build(live.var_store(), lr)?;
        opt.set_weight_decay_group(DECAY_GROUP, WEIGHT_DECAY / lr);
        opt.set_weight_decay_group(NO_DECAY_GROUP, 0.0);

        let mut optimizer = StepState::new(opt, WarmupSchedule::default(), lr);
        let mut checkpoints = Checkpoints::default();

        if training.num_epochs == 0 {
            live.save(&record.model_path())?;
            ema.net().save(&record.ema_model_path())?;
            record.write_series()?;
        }

        for epoch in 0..training.num_epochs {
            info!("epoch {epoch}");
            let epoch_start = Instant::now();

            let (training_loss, training_time) = train_epoch(
                &live,
                &mut ema,
                &mut optimizer,
                &train_loader,
                training.accumulation_steps(),
                device,
                &mut rng,
            )?;
            log_phase("training_loss", training_loss, training_time);

            let (training_eval_loss, training_eval_time) = evaluate(&live, &train_eval_loader, device, &mut rng)?;
            log_phase("training_eval_loss", training_eval_loss, training_eval_time);
            let (validation_eval_loss, validation_eval_time) = evaluate(&live, &val_eval_loader, device, &mut rng)?;
            log_phase("validation_eval_loss", validation_eval_loss, validation_eval_time);
            let (training_eval_loss_ema, training_eval_time_ema) =
                evaluate(ema.net(), &train_eval_loader, device, &mut rng)?;
            log_phase("training_eval_loss_ema", training_eval_loss_ema, training_eval_time_ema);
            let (validation_eval_loss_ema, validation_eval_time_ema) =
                evaluate(ema.net(), &val_eval_loader, device, &mut rng)?;
            log_phase("validation_eval_loss_ema", validation_eval_loss_ema, validation_eval_time_ema);

            info!("[t = {:>12.8}]", epoch_start.elapsed().as_secs_f64());

            record.push_epoch(
                PhaseValues {
                    training: training_loss,
                    training_eval: training_eval_loss,
                    validation_eval: validation_eval_loss,
                    training_eval_ema: training_eval_loss_ema,
                    validation_eval_ema: validation_eval_loss_ema,
                },
                PhaseValues {
                    training: training_time,
                    training_eval: training_eval_time,
                    validation_eval: validation_eval_time,
                    training_eval_ema: training_eval_time_ema,
                    validation_eval_ema: validation_eval_time_ema,
                },
            )?;

            checkpoints.save_improved(
                &record,
                &live,
                ema.net(),
                validation_eval_loss,
                validation_eval_loss_ema,
            )?;
        }

        // Finalize on the best checkpoints.
        live.load(&record.model_path())?;
        ema.net_mut().load(&record.ema_model_path())?;

        let mut summaries = Vec::with_capacity(4);
        for (name, net, loader) in [
            ("training_distances", &live, &train_eval_loader),
            ("validation_distances", &live, &val_eval_loader),
            ("training_distances_ema", ema.net(), &train_eval_loader),
            ("validation_distances_ema", ema.net(), &val_eval_loader),
        ] {
            let acc = distances(net, loader, device, &mut rng)?;
            record.write_distances(name, &acc.distances()?)?;
            let summary = acc.summary();
            if let Some(s) = &summary {
                info!("{name}: {}", s.summary());
            }
            summaries.push(summary);
        }
        let mut summaries = summaries.into_iter();

        info!(run = %record.dir().display(), "run complete");
        Ok(RunSummary {
            run_dir: record.dir().to_path_buf(),
            effective_seed,
            num_parameters,
            losses: record.losses().to_vec(),
            optimizer_steps: optimizer.steps,
            ema_updates: ema.num_updates(),
            learning_rate: optimizer.applied_lr,
            training: summaries.next().flatten(),
            validation: summaries.next().flatten(),
            training_ema: summaries.next().flatten(),
            validation_ema: summaries.next().flatten(),
        })
    }
}

/// Run every configuration in order, stopping at the first failure.
pub fn run_all(configs: Vec<RunConfig>, use_cuda: bool) -> TrainResult<Vec<RunSummary>> {
    let total = configs.len();
    let mut summaries = Vec::with_capacity(total);
    for (i, config) in configs.into_iter().enumerate() {
        info!("run {}/{}: {}", i + 1, total, config.run_name());
        summaries.push(Trainer::new(config)?.run(use_cuda)?);
    }
    Ok(summaries)
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

struct StepState {
    opt: nn::Optimizer,
    schedule: WarmupSchedule,
    lr: f64,
    steps: usize,
    applied_lr: f64,
}

impl StepState {
    fn new(opt: nn::Optimizer, schedule: WarmupSchedule, lr: f64) -> Self {
        let mut state = StepState { opt, schedule, lr, steps: 0, applied_lr: lr };
        state.apply_lr();
        state
    }

    fn apply_lr(&mut self) {
        self.applied_lr = self.lr * self.schedule.factor(self.steps);
        self.opt.set_lr(self.applied_lr);
    }

    fn step(&mut self) {
        self.opt.step();
        self.opt.zero_grad();
        self.steps += 1;
        self.apply_lr();
    }
}

/// One optimisation pass. Returns the mean per-step loss (NaN without a
/// completed step) and the seconds spent in forward, backward and step.
fn train_epoch(
    live: &KeypointNet,
    ema: &mut EmaModel,
    optimizer: &mut StepState,
    loader: &DataLoader<'_>,
    accumulation_steps: usize,
    device: Device,
    rng: &mut StdRng,
) -> TrainResult<(f64, f64)> {
    let mut accumulation_losses = vec![0.0f64; accumulation_steps];
    let mut step_losses = Vec::new();
    let mut elapsed = Duration::ZERO;

    for (i, batch) in loader.iter(rng).enumerate() {
        let batch = batch?;
        let images = batch.images.to_device(device);
        let targets = batch.heatmaps.to_device(device);

        let start = Instant::now();
        let prediction = live.forward(&images, ForwardMode::Train);
        let loss = heatmap_loss(&prediction, &targets);
        accumulation_losses[i % accumulation_steps] = loss.double_value(&[]);
        loss.backward();

        let boundary = (i + 1) % accumulation_steps == 0;
        if boundary {
            optimizer.step();
            step_losses.push(mean(&accumulation_losses));
        }
        elapsed += start.elapsed();

        if boundary {
            ema.update(live)?;
        }
    }

    if ema.net().has_batch_norm() {
        let batches = loader
            .iter(rng)
            .map(|b| b.map(|b| b.images.to_device(device)).map_err(TrainError::from));
        ema.refit(batches)?;
    }

    Ok((mean(&step_losses), elapsed.as_secs_f64()))
}

/// Mean per-batch loss of `net` over `loader` and the seconds spent in
/// forward passes.
fn evaluate(
    net: &KeypointNet,
    loader: &DataLoader<'_>,
    device: Device,
    rng: &mut StdRng,
) -> TrainResult<(f64, f64)> {
    let mut losses = Vec::with_capacity(loader.num_batches());
    let mut elapsed = Duration::ZERO;
    for batch in loader.iter(rng) {
        let batch = batch?;
        let images = batch.images.to_device(device);
        let targets = batch.heatmaps.to_device(device);

        let start = Instant::now();
        let prediction = net.forward_inference(&images);
        elapsed += start.elapsed();

        losses.push(tch::no_grad(|| heatmap_loss(&prediction, &targets)).double_value(&[]));
    }
    Ok((mean(&losses), elapsed.as_secs_f64()))
}

/// Pixel distances of `net`'s argmax keypoints over `loader`.
fn distances(
    net: &KeypointNet,
    loader: &DataLoader<'_>,
    device: Device,
    rng: &mut StdRng,
) -> TrainResult<DistanceAccumulator> {
    let mut acc = DistanceAccumulator::new(net.num_keypoints());
    for batch in loader.iter(rng) {
        let batch = batch?;
        let prediction = net.forward_inference(&batch.images.to_device(device));
        acc.update(&prediction, &batch.coords)?;
    }
    Ok(acc)
}

fn log_phase(name: &str, loss: f64, seconds: f64) {
    info!("{:<25} {:>11.8} [t = {:>12.8}]", format!("{name}:"), loss, seconds);
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
