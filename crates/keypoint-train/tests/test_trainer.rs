//! End-to-end tests for [`keypoint_train::trainer`].
//!
//! Each test writes a five-sample visuomotor dataset into a
//! [`tempfile::TempDir`] and runs a tiny isotropic model on the CPU. Runs
//! reseed the global torch generator, so they are serialized through
//! [`RUN_LOCK`].

use image::{GrayImage, Luma};
use keypoint_train::config::{
    Ablation, Architecture, DatasetKind, ModelConfig, RunConfig, TrainingConfig,
};
use keypoint_train::model::KeypointNet;
use keypoint_train::record::{RunRecord, LOSS_HEADER, TIME_HEADER};
use keypoint_train::trainer::{run_all, Checkpoints, Trainer, WarmupSchedule};
use std::path::Path;
use std::sync::Mutex;
use tch::Device;
use tempfile::TempDir;

static RUN_LOCK: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_dataset(root: &Path, n: usize) {
    let dir = root.join(DatasetKind::Visuomotor.spec().directory);
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..n {
        let (r, c) = (16 + 6 * i as u32, 40 - 4 * i as u32);
        let img = GrayImage::from_fn(64, 64, |x, y| {
            let d2 = (x as i64 - c as i64).pow(2) + (y as i64 - r as i64).pow(2);
            Luma([if d2 < 9 { 255 } else { 20 + (x % 7) as u8 }])
        });
        img.save(dir.join(format!("{i:03}.png"))).unwrap();
        std::fs::write(dir.join(format!("{i:03}.csv")), format!("index,row,col\n0,{r}.5,{c}.5\n")).unwrap();
    }
}

fn tiny_config(root: &Path, num_epochs: usize) -> RunConfig {
    RunConfig {
        seed: 7,
        dataset: DatasetKind::Visuomotor,
        ablation: Ablation::None,
        model: ModelConfig {
            architecture: Architecture::Isotropic,
            patch_size: 16,
            num_blocks: 1,
            num_features: 8,
            depthwise_filter_size: 3,
            ..ModelConfig::default()
        },
        training: TrainingConfig {
            training_batch_size: 2,
            accumulation_size: 1,
            evaluation_batch_size: 3,
            learning_rate: 1e-3,
            num_epochs,
        },
        data_root: root.to_path_buf(),
        output_root: root.join("generated"),
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

fn line_count(path: &Path) -> usize {
    read(path).lines().count()
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[test]
fn two_epoch_run_writes_every_artifact() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    write_dataset(tmp.path(), 5);
    let config = tiny_config(tmp.path(), 2);

    let summary = Trainer::new(config.clone()).unwrap().run(false).unwrap();
    let dir = summary.run_dir.clone();
    assert_eq!(dir, config.run_dir());
    assert!(summary.num_parameters > 0);

    // 0.75 · 5 = 3.75 rounds to 4.
    assert_eq!(line_count(&dir.join("training_images.csv")), 5);
    assert_eq!(line_count(&dir.join("validation_images.csv")), 2);
    assert!(read(&dir.join("training_images.csv")).lines().nth(1).unwrap().ends_with(".png"));

    let losses = read(&dir.join("losses.csv"));
    let rows: Vec<&str> = losses.lines().collect();
    assert_eq!(rows[0], LOSS_HEADER.join(","));
    assert_eq!(rows.len(), 3);
    assert!(rows[2].starts_with("1,"));
    assert_eq!(read(&dir.join("times.csv")).lines().next(), Some(TIME_HEADER.join(",").as_str()));
    assert_eq!(line_count(&dir.join("times.csv")), 3);

    assert_eq!(summary.losses.len(), 2);
    // Four samples in micro-batches of one, two per optimizer step.
    assert_eq!(summary.optimizer_steps, 4);
    assert_eq!(summary.ema_updates, 4);
    for row in &summary.losses {
        assert!(row.training.is_finite());
        assert!(row.validation_eval.is_finite());
        assert!(row.validation_eval_ema.is_finite());
    }

    assert!(dir.join("model.pt").is_file());
    assert!(dir.join("model_ema.pt").is_file());
    assert!(dir.join("config.json").is_file());
    assert_eq!(RunConfig::from_json(&dir.join("config.json")).unwrap(), config);

    for (name, samples) in [
        ("training_distances", 4),
        ("validation_distances", 1),
        ("training_distances_ema", 4),
        ("validation_distances_ema", 1),
    ] {
        let path = dir.join(format!("{name}.csv"));
        let text = read(&path);
        assert_eq!(text.lines().next(), Some("image,keypoint,distance"));
        assert_eq!(text.lines().count(), 1 + samples, "{name}");
    }
    assert!(summary.validation.is_some());
    assert!(summary.training_ema.is_some());
}

#[test]
fn zero_epoch_run_saves_initial_weights() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    write_dataset(tmp.path(), 5);

    let summary = Trainer::new(tiny_config(tmp.path(), 0)).unwrap().run(false).unwrap();
    assert_eq!(summary.optimizer_steps, 0);
    assert_eq!(summary.ema_updates, 0);
    assert_eq!(summary.learning_rate, 1e-3 * WarmupSchedule::default().factor(0));
    let dir = summary.run_dir;
    assert!(summary.losses.is_empty());
    assert_eq!(read(&dir.join("losses.csv")).trim(), LOSS_HEADER.join(","));
    assert_eq!(read(&dir.join("times.csv")).trim(), TIME_HEADER.join(","));
    assert!(dir.join("model.pt").is_file());
    assert!(dir.join("model_ema.pt").is_file());
    assert_eq!(line_count(&dir.join("validation_distances_ema.csv")), 2);
}

#[test]
fn optimizer_and_ema_step_once_per_accumulated_batch() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    write_dataset(tmp.path(), 5);

    let mut config = tiny_config(tmp.path(), 1);
    config.training.training_batch_size = 4;
    config.training.evaluation_batch_size = 4;
    let whole = Trainer::new(config.clone()).unwrap().run(false).unwrap();
    assert_eq!(whole.optimizer_steps, 1);
    assert_eq!(whole.ema_updates, 1);

    config.training.training_batch_size = 2;
    config.output_root = tmp.path().join("pairs");
    let pairs = Trainer::new(config).unwrap().run(false).unwrap();
    assert_eq!(pairs.optimizer_steps, 2);
    assert_eq!(pairs.ema_updates, 2);

    // The warmed-up rate is what the optimizer was last given.
    let schedule = WarmupSchedule::default();
    assert_eq!(whole.learning_rate, 1e-3 * schedule.factor(1));
    assert_eq!(pairs.learning_rate, 1e-3 * schedule.factor(2));
    assert!(pairs.learning_rate > whole.learning_rate);
}

#[test]
fn only_the_improving_net_is_rewritten() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let record = RunRecord::create(tmp.path().join("run")).unwrap();
    let model = tiny_config(tmp.path(), 1).model;
    let mut live = KeypointNet::new(&model, 1, Device::Cpu);
    let mut ema = KeypointNet::new(&model, 1, Device::Cpu);
    let mut checkpoints = Checkpoints::default();

    assert_eq!(checkpoints.save_improved(&record, &live, &ema, 0.5, 0.5).unwrap(), (true, true));
    let live_bytes = std::fs::read(record.model_path()).unwrap();
    let ema_bytes = std::fs::read(record.ema_model_path()).unwrap();

    // Both nets change; only the EMA validation loss improves.
    live.copy_from(&KeypointNet::new(&model, 1, Device::Cpu)).unwrap();
    ema.copy_from(&KeypointNet::new(&model, 1, Device::Cpu)).unwrap();
    assert_eq!(checkpoints.save_improved(&record, &live, &ema, 0.6, 0.4).unwrap(), (false, true));
    assert_eq!(std::fs::read(record.model_path()).unwrap(), live_bytes);
    assert_ne!(std::fs::read(record.ema_model_path()).unwrap(), ema_bytes);

    // Then the reverse.
    live.copy_from(&KeypointNet::new(&model, 1, Device::Cpu)).unwrap();
    let ema_bytes = std::fs::read(record.ema_model_path()).unwrap();
    assert_eq!(checkpoints.save_improved(&record, &live, &ema, 0.55, 0.45).unwrap(), (true, false));
    assert_ne!(std::fs::read(record.model_path()).unwrap(), live_bytes);
    assert_eq!(std::fs::read(record.ema_model_path()).unwrap(), ema_bytes);
}

#[test]
fn same_seed_reproduces_split_and_losses() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    write_dataset(tmp.path(), 5);

    let first = tiny_config(tmp.path(), 1);
    let second = RunConfig { output_root: tmp.path().join("again"), ..first.clone() };
    let summaries = run_all(vec![first, second], false).unwrap();
    let (a, b) = (&summaries[0].run_dir, &summaries[1].run_dir);

    assert_eq!(read(&a.join("training_images.csv")), read(&b.join("training_images.csv")));
    assert_eq!(read(&a.join("losses.csv")), read(&b.join("losses.csv")));
    assert_eq!(summaries[0].effective_seed, summaries[1].effective_seed);
}

#[test]
fn ablation_shrinks_only_the_training_split() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    write_dataset(tmp.path(), 5);

    let config = RunConfig { ablation: Ablation::Half, ..tiny_config(tmp.path(), 0) };
    let summary = Trainer::new(config).unwrap().run(false).unwrap();
    assert_eq!(line_count(&summary.run_dir.join("training_images.csv")), 3);
    assert_eq!(line_count(&summary.run_dir.join("validation_images.csv")), 2);
    assert_eq!(line_count(&summary.run_dir.join("training_distances.csv")), 3);
}

#[test]
fn missing_dataset_fails_before_training() {
    let _guard = RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let result = Trainer::new(tiny_config(tmp.path(), 1)).unwrap().run(false);
    assert!(matches!(result, Err(keypoint_train::TrainError::Dataset(_))));
}
