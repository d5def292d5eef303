//! On-disk artifacts of a run.
//!
//! ```text
//! <run dir>/
//!   config.json
//!   training_images.csv        index,path
//!   validation_images.csv      index,path
//!   losses.csv                 epoch + five phase losses
//!   times.csv                  epoch + five phase times (seconds)
//!   model.pt                   best live weights
//!   model_ema.pt               best EMA weights
//!   training_distances.csv     image,keypoint,distance
//!   validation_distances.csv
//!   training_distances_ema.csv
//!   validation_distances_ema.csv
//! ```
//!
//! `losses.csv` and `times.csv` are rewritten after every completed epoch so
//! that an interrupted run leaves consistent tables behind.

use ndarray::Array2;
use std::path::{Path, PathBuf};

use crate::dataset::image_path;
use crate::error::{TrainError, TrainResult};

/// Header of `losses.csv`.
pub const LOSS_HEADER: [&str; 6] = [
    "epoch",
    "training_loss",
    "training_eval_loss",
    "validation_eval_loss",
    "training_eval_loss_ema",
    "validation_eval_loss_ema",
];

/// Header of `times.csv`.
pub const TIME_HEADER: [&str; 6] = [
    "epoch",
    "training_time",
    "training_eval_time",
    "validation_eval_time",
    "training_eval_time_ema",
    "validation_eval_time_ema",
];

/// Live checkpoint file name.
pub const MODEL_FILE: &str = "model.pt";
/// EMA checkpoint file name.
pub const EMA_MODEL_FILE: &str = "model_ema.pt";

/// One value per epoch phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseValues {
    /// Optimisation pass over the augmented training loader.
    pub training: f64,
    /// Live model on the training split.
    pub training_eval: f64,
    /// Live model on the validation split.
    pub validation_eval: f64,
    /// EMA model on the training split.
    pub training_eval_ema: f64,
    /// EMA model on the validation split.
    pub validation_eval_ema: f64,
}

impl PhaseValues {
    fn to_row(self, epoch: usize) -> [String; 6] {
        [
            epoch.to_string(),
            format!("{:.8}", self.training),
            format!("{:.8}", self.training_eval),
            format!("{:.8}", self.validation_eval),
            format!("{:.8}", self.training_eval_ema),
            format!("{:.8}", self.validation_eval_ema),
        ]
    }
}

/// Loss and time series of a run, plus the artifact paths.
#[derive(Debug, Clone)]
pub struct RunRecord {
    dir: PathBuf,
    losses: Vec<PhaseValues>,
    times: Vec<PhaseValues>,
}

impl RunRecord {
    /// Create the run directory (and parents) if needed.
    pub fn create(dir: impl Into<PathBuf>) -> TrainResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;
        Ok(RunRecord { dir, losses: Vec::new(), times: Vec::new() })
    }

    /// The run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the live checkpoint.
    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Path of the EMA checkpoint.
    pub fn ema_model_path(&self) -> PathBuf {
        self.dir.join(EMA_MODEL_FILE)
    }

    /// Loss rows recorded so far.
    pub fn losses(&self) -> &[PhaseValues] {
        &self.losses
    }

    /// Time rows recorded so far.
    pub fn times(&self) -> &[PhaseValues] {
        &self.times
    }

    /// Write `<name>.csv` listing the image of every sample in order.
    pub fn write_split(&self, name: &str, samples: &[PathBuf]) -> TrainResult<()> {
        let mut writer = self.writer(&format!("{name}.csv"))?;
        writer.write_record(["index", "path"])?;
        for (i, base) in samples.iter().enumerate() {
            writer.write_record([i.to_string(), image_path(base).display().to_string()])?;
        }
        self.flush(writer, name)
    }

    /// Append a completed epoch and rewrite both tables.
    pub fn push_epoch(&mut self, losses: PhaseValues, times: PhaseValues) -> TrainResult<()> {
        self.losses.push(losses);
        self.times.push(times);
        self.write_series()
    }

    /// Rewrite `losses.csv` and `times.csv` from the recorded rows.
    pub fn write_series(&self) -> TrainResult<()> {
        for (file, header, rows) in [
            ("losses.csv", LOSS_HEADER, &self.losses),
            ("times.csv", TIME_HEADER, &self.times),
        ] {
            let mut writer = self.writer(file)?;
            writer.write_record(header)?;
            for (epoch, row) in rows.iter().enumerate() {
                writer.write_record(row.to_row(epoch))?;
            }
            self.flush(writer, file)?;
        }
        Ok(())
    }

    /// Write `<name>.csv` with one `image,keypoint,distance` row per entry of
    /// the `[N, K]` table.
    pub fn write_distances(&self, name: &str, distances: &Array2<f32>) -> TrainResult<()> {
        let mut writer = self.writer(&format!("{name}.csv"))?;
        writer.write_record(["image", "keypoint", "distance"])?;
        for ((image, keypoint), distance) in distances.indexed_iter() {
            writer.write_record([image.to_string(), keypoint.to_string(), format!("{distance:.8}")])?;
        }
        self.flush(writer, name)
    }

    fn writer(&self, file: &str) -> TrainResult<csv::Writer<std::fs::File>> {
        Ok(csv::Writer::from_path(self.dir.join(file))?)
    }

    fn flush(&self, mut writer: csv::Writer<std::fs::File>, file: &str) -> TrainResult<()> {
        writer.flush().map_err(|e| TrainError::io(self.dir.join(file), e))
    }
}
