use std::{
    fs,
    path::{Path, PathBuf},
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{engine::MatchPurity, object_store::validate_volume_path, time::Time, TrainingError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub algorithms: AlgorithmsConfig,
    #[serde(default)]
    pub data: DataConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.run.max_duration.value == 0 {
            errors.push("run.max_duration must be greater than 0".to_string());
        }

        if self.run.log_every_n_batches == 0 {
            errors.push("run.log_every_n_batches must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if let Some(0) = self.scheduler.total_steps {
            errors.push("scheduler.total_steps must be greater than 0".to_string());
        }

        if let (Some(warmup), Some(total)) =
            (self.scheduler.warmup_steps, self.scheduler.total_steps)
        {
            if warmup > total {
                errors
                    .push("scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string());
            }
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }

        if let Some(power) = self.scheduler.power {
            if power <= 0.0 {
                errors.push("scheduler.power must be greater than 0".to_string());
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_batches.unwrap_or(0) == 0
                && checkpoint.every_n_epochs.unwrap_or(0) == 0
            {
                errors.push(
                    "checkpoint must specify `every_n_batches` and/or `every_n_epochs`".to_string(),
                );
            }
            if let Some(0) = checkpoint.every_n_batches {
                errors.push("checkpoint.every_n_batches must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.every_n_epochs {
                errors.push("checkpoint.every_n_epochs must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("checkpoint.max_keep must be greater than 0".to_string());
            }
            if let Some(remote) = &checkpoint.remote {
                if let Err(err) = validate_volume_path(&remote.path) {
                    errors.push(format!("checkpoint.remote.path: {err}"));
                }
            }
        }

        if let Some(0) = self.evaluation.every_n_batches {
            errors.push("evaluation.every_n_batches must be greater than 0".to_string());
        }

        if let Some(0) = self.evaluation.every_n_epochs {
            errors.push("evaluation.every_n_epochs must be greater than 0".to_string());
        }

        if let Some(0) = self.evaluation.max_batches {
            errors.push("evaluation.max_batches must be greater than 0".to_string());
        }

        if self.logging.flush_every_n == 0 {
            errors.push("logging.flush_every_n must be greater than 0".to_string());
        }

        if let Some(clipping) = &self.algorithms.gradient_clipping {
            if !(clipping.max_norm > 0.0) {
                errors.push(
                    "algorithms.gradient_clipping.max_norm must be greater than 0".to_string(),
                );
            }
        }

        if let Some(early) = &self.algorithms.early_stopping {
            if early.metric.trim().is_empty() {
                errors.push("algorithms.early_stopping.metric must not be empty".to_string());
            }
            if early.patience == 0 {
                errors.push(
                    "algorithms.early_stopping.patience must be greater than 0".to_string(),
                );
            }
            if early.min_delta < 0.0 {
                errors.push("algorithms.early_stopping.min_delta must be >= 0".to_string());
            }
        }

        if self.data.samples == 0 {
            errors.push("data.samples must be greater than 0".to_string());
        }

        if self.data.features == 0 {
            errors.push("data.features must be greater than 0".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.noise < 0.0 {
            errors.push("data.noise must be >= 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.apply_base_path(base);
        }
        self.logging.apply_base_path(base);
    }

    /// SHA-256 of the config's JSON form, recorded in checkpoint manifests.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        let json = serde_json::to_vec(self)
            .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
        Ok(hex_encode(Sha256::digest(json)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration: Time,
    #[serde(default = "default_log_every_n_batches")]
    pub log_every_n_batches: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_duration: default_max_duration(),
            log_every_n_batches: default_log_every_n_batches(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub match_purity: MatchPurity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_steps: Option<u64>,
    /// Defaults to the number of batches implied by `run.max_duration`.
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub min_lr: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    LinearWarmup,
    Cosine,
    CosineWithWarmup,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub every_n_batches: Option<u64>,
    #[serde(default)]
    pub every_n_epochs: Option<u64>,
    #[serde(default)]
    pub max_keep: Option<usize>,
    #[serde(default)]
    pub remote: Option<RemoteCheckpointConfig>,
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
        if let Some(remote) = self.remote.as_mut() {
            absolutize_in_place(&mut remote.mount_root, base);
        }
    }
}

/// Mirror of every saved checkpoint on a mounted volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCheckpointConfig {
    pub mount_root: PathBuf,
    /// `Volumes/<catalog>/<schema>/<volume>/<path>`.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_batches: Option<u64>,
    #[serde(default)]
    pub every_n_epochs: Option<u64>,
    #[serde(default)]
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            metrics_file: None,
            flush_every_n: default_flush_every_n(),
        }
    }
}

impl LoggingConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.metrics_file.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgorithmsConfig {
    #[serde(default)]
    pub gradient_clipping: Option<GradientClippingConfig>,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientClippingConfig {
    pub max_norm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_early_stopping_metric")]
    pub metric: String,
    #[serde(default = "default_patience")]
    pub patience: u32,
    #[serde(default)]
    pub min_delta: f64,
}

/// Synthetic regression data used by the `train` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default = "default_eval_samples")]
    pub eval_samples: usize,
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            eval_samples: default_eval_samples(),
            features: default_features(),
            batch_size: default_batch_size(),
            noise: default_noise(),
            shuffle: default_shuffle(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_seed() -> u64 {
    42
}

fn default_max_duration() -> Time {
    Time::epochs(1)
}

fn default_log_every_n_batches() -> u64 {
    10
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_enable_stdout() -> bool {
    true
}

fn default_flush_every_n() -> usize {
    1
}

fn default_early_stopping_metric() -> String {
    "loss/train".to_string()
}

fn default_patience() -> u32 {
    2
}

fn default_samples() -> usize {
    256
}

fn default_eval_samples() -> usize {
    64
}

fn default_features() -> usize {
    4
}

fn default_batch_size() -> usize {
    16
}

fn default_noise() -> f64 {
    0.01
}

fn default_shuffle() -> bool {
    true
}
