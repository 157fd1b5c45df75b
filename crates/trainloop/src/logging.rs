use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};
use tracing::info;

use crate::{config::LoggingConfig, time::Timestamp, Result, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub metrics_file: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            metrics_file: config.metrics_file.clone(),
            flush_every_n: config.flush_every_n.max(1),
        }
    }
}

/// A sink for metric records.
pub trait LoggerDestination: Send {
    fn log_metrics(&mut self, timestamp: &Timestamp, metrics: &BTreeMap<String, f64>)
        -> Result<()>;

    fn log_hyperparameters(&mut self, _params: &BTreeMap<String, Value>) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fans metric records out to every destination, in registration order.
///
/// Algorithms receive the logger during `apply`; the loop uses it for its own
/// periodic records.
#[derive(Default)]
pub struct Logger {
    destinations: Vec<Box<dyn LoggerDestination>>,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &LoggingSettings) -> Result<Self> {
        let mut logger = Self::new();
        if settings.enable_stdout {
            logger.add_destination(ConsoleDestination);
        }
        if let Some(path) = settings.metrics_file.as_ref() {
            logger.add_destination(JsonlDestination::create(path, settings.flush_every_n)?);
        }
        Ok(logger)
    }

    pub fn with_destination(mut self, destination: impl LoggerDestination + 'static) -> Self {
        self.add_destination(destination);
        self
    }

    pub fn add_destination(&mut self, destination: impl LoggerDestination + 'static) {
        self.destinations.push(Box::new(destination));
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn log_metrics(
        &mut self,
        timestamp: &Timestamp,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        for destination in self.destinations.iter_mut() {
            destination.log_metrics(timestamp, metrics)?;
        }
        Ok(())
    }

    pub fn log_metric(&mut self, timestamp: &Timestamp, name: &str, value: f64) -> Result<()> {
        let mut metrics = BTreeMap::new();
        metrics.insert(name.to_string(), value);
        self.log_metrics(timestamp, &metrics)
    }

    pub fn log_hyperparameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        for destination in self.destinations.iter_mut() {
            destination.log_hyperparameters(params)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for destination in self.destinations.iter_mut() {
            destination.flush()?;
        }
        Ok(())
    }
}

/// Writes metric records as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleDestination;

impl LoggerDestination for ConsoleDestination {
    fn log_metrics(
        &mut self,
        timestamp: &Timestamp,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let rendered = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            epoch = timestamp.epoch,
            batch = timestamp.batch,
            sample = timestamp.sample,
            "{rendered}"
        );
        Ok(())
    }

    fn log_hyperparameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in params {
            info!(hyperparameter = %name, value = %value, "hyperparameter");
        }
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
pub struct JsonlDestination {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl JsonlDestination {
    pub fn create(path: &Path, flush_every: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to create metrics directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to open metrics file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|err| TrainingError::runtime(format!("failed to encode metrics: {err}")))?;
        self.writer.write_all(b"\n").map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write metrics file {}: {err}",
                self.path.display()
            ))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            LoggerDestination::flush(self)?;
        }
        Ok(())
    }
}

impl LoggerDestination for JsonlDestination {
    fn log_metrics(
        &mut self,
        timestamp: &Timestamp,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let record = json!({
            "wall_time": current_wall_time(),
            "epoch": timestamp.epoch,
            "batch": timestamp.batch,
            "sample": timestamp.sample,
            "token": timestamp.token,
            "metrics": metrics,
        });
        self.write_record(&record)
    }

    fn log_hyperparameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        let record = json!({
            "wall_time": current_wall_time(),
            "hyperparameters": params,
        });
        self.write_record(&record)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush metrics file {}: {err}",
                self.path.display()
            ))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for JsonlDestination {
    fn drop(&mut self) {
        let _ = LoggerDestination::flush(self);
    }
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}
