//! Mutable training state shared between the loop and its algorithms.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{backprop::GradStore, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::{
    data::Batch,
    float,
    metrics::ExponentialMovingAverage,
    model::{Model, Optimizer, TensorRecord},
    scheduler::{LRScheduler, SchedulerState},
    time::{Time, Timestamp},
    Result, TrainingError,
};

pub const MODEL: &str = "model";
pub const OPTIMIZERS: &str = "optimizers";
pub const SCHEDULERS: &str = "schedulers";
pub const SEED: &str = "seed";
pub const METRICS: &str = "metrics";
pub const STOP_REQUESTED: &str = "stop_requested";
pub const TRAIN_LOSS_EMA: &str = "train_loss_ema";

const TRAIN_LOSS_EMA_ALPHA: f64 = 0.1;

/// Names of the fields defined on `State` itself. Attributes registered by
/// algorithms may not reuse them.
pub const BUILTIN_ATTRIBUTES: [&str; 13] = [
    MODEL,
    OPTIMIZERS,
    SCHEDULERS,
    SEED,
    METRICS,
    STOP_REQUESTED,
    TRAIN_LOSS_EMA,
    "timestamp",
    "max_duration",
    "current_batch",
    "outputs",
    "loss",
    "grads",
];

/// Current-epoch values plus everything archived at earlier epoch boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(with = "float::series_map")]
    pub current: BTreeMap<String, Vec<f64>>,
    #[serde(with = "float::series_map")]
    pub archived: BTreeMap<String, Vec<f64>>,
}

pub struct State {
    pub model: Box<dyn Model>,
    pub optimizers: Vec<Box<dyn Optimizer>>,
    /// Scheduler `i` drives optimizer `i`.
    pub schedulers: Vec<Box<dyn LRScheduler>>,
    pub timestamp: Timestamp,
    pub max_duration: Time,
    pub seed: u64,
    pub current_batch: Option<Batch>,
    pub outputs: Option<Tensor>,
    pub loss: Option<Tensor>,
    pub grads: Option<GradStore>,
    /// Values recorded during the current epoch. Archived, not dropped, when
    /// the next epoch starts.
    pub metrics: BTreeMap<String, Vec<f64>>,
    /// Ask the loop to stop at the next batch boundary. Persisted, so a run
    /// resumed after the request stops at the same point.
    pub stop_requested: bool,
    /// Smoothed training loss, as logged next to `loss/train`.
    pub train_loss_ema: ExponentialMovingAverage,
    archived_metrics: BTreeMap<String, Vec<f64>>,
    attributes: BTreeMap<String, Value>,
    serialized_attributes: BTreeSet<String>,
}

impl State {
    pub fn new(model: Box<dyn Model>, max_duration: Time, seed: u64) -> Self {
        let serialized_attributes = [
            MODEL,
            OPTIMIZERS,
            SCHEDULERS,
            SEED,
            METRICS,
            STOP_REQUESTED,
            TRAIN_LOSS_EMA,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        Self {
            model,
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            timestamp: Timestamp::default(),
            max_duration,
            seed,
            current_batch: None,
            outputs: None,
            loss: None,
            grads: None,
            metrics: BTreeMap::new(),
            stop_requested: false,
            train_loss_ema: ExponentialMovingAverage::new(TRAIN_LOSS_EMA_ALPHA),
            archived_metrics: BTreeMap::new(),
            attributes: BTreeMap::new(),
            serialized_attributes,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizers.push(optimizer);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    /// Adds a named attribute. Serialized attributes become part of every
    /// checkpoint and must be present when one is restored.
    pub fn register_attribute(
        &mut self,
        name: impl Into<String>,
        initial: Value,
        serialized: bool,
    ) -> Result<()> {
        let name = name.into();
        if BUILTIN_ATTRIBUTES.contains(&name.as_str()) || self.attributes.contains_key(&name) {
            return Err(TrainingError::contract(format!(
                "state attribute `{name}` is already registered"
            )));
        }
        if serialized {
            self.serialized_attributes.insert(name.clone());
        }
        self.attributes.insert(name, initial);
        Ok(())
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: &str, value: Value) -> Result<()> {
        match self.attributes.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TrainingError::contract(format!(
                "state attribute `{name}` was never registered"
            ))),
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        BUILTIN_ATTRIBUTES.contains(&name) || self.attributes.contains_key(name)
    }

    pub fn serialized_attributes(&self) -> &BTreeSet<String> {
        &self.serialized_attributes
    }

    pub fn record_metric(&mut self, name: &str, value: f64) {
        self.metrics.entry(name.to_string()).or_default().push(value);
    }

    /// Every value recorded for `name` across the whole run, oldest first.
    pub fn metric_trace(&self, name: &str) -> Vec<f64> {
        let mut trace = self.archived_metrics.get(name).cloned().unwrap_or_default();
        if let Some(current) = self.metrics.get(name) {
            trace.extend_from_slice(current);
        }
        trace
    }

    pub fn latest_metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(|values| values.last().copied())
    }

    /// Moves the current epoch's metrics into the archive.
    pub fn archive_epoch_metrics(&mut self) {
        for (name, values) in std::mem::take(&mut self.metrics) {
            self.archived_metrics.entry(name).or_default().extend(values);
        }
    }

    pub fn metric_history(&self) -> MetricHistory {
        MetricHistory {
            current: self.metrics.clone(),
            archived: self.archived_metrics.clone(),
        }
    }

    /// Learning rate of the first optimizer, if any.
    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizers.first().map(|opt| opt.learning_rate())
    }

    /// Pushes each scheduler's rate into the optimizer it drives.
    pub fn sync_learning_rates(&mut self) {
        for (optimizer, scheduler) in self.optimizers.iter_mut().zip(self.schedulers.iter()) {
            optimizer.set_learning_rate(scheduler.learning_rate());
        }
    }

    /// Scales every schedule, and the raw rate of optimizers that have no
    /// scheduler, then pushes the result into the optimizers.
    pub fn scale_learning_rates(&mut self, factor: f64) {
        for scheduler in self.schedulers.iter_mut() {
            scheduler.scale_learning_rate(factor);
        }
        for optimizer in self.optimizers.iter_mut().skip(self.schedulers.len()) {
            let lr = optimizer.learning_rate();
            optimizer.set_learning_rate(lr * factor);
        }
        self.sync_learning_rates();
    }

    /// Drops the per-step values once a batch has finished.
    pub fn clear_transients(&mut self) {
        self.current_batch = None;
        self.outputs = None;
        self.loss = None;
        self.grads = None;
    }

    pub(crate) fn serialize_attributes(&self) -> Result<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for name in &self.serialized_attributes {
            let value = match name.as_str() {
                MODEL => self.model.state_dict()?,
                OPTIMIZERS => Value::Array(
                    self.optimizers
                        .iter()
                        .map(|opt| opt.state_dict())
                        .collect::<Result<Vec<_>>>()?,
                ),
                SCHEDULERS => serde_json::to_value(
                    self.schedulers
                        .iter()
                        .map(|sched| sched.snapshot())
                        .collect::<Vec<_>>(),
                )?,
                SEED => json!(self.seed),
                METRICS => serde_json::to_value(self.metric_history())?,
                STOP_REQUESTED => json!(self.stop_requested),
                TRAIN_LOSS_EMA => serde_json::to_value(&self.train_loss_ema)?,
                other => self.attributes.get(other).cloned().ok_or_else(|| {
                    TrainingError::contract(format!("serialized attribute `{other}` is missing"))
                })?,
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// Checks that `values` has exactly the serialized attributes of this
    /// state, with matching optimizer and scheduler counts.
    pub(crate) fn check_serialized_schema(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let expected: BTreeSet<&str> = self
            .serialized_attributes
            .iter()
            .map(String::as_str)
            .collect();
        let found: BTreeSet<&str> = values.keys().map(String::as_str).collect();
        if expected != found {
            let missing: Vec<_> = expected.difference(&found).copied().collect();
            let unexpected: Vec<_> = found.difference(&expected).copied().collect();
            return Err(TrainingError::contract(format!(
                "checkpoint state schema mismatch (missing: [{}], unexpected: [{}])",
                missing.join(", "),
                unexpected.join(", ")
            )));
        }

        let optimizer_count = values
            .get(OPTIMIZERS)
            .and_then(Value::as_array)
            .map(Vec::len);
        if optimizer_count != Some(self.optimizers.len()) {
            return Err(TrainingError::contract(format!(
                "checkpoint has {:?} optimizers, state has {}",
                optimizer_count,
                self.optimizers.len()
            )));
        }
        let scheduler_count = values
            .get(SCHEDULERS)
            .and_then(Value::as_array)
            .map(Vec::len);
        if scheduler_count != Some(self.schedulers.len()) {
            return Err(TrainingError::contract(format!(
                "checkpoint has {:?} schedulers, state has {}",
                scheduler_count,
                self.schedulers.len()
            )));
        }
        Ok(())
    }

    /// Replaces the serialized attributes and the timestamp. Every value is
    /// parsed and checked before anything is written; if loading the model,
    /// optimizer or scheduler state still fails, their previous state is put
    /// back.
    pub(crate) fn restore_attributes(
        &mut self,
        timestamp: Timestamp,
        mut values: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.check_serialized_schema(&values)?;

        let model = take(&mut values, MODEL)?;
        let optimizers = match take(&mut values, OPTIMIZERS)? {
            Value::Array(states) => states,
            _ => return Err(TrainingError::contract("optimizer state is not a list")),
        };
        let schedulers: Vec<SchedulerState> =
            take_parsed(&mut values, SCHEDULERS, "scheduler state")?;
        let seed: u64 = take_parsed(&mut values, SEED, "seed")?;
        let history: MetricHistory = take_parsed(&mut values, METRICS, "metric history")?;
        let stop_requested: bool = take_parsed(&mut values, STOP_REQUESTED, "stop flag")?;
        let train_loss_ema: ExponentialMovingAverage =
            take_parsed(&mut values, TRAIN_LOSS_EMA, "loss average")?;

        let previous = NumericState {
            model: self.model.state_dict()?,
            optimizers: self
                .optimizers
                .iter()
                .map(|opt| opt.state_dict())
                .collect::<Result<Vec<_>>>()?,
            schedulers: self.schedulers.iter().map(|sched| sched.snapshot()).collect(),
        };
        let restored = NumericState {
            model,
            optimizers,
            schedulers,
        };
        if let Err(err) = self.load_numeric_state(&restored) {
            if let Err(rollback) = self.load_numeric_state(&previous) {
                error!(error = %rollback, "failed to put back the state replaced by a checkpoint");
            }
            return Err(err);
        }

        self.seed = seed;
        self.metrics = history.current;
        self.archived_metrics = history.archived;
        self.stop_requested = stop_requested;
        self.train_loss_ema = train_loss_ema;
        self.attributes.extend(values);
        self.timestamp = timestamp;
        self.clear_transients();
        Ok(())
    }

    fn load_numeric_state(&mut self, numeric: &NumericState) -> Result<()> {
        self.model.load_state_dict(&numeric.model)?;
        for (optimizer, state) in self.optimizers.iter_mut().zip(&numeric.optimizers) {
            optimizer.load_state_dict(state)?;
        }
        for (scheduler, snapshot) in self.schedulers.iter_mut().zip(&numeric.schedulers) {
            scheduler.load_snapshot(snapshot)?;
        }
        Ok(())
    }

    /// SHA-256 over everything observable in the state. Two states with the
    /// same fingerprint are indistinguishable to an algorithm.
    pub fn fingerprint(&self) -> Result<String> {
        let tensor = |value: &Option<Tensor>| -> Result<Value> {
            match value {
                Some(t) => Ok(serde_json::to_value(TensorRecord::from_tensor(t)?)?),
                None => Ok(Value::Null),
            }
        };
        let batch = match &self.current_batch {
            Some(batch) => json!({
                "inputs": TensorRecord::from_tensor(&batch.inputs)?,
                "targets": TensorRecord::from_tensor(&batch.targets)?,
                "samples": batch.samples,
                "tokens": batch.tokens,
            }),
            None => Value::Null,
        };
        let digest = json!({
            "timestamp": self.timestamp,
            "max_duration": self.max_duration,
            "seed": self.seed,
            "model": self.model.state_dict()?,
            "training": self.model.is_training(),
            "optimizers": self
                .optimizers
                .iter()
                .map(|opt| opt.state_dict())
                .collect::<Result<Vec<_>>>()?,
            "learning_rates": self
                .optimizers
                .iter()
                .map(|opt| opt.learning_rate())
                .collect::<Vec<_>>(),
            "schedulers": self
                .schedulers
                .iter()
                .map(|sched| sched.snapshot())
                .collect::<Vec<_>>(),
            "metrics": self.metric_history(),
            "attributes": self.attributes,
            "stop_requested": self.stop_requested,
            "train_loss_ema": self.train_loss_ema,
            "current_batch": batch,
            "outputs": tensor(&self.outputs)?,
            "loss": tensor(&self.loss)?,
            "has_grads": self.grads.is_some(),
        });
        let bytes = serde_json::to_vec(&digest)?;
        Ok(hex_encode(Sha256::digest(bytes)))
    }
}

/// Everything in a checkpoint that is loaded through a fallible
/// `load_state_dict` call.
struct NumericState {
    model: Value,
    optimizers: Vec<Value>,
    schedulers: Vec<SchedulerState>,
}

fn take(values: &mut BTreeMap<String, Value>, name: &str) -> Result<Value> {
    values
        .remove(name)
        .ok_or_else(|| TrainingError::contract(format!("checkpoint has no `{name}` attribute")))
}

fn take_parsed<T>(values: &mut BTreeMap<String, Value>, name: &str, what: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(take(values, name)?)
        .map_err(|err| TrainingError::contract(format!("malformed {what}: {err}")))
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("timestamp", &self.timestamp)
            .field("max_duration", &self.max_duration)
            .field("seed", &self.seed)
            .field("optimizers", &self.optimizers.len())
            .field("schedulers", &self.schedulers.len())
            .field("metrics", &self.metrics.keys().collect::<Vec<_>>())
            .field("stop_requested", &self.stop_requested)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}
