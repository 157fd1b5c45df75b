#![allow(dead_code)]

use std::{
    cell::Cell,
    path::Path,
    sync::{Arc, Mutex},
};

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use serde_json::{json, Value};
use trainloop::{
    backend::{InMemoryLoader, LinearRegressor, Sgd, SyntheticRegression},
    config::CheckpointConfig,
    scheduler::ConstantWithWarmup,
    Algorithm, Batch, Event, Logger, Model, Observer, State, Time, Timestamp, Trace,
    TrainerBuilder, TrainingConfig, TrainingError,
};

pub const FEATURES: usize = 2;
pub const SAMPLES: usize = 40;
pub const BATCH_SIZE: usize = 4;
pub const BATCHES_PER_EPOCH: u64 = 10;
pub const LEARNING_RATE: f64 = 0.1;

pub fn config(max_duration: Time) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.run.seed = 7;
    config.run.max_duration = max_duration;
    config.run.log_every_n_batches = 5;
    config.optimizer.learning_rate = LEARNING_RATE;
    config.logging.enable_stdout = false;
    config
}

pub fn with_checkpoints(
    mut config: TrainingConfig,
    directory: &Path,
    every_n_batches: u64,
) -> TrainingConfig {
    config.checkpoint = Some(CheckpointConfig {
        directory: directory.to_path_buf(),
        every_n_batches: Some(every_n_batches),
        every_n_epochs: None,
        max_keep: None,
        remote: None,
    });
    config
}

pub fn loader() -> InMemoryLoader {
    SyntheticRegression::generate(SAMPLES, FEATURES, 0.1, 3, &Device::Cpu)
        .expect("synthetic data")
        .into_loader(BATCH_SIZE, true)
        .expect("loader")
}

/// Held-out data in a fixed order.
pub fn eval_loader() -> InMemoryLoader {
    SyntheticRegression::generate(SAMPLES / 2, FEATURES, 0.1, 4, &Device::Cpu)
        .expect("synthetic data")
        .into_loader(BATCH_SIZE, false)
        .expect("loader")
}

pub fn optimizer_for(model: &dyn Model) -> Sgd {
    let vars = model
        .parameters()
        .into_iter()
        .map(|(_, var)| var)
        .collect();
    Sgd::new(vars, LEARNING_RATE).expect("sgd")
}

/// Linear model, SGD, a constant schedule and the synthetic loader.
pub fn builder(config: TrainingConfig) -> TrainerBuilder {
    let model = LinearRegressor::new(FEATURES, &Device::Cpu).expect("model");
    builder_with_model(config, model)
}

pub fn builder_with_model(config: TrainingConfig, model: impl Model + 'static) -> TrainerBuilder {
    let optimizer = optimizer_for(&model);
    TrainerBuilder::new(config, model, loader())
        .optimizer(optimizer)
        .scheduler(Box::new(
            ConstantWithWarmup::constant(LEARNING_RATE).expect("scheduler"),
        ))
        .logger(Logger::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub event: Event,
    pub timestamp: Timestamp,
    pub traces: Vec<Trace>,
}

pub type EventLog = Arc<Mutex<Vec<Record>>>;

/// Observer that keeps every event it sees.
pub struct Recorder {
    log: EventLog,
}

impl Recorder {
    pub fn new() -> (Self, EventLog) {
        let log = EventLog::default();
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl Observer for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_event(&mut self, event: Event, state: &State, traces: &[Trace]) -> trainloop::Result<()> {
        self.log.lock().expect("log lock").push(Record {
            event,
            timestamp: state.timestamp,
            traces: traces.to_vec(),
        });
        Ok(())
    }
}

pub fn events(log: &EventLog) -> Vec<Event> {
    log.lock()
        .expect("log lock")
        .iter()
        .map(|record| record.event)
        .collect()
}

pub fn records(log: &EventLog) -> Vec<Record> {
    log.lock().expect("log lock").clone()
}

/// Counts the batches it has seen and persists the count in checkpoints.
pub struct BatchCounter {
    pub count: u64,
}

impl Algorithm for BatchCounter {
    fn name(&self) -> &str {
        "batch_counter"
    }

    fn matches(&self, event: Event, _state: &State) -> bool {
        event == Event::BatchEnd
    }

    fn apply(
        &mut self,
        _event: Event,
        _state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        self.count += 1;
        Ok(Trace::new(format!("seen {} batches", self.count)))
    }

    fn state_dict(&self) -> Option<Value> {
        Some(json!({ "count": self.count }))
    }

    fn load_state_dict(&mut self, state: Value) -> trainloop::Result<()> {
        self.count = state["count"]
            .as_u64()
            .ok_or_else(|| TrainingError::contract("missing count"))?;
        Ok(())
    }
}

/// Fires on a fixed event and appends its name to a shared list.
pub struct Tagger {
    pub name: String,
    pub priority: Option<i32>,
    pub event: Event,
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Algorithm for Tagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Option<i32> {
        self.priority
    }

    fn matches(&self, event: Event, _state: &State) -> bool {
        event == self.event
    }

    fn apply(
        &mut self,
        _event: Event,
        _state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        self.seen.lock().expect("seen lock").push(self.name.clone());
        Ok(Trace::new("tagged"))
    }
}

/// Fails when `event` fires at global batch `batch`.
pub struct FailAt {
    pub event: Event,
    pub batch: u64,
}

impl Algorithm for FailAt {
    fn name(&self) -> &str {
        "fail_at"
    }

    fn matches(&self, event: Event, state: &State) -> bool {
        event == self.event && state.timestamp.batch == self.batch
    }

    fn apply(
        &mut self,
        _event: Event,
        _state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        Err(TrainingError::runtime("scripted failure"))
    }
}

/// Wraps the linear model and fails the `fail_on_call`-th forward pass.
pub struct FlakyModel {
    pub inner: LinearRegressor,
    pub calls: Cell<u64>,
    pub fail_on_call: u64,
}

impl FlakyModel {
    pub fn new(fail_on_call: u64) -> Self {
        Self {
            inner: LinearRegressor::new(FEATURES, &Device::Cpu).expect("model"),
            calls: Cell::new(0),
            fail_on_call,
        }
    }
}

impl Model for FlakyModel {
    fn forward(&self, batch: &Batch) -> trainloop::Result<Tensor> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if call == self.fail_on_call {
            return Err(TrainingError::runtime("forward exploded"));
        }
        self.inner.forward(batch)
    }

    fn compute_loss(&self, outputs: &Tensor, batch: &Batch) -> trainloop::Result<Tensor> {
        self.inner.compute_loss(outputs, batch)
    }

    fn backward(&self, loss: &Tensor) -> trainloop::Result<GradStore> {
        self.inner.backward(loss)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.inner.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }
}
