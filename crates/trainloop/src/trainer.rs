use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use candle_core::{DType, Tensor};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    algorithm::Algorithm,
    checkpoint::{self, CheckpointDescriptor, SaveRequest, Snapshot},
    config::TrainingConfig,
    data::DataLoader,
    engine::Engine,
    event::Event,
    logging::{Logger, LoggingSettings},
    metrics::{EvaluationMetrics, EvaluationSummary},
    model::{Model, Optimizer},
    object_store::{ObjectStore, VolumeObjectStore},
    observer::Observer,
    scheduler::LRScheduler,
    state::State,
    time::Timestamp,
    Result, TrainingError,
};

pub const TRAIN_LOSS_METRIC: &str = "loss/train";
pub const EVAL_LOSS_METRIC: &str = "eval/loss";

/// Assembles a [`Trainer`]. `build` registers everything with the engine and
/// dispatches `INIT`, after which the registry is frozen.
pub struct TrainerBuilder {
    config: TrainingConfig,
    model: Box<dyn Model>,
    optimizers: Vec<Box<dyn Optimizer>>,
    schedulers: Vec<Box<dyn LRScheduler>>,
    train_loader: Box<dyn DataLoader>,
    eval_loader: Option<Box<dyn DataLoader>>,
    algorithms: Vec<Box<dyn Algorithm>>,
    observers: Vec<Box<dyn Observer>>,
    logger: Option<Logger>,
    object_store: Option<Box<dyn ObjectStore>>,
    attributes: Vec<(String, Value, bool)>,
}

impl TrainerBuilder {
    pub fn new(
        config: TrainingConfig,
        model: impl Model + 'static,
        train_loader: impl DataLoader + 'static,
    ) -> Self {
        Self {
            config,
            model: Box::new(model),
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            train_loader: Box::new(train_loader),
            eval_loader: None,
            algorithms: Vec::new(),
            observers: Vec::new(),
            logger: None,
            object_store: None,
            attributes: Vec::new(),
        }
    }

    pub fn optimizer(mut self, optimizer: impl Optimizer + 'static) -> Self {
        self.optimizers.push(Box::new(optimizer));
        self
    }

    /// Scheduler `i` drives optimizer `i`.
    pub fn scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn eval_loader(mut self, loader: impl DataLoader + 'static) -> Self {
        self.eval_loader = Some(Box::new(loader));
        self
    }

    pub fn algorithm(mut self, algorithm: impl Algorithm + 'static) -> Self {
        self.algorithms.push(Box::new(algorithm));
        self
    }

    pub fn algorithms(mut self, algorithms: impl IntoIterator<Item = Box<dyn Algorithm>>) -> Self {
        self.algorithms.extend(algorithms);
        self
    }

    pub fn observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Replaces the logger built from `[logging]`.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replaces the store built from `[checkpoint.remote]`.
    pub fn object_store(mut self, store: impl ObjectStore + 'static) -> Self {
        self.object_store = Some(Box::new(store));
        self
    }

    /// Registers an extra state attribute before `INIT`.
    pub fn attribute(mut self, name: impl Into<String>, initial: Value, serialized: bool) -> Self {
        self.attributes.push((name.into(), initial, serialized));
        self
    }

    pub fn build(self) -> Result<Trainer> {
        let TrainerBuilder {
            config,
            model,
            optimizers,
            schedulers,
            train_loader,
            eval_loader,
            algorithms,
            observers,
            logger,
            object_store,
            attributes,
        } = self;

        config.validate()?;
        if schedulers.len() > optimizers.len() {
            return Err(TrainingError::contract(format!(
                "{} schedulers registered for {} optimizers",
                schedulers.len(),
                optimizers.len()
            )));
        }

        let logger = match logger {
            Some(logger) => logger,
            None => Logger::from_settings(&LoggingSettings::from_config(&config.logging))?,
        };
        let mut engine = Engine::new(logger).with_match_purity(config.engine.match_purity);
        for algorithm in algorithms {
            engine.register_algorithm(algorithm)?;
        }
        for observer in observers {
            engine.register_observer(observer)?;
        }

        let mut state = State::new(model, config.run.max_duration, config.run.seed);
        state.optimizers = optimizers;
        state.schedulers = schedulers;
        for (name, initial, serialized) in attributes {
            state.register_attribute(name, initial, serialized)?;
        }
        state.sync_learning_rates();

        let remote = config
            .checkpoint
            .as_ref()
            .and_then(|checkpoint| checkpoint.remote.as_ref());
        let (object_store, remote_prefix) = match (object_store, remote) {
            (Some(store), remote) => (
                Some(store),
                remote.map(|r| r.path.clone()).unwrap_or_default(),
            ),
            (None, Some(remote)) => {
                let store: Box<dyn ObjectStore> =
                    Box::new(VolumeObjectStore::new(&remote.mount_root, &remote.path)?);
                (Some(store), remote.path.clone())
            }
            (None, None) => (None, String::new()),
        };

        let config_sha256 = config.fingerprint()?;
        let mut trainer = Trainer {
            config,
            config_sha256,
            state,
            engine,
            train_loader,
            eval_loader,
            object_store,
            remote_prefix,
        };

        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("seed".to_string(), json!(trainer.state.seed));
        hyperparameters.insert(
            "max_duration".to_string(),
            json!(trainer.state.max_duration.to_string()),
        );
        hyperparameters.insert(
            "learning_rate".to_string(),
            json!(trainer.state.learning_rate()),
        );
        hyperparameters.insert(
            "algorithms".to_string(),
            json!(trainer.engine.algorithm_order()),
        );
        trainer
            .engine
            .logger_mut()
            .log_hyperparameters(&hyperparameters)?;

        trainer.run_event(Event::Init)?;
        Ok(trainer)
    }
}

/// Drives epochs of batches and asks the engine to run every lifecycle event.
pub struct Trainer {
    config: TrainingConfig,
    config_sha256: String,
    state: State,
    engine: Engine,
    train_loader: Box<dyn DataLoader>,
    eval_loader: Option<Box<dyn DataLoader>>,
    object_store: Option<Box<dyn ObjectStore>>,
    remote_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Batch,
    Epoch,
}

impl Trainer {
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn timestamp(&self) -> Timestamp {
        self.state.timestamp
    }

    pub fn fit(&mut self) -> Result<()> {
        self.fit_with_shutdown(|_| false)
    }

    /// Trains until `max_duration` is reached, an algorithm sets
    /// `stop_requested`, or `should_stop` returns true. All three are checked
    /// between batches only. `FIT_END` fires in every case.
    ///
    /// A stop request survives checkpoints, so resuming a run that had
    /// already been asked to stop fires `FIT_START` and `FIT_END` only.
    pub fn fit_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<()>
    where
        F: FnMut(&Timestamp) -> bool,
    {
        let per_epoch = self.train_loader.batches_per_epoch() as u64;
        if per_epoch == 0 {
            return Err(TrainingError::runtime("training loader yields no batches"));
        }

        self.run_event(Event::FitStart)?;
        self.state.model.set_training(true);
        info!(
            epoch = self.state.timestamp.epoch,
            batch = self.state.timestamp.batch,
            max_duration = %self.state.max_duration,
            batches_per_epoch = per_epoch,
            "starting training"
        );

        'epochs: loop {
            if self.stop_reason(&mut should_stop) {
                break;
            }

            let epoch = self.state.timestamp.epoch;
            let offset = self.state.timestamp.batch_in_epoch;
            let started = self.train_loader.start_epoch(epoch, self.state.seed);
            self.guard("dataloader", started)?;

            if offset == 0 {
                self.state.archive_epoch_metrics();
                self.run_event(Event::EpochStart)?;
            } else {
                info!(epoch, batch_in_epoch = offset, "re-entering epoch");
                let skipped = self.train_loader.skip(offset);
                self.guard("dataloader", skipped)?;
            }

            while self.state.timestamp.batch_in_epoch < per_epoch {
                if self.stop_reason(&mut should_stop) {
                    break 'epochs;
                }
                self.train_batch()?;
                self.maybe_log()?;
                self.maybe_evaluate(Boundary::Batch)?;
                self.maybe_checkpoint(Boundary::Batch)?;
            }

            // Epoch evaluation lands in this epoch's metrics, where EPOCH_END
            // algorithms and the epoch checkpoint both see it.
            self.maybe_evaluate(Boundary::Epoch)?;
            self.run_event(Event::EpochEnd)?;
            self.state.timestamp = self.state.timestamp.to_next_epoch();
            self.maybe_checkpoint(Boundary::Epoch)?;
        }

        self.run_event(Event::FitEnd)?;
        self.engine.logger_mut().flush()?;
        info!(
            epoch = self.state.timestamp.epoch,
            batch = self.state.timestamp.batch,
            "training finished"
        );
        Ok(())
    }

    fn stop_reason<F>(&mut self, should_stop: &mut F) -> bool
    where
        F: FnMut(&Timestamp) -> bool,
    {
        let ts = self.state.timestamp;
        let reason = if ts.reached(self.state.max_duration) {
            "max_duration reached"
        } else if self.state.stop_requested {
            "stop requested by an algorithm"
        } else if should_stop(&ts) {
            "shutdown requested"
        } else {
            return false;
        };
        info!(epoch = ts.epoch, batch = ts.batch, "{reason}");
        true
    }

    fn train_batch(&mut self) -> Result<()> {
        self.run_event(Event::BatchStart)?;

        self.run_event(Event::BeforeDataloader)?;
        let fetched = self.train_loader.next_batch().and_then(|batch| {
            batch.ok_or_else(|| {
                TrainingError::runtime("training loader ran out before the end of the epoch")
            })
        });
        let batch = self.guard("dataloader", fetched)?;
        let (samples, tokens) = (batch.samples, batch.tokens);
        self.state.current_batch = Some(batch);
        self.run_event(Event::AfterDataloader)?;

        let zeroed = self
            .state
            .optimizers
            .iter_mut()
            .try_for_each(|optimizer| optimizer.zero_grad());
        self.guard("zero_grad", zeroed)?;

        self.run_event(Event::BeforeForward)?;
        let outputs = match &self.state.current_batch {
            Some(batch) => self.state.model.forward(batch),
            None => Err(missing("current batch", "forward")),
        };
        let outputs = self.guard("forward", outputs)?;
        self.state.outputs = Some(outputs);
        self.run_event(Event::AfterForward)?;

        self.run_event(Event::BeforeLoss)?;
        let loss = match (&self.state.outputs, &self.state.current_batch) {
            (Some(outputs), Some(batch)) => self
                .state
                .model
                .compute_loss(outputs, batch)
                .and_then(|loss| scalar(&loss).map(|value| (loss, value))),
            _ => Err(missing("outputs", "loss")),
        };
        let (loss, loss_value) = self.guard("loss", loss)?;
        self.state.loss = Some(loss);
        self.run_event(Event::AfterLoss)?;

        self.run_event(Event::BeforeBackward)?;
        let grads = match &self.state.loss {
            Some(loss) => self.state.model.backward(loss),
            None => Err(missing("loss", "backward")),
        };
        let grads = self.guard("backward", grads)?;
        self.state.grads = Some(grads);
        self.run_event(Event::AfterBackward)?;

        self.state.sync_learning_rates();
        self.run_event(Event::BeforeOptimizerStep)?;
        let stepped = match &self.state.grads {
            Some(grads) => self
                .state
                .optimizers
                .iter_mut()
                .try_for_each(|optimizer| optimizer.step(grads)),
            None => Err(missing("gradients", "optimizer step")),
        };
        self.guard("optimizer_step", stepped)?;
        self.run_event(Event::AfterOptimizerStep)?;

        for scheduler in self.state.schedulers.iter_mut() {
            scheduler.step();
        }
        self.state.sync_learning_rates();
        self.state.record_metric(TRAIN_LOSS_METRIC, loss_value);
        self.state.train_loss_ema.update(loss_value);
        self.state.timestamp = self.state.timestamp.to_next_batch(samples, tokens);

        self.run_event(Event::BatchEnd)?;
        self.state.clear_transients();
        Ok(())
    }

    fn maybe_log(&mut self) -> Result<()> {
        let ts = self.state.timestamp;
        if ts.batch % self.config.run.log_every_n_batches != 0 {
            return Ok(());
        }
        let Some(loss) = self.state.latest_metric(TRAIN_LOSS_METRIC) else {
            return Ok(());
        };

        let mut metrics = BTreeMap::new();
        metrics.insert(TRAIN_LOSS_METRIC.to_string(), loss);
        if let Some(smoothed) = self.state.train_loss_ema.value() {
            metrics.insert(format!("{TRAIN_LOSS_METRIC}_ema"), smoothed);
        }
        if let Some(lr) = self.state.learning_rate() {
            metrics.insert("learning_rate".to_string(), lr);
        }
        self.engine.logger_mut().log_metrics(&ts, &metrics)
    }

    fn maybe_checkpoint(&mut self, boundary: Boundary) -> Result<()> {
        let Some(settings) = self.config.checkpoint.as_ref() else {
            return Ok(());
        };
        let ts = self.state.timestamp;
        let due = match boundary {
            Boundary::Batch => settings
                .every_n_batches
                .map_or(false, |n| n > 0 && ts.batch % n == 0),
            Boundary::Epoch => settings
                .every_n_epochs
                .map_or(false, |n| n > 0 && ts.epoch % n == 0),
        };
        if !due {
            return Ok(());
        }

        let directory = settings.directory.clone();
        let max_keep = settings.max_keep;
        let descriptor = self.write_checkpoint(&directory, max_keep)?;
        info!(
            epoch = ts.epoch,
            batch = ts.batch,
            path = %descriptor.directory.display(),
            "checkpoint saved"
        );

        if let Some(store) = self.object_store.as_deref() {
            checkpoint::upload_checkpoint(store, &descriptor, &self.remote_prefix)?;
        }

        let event = match boundary {
            Boundary::Batch => Event::BatchCheckpoint,
            Boundary::Epoch => Event::EpochCheckpoint,
        };
        self.run_event(event)?;
        Ok(())
    }

    fn maybe_evaluate(&mut self, boundary: Boundary) -> Result<()> {
        if self.eval_loader.is_none() {
            return Ok(());
        }
        let settings = &self.config.evaluation;
        let ts = self.state.timestamp;
        let due = match boundary {
            Boundary::Batch => settings
                .every_n_batches
                .map_or(false, |n| n > 0 && ts.batch % n == 0),
            // Runs before EPOCH_END, while the counter still names the
            // epoch being finished.
            Boundary::Epoch => settings
                .every_n_epochs
                .map_or(false, |n| n > 0 && (ts.epoch + 1) % n == 0),
        };
        if !due {
            return Ok(());
        }
        let max_batches = settings.max_batches;
        self.evaluate(max_batches)?;
        Ok(())
    }

    /// Runs the eval event family over the evaluation loader in inference
    /// mode and records the mean loss as `eval/loss`.
    pub fn evaluate(&mut self, max_batches: Option<usize>) -> Result<EvaluationSummary> {
        let mut loader = self
            .eval_loader
            .take()
            .ok_or_else(|| TrainingError::runtime("no evaluation loader configured"))?;

        let was_training = self.state.model.is_training();
        self.state.model.set_training(false);
        let result = self.run_evaluation(loader.as_mut(), max_batches);
        self.state.model.set_training(was_training);
        self.eval_loader = Some(loader);
        result
    }

    fn run_evaluation(
        &mut self,
        loader: &mut dyn DataLoader,
        max_batches: Option<usize>,
    ) -> Result<EvaluationSummary> {
        self.run_event(Event::EvalStart)?;
        let started = loader.start_epoch(0, self.state.seed);
        self.guard("eval_dataloader", started)?;

        let available = loader.batches_per_epoch();
        let limit = max_batches.map_or(available, |max| max.min(available));
        let mut metrics = EvaluationMetrics::default();

        for _ in 0..limit {
            self.run_event(Event::EvalBatchStart)?;
            let fetched = loader.next_batch().and_then(|batch| {
                batch.ok_or_else(|| TrainingError::runtime("evaluation loader ran out early"))
            });
            let batch = self.guard("eval_dataloader", fetched)?;
            let samples = batch.samples;
            self.state.current_batch = Some(batch);

            self.run_event(Event::EvalBeforeForward)?;
            let outputs = match &self.state.current_batch {
                Some(batch) => self.state.model.forward(batch),
                None => Err(missing("current batch", "eval forward")),
            };
            let outputs = self.guard("eval_forward", outputs)?;
            self.state.outputs = Some(outputs);
            self.run_event(Event::EvalAfterForward)?;

            let loss = match (&self.state.outputs, &self.state.current_batch) {
                (Some(outputs), Some(batch)) => self
                    .state
                    .model
                    .compute_loss(outputs, batch)
                    .and_then(|loss| scalar(&loss).map(|value| (loss, value))),
                _ => Err(missing("outputs", "eval loss")),
            };
            let (loss, value) = self.guard("eval_loss", loss)?;
            metrics.update(value, samples);
            self.state.loss = Some(loss);

            self.run_event(Event::EvalBatchEnd)?;
            self.state.clear_transients();
        }

        let summary = metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no batches"))?;
        self.state
            .record_metric(EVAL_LOSS_METRIC, summary.average_loss);
        let ts = self.state.timestamp;
        self.engine
            .logger_mut()
            .log_metric(&ts, EVAL_LOSS_METRIC, summary.average_loss)?;
        self.run_event(Event::EvalEnd)?;

        info!(
            batch = ts.batch,
            loss = summary.average_loss,
            batches = summary.batches,
            samples = summary.samples,
            "evaluation finished"
        );
        Ok(summary)
    }

    /// Writes a checkpoint of the current state under `base_dir`.
    pub fn save_checkpoint(&self, base_dir: &Path) -> Result<CheckpointDescriptor> {
        self.write_checkpoint(base_dir, None)
    }

    fn write_checkpoint(
        &self,
        base_dir: &Path,
        max_keep: Option<usize>,
    ) -> Result<CheckpointDescriptor> {
        let snapshot = Snapshot::capture(&self.state, &self.engine)?;
        checkpoint::save_checkpoint(SaveRequest {
            base_dir,
            snapshot: &snapshot,
            config_sha256: Some(self.config_sha256.clone()),
            max_keep,
        })
    }

    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>> {
        let Some(settings) = &self.config.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        self.resume_from_path(&descriptor.directory).map(Some)
    }

    /// Downloads checkpoint `name` from the remote store into the local
    /// checkpoint directory and resumes from it.
    pub fn resume_from_remote(&mut self, name: &str) -> Result<CheckpointDescriptor> {
        let local_base: PathBuf = self
            .config
            .checkpoint
            .as_ref()
            .map(|settings| settings.directory.clone())
            .ok_or_else(|| TrainingError::runtime("no checkpoint directory configured"))?;
        let store = self
            .object_store
            .as_deref()
            .ok_or_else(|| TrainingError::runtime("no remote checkpoint store configured"))?;
        let descriptor =
            checkpoint::fetch_checkpoint(store, &self.remote_prefix, name, &local_base)?;
        self.resume_from_path(&descriptor.directory)
    }

    /// Restores a checkpoint and dispatches `AFTER_LOAD`. The next `fit`
    /// continues with the first batch the checkpointed run had not finished.
    pub fn resume_from_path(&mut self, directory: &Path) -> Result<CheckpointDescriptor> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        if outcome.manifest.config_sha256.as_deref() != Some(self.config_sha256.as_str()) {
            warn!(
                path = %directory.display(),
                "checkpoint was written with a different configuration"
            );
        }

        let manifest = outcome.manifest.clone();
        if let Err(err) = outcome.snapshot.restore(&mut self.state, &mut self.engine) {
            self.engine.abort(err.to_string());
            return Err(err);
        }
        info!(
            path = %directory.display(),
            epoch = manifest.timestamp.epoch,
            batch = manifest.timestamp.batch,
            "resumed from checkpoint"
        );

        self.run_event(Event::AfterLoad)?;
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    /// Closes observers and flushes the logger.
    pub fn close(&mut self) -> Result<()> {
        self.engine.close()
    }

    fn run_event(&mut self, event: Event) -> Result<()> {
        self.engine.run_event(event, &mut self.state).map(|_| ())
    }

    /// Wraps a failed numeric operation with the last dispatched event and
    /// aborts the engine so that the pending `After*` event never fires.
    fn guard<T>(&mut self, operation: &'static str, result: Result<T>) -> Result<T> {
        result.map_err(|source| {
            let event = self.engine.last_event().unwrap_or(Event::Init);
            let timestamp = self.state.timestamp;
            error!(%event, operation, error = %source, "numeric operation failed; aborting run");
            self.engine.abort(format!("{operation} failed"));
            TrainingError::Numeric {
                operation,
                event,
                timestamp,
                source: Box::new(source),
            }
        })
    }
}

fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

fn missing(what: &str, operation: &str) -> TrainingError {
    TrainingError::contract(format!("{what} was cleared before the {operation}"))
}
