use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    algorithm::{Algorithm, Trace},
    event::Event,
    logging::Logger,
    state::State,
    Result, TrainingError,
};

/// Requests a stop once the epoch mean of a metric has failed to improve
/// (decrease by more than `min_delta`) for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    metric: String,
    patience: u32,
    min_delta: f64,
    progress: Progress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Progress {
    best: Option<f64>,
    bad_epochs: u32,
}

impl EarlyStopping {
    pub fn new(metric: impl Into<String>, patience: u32) -> Self {
        Self {
            metric: metric.into(),
            patience,
            min_delta: 0.0,
            progress: Progress::default(),
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    pub fn best(&self) -> Option<f64> {
        self.progress.best
    }
}

impl Algorithm for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn matches(&self, event: Event, _state: &State) -> bool {
        event == Event::EpochEnd
    }

    fn apply(&mut self, _event: Event, state: &mut State, logger: &mut Logger) -> Result<Trace> {
        let Some(values) = state.metrics.get(&self.metric).filter(|v| !v.is_empty()) else {
            return Ok(Trace::new(format!("metric `{}` not recorded this epoch", self.metric)));
        };
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        logger.log_metric(&state.timestamp, &format!("{}/epoch_mean", self.metric), mean)?;

        let improved = match self.progress.best {
            Some(best) => mean < best - self.min_delta,
            None => true,
        };
        if improved {
            self.progress.best = Some(mean);
            self.progress.bad_epochs = 0;
            return Ok(Trace::new(format!("{} improved to {mean:.6}", self.metric)));
        }

        self.progress.bad_epochs += 1;
        if self.progress.bad_epochs >= self.patience {
            state.stop_requested = true;
            return Ok(Trace::new(format!(
                "{} has not improved for {} epochs; stopping",
                self.metric, self.progress.bad_epochs
            ))
            .touched("stop_requested"));
        }
        Ok(Trace::new(format!(
            "{} did not improve ({}/{})",
            self.metric, self.progress.bad_epochs, self.patience
        )))
    }

    fn state_dict(&self) -> Option<Value> {
        serde_json::to_value(&self.progress).ok()
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        self.progress = serde_json::from_value(state).map_err(|err| {
            TrainingError::contract(format!("malformed early stopping state: {err}"))
        })?;
        Ok(())
    }
}
