use tracing::{debug, info};

use crate::{algorithm::Trace, event::Event, state::State, Result};

/// Read-only listener notified after every algorithm has run for an event.
///
/// An error from `on_event` aborts the run.
pub trait Observer: Send {
    fn name(&self) -> &str;

    fn on_event(&mut self, event: Event, state: &State, traces: &[Trace]) -> Result<()>;

    /// Called once when the trainer shuts down.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits a `tracing` record for every event and every algorithm trace.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    name: String,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self {
            name: "tracing".to_string(),
        }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for TracingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&mut self, event: Event, state: &State, traces: &[Trace]) -> Result<()> {
        let ts = state.timestamp;
        match event {
            Event::Init
            | Event::AfterLoad
            | Event::FitStart
            | Event::EpochStart
            | Event::EpochEnd
            | Event::FitEnd
            | Event::EvalStart
            | Event::EvalEnd
            | Event::BatchCheckpoint
            | Event::EpochCheckpoint => {
                info!(%event, epoch = ts.epoch, batch = ts.batch, "lifecycle event");
            }
            _ => {
                debug!(%event, epoch = ts.epoch, batch = ts.batch, "event");
            }
        }
        for trace in traces {
            info!(
                %event,
                algorithm = %trace.algorithm,
                touched = ?trace.touched,
                batch = ts.batch,
                "{}",
                trace.summary
            );
        }
        Ok(())
    }
}
