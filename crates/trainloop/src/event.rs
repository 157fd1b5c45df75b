//! Lifecycle events and the sequencing rules the engine enforces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Init,
    AfterLoad,
    FitStart,

    EpochStart,
    BatchStart,
    BeforeDataloader,
    AfterDataloader,
    BeforeForward,
    AfterForward,
    BeforeLoss,
    AfterLoss,
    BeforeBackward,
    AfterBackward,
    BeforeOptimizerStep,
    AfterOptimizerStep,
    BatchEnd,
    BatchCheckpoint,
    EpochEnd,
    EpochCheckpoint,

    FitEnd,

    EvalStart,
    EvalBatchStart,
    EvalBeforeForward,
    EvalAfterForward,
    EvalBatchEnd,
    EvalEnd,
}

impl Event {
    pub const ALL: [Event; 26] = [
        Event::Init,
        Event::AfterLoad,
        Event::FitStart,
        Event::EpochStart,
        Event::BatchStart,
        Event::BeforeDataloader,
        Event::AfterDataloader,
        Event::BeforeForward,
        Event::AfterForward,
        Event::BeforeLoss,
        Event::AfterLoss,
        Event::BeforeBackward,
        Event::AfterBackward,
        Event::BeforeOptimizerStep,
        Event::AfterOptimizerStep,
        Event::BatchEnd,
        Event::BatchCheckpoint,
        Event::EpochEnd,
        Event::EpochCheckpoint,
        Event::FitEnd,
        Event::EvalStart,
        Event::EvalBatchStart,
        Event::EvalBeforeForward,
        Event::EvalAfterForward,
        Event::EvalBatchEnd,
        Event::EvalEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Init => "init",
            Event::AfterLoad => "after_load",
            Event::FitStart => "fit_start",
            Event::EpochStart => "epoch_start",
            Event::BatchStart => "batch_start",
            Event::BeforeDataloader => "before_dataloader",
            Event::AfterDataloader => "after_dataloader",
            Event::BeforeForward => "before_forward",
            Event::AfterForward => "after_forward",
            Event::BeforeLoss => "before_loss",
            Event::AfterLoss => "after_loss",
            Event::BeforeBackward => "before_backward",
            Event::AfterBackward => "after_backward",
            Event::BeforeOptimizerStep => "before_optimizer_step",
            Event::AfterOptimizerStep => "after_optimizer_step",
            Event::BatchEnd => "batch_end",
            Event::BatchCheckpoint => "batch_checkpoint",
            Event::EpochEnd => "epoch_end",
            Event::EpochCheckpoint => "epoch_checkpoint",
            Event::FitEnd => "fit_end",
            Event::EvalStart => "eval_start",
            Event::EvalBatchStart => "eval_batch_start",
            Event::EvalBeforeForward => "eval_before_forward",
            Event::EvalAfterForward => "eval_after_forward",
            Event::EvalBatchEnd => "eval_batch_end",
            Event::EvalEnd => "eval_end",
        }
    }

    /// The closing event for a `Before*` event.
    pub fn after(&self) -> Option<Event> {
        match self {
            Event::BeforeDataloader => Some(Event::AfterDataloader),
            Event::BeforeForward => Some(Event::AfterForward),
            Event::BeforeLoss => Some(Event::AfterLoss),
            Event::BeforeBackward => Some(Event::AfterBackward),
            Event::BeforeOptimizerStep => Some(Event::AfterOptimizerStep),
            Event::EvalBeforeForward => Some(Event::EvalAfterForward),
            _ => None,
        }
    }

    /// The opening event for an `After*` event.
    pub fn before(&self) -> Option<Event> {
        match self {
            Event::AfterDataloader => Some(Event::BeforeDataloader),
            Event::AfterForward => Some(Event::BeforeForward),
            Event::AfterLoss => Some(Event::BeforeLoss),
            Event::AfterBackward => Some(Event::BeforeBackward),
            Event::AfterOptimizerStep => Some(Event::BeforeOptimizerStep),
            Event::EvalAfterForward => Some(Event::EvalBeforeForward),
            _ => None,
        }
    }

    pub fn is_before(&self) -> bool {
        self.after().is_some()
    }

    pub fn is_after(&self) -> bool {
        self.before().is_some()
    }

    pub fn is_eval(&self) -> bool {
        matches!(
            self,
            Event::EvalStart
                | Event::EvalBatchStart
                | Event::EvalBeforeForward
                | Event::EvalAfterForward
                | Event::EvalBatchEnd
                | Event::EvalEnd
        )
    }

    /// Name of the operation a `Before*`/`After*` pair wraps.
    pub fn section(&self) -> Option<&'static str> {
        let opening = if self.is_before() {
            *self
        } else {
            self.before()?
        };
        match opening {
            Event::BeforeDataloader => Some("dataloader"),
            Event::BeforeForward => Some("forward"),
            Event::BeforeLoss => Some("loss"),
            Event::BeforeBackward => Some("backward"),
            Event::BeforeOptimizerStep => Some("optimizer_step"),
            Event::EvalBeforeForward => Some("eval_forward"),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the lifecycle so that events reach the engine in a legal order.
///
/// `check` validates without changing anything; `commit` records an event
/// once its dispatch has completed.
#[derive(Debug, Default, Clone)]
pub(crate) struct EventSequencer {
    initialized: bool,
    open: Option<Event>,
    last: Option<Event>,
}

impl EventSequencer {
    pub(crate) fn check(&self, event: Event) -> Result<(), TrainingError> {
        if event == Event::Init {
            if self.initialized {
                return Err(TrainingError::contract("init can only fire once"));
            }
            return Ok(());
        }
        if !self.initialized {
            return Err(TrainingError::contract(format!(
                "{event} dispatched before init"
            )));
        }
        if let Some(open) = self.open {
            let expected = open.after();
            if Some(event) != expected {
                return Err(TrainingError::contract(format!(
                    "{event} dispatched while {open} is still open (expected {})",
                    expected.map(|e| e.as_str()).unwrap_or("?")
                )));
            }
            return Ok(());
        }
        if let Some(opening) = event.before() {
            return Err(TrainingError::contract(format!(
                "{event} dispatched without a preceding {opening}"
            )));
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self, event: Event) {
        if event == Event::Init {
            self.initialized = true;
        }
        if event.is_before() {
            self.open = Some(event);
        } else if event.is_after() {
            self.open = None;
        }
        self.last = Some(event);
    }

    pub(crate) fn initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn last(&self) -> Option<Event> {
        self.last
    }
}
