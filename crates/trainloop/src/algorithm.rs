use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{event::Event, logging::Logger, state::State, Result, TrainingError};

/// A technique that reads or mutates the training state at lifecycle events.
///
/// The engine asks every registered algorithm whether it `matches` an event
/// and then calls `apply` on those that do, lowest priority first. `matches`
/// must not mutate the state.
pub trait Algorithm: Send {
    /// Unique within an engine; keys the algorithm's checkpoint entry.
    fn name(&self) -> &str;

    /// Lower runs first. `None` sorts as `0`; ties keep registration order.
    fn priority(&self) -> Option<i32> {
        None
    }

    fn matches(&self, event: Event, state: &State) -> bool;

    fn apply(&mut self, event: Event, state: &mut State, logger: &mut Logger) -> Result<Trace>;

    /// Persistent sub-state to include in checkpoints.
    fn state_dict(&self) -> Option<Value> {
        None
    }

    fn load_state_dict(&mut self, _state: Value) -> Result<()> {
        Err(TrainingError::contract(format!(
            "algorithm `{}` has no persistent state to load",
            self.name()
        )))
    }
}

/// What an algorithm did during one `apply` call.
///
/// The engine fills in `algorithm` and `event`; the algorithm reports which
/// state attributes it touched and a short summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub algorithm: String,
    pub event: Event,
    pub touched: Vec<String>,
    pub summary: String,
}

impl Trace {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            algorithm: String::new(),
            event: Event::Init,
            touched: Vec::new(),
            summary: summary.into(),
        }
    }

    pub fn touched(mut self, attribute: impl Into<String>) -> Self {
        self.touched.push(attribute.into());
        self
    }

    pub(crate) fn stamp(mut self, algorithm: &str, event: Event) -> Self {
        self.algorithm = algorithm.to_string();
        self.event = event;
        self
    }
}
