use thiserror::Error;

use crate::{event::Event, object_store::ObjectStoreError, time::Timestamp};

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("algorithm `{algorithm}` failed during {event} at {timestamp}: {source}")]
    Algorithm {
        algorithm: String,
        event: Event,
        timestamp: Timestamp,
        #[source]
        source: Box<TrainingError>,
    },

    #[error("observer `{observer}` failed during {event} at {timestamp}: {source}")]
    Observer {
        observer: String,
        event: Event,
        timestamp: Timestamp,
        #[source]
        source: Box<TrainingError>,
    },

    #[error("{operation} failed after {event} at {timestamp}: {source}")]
    Numeric {
        operation: &'static str,
        event: Event,
        timestamp: Timestamp,
        #[source]
        source: Box<TrainingError>,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    /// True for errors raised by the engine or loop because a documented
    /// contract was broken, as opposed to failures inside collaborators.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }

    /// Event during which the failure surfaced, when known.
    pub fn event(&self) -> Option<Event> {
        match self {
            Self::Algorithm { event, .. }
            | Self::Observer { event, .. }
            | Self::Numeric { event, .. } => Some(*event),
            _ => None,
        }
    }

    /// Timestamp at which the failure surfaced, when known.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Algorithm { timestamp, .. }
            | Self::Observer { timestamp, .. }
            | Self::Numeric { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
