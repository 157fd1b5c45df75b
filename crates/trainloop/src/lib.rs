pub mod algorithm;
pub mod algorithms;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod event;
pub mod float;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod object_store;
pub mod observer;
pub mod profiler;
pub mod scheduler;
pub mod state;
pub mod time;
pub mod trainer;

pub use algorithm::{Algorithm, Trace};
pub use config::TrainingConfig;
pub use data::{Batch, DataLoader};
pub use engine::{Engine, MatchPurity};
pub use error::{Result, TrainingError};
pub use event::Event;
pub use logging::{Logger, LoggerDestination};
pub use model::{Model, Optimizer};
pub use object_store::{ObjectStore, ObjectStoreError, VolumeObjectStore};
pub use observer::{Observer, TracingObserver};
pub use profiler::{ProfileReport, Profiler};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use state::State;
pub use time::{Time, TimeUnit, Timestamp};
pub use trainer::{Trainer, TrainerBuilder};
