//! Small candle-based model, optimizer and loader implementing the numeric
//! capabilities. Used by the `train` binary and by the tests.

mod linear;
mod loader;
mod sgd;

pub use linear::LinearRegressor;
pub use loader::{InMemoryLoader, SyntheticRegression};
pub use sgd::Sgd;
