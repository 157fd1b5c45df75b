use candle_core::{backprop::GradStore, Var};
use candle_nn::{Optimizer as _, SGD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{model::Optimizer, Result, TrainingError};

/// Plain stochastic gradient descent over candle's `SGD`.
pub struct Sgd {
    inner: SGD,
}

#[derive(Debug, Serialize, Deserialize)]
struct SgdState {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        Ok(Self {
            inner: SGD::new(vars, learning_rate)?,
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        Ok(self.inner.step(grads)?)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn state_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(SgdState {
            learning_rate: self.inner.learning_rate(),
        })?)
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        let state: SgdState = serde_json::from_value(state.clone())
            .map_err(|err| TrainingError::contract(format!("malformed optimizer state: {err}")))?;
        self.inner.set_learning_rate(state.learning_rate);
        Ok(())
    }
}
