//! Numeric capabilities the loop drives: the model and its optimizers.
//!
//! The loop never computes anything itself; it calls these at the right
//! point between a `Before*` and an `After*` event.

use std::collections::{BTreeMap, HashMap};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{data::Batch, float::Float, Result, TrainingError};

pub trait Model: Send {
    fn forward(&self, batch: &Batch) -> Result<Tensor>;

    fn compute_loss(&self, outputs: &Tensor, batch: &Batch) -> Result<Tensor>;

    fn backward(&self, loss: &Tensor) -> Result<GradStore> {
        Ok(loss.backward()?)
    }

    /// Named trainable parameters, in a stable order.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn state_dict(&self) -> Result<Value> {
        let mut records = BTreeMap::new();
        for (name, var) in self.parameters() {
            records.insert(name, TensorRecord::from_tensor(var.as_tensor())?);
        }
        Ok(serde_json::to_value(records)?)
    }

    /// Checks every parameter against the checkpoint before writing any of
    /// them, so a rejected state leaves the model untouched.
    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        let mut records: HashMap<String, TensorRecord> = serde_json::from_value(state.clone())
            .map_err(|err| TrainingError::contract(format!("malformed model state: {err}")))?;

        let mut updates = Vec::new();
        for (name, var) in self.parameters() {
            let record = records.remove(&name).ok_or_else(|| {
                TrainingError::contract(format!("checkpoint missing parameter {name}"))
            })?;
            let tensor = record.to_tensor(var.as_tensor())?;
            updates.push((var, tensor));
        }

        if !records.is_empty() {
            let mut extra = records.into_keys().collect::<Vec<_>>();
            extra.sort();
            return Err(TrainingError::contract(format!(
                "checkpoint contains unused parameters: {}",
                extra.join(", ")
            )));
        }

        for (var, tensor) in updates {
            var.set(&tensor)?;
        }
        Ok(())
    }
}

pub trait Optimizer: Send {
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    /// Gradients are produced fresh by every backward pass, so most
    /// optimizers have nothing to clear.
    fn zero_grad(&mut self) -> Result<()> {
        Ok(())
    }

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<Value>;

    fn load_state_dict(&mut self, state: &Value) -> Result<()>;
}

/// Element values of a stored tensor. Floating point dtypes are widened to
/// `f64` and integer dtypes to `i64`, both of which hold every value of the
/// narrower types exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorValues {
    Float(Vec<Float>),
    Int(Vec<i64>),
}

/// Parameter values as stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub values: TensorValues,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let dtype = tensor.dtype();
        let values = if dtype.is_float() {
            let values = flat.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            TensorValues::Float(values.into_iter().map(Float).collect())
        } else {
            TensorValues::Int(flat.to_dtype(DType::I64)?.to_vec1::<i64>()?)
        };
        Ok(Self {
            dtype: dtype.as_str().to_string(),
            shape: tensor.dims().to_vec(),
            values,
        })
    }

    /// Rebuilds the tensor on the device of `like`, which must have the
    /// recorded dtype and shape.
    pub fn to_tensor(&self, like: &Tensor) -> Result<Tensor> {
        if self.dtype != like.dtype().as_str() {
            return Err(TrainingError::contract(format!(
                "parameter dtype mismatch: checkpoint {}, model {}",
                self.dtype,
                like.dtype().as_str()
            )));
        }
        if self.shape != like.dims() {
            return Err(TrainingError::contract(format!(
                "parameter shape mismatch: checkpoint {:?}, model {:?}",
                self.shape,
                like.dims()
            )));
        }
        let shape = self.shape.as_slice();
        let tensor = match &self.values {
            TensorValues::Float(values) => {
                let values: Vec<f64> = values.iter().map(|value| value.0).collect();
                Tensor::from_vec(values, shape, like.device())?
            }
            TensorValues::Int(values) => Tensor::from_vec(values.clone(), shape, like.device())?,
        };
        Ok(tensor.to_dtype(like.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::State, time::Time};
    use candle_core::Device;

    /// One `f64` parameter and nothing to compute.
    struct Scalar {
        value: Var,
    }

    impl Scalar {
        fn new(value: f64) -> Self {
            let tensor = Tensor::new(&[value], &Device::Cpu).unwrap();
            Self {
                value: Var::from_tensor(&tensor).unwrap(),
            }
        }

        fn get(&self) -> f64 {
            self.value.as_tensor().to_vec1::<f64>().unwrap()[0]
        }
    }

    impl Model for Scalar {
        fn forward(&self, batch: &Batch) -> Result<Tensor> {
            Ok(batch.inputs.clone())
        }

        fn compute_loss(&self, outputs: &Tensor, _batch: &Batch) -> Result<Tensor> {
            Ok(outputs.sum_all()?)
        }

        fn parameters(&self) -> Vec<(String, Var)> {
            vec![("value".to_string(), self.value.clone())]
        }

        fn set_training(&mut self, _training: bool) {}

        fn is_training(&self) -> bool {
            true
        }
    }

    #[test]
    fn f64_parameters_round_trip_exactly() {
        let source = Scalar::new(0.1);
        let state = source.state_dict().unwrap();
        assert_eq!(state["value"]["dtype"], "f64");

        let mut restored = Scalar::new(0.0);
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored.get(), 0.1);
    }

    #[test]
    fn dtype_mismatch_leaves_the_model_untouched() {
        let mut state = Scalar::new(0.5).state_dict().unwrap();
        state["value"]["dtype"] = Value::from("f32");

        let mut target = Scalar::new(2.0);
        let err = target.load_state_dict(&state).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(target.get(), 2.0);
    }

    #[test]
    fn integer_tensors_keep_their_values() {
        let tensor = Tensor::new(&[3u32, 7, u32::MAX], &Device::Cpu).unwrap();
        let record = TensorRecord::from_tensor(&tensor).unwrap();
        assert_eq!(
            record.values,
            TensorValues::Int(vec![3, 7, i64::from(u32::MAX)])
        );
        let rebuilt = record.to_tensor(&tensor).unwrap();
        assert_eq!(rebuilt.to_vec1::<u32>().unwrap(), vec![3, 7, u32::MAX]);
    }

    #[test]
    fn fingerprint_sees_changes_below_f32_precision() {
        let model = Scalar::new(1.0);
        let value = model.value.clone();
        let state = State::new(Box::new(model), Time::epochs(1), 0);
        let before = state.fingerprint().unwrap();

        let nudged = Tensor::new(&[1.0 + 1e-12], &Device::Cpu).unwrap();
        value.set(&nudged).unwrap();
        assert_ne!(before, state.fingerprint().unwrap());
    }
}
