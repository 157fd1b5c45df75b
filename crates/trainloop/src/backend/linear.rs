use candle_core::{DType, Device, Tensor, Var};

use crate::{data::Batch, model::Model, Result};

/// `y = x · w + b` with a mean-squared-error loss.
pub struct LinearRegressor {
    weight: Var,
    bias: Var,
    training: bool,
}

impl LinearRegressor {
    /// Zero-initialised, so every run starts from the same point.
    pub fn new(features: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::zeros((features, 1), DType::F32, device)?,
            bias: Var::zeros(1, DType::F32, device)?,
            training: true,
        })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }
}

impl Model for LinearRegressor {
    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let outputs = batch
            .inputs
            .matmul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;
        Ok(outputs)
    }

    fn compute_loss(&self, outputs: &Tensor, batch: &Batch) -> Result<Tensor> {
        Ok(candle_nn::loss::mse(outputs, &batch.targets)?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dict_round_trips_parameters() {
        let device = Device::Cpu;
        let source = LinearRegressor::new(3, &device).unwrap();
        source
            .weight()
            .set(&Tensor::new(&[[0.5f32], [-1.25], [2.0]], &device).unwrap())
            .unwrap();
        source
            .bias()
            .set(&Tensor::new(&[0.75f32], &device).unwrap())
            .unwrap();

        let mut target = LinearRegressor::new(3, &device).unwrap();
        target.load_state_dict(&source.state_dict().unwrap()).unwrap();
        assert_eq!(
            target.weight().as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.5, -1.25, 2.0]
        );

        let mut wrong_shape = LinearRegressor::new(2, &device).unwrap();
        let err = wrong_shape
            .load_state_dict(&source.state_dict().unwrap())
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn forward_and_loss_have_expected_shapes() {
        let device = Device::Cpu;
        let model = LinearRegressor::new(2, &device).unwrap();
        let inputs = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device).unwrap();
        let targets = Tensor::new(&[[1f32], [1.0]], &device).unwrap();
        let batch = Batch::new(inputs, targets).unwrap();

        let outputs = model.forward(&batch).unwrap();
        assert_eq!(outputs.dims(), &[2, 1]);
        let loss = model.compute_loss(&outputs, &batch).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 1.0);
    }
}
