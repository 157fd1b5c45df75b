use candle_core::DType;

use crate::{
    algorithm::{Algorithm, Trace},
    event::Event,
    logging::Logger,
    state::State,
    Result,
};

/// Rescales gradients so that their global L2 norm is at most `max_norm`.
#[derive(Debug, Clone)]
pub struct GradientClipping {
    max_norm: f64,
}

impl GradientClipping {
    pub fn new(max_norm: f64) -> Self {
        Self { max_norm }
    }
}

impl Algorithm for GradientClipping {
    fn name(&self) -> &str {
        "gradient_clipping"
    }

    fn matches(&self, event: Event, state: &State) -> bool {
        event == Event::AfterBackward && state.grads.is_some()
    }

    fn apply(&mut self, _event: Event, state: &mut State, logger: &mut Logger) -> Result<Trace> {
        let parameters = state.model.parameters();
        let Some(grads) = state.grads.as_mut() else {
            return Ok(Trace::new("no gradients to clip"));
        };

        let mut sum_squares = 0.0f64;
        for (_, var) in &parameters {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_squares += grad
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64;
            }
        }
        let total_norm = sum_squares.sqrt();
        logger.log_metric(&state.timestamp, "grad_norm", total_norm)?;

        if total_norm <= self.max_norm {
            return Ok(Trace::new(format!(
                "global norm {total_norm:.4} within {:.4}",
                self.max_norm
            )));
        }

        let clip_coef = self.max_norm / (total_norm + 1e-6);
        for (_, var) in &parameters {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * clip_coef)?);
            }
        }

        Ok(Trace::new(format!(
            "clipped global norm {total_norm:.4} to {:.4}",
            self.max_norm
        ))
        .touched("grads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::LinearRegressor, data::Batch, model::Model, time::Time};
    use candle_core::{Device, Tensor};

    fn state_with_grads() -> State {
        let device = Device::Cpu;
        let model = LinearRegressor::new(2, &device).unwrap();
        let batch = Batch::new(
            Tensor::new(&[[10f32, -10.0], [5.0, 5.0]], &device).unwrap(),
            Tensor::new(&[[30f32], [-20.0]], &device).unwrap(),
        )
        .unwrap();
        let outputs = model.forward(&batch).unwrap();
        let loss = model.compute_loss(&outputs, &batch).unwrap();
        let grads = model.backward(&loss).unwrap();

        let mut state = State::new(Box::new(model), Time::epochs(1), 0);
        state.grads = Some(grads);
        state
    }

    fn global_norm(state: &State) -> f64 {
        let grads = state.grads.as_ref().unwrap();
        state
            .model
            .parameters()
            .iter()
            .filter_map(|(_, var)| grads.get(var.as_tensor()))
            .map(|g| g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() as f64)
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn clips_large_gradients_to_max_norm() {
        let mut state = state_with_grads();
        assert!(global_norm(&state) > 1.0);

        let mut clipping = GradientClipping::new(1.0);
        assert!(clipping.matches(Event::AfterBackward, &state));
        assert!(!clipping.matches(Event::BeforeBackward, &state));

        let trace = clipping
            .apply(Event::AfterBackward, &mut state, &mut Logger::new())
            .unwrap();
        assert_eq!(trace.touched, vec!["grads".to_string()]);
        assert!((global_norm(&state) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn leaves_small_gradients_alone() {
        let mut state = state_with_grads();
        let before = global_norm(&state);
        let trace = GradientClipping::new(before * 2.0)
            .apply(Event::AfterBackward, &mut state, &mut Logger::new())
            .unwrap();
        assert!(trace.touched.is_empty());
        assert!((global_norm(&state) - before).abs() < 1e-9);
    }
}
