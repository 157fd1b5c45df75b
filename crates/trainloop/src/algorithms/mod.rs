mod early_stopping;
mod gradient_clipping;

pub use early_stopping::EarlyStopping;
pub use gradient_clipping::GradientClipping;

use crate::{algorithm::Algorithm, config::AlgorithmsConfig};

/// Instantiates the algorithms enabled in `[algorithms]`.
pub fn from_config(config: &AlgorithmsConfig) -> Vec<Box<dyn Algorithm>> {
    let mut algorithms: Vec<Box<dyn Algorithm>> = Vec::new();
    if let Some(clipping) = &config.gradient_clipping {
        algorithms.push(Box::new(GradientClipping::new(clipping.max_norm)));
    }
    if let Some(early) = &config.early_stopping {
        let stopping = EarlyStopping::new(early.metric.clone(), early.patience)
            .with_min_delta(early.min_delta);
        algorithms.push(Box::new(stopping));
    }
    algorithms
}
