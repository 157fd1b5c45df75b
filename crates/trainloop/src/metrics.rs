use serde::{Deserialize, Serialize};

use crate::float;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    #[serde(with = "float::option")]
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Sample-weighted loss accumulator for one evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    sample_count: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, samples: u64) {
        self.loss_sum += loss * samples as f64;
        self.sample_count += samples;
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.sample_count == 0 {
            None
        } else {
            Some(EvaluationSummary {
                average_loss: self.loss_sum / self.sample_count as f64,
                batches: self.batches,
                samples: self.sample_count,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub batches: usize,
    pub samples: u64,
}
