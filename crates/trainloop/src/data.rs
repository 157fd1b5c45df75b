use candle_core::Tensor;

use crate::{Result, TrainingError};

/// Inputs and targets for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub samples: u64,
    pub tokens: u64,
}

impl Batch {
    /// Samples are read from the leading dimension of `inputs`; tokens default
    /// to one per sample.
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self> {
        let samples = inputs.dims().first().copied().ok_or_else(|| {
            TrainingError::runtime("batch inputs must have a leading batch dimension")
        })? as u64;
        Ok(Self {
            inputs,
            targets,
            samples,
            tokens: samples,
        })
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Source of batches for one pass over a dataset.
///
/// The loop calls `start_epoch` before pulling batches and expects exactly
/// `batches_per_epoch` batches afterwards. The order must depend only on
/// `(epoch, seed)` so that a resumed run sees the same batches.
pub trait DataLoader: Send {
    fn start_epoch(&mut self, epoch: u64, seed: u64) -> Result<()>;

    fn next_batch(&mut self) -> Result<Option<Batch>>;

    fn batches_per_epoch(&self) -> usize;

    /// Discards `count` batches. Used to re-enter an epoch after a resume.
    fn skip(&mut self, count: u64) -> Result<()> {
        for skipped in 0..count {
            if self.next_batch()?.is_none() {
                return Err(TrainingError::checkpoint(format!(
                    "checkpoint references batch {count} but the loader ran out after {skipped}"
                )));
            }
        }
        Ok(())
    }
}
