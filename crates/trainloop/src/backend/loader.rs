use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    data::{Batch, DataLoader},
    Result, TrainingError,
};

/// Serves fixed tensors in batches, reshuffled per epoch from `(seed, epoch)`.
pub struct InMemoryLoader {
    inputs: Tensor,
    targets: Tensor,
    batch_size: usize,
    shuffle: bool,
    order: Vec<u32>,
    cursor: usize,
}

impl InMemoryLoader {
    pub fn new(inputs: Tensor, targets: Tensor, batch_size: usize, shuffle: bool) -> Result<Self> {
        let rows = inputs.dims().first().copied().unwrap_or(0);
        if rows == 0 || batch_size == 0 {
            return Err(TrainingError::runtime(
                "in-memory loader needs at least one sample and a positive batch size",
            ));
        }
        if targets.dims().first().copied() != Some(rows) {
            return Err(TrainingError::runtime(format!(
                "inputs have {rows} rows but targets have {:?}",
                targets.dims().first()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            batch_size,
            shuffle,
            order: (0..rows as u32).collect(),
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl DataLoader for InMemoryLoader {
    fn start_epoch(&mut self, epoch: u64, seed: u64) -> Result<()> {
        self.order.sort_unstable();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = Tensor::new(&self.order[self.cursor..end], self.inputs.device())?;
        self.cursor = end;

        let inputs = self.inputs.index_select(&indices, 0)?;
        let targets = self.targets.index_select(&indices, 0)?;
        Batch::new(inputs, targets).map(Some)
    }

    fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        if count as usize > remaining {
            return Err(TrainingError::checkpoint(format!(
                "cannot skip {count} batches; only {remaining} remain in the epoch"
            )));
        }
        self.cursor = (self.cursor + count as usize * self.batch_size).min(self.order.len());
        Ok(())
    }
}

/// Noisy samples of a random linear function.
pub struct SyntheticRegression {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl SyntheticRegression {
    pub fn generate(
        samples: usize,
        features: usize,
        noise: f64,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..features).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let bias: f32 = rng.gen_range(-1.0..1.0);

        let mut xs = Vec::with_capacity(samples * features);
        let mut ys = Vec::with_capacity(samples);
        for _ in 0..samples {
            let row: Vec<f32> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let clean: f32 = row.iter().zip(&weights).map(|(x, w)| x * w).sum::<f32>() + bias;
            let jitter = rng.gen_range(-1.0..1.0) * noise as f32;
            ys.push(clean + jitter);
            xs.extend(row);
        }

        Ok(Self {
            inputs: Tensor::from_vec(xs, (samples, features), device)?,
            targets: Tensor::from_vec(ys, (samples, 1), device)?,
            weights,
            bias,
        })
    }

    pub fn into_loader(self, batch_size: usize, shuffle: bool) -> Result<InMemoryLoader> {
        InMemoryLoader::new(self.inputs, self.targets, batch_size, shuffle)
    }
}
