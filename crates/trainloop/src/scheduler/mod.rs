use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, Result, TrainingError};

/// Learning-rate schedule driving one optimizer.
///
/// `learning_rate` is the rate for the next optimizer step and is valid
/// before the first call to `step`.
pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the new rate.
    fn step(&mut self) -> f64;

    fn learning_rate(&self) -> f64;

    /// Multiplies every future rate by `factor`.
    fn scale_learning_rate(&mut self, factor: f64);

    fn snapshot(&self) -> SchedulerState;

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: SchedulerKind,
    pub step: u64,
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    LinearWarmupCosine,
    ConstantWithWarmup,
    PolynomialDecay,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    LinearWarmupCosine {
        base_lr: f64,
        total_steps: u64,
        warmup_proportion: f64,
        min_lr: f64,
    },
    ConstantWithWarmup {
        base_lr: f64,
        total_steps: u64,
        warmup_proportion: f64,
    },
    PolynomialDecay {
        base_lr: f64,
        total_steps: u64,
        warmup_proportion: f64,
        min_lr: f64,
        power: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: u64,
    ) -> Result<Self> {
        if total_steps == 0 {
            return Err(TrainingError::validation(vec![
                "scheduler requires total_steps greater than zero".to_string(),
            ]));
        }

        if let Some(cfg_total) = cfg.total_steps {
            if cfg_total != total_steps {
                return Err(TrainingError::validation(vec![format!(
                    "scheduler total_steps mismatch between runtime ({total_steps}) and config ({cfg_total})"
                )]));
            }
        }

        let warmup_steps = cfg.warmup_steps.unwrap_or(0);
        let warmup_proportion = (warmup_steps as f64 / total_steps as f64).clamp(0.0, 1.0);
        let min_lr = cfg.min_lr.unwrap_or(0.0);

        match cfg.strategy {
            config::LearningRateSchedule::Constant | config::LearningRateSchedule::LinearWarmup => {
                Ok(SchedulerConfig::ConstantWithWarmup {
                    base_lr,
                    total_steps,
                    warmup_proportion,
                })
            }
            config::LearningRateSchedule::Cosine
            | config::LearningRateSchedule::CosineWithWarmup => {
                Ok(SchedulerConfig::LinearWarmupCosine {
                    base_lr,
                    total_steps,
                    warmup_proportion,
                    min_lr,
                })
            }
            config::LearningRateSchedule::Polynomial => {
                let power = cfg.power.unwrap_or(1.0);
                Ok(SchedulerConfig::PolynomialDecay {
                    base_lr,
                    total_steps,
                    warmup_proportion,
                    min_lr,
                    power: if power <= 0.0 { 1.0 } else { power },
                })
            }
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>> {
        match self {
            SchedulerConfig::LinearWarmupCosine {
                base_lr,
                total_steps,
                warmup_proportion,
                min_lr,
            } => Ok(Box::new(LinearWarmupCosine::new(
                base_lr,
                min_lr,
                total_steps,
                warmup_proportion,
            )?)),
            SchedulerConfig::ConstantWithWarmup {
                base_lr,
                total_steps,
                warmup_proportion,
            } => Ok(Box::new(ConstantWithWarmup::new(
                base_lr,
                total_steps,
                warmup_proportion,
            )?)),
            SchedulerConfig::PolynomialDecay {
                base_lr,
                total_steps,
                warmup_proportion,
                min_lr,
                power,
            } => Ok(Box::new(PolynomialDecay::new(
                base_lr,
                min_lr,
                total_steps,
                warmup_proportion,
                power,
            )?)),
        }
    }
}

/// Step counter and scale shared by every schedule.
#[derive(Debug, Clone)]
struct Progress {
    kind: SchedulerKind,
    step: u64,
    scale: f64,
}

impl Progress {
    fn new(kind: SchedulerKind) -> Self {
        Self {
            kind,
            step: 0,
            scale: 1.0,
        }
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: self.kind,
            step: self.step,
            scale: self.scale,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(TrainingError::contract(format!(
                "scheduler snapshot is for {:?}, not {:?}",
                state.kind, self.kind
            )));
        }
        if !(state.scale.is_finite() && state.scale > 0.0) {
            return Err(TrainingError::contract(format!(
                "scheduler snapshot has invalid scale {}",
                state.scale
            )));
        }
        self.step = state.step;
        self.scale = state.scale;
        Ok(())
    }
}

pub struct LinearWarmupCosine {
    base_lr: f64,
    min_lr: f64,
    total_steps: u64,
    warmup_steps: u64,
    progress: Progress,
}

impl LinearWarmupCosine {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        total_steps: u64,
        warmup_proportion: f64,
    ) -> Result<Self> {
        validate_base_lr(base_lr)?;
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::validation(vec![
                "scheduler min_lr must be in [0, base_lr]".to_string(),
            ]));
        }
        Ok(Self {
            base_lr,
            min_lr,
            total_steps: total_steps.max(1),
            warmup_steps: compute_warmup_steps(total_steps, warmup_proportion),
            progress: Progress::new(SchedulerKind::LinearWarmupCosine),
        })
    }

    fn compute_lr(&self, step: u64) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }

        if self.total_steps <= self.warmup_steps {
            return self.base_lr.max(self.min_lr);
        }

        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let denom = (self.total_steps - self.warmup_steps).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

pub struct ConstantWithWarmup {
    base_lr: f64,
    warmup_steps: u64,
    progress: Progress,
}

impl ConstantWithWarmup {
    pub fn new(base_lr: f64, total_steps: u64, warmup_proportion: f64) -> Result<Self> {
        validate_base_lr(base_lr)?;
        Ok(Self {
            base_lr,
            warmup_steps: compute_warmup_steps(total_steps, warmup_proportion),
            progress: Progress::new(SchedulerKind::ConstantWithWarmup),
        })
    }

    pub fn constant(base_lr: f64) -> Result<Self> {
        Self::new(base_lr, 1, 0.0)
    }

    fn compute_lr(&self, step: u64) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            self.base_lr * progress
        } else {
            self.base_lr
        }
    }
}

pub struct PolynomialDecay {
    base_lr: f64,
    min_lr: f64,
    power: f64,
    total_steps: u64,
    warmup_steps: u64,
    progress: Progress,
}

impl PolynomialDecay {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        total_steps: u64,
        warmup_proportion: f64,
        power: f64,
    ) -> Result<Self> {
        validate_base_lr(base_lr)?;
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::validation(vec![
                "scheduler min_lr must be in [0, base_lr]".to_string(),
            ]));
        }
        Ok(Self {
            base_lr,
            min_lr,
            power: if power <= 0.0 { 1.0 } else { power },
            total_steps: total_steps.max(1),
            warmup_steps: compute_warmup_steps(total_steps, warmup_proportion),
            progress: Progress::new(SchedulerKind::PolynomialDecay),
        })
    }

    fn compute_lr(&self, step: u64) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }

        if self.total_steps <= self.warmup_steps {
            return self.min_lr;
        }

        let denom = (self.total_steps - self.warmup_steps).max(1) as f64;
        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let decay = (1.0 - progress).max(0.0).powf(self.power);
        self.min_lr + (self.base_lr - self.min_lr) * decay
    }
}

macro_rules! impl_lr_scheduler {
    ($ty:ty) => {
        impl LRScheduler for $ty {
            fn step(&mut self) -> f64 {
                self.progress.step = self.progress.step.saturating_add(1);
                self.learning_rate()
            }

            fn learning_rate(&self) -> f64 {
                self.compute_lr(self.progress.step) * self.progress.scale
            }

            fn scale_learning_rate(&mut self, factor: f64) {
                self.progress.scale *= factor;
            }

            fn snapshot(&self) -> SchedulerState {
                self.progress.snapshot()
            }

            fn load_snapshot(&mut self, state: &SchedulerState) -> Result<()> {
                self.progress.restore(state)
            }
        }
    };
}

impl_lr_scheduler!(LinearWarmupCosine);
impl_lr_scheduler!(ConstantWithWarmup);
impl_lr_scheduler!(PolynomialDecay);

fn validate_base_lr(base_lr: f64) -> Result<()> {
    if base_lr <= 0.0 {
        return Err(TrainingError::validation(vec![
            "scheduler requires base learning rate > 0".to_string(),
        ]));
    }
    Ok(())
}

fn compute_warmup_steps(total_steps: u64, proportion: f64) -> u64 {
    if total_steps == 0 {
        return 0;
    }
    let clamped = proportion.clamp(0.0, 1.0);
    let steps = (clamped * total_steps as f64).round() as u64;
    steps.min(total_steps)
}
