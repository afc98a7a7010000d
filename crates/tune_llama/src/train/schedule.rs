//! Schedule resolution and the learning-rate curve.

use serde::{Deserialize, Serialize};

use super::args::TrainArgs;
use crate::profile::{DeviceProfile, TrainingSchedule};

/// Profile defaults with CLI overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSchedule {
    pub schedule: TrainingSchedule,
    pub context_length: usize,
}

impl RunSchedule {
    pub fn resolve(profile: &DeviceProfile, args: &TrainArgs) -> Self {
        let mut schedule = profile.schedule();
        if let Some(v) = args.batch_size {
            schedule.batch_size = v.max(1);
        }
        if let Some(v) = args.grad_accum {
            schedule.grad_accum = v.max(1);
        }
        if let Some(v) = args.num_epochs {
            schedule.epochs = v;
        }
        if let Some(v) = args.learning_rate {
            schedule.learning_rate = v;
        }
        if let Some(v) = args.warmup_ratio {
            schedule.warmup_ratio = v.clamp(0.0, 1.0);
        }
        if let Some(v) = args.patience {
            schedule.patience = v;
        }
        if let Some(v) = args.eval_steps {
            schedule.eval_every = v.max(1);
        }
        if let Some(v) = args.save_steps {
            schedule.save_every = v.max(1);
        }
        if let Some(v) = args.save_total_limit {
            schedule.retained_checkpoints = v.max(1);
        }
        Self {
            schedule,
            context_length: args.max_length.unwrap_or_else(|| profile.context_length()),
        }
    }

    /// Optimizer steps per epoch for `n_train` examples. A short final window still
    /// counts as a step.
    pub fn steps_per_epoch(&self, n_train: usize) -> usize {
        let micro = n_train.div_ceil(self.schedule.batch_size.max(1));
        micro.div_ceil(self.schedule.grad_accum.max(1))
    }

    pub fn total_steps(&self, n_train: usize) -> usize {
        self.steps_per_epoch(n_train) * self.schedule.epochs
    }
}

/// Linear warmup then cosine decay to `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub peak_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LrSchedule {
    pub fn new(peak_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        Self {
            peak_lr,
            min_lr: 0.0,
            warmup_steps: (total_steps as f64 * warmup_ratio).ceil() as usize,
            total_steps,
        }
    }

    /// Learning rate for the optimizer update that produces step `step` (1-based).
    pub fn at(&self, step: usize) -> f64 {
        let step = step.max(1);
        if step <= self.warmup_steps {
            self.peak_lr * (step as f64 / self.warmup_steps as f64)
        } else {
            let progress = (step - self.warmup_steps) as f64
                / (self.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
            let progress = progress.clamp(0.0, 1.0);
            let cosine = (progress * std::f64::consts::PI).cos();
            let decay = 0.5 * (1.0 + cosine);
            self.min_lr + (self.peak_lr - self.min_lr) * decay
        }
    }
}
