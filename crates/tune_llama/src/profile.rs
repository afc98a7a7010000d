//! Device profiles
//!
//! One `DeviceProfile` is chosen per run and drives precision, adapter sizing,
//! context length and the whole training schedule.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryClass {
    /// < 8 GB
    Low,
    /// < 16 GB
    Medium,
    High,
}

impl MemoryClass {
    pub fn from_total_mb(total_mb: usize) -> Self {
        if total_mb < 8000 {
            MemoryClass::Low
        } else if total_mb < 16000 {
            MemoryClass::Medium
        } else {
            MemoryClass::High
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub memory_class: MemoryClass,
}

/// Step cadence and optimizer settings derived from a profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSchedule {
    pub batch_size: usize,
    pub grad_accum: usize,
    pub epochs: usize,
    /// In optimizer steps.
    pub eval_every: usize,
    pub save_every: usize,
    pub retained_checkpoints: usize,
    pub learning_rate: f64,
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub patience: usize,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            memory_class: MemoryClass::Low,
        }
    }

    pub fn gpu(memory_class: MemoryClass) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            memory_class,
        }
    }

    /// Profile for an already-selected device. Accelerators are classed by total VRAM.
    pub fn detect(device: &Device) -> Self {
        if device.is_cpu() {
            return Self::cpu();
        }
        match tune_engine::device_utils::get_vram_info(0) {
            Ok(info) if info.total > 0 => {
                let class = MemoryClass::from_total_mb(info.total_mb());
                tracing::info!(
                    "[Auto-Config] Detected VRAM: {} MB Total -> {:?}",
                    info.total_mb(),
                    class
                );
                Self::gpu(class)
            }
            Ok(_) => {
                tracing::warn!("[Auto-Config] VRAM unknown, assuming a low-memory GPU");
                Self::gpu(MemoryClass::Low)
            }
            Err(e) => {
                tracing::warn!("[Auto-Config] Failed to detect VRAM: {e}");
                Self::gpu(MemoryClass::Low)
            }
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.kind == DeviceKind::Gpu
    }

    /// CPU, or a GPU with little memory.
    pub fn is_constrained(&self) -> bool {
        !self.is_gpu() || self.memory_class == MemoryClass::Low
    }

    pub fn load_dtype(&self) -> DType {
        if self.is_gpu() && self.memory_class >= MemoryClass::Medium {
            DType::F16
        } else {
            DType::F32
        }
    }

    pub fn context_length(&self) -> usize {
        match self.kind {
            DeviceKind::Cpu => 256,
            DeviceKind::Gpu => 512,
        }
    }

    /// Upper bound on examples kept after shuffling.
    pub fn dataset_cap(&self) -> Option<usize> {
        match self.kind {
            DeviceKind::Cpu => Some(1000),
            DeviceKind::Gpu => None,
        }
    }

    pub fn schedule(&self) -> TrainingSchedule {
        match (self.kind, self.memory_class) {
            (DeviceKind::Cpu, _) => TrainingSchedule {
                batch_size: 1,
                grad_accum: 16,
                epochs: 2,
                eval_every: 50,
                save_every: 50,
                retained_checkpoints: 2,
                learning_rate: 5e-5,
                warmup_ratio: 0.1,
                weight_decay: 0.05,
                max_grad_norm: 0.3,
                patience: 3,
            },
            (DeviceKind::Gpu, class) => {
                let (batch_size, grad_accum, eval_every) = match class {
                    MemoryClass::Low => (4, 8, 200),
                    MemoryClass::Medium => (8, 4, 500),
                    MemoryClass::High => (10, 4, 500),
                };
                TrainingSchedule {
                    batch_size,
                    grad_accum,
                    epochs: 3,
                    eval_every,
                    save_every: 200,
                    retained_checkpoints: 3,
                    learning_rate: 3e-4,
                    warmup_ratio: 0.1,
                    weight_decay: 0.01,
                    max_grad_norm: 1.0,
                    patience: 3,
                }
            }
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU-{:?}", self.memory_class),
        }
    }
}
