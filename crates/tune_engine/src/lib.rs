//! Tune Engine
//!
//! Numeric runtime for adapter fine-tuning: a llama-layout causal LM built on candle,
//! low-rank adapters on its linear layers, a persistable AdamW and the masked causal loss.
//! The orchestration crate treats everything here as "load weights / forward-backward /
//! save weights".

pub mod device_utils;
pub mod fixtures;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optim;

pub use layers::{LoraAdapter, LoraLinear, RmsNorm};
pub use loss::{LabelBatch, IGNORE_INDEX};
pub use model::{CausalLm, LlamaConfig, LoraSettings, RuntimeFeatures};
pub use optim::{AdamW, GradAccumulator, ParamsAdamW};
