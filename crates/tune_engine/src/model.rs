//! Model Module - llama-layout causal LM
//!
//! - DecoderBlock: attention + SwiGLU MLP with pre-norm residuals
//! - CausalLm: embedding, blocks, final norm and LM head
//! - LlamaConfig: HF-compatible `config.json`

pub mod block;
pub mod config;
pub mod llama;

pub use block::DecoderBlock;
pub use config::LlamaConfig;
pub use llama::{CausalLm, LoraSettings, RuntimeFeatures};
