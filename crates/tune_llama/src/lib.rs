//! Tune Llama
//!
//! Fine-tuning pipeline: paired text → dataset → provisioned model (adapter or partial
//! unfreeze) → checkpointed training → merged export with a serving manifest.

pub mod cli;
pub mod collate;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod export;
pub mod generate;
pub mod profile;
pub mod provision;
pub mod scaffold;
pub mod tracking;
pub mod train;

pub use error::{PipelineError, PipelineResult, Stage};
