//! Training Arguments - CLI configuration for training
//!
//! Schedule fields are optional: anything left unset comes from the device profile.

use clap::Args;
use std::path::PathBuf;

use crate::provision::{BiasPolicy, REFERENCE_MODEL};

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Base model: local directory or model-hub id
    #[arg(long, default_value = REFERENCE_MODEL)]
    pub model_id: String,

    /// Instruction lines
    #[arg(long, default_value = "improved.nl")]
    pub input_file: PathBuf,

    /// Response lines (paired with input_file by line number)
    #[arg(long, default_value = "improved.cm")]
    pub output_file: PathBuf,

    #[arg(long, default_value = "./finetuned_model")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub num_epochs: Option<usize>,

    #[arg(long)]
    pub warmup_ratio: Option<f64>,

    /// Context length used for padding/truncation
    #[arg(long)]
    pub max_length: Option<usize>,

    #[arg(long)]
    pub grad_accum: Option<usize>,

    /// Evaluations without improvement before stopping early
    #[arg(long)]
    pub patience: Option<usize>,

    /// Evaluate every N optimizer steps
    #[arg(long)]
    pub eval_steps: Option<usize>,

    /// Write a checkpoint every N optimizer steps
    #[arg(long)]
    pub save_steps: Option<usize>,

    /// Checkpoints kept on disk (the best one is always kept as well)
    #[arg(long)]
    pub save_total_limit: Option<usize>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 0.05)]
    pub test_fraction: f64,

    /// Force the use of CPU even if a GPU is available
    #[arg(long, action)]
    pub force_cpu: bool,

    /// Append per-step metrics to metrics.jsonl in the output directory
    #[arg(long, action)]
    pub track: bool,

    #[arg(long, action)]
    pub no_gradient_checkpointing: bool,

    /// Skip adapter injection and fine-tune the last block directly
    #[arg(long, action)]
    pub no_adapter: bool,

    #[arg(long, value_enum, default_value_t = BiasPolicy::None)]
    pub bias: BiasPolicy,
}

impl TrainArgs {
    /// Arguments with every optional field unset, for programmatic runs.
    pub fn new(
        model_id: impl Into<String>,
        input_file: impl Into<PathBuf>,
        output_file: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            input_file: input_file.into(),
            output_file: output_file.into(),
            output_dir: output_dir.into(),
            batch_size: None,
            learning_rate: None,
            num_epochs: None,
            warmup_ratio: None,
            max_length: None,
            grad_accum: None,
            patience: None,
            eval_steps: None,
            save_steps: None,
            save_total_limit: None,
            seed: 42,
            test_fraction: 0.05,
            force_cpu: false,
            track: false,
            no_gradient_checkpointing: false,
            no_adapter: false,
            bias: BiasPolicy::None,
        }
    }
}
