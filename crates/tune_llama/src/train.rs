//! Train Module - end-to-end fine-tuning pipeline
//!
//! - args: CLI arguments for training
//! - schedule: profile defaults + overrides, cosine learning rate
//! - checkpoint: atomic `checkpoint-<step>` directories
//! - training_loop: the orchestrator state machine

pub mod args;
pub mod checkpoint;
pub mod schedule;
pub mod training_loop;

pub use args::TrainArgs;
pub use checkpoint::{Checkpoint, CheckpointStore, TrainerState};
pub use schedule::{LrSchedule, RunSchedule};
pub use training_loop::{
    Outcome, Phase, RunReport, RunSummary, TrainingOrchestrator, RUN_SUMMARY_FILE,
};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::collate::Collator;
use crate::config::RuntimeEnv;
use crate::data::DatasetBuilder;
use crate::error::PipelineResult;
use crate::profile::DeviceProfile;
use crate::provision::{AdapterMode, ModelProvisioner, ProvisionRequest};

/// Dataset → provision → tokenize → train, on the device `args` selects.
pub fn run(args: &TrainArgs, env: RuntimeEnv, stop: Arc<AtomicBool>) -> PipelineResult<RunReport> {
    info!("--- Fine-tuning {} ---", args.model_id);
    let device = tune_engine::device_utils::select_device(args.force_cpu);
    let profile = DeviceProfile::detect(&device);
    let run = RunSchedule::resolve(&profile, args);
    info!(
        "🖥️ Profile {} | context {} | batch {} x accum {} | epochs {} | lr {:e}",
        profile,
        run.context_length,
        run.schedule.batch_size,
        run.schedule.grad_accum,
        run.schedule.epochs,
        run.schedule.learning_rate
    );

    let dataset = DatasetBuilder::new(args.seed)
        .with_test_fraction(args.test_fraction)
        .with_cap(profile.dataset_cap())
        .build_from_files(&args.input_file, &args.output_file)?;

    let mut req = ProvisionRequest::new(&args.model_id, profile, device);
    req.adapter_mode = if args.no_adapter {
        AdapterMode::Disabled
    } else {
        AdapterMode::Auto
    };
    req.bias = args.bias;
    req.gradient_checkpointing = !args.no_gradient_checkpointing;
    req.seed = args.seed;
    let provisioned = ModelProvisioner::new(env).provision(&req)?;
    if provisioned.fallback_used {
        info!("ℹ️ Training on fallback model {}", provisioned.model_id);
    }

    let max_positions = provisioned.model.model().config().max_position_embeddings;
    let context_length = if run.context_length > max_positions {
        info!(
            "Context length {} exceeds the model's {} positions, clamping",
            run.context_length, max_positions
        );
        max_positions
    } else {
        run.context_length
    };
    let run = RunSchedule {
        context_length,
        ..run
    };

    let collator = Collator::new(&provisioned.tokenizer, run.context_length);
    let train = collator.encode_all(&dataset.train)?;
    let validation = collator.encode_all(&dataset.validation)?;

    TrainingOrchestrator::new(&args.output_dir, run, provisioned.model_id.clone())
        .with_tracking(args.track)
        .with_stop_flag(stop)
        .run(
            provisioned.model.as_ref(),
            &provisioned.tokenizer,
            &train,
            &validation,
        )
}
