#![allow(dead_code)]

use anyhow::Result;
use candle_core::Device;
use std::path::{Path, PathBuf};
use tune_engine::fixtures::{self, FixtureOptions};
use tune_llama::collate::{Collator, TokenizedExample};
use tune_llama::config::RuntimeEnv;
use tune_llama::data::{Dataset, DatasetBuilder};
use tune_llama::profile::DeviceProfile;
use tune_llama::provision::{ModelProvisioner, ProvisionRequest, Provisioned, TokenizerHandle};
use tune_llama::train::RunSchedule;

pub const SCENARIO_INPUTS: [&str; 4] = [
    "list files",
    "find largest files",
    "check disk space with a command that is quite long indeed",
    "search text in files",
];
pub const SCENARIO_OUTPUTS: [&str; 4] = ["ls -la", "du -sh * | sort -rh | head", "df -h", "grep -rn pattern ."];

pub fn tiny_model(root: &Path, name: &str, opts: &FixtureOptions) -> Result<PathBuf> {
    let dir = root.join(name);
    fixtures::write_tiny_model(&dir, opts)?;
    Ok(dir)
}

/// Environment that never points at a shared cache.
pub fn env(root: &Path) -> RuntimeEnv {
    RuntimeEnv {
        cache_dir: root.join("cache"),
        ..Default::default()
    }
}

/// CPU request with no hub fallback.
pub fn cpu_request(model_dir: &Path) -> ProvisionRequest {
    let mut req = ProvisionRequest::new(
        model_dir.to_string_lossy(),
        DeviceProfile::cpu(),
        Device::Cpu,
    );
    req.fallback_models = Vec::new();
    req
}

pub fn provision(root: &Path, model_dir: &Path) -> Result<Provisioned> {
    Ok(ModelProvisioner::new(env(root)).provision(&cpu_request(model_dir))?)
}

pub fn scenario_dataset(test_fraction: f64) -> Result<Dataset> {
    Ok(DatasetBuilder::new(42)
        .with_test_fraction(test_fraction)
        .build(&SCENARIO_INPUTS, &SCENARIO_OUTPUTS)?)
}

pub fn tokenize(
    tokenizer: &TokenizerHandle,
    dataset: &Dataset,
    context_length: usize,
) -> Result<(Vec<TokenizedExample>, Vec<TokenizedExample>)> {
    let collator = Collator::new(tokenizer, context_length);
    Ok((
        collator.encode_all(&dataset.train)?,
        collator.encode_all(&dataset.validation)?,
    ))
}

/// Small, fast schedule: checkpoint every step, evaluate every other step.
pub fn quick_schedule(epochs: usize, batch_size: usize, grad_accum: usize) -> RunSchedule {
    let mut schedule = DeviceProfile::cpu().schedule();
    schedule.batch_size = batch_size;
    schedule.grad_accum = grad_accum;
    schedule.epochs = epochs;
    schedule.eval_every = 2;
    schedule.save_every = 1;
    schedule.retained_checkpoints = 10;
    schedule.learning_rate = 1e-2;
    RunSchedule {
        schedule,
        context_length: 32,
    }
}
