//! The two ways a provisioned model can be trained, behind one capability trait.
//!
//! `AdaptedModel` trains low-rank adapters on a frozen base; `PlainModel` trains a
//! selected subset of base tensors directly. The variant is fixed at provisioning time.

use anyhow::{anyhow, Context};
use candle_core::{Result, Tensor, Var};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tune_engine::CausalLm;

use super::family::{AdapterConfig, AdapterConfigFile};
use super::tokenizer::TokenizerHandle;
use crate::error::{PipelineError, PipelineResult};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const RAW_ADAPTER_DIR: &str = "default";
pub const RAW_ADAPTER_FILE: &str = "adapter_weights.safetensors";
const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TuningKind {
    Adapter,
    Plain,
}

/// Where a save ended up and which mechanism wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub strategy: &'static str,
    pub path: PathBuf,
}

pub trait Tunable {
    fn kind(&self) -> TuningKind;

    fn model(&self) -> &CausalLm;

    /// Trainable variables by name, in optimizer order.
    fn trainable(&self) -> &[(String, Var)];

    fn trainable_parameters(&self) -> usize {
        self.trainable()
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }

    /// Detached copies of every trainable tensor.
    fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        self.trainable()
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Writes `values` back into the trainable variables. Every variable must be present.
    fn restore(&self, values: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.trainable() {
            let Some(value) = values.get(name) else {
                candle_core::bail!("no saved value for trainable tensor {name}");
            };
            let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&value)?;
        }
        Ok(())
    }

    /// Persists what this run learned plus the tokenizer.
    fn save(&self, dir: &Path, tokenizer: &TokenizerHandle) -> PipelineResult<SavedArtifact>;

    /// Dense weights with nothing adapter-specific left.
    fn merge(&self) -> Result<HashMap<String, Tensor>>;
}

/// Ordered adapter persistence mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSaveStrategy {
    /// `adapter_config.json` + `adapter_model.safetensors` with PEFT key names.
    PeftLayout,
    /// Raw variable names under `default/`.
    AdapterOnly,
}

impl AdapterSaveStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterSaveStrategy::PeftLayout => "peft",
            AdapterSaveStrategy::AdapterOnly => "adapter-only",
        }
    }

    fn write(&self, model: &AdaptedModel, dir: &Path) -> anyhow::Result<PathBuf> {
        let file = AdapterConfigFile::new(&model.base_model, &model.config);
        match self {
            AdapterSaveStrategy::PeftLayout => {
                let tensors: HashMap<String, Tensor> = model
                    .trainable
                    .iter()
                    .map(|(n, v)| (format!("{PEFT_PREFIX}{n}"), v.as_tensor().clone()))
                    .collect();
                let path = dir.join(ADAPTER_WEIGHTS_FILE);
                candle_core::safetensors::save(&tensors, &path)
                    .with_context(|| format!("writing {}", path.display()))?;
                file.save(dir)?;
                Ok(path)
            }
            AdapterSaveStrategy::AdapterOnly => {
                let sub = dir.join(RAW_ADAPTER_DIR);
                std::fs::create_dir_all(&sub)?;
                let tensors: HashMap<String, Tensor> = model
                    .trainable
                    .iter()
                    .map(|(n, v)| (n.clone(), v.as_tensor().clone()))
                    .collect();
                let path = sub.join(RAW_ADAPTER_FILE);
                candle_core::safetensors::save(&tensors, &path)
                    .with_context(|| format!("writing {}", path.display()))?;
                file.save(&sub)?;
                Ok(path)
            }
        }
    }
}

pub struct AdaptedModel {
    model: CausalLm,
    trainable: Vec<(String, Var)>,
    config: AdapterConfig,
    base_model: String,
    strategies: Vec<AdapterSaveStrategy>,
}

impl AdaptedModel {
    pub fn new(
        model: CausalLm,
        trainable: Vec<(String, Var)>,
        config: AdapterConfig,
        base_model: String,
    ) -> Self {
        Self {
            model,
            trainable,
            config,
            base_model,
            strategies: vec![
                AdapterSaveStrategy::PeftLayout,
                AdapterSaveStrategy::AdapterOnly,
            ],
        }
    }

    pub fn with_save_strategies(mut self, strategies: Vec<AdapterSaveStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn base_model(&self) -> &str {
        &self.base_model
    }
}

impl Tunable for AdaptedModel {
    fn kind(&self) -> TuningKind {
        TuningKind::Adapter
    }

    fn model(&self) -> &CausalLm {
        &self.model
    }

    fn trainable(&self) -> &[(String, Var)] {
        &self.trainable
    }

    fn save(&self, dir: &Path, tokenizer: &TokenizerHandle) -> PipelineResult<SavedArtifact> {
        std::fs::create_dir_all(dir)
            .map_err(|e| PipelineError::SaveFailure(format!("{}: {e}", dir.display())))?;
        if let Err(e) = tokenizer.save(dir) {
            warn!("⚠️ Tokenizer save failed: {e:#}");
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.write(self, dir) {
                Ok(path) => {
                    if !failures.is_empty() {
                        warn!("⚠️ Saved adapter with fallback mechanism '{}'", strategy.name());
                    }
                    info!("💾 Adapter saved ({}) -> {}", strategy.name(), path.display());
                    return Ok(SavedArtifact {
                        strategy: strategy.name(),
                        path,
                    });
                }
                Err(e) => {
                    warn!("⚠️ Adapter save via '{}' failed: {e:#}", strategy.name());
                    failures.push(format!("{}: {e:#}", strategy.name()));
                }
            }
        }
        Err(PipelineError::SaveFailure(format!(
            "every adapter save mechanism failed ({})",
            failures.join("; ")
        )))
    }

    fn merge(&self) -> Result<HashMap<String, Tensor>> {
        self.model.merged_weights()
    }
}

pub struct PlainModel {
    model: CausalLm,
    trainable: Vec<(String, Var)>,
}

impl PlainModel {
    pub fn new(model: CausalLm, trainable: Vec<(String, Var)>) -> Self {
        Self { model, trainable }
    }
}

impl Tunable for PlainModel {
    fn kind(&self) -> TuningKind {
        TuningKind::Plain
    }

    fn model(&self) -> &CausalLm {
        &self.model
    }

    fn trainable(&self) -> &[(String, Var)] {
        &self.trainable
    }

    fn save(&self, dir: &Path, tokenizer: &TokenizerHandle) -> PipelineResult<SavedArtifact> {
        let write = || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(dir)?;
            tokenizer.save(dir)?;
            self.model.config().save(dir.join("config.json"))?;
            let path = dir.join("model.safetensors");
            candle_core::safetensors::save(&self.model.named_weights()?, &path)?;
            Ok(path)
        };
        match write() {
            Ok(path) => {
                info!("💾 Model saved -> {}", path.display());
                Ok(SavedArtifact {
                    strategy: "dense",
                    path,
                })
            }
            Err(e) => Err(PipelineError::SaveFailure(format!(
                "dense save to {} failed: {e:#}",
                dir.display()
            ))),
        }
    }

    fn merge(&self) -> Result<HashMap<String, Tensor>> {
        self.model.named_weights()
    }
}

/// Adapter tensors from either save layout, keyed by variable name.
pub fn read_adapter_weights(dir: &Path) -> anyhow::Result<(AdapterConfigFile, HashMap<String, Tensor>)> {
    let device = candle_core::Device::Cpu;
    let peft = dir.join(ADAPTER_WEIGHTS_FILE);
    if peft.is_file() {
        let cfg = AdapterConfigFile::load(dir)?;
        let tensors = candle_core::safetensors::load(&peft, &device)?
            .into_iter()
            .map(|(k, v)| (k.strip_prefix(PEFT_PREFIX).unwrap_or(&k).to_string(), v))
            .collect();
        return Ok((cfg, tensors));
    }
    let raw_dir = dir.join(RAW_ADAPTER_DIR);
    let raw = raw_dir.join(RAW_ADAPTER_FILE);
    if raw.is_file() {
        let cfg = AdapterConfigFile::load(&raw_dir)?;
        return Ok((cfg, candle_core::safetensors::load(&raw, &device)?));
    }
    Err(anyhow!("no adapter weights found in {}", dir.display()))
}
