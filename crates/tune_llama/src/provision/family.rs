//! Model-family heuristic and adapter configuration.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tune_engine::LoraSettings;

use crate::profile::DeviceProfile;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    TinyLlama,
    Llama,
    Mistral,
    Falcon,
    Generic,
}

impl ModelFamily {
    /// Case-insensitive substring match on the model identifier, most specific first.
    pub fn detect(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("tinyllama") {
            ModelFamily::TinyLlama
        } else if id.contains("llama") {
            ModelFamily::Llama
        } else if id.contains("mistral") {
            ModelFamily::Mistral
        } else if id.contains("falcon") {
            ModelFamily::Falcon
        } else {
            ModelFamily::Generic
        }
    }

    /// Adapter targets in priority order.
    pub fn target_modules(&self) -> &'static [&'static str] {
        match self {
            ModelFamily::TinyLlama => &[
                "q_proj",
                "v_proj",
                "k_proj",
                "o_proj",
                "gate_proj",
                "up_proj",
                "down_proj",
            ],
            ModelFamily::Llama | ModelFamily::Mistral | ModelFamily::Generic => {
                &["q_proj", "v_proj", "k_proj", "o_proj"]
            }
            ModelFamily::Falcon => &[
                "query_key_value",
                "dense",
                "dense_h_to_4h",
                "dense_4h_to_h",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BiasPolicy {
    /// Biases stay frozen.
    None,
    /// Biases of adapted modules train alongside the adapter.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdapterMode {
    Auto,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub rank: usize,
    pub scale_factor: f64,
    pub dropout: f32,
    pub target_modules: Vec<String>,
    pub bias: BiasPolicy,
}

impl AdapterConfig {
    /// Constrained devices get half the rank, two targets and more dropout.
    pub fn for_profile(profile: &DeviceProfile, family: ModelFamily, bias: BiasPolicy) -> Self {
        let targets = family.target_modules();
        let (rank, dropout, targets) = if profile.is_constrained() {
            (8, 0.1, &targets[..2.min(targets.len())])
        } else {
            (16, 0.05, targets)
        };
        Self {
            rank,
            scale_factor: (rank * 2) as f64,
            dropout,
            target_modules: targets.iter().map(|s| s.to_string()).collect(),
            bias,
        }
    }

    /// Same config at a different rank, keeping alpha = 2r.
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self.scale_factor = (rank * 2) as f64;
        self
    }

    pub fn lora_settings(&self) -> LoraSettings {
        LoraSettings {
            rank: self.rank,
            alpha: self.scale_factor,
            dropout: self.dropout,
            targets: self.target_modules.clone(),
            train_bias: self.bias == BiasPolicy::All,
        }
    }
}

/// On-disk `adapter_config.json`, PEFT field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfigFile {
    pub base_model_name_or_path: String,
    pub peft_type: String,
    pub task_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    pub bias: BiasPolicy,
    #[serde(default)]
    pub inference_mode: bool,
}

impl AdapterConfigFile {
    pub fn new(base_model: &str, cfg: &AdapterConfig) -> Self {
        Self {
            base_model_name_or_path: base_model.to_string(),
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            r: cfg.rank,
            lora_alpha: cfg.scale_factor,
            lora_dropout: cfg.dropout,
            target_modules: cfg.target_modules.clone(),
            bias: cfg.bias,
            inference_mode: true,
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            rank: self.r,
            scale_factor: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
            bias: self.bias,
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}
