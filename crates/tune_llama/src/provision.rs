//! Provision Module - base model + tokenizer + trainable variant
//!
//! - source: local directory / model-hub resolution
//! - tokenizer: EOS and PAD discovery
//! - family: model-family heuristic and adapter sizing
//! - weights: uninitialised-tensor materialisation and the unfreeze policy
//! - tunable: `AdaptedModel` / `PlainModel` behind the `Tunable` trait

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tracing::{error, info, warn};
use tune_engine::{CausalLm, LlamaConfig, RuntimeFeatures};

use crate::config::RuntimeEnv;
use crate::error::{PipelineError, PipelineResult};
use crate::profile::DeviceProfile;

pub mod family;
pub mod source;
pub mod tokenizer;
pub mod tunable;
pub mod weights;

pub use family::{AdapterConfig, AdapterConfigFile, AdapterMode, BiasPolicy, ModelFamily};
pub use tokenizer::TokenizerHandle;
pub use tunable::{AdaptedModel, AdapterSaveStrategy, PlainModel, SavedArtifact, Tunable, TuningKind};
pub use weights::UnfreezePolicy;

/// Smaller model tried when the requested one cannot be loaded.
pub const REFERENCE_MODEL: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
const MIN_FALLBACK_RANK: usize = 4;

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub model_id: String,
    pub profile: DeviceProfile,
    pub device: Device,
    pub adapter_mode: AdapterMode,
    pub bias: BiasPolicy,
    pub gradient_checkpointing: bool,
    pub seed: u64,
    /// Overrides the default last-block policy.
    pub unfreeze: Option<UnfreezePolicy>,
    /// Tried in order after the primary model, each at a reduced adapter rank.
    pub fallback_models: Vec<String>,
}

impl ProvisionRequest {
    pub fn new(model_id: impl Into<String>, profile: DeviceProfile, device: Device) -> Self {
        Self {
            model_id: model_id.into(),
            profile,
            device,
            adapter_mode: AdapterMode::Auto,
            bias: BiasPolicy::None,
            gradient_checkpointing: true,
            seed: 42,
            unfreeze: None,
            fallback_models: vec![REFERENCE_MODEL.to_string()],
        }
    }
}

/// One entry of the load chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub model_id: String,
    /// `None` keeps the profile's rank.
    pub rank: Option<usize>,
}

pub struct Provisioned {
    pub model: Box<dyn Tunable>,
    pub tokenizer: TokenizerHandle,
    pub model_id: String,
    pub adapter: Option<AdapterConfig>,
    pub features: RuntimeFeatures,
    pub fallback_used: bool,
}

pub struct ModelProvisioner {
    env: RuntimeEnv,
}

impl ModelProvisioner {
    pub fn new(env: RuntimeEnv) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &RuntimeEnv {
        &self.env
    }

    pub fn candidates(&self, req: &ProvisionRequest) -> Vec<Candidate> {
        let family = ModelFamily::detect(&req.model_id);
        let base_rank = AdapterConfig::for_profile(&req.profile, family, req.bias).rank;
        let reduced = (base_rank / 2).max(MIN_FALLBACK_RANK);
        let mut chain = vec![Candidate {
            model_id: req.model_id.clone(),
            rank: None,
        }];
        // A fallback equal to an earlier entry would only repeat the same failure.
        for id in &req.fallback_models {
            if chain.iter().any(|c| c.model_id == *id) {
                continue;
            }
            chain.push(Candidate {
                model_id: id.clone(),
                rank: Some(reduced),
            });
        }
        chain
    }

    /// Walks the candidate chain. Zero-trainable failures are never retried on another
    /// model; any other failure moves on to the next candidate.
    pub fn provision(&self, req: &ProvisionRequest) -> PipelineResult<Provisioned> {
        let mut failures = Vec::new();
        for (i, candidate) in self.candidates(req).into_iter().enumerate() {
            info!(
                "🔧 Provisioning {} (profile {}, attempt {})",
                candidate.model_id,
                req.profile,
                i + 1
            );
            match self.try_candidate(req, &candidate) {
                Ok(mut provisioned) => {
                    provisioned.fallback_used = i > 0;
                    return Ok(provisioned);
                }
                Err(e @ PipelineError::ZeroTrainableParameters { .. }) => return Err(e),
                Err(e) => {
                    error!("❌ Failed to load {}: {e}", candidate.model_id);
                    failures.push(format!("{}: {e}", candidate.model_id));
                }
            }
        }
        Err(PipelineError::ModelLoad(failures.join("; ")))
    }

    fn try_candidate(
        &self,
        req: &ProvisionRequest,
        candidate: &Candidate,
    ) -> PipelineResult<Provisioned> {
        let files = source::resolve(&candidate.model_id, &self.env)
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let tokenizer = TokenizerHandle::load(&files.tokenizer, files.tokenizer_config.as_deref())
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let cfg = load_config(&files.config)?;

        let mut dtype = req.profile.load_dtype();
        if req.adapter_mode == AdapterMode::Disabled && dtype != DType::F32 {
            info!("Plain fine-tuning keeps weights in F32");
            dtype = DType::F32;
        }
        let mut tensors = source::load_tensors(
            &files,
            dtype,
            &req.device,
            self.env.allocator.staged_placement,
        )
        .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let mut rng = StdRng::seed_from_u64(req.seed);
        weights::materialize_missing(&cfg, &mut tensors, dtype, &req.device, &mut rng)?;

        let base_model = canonical_id(&candidate.model_id);
        let family = ModelFamily::detect(&candidate.model_id);
        let mut adapter_cfg = AdapterConfig::for_profile(&req.profile, family, req.bias);
        if let Some(rank) = candidate.rank {
            adapter_cfg = adapter_cfg.with_rank(rank);
        }

        if req.adapter_mode == AdapterMode::Auto {
            let vb = VarBuilder::from_tensors(tensors.clone(), dtype, &req.device);
            let mut model = CausalLm::load(&cfg, vb).map_err(model_load)?;
            let trainable = model
                .inject_adapters(&adapter_cfg.lora_settings(), &mut rng)
                .map_err(model_load)?;
            if !trainable.is_empty() {
                let features = self.features(&model, req);
                let adapted = AdaptedModel::new(model, trainable, adapter_cfg.clone(), base_model);
                info!(
                    "✅ Adapter injected: rank {} on [{}], {} trainable params",
                    adapter_cfg.rank,
                    adapter_cfg.target_modules.join(", "),
                    adapted.trainable_parameters()
                );
                return Ok(Provisioned {
                    model: Box::new(adapted),
                    tokenizer,
                    model_id: candidate.model_id.clone(),
                    adapter: Some(adapter_cfg),
                    features,
                    fallback_used: false,
                });
            }
            warn!(
                "⚠️ Adapter targets [{}] matched nothing in {}; falling back to partial unfreeze",
                adapter_cfg.target_modules.join(", "),
                candidate.model_id
            );
        }

        if dtype != DType::F32 {
            for t in tensors.values_mut() {
                *t = t.to_dtype(DType::F32).map_err(model_load)?;
            }
            dtype = DType::F32;
        }
        let policy = req
            .unfreeze
            .clone()
            .unwrap_or_else(|| UnfreezePolicy::for_layers(cfg.num_hidden_layers));
        let trainable = weights::unfreeze(&mut tensors, &policy)?;
        let vb = VarBuilder::from_tensors(tensors, dtype, &req.device);
        let model = CausalLm::load(&cfg, vb).map_err(model_load)?;
        let features = self.features(&model, req);
        Ok(Provisioned {
            model: Box::new(PlainModel::new(model, trainable)),
            tokenizer,
            model_id: candidate.model_id.clone(),
            adapter: None,
            features,
            fallback_used: false,
        })
    }

    /// Reloads a finished run: an adapter directory (adapter config + weights, base
    /// model provisioned from the recorded id) or a dense model directory.
    pub fn load_trained(&self, dir: &Path, device: &Device) -> PipelineResult<Provisioned> {
        let has_adapter = dir.join(family::ADAPTER_CONFIG_FILE).exists()
            || dir
                .join(tunable::RAW_ADAPTER_DIR)
                .join(tunable::RAW_ADAPTER_FILE)
                .exists();
        if !has_adapter {
            let files = source::resolve_local(dir)
                .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
            let (model, tokenizer) = self.load_frozen(&files, device)?;
            let features = model.features();
            return Ok(Provisioned {
                model: Box::new(PlainModel::new(model, Vec::new())),
                tokenizer,
                model_id: dir.to_string_lossy().to_string(),
                adapter: None,
                features,
                fallback_used: false,
            });
        }

        let (file, saved) = tunable::read_adapter_weights(dir)
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let files = source::resolve(&file.base_model_name_or_path, &self.env)
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let (mut model, base_tokenizer) = self.load_frozen(&files, device)?;
        let tokenizer = if dir.join("tokenizer.json").exists() {
            TokenizerHandle::load(&dir.join("tokenizer.json"), None)
                .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?
        } else {
            base_tokenizer
        };

        let adapter_cfg = file.adapter_config();
        let mut rng = StdRng::seed_from_u64(0);
        let trainable = model
            .inject_adapters(&adapter_cfg.lora_settings(), &mut rng)
            .map_err(model_load)?;
        let features = model.features();
        let adapted = AdaptedModel::new(
            model,
            trainable,
            adapter_cfg.clone(),
            file.base_model_name_or_path.clone(),
        );
        adapted.restore(&saved).map_err(model_load)?;
        info!("📂 Loaded adapter from {}", dir.display());
        Ok(Provisioned {
            model: Box::new(adapted),
            tokenizer,
            model_id: file.base_model_name_or_path,
            adapter: Some(adapter_cfg),
            features,
            fallback_used: false,
        })
    }

    /// Frozen F32 model, for generation and merging.
    fn load_frozen(
        &self,
        files: &source::ModelFiles,
        device: &Device,
    ) -> PipelineResult<(CausalLm, TokenizerHandle)> {
        let tokenizer = TokenizerHandle::load(&files.tokenizer, files.tokenizer_config.as_deref())
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let cfg = load_config(&files.config)?;
        let mut tensors = source::load_tensors(
            files,
            DType::F32,
            device,
            self.env.allocator.staged_placement,
        )
        .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        let mut rng = StdRng::seed_from_u64(0);
        weights::materialize_missing(&cfg, &mut tensors, DType::F32, device, &mut rng)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model = CausalLm::load(&cfg, vb).map_err(model_load)?;
        Ok((model, tokenizer))
    }

    fn features(&self, model: &CausalLm, req: &ProvisionRequest) -> RuntimeFeatures {
        let features = model.features();
        if req.gradient_checkpointing && !features.gradient_checkpointing {
            info!("Gradient checkpointing requested but unsupported by this runtime, continuing without it");
        }
        features
    }
}

fn load_config(path: &Path) -> PipelineResult<LlamaConfig> {
    let cfg = LlamaConfig::from_file(path).map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
    let supported = cfg.architectures.is_empty()
        || cfg
            .architectures
            .iter()
            .any(|a| a.contains("Llama") || a.contains("Mistral"));
    if !supported {
        return Err(PipelineError::ModelLoad(format!(
            "unsupported architecture {:?}",
            cfg.architectures
        )));
    }
    Ok(cfg)
}

fn model_load(e: candle_core::Error) -> PipelineError {
    PipelineError::ModelLoad(e.to_string())
}

/// Local paths are recorded absolutely so an adapter directory can find its base later.
fn canonical_id(model_id: &str) -> String {
    match std::fs::canonicalize(model_id) {
        Ok(path) if path.is_dir() => path.to_string_lossy().to_string(),
        _ => model_id.to_string(),
    }
}
