//! Model source resolution: a local directory or a model-hub repository.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::ApiBuilder;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RuntimeEnv;

const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Files that make up one model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// A directory with `config.json` is used as-is; anything else is fetched from the hub.
pub fn resolve(model_id: &str, env: &RuntimeEnv) -> Result<ModelFiles> {
    let path = Path::new(model_id);
    if path.is_dir() {
        resolve_local(path)
    } else {
        resolve_hub(model_id, env)
    }
}

pub fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    let config = dir.join("config.json");
    let tokenizer = dir.join("tokenizer.json");
    if !config.exists() {
        bail!("No config.json found in {:?}", dir);
    }
    if !tokenizer.exists() {
        bail!("No tokenizer.json found in {:?}", dir);
    }
    let tokenizer_config = Some(dir.join("tokenizer_config.json")).filter(|p| p.exists());

    let single = dir.join("model.safetensors");
    let weights = if single.exists() {
        vec![single]
    } else if dir.join(SHARD_INDEX).exists() {
        shard_names(&dir.join(SHARD_INDEX))?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else {
        let pattern = dir.join("*.safetensors");
        let mut found: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(|entry| entry.ok())
            .collect();
        found.sort();
        found
    };
    if weights.is_empty() {
        bail!("No model.safetensors found in {:?}", dir);
    }

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

fn resolve_hub(model_id: &str, env: &RuntimeEnv) -> Result<ModelFiles> {
    info!("🌐 Fetching {} from the model hub (cache: {:?})", model_id, env.cache_dir);
    std::fs::create_dir_all(&env.cache_dir)
        .with_context(|| format!("creating cache dir {:?}", env.cache_dir))?;
    let mut builder = ApiBuilder::new()
        .with_cache_dir(env.cache_dir.clone())
        .with_token(env.hub_token.clone())
        .with_progress(false);
    if let Some(endpoint) = &env.hub_endpoint {
        builder = builder.with_endpoint(endpoint.clone());
    }
    let api = builder.build()?;
    let repo = api.model(model_id.to_string());

    let config = repo.get("config.json")?;
    let tokenizer = repo.get("tokenizer.json")?;
    let tokenizer_config = repo.get("tokenizer_config.json").ok();
    let weights = match repo.get("model.safetensors") {
        Ok(path) => vec![path],
        Err(single_err) => {
            let index = repo.get(SHARD_INDEX).map_err(|_| {
                anyhow!("{model_id}: no model.safetensors ({single_err}) and no shard index")
            })?;
            shard_names(&index)?
                .iter()
                .map(|name| repo.get(name))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

/// Unique shard file names from a safetensors index, sorted.
fn shard_names(index: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index)?;
    let json: serde_json::Value = serde_json::from_str(&raw)?;
    let map = json
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| anyhow!("{:?} has no weight_map", index))?;
    let names: BTreeSet<String> = map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    Ok(names.into_iter().collect())
}

/// Reads every shard into one map, cast to `dtype` on `device`. With `staged`, tensors
/// are read on the host and moved over afterwards.
pub fn load_tensors(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
    staged: bool,
) -> Result<HashMap<String, Tensor>> {
    let read_device = if staged { Device::Cpu } else { device.clone() };
    let mut tensors = HashMap::new();
    for shard in &files.weights {
        let part = candle_core::safetensors::load(shard, &read_device)
            .with_context(|| format!("reading weights {}", shard.display()))?;
        for (name, tensor) in part {
            let tensor = tensor.to_dtype(dtype)?.to_device(device)?;
            tensors.insert(name, tensor);
        }
    }
    info!(
        "📦 Loaded {} tensors from {} file(s) as {:?}",
        tensors.len(),
        files.weights.len(),
        dtype
    );
    Ok(tensors)
}
