//! Runtime environment
//!
//! Process-level knobs (weight cache, allocator tuning, hub endpoint) collected once
//! into an explicit struct and handed to the provisioner. Nothing else in the crate
//! reads the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const CACHE_DIR_VAR: &str = "TUNE_CACHE_DIR";
pub const STAGED_ALLOC_VAR: &str = "TUNE_STAGED_ALLOC";
pub const HUB_ENDPOINT_VAR: &str = "HF_ENDPOINT";
pub const HUB_TOKEN_VAR: &str = "HF_TOKEN";

const DEFAULT_CACHE_DIR: &str = "./model_cache";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorTuning {
    /// Read weights onto the host first and move them to the accelerator afterwards,
    /// instead of materialising directly on the device.
    pub staged_placement: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnv {
    pub cache_dir: PathBuf,
    pub allocator: AllocatorTuning,
    pub hub_endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub hub_token: Option<String>,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            allocator: AllocatorTuning::default(),
            hub_endpoint: None,
            hub_token: None,
        }
    }
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let cache_dir = non_empty(CACHE_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        let staged_placement = non_empty(STAGED_ALLOC_VAR)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            cache_dir,
            allocator: AllocatorTuning { staged_placement },
            hub_endpoint: non_empty(HUB_ENDPOINT_VAR),
            hub_token: non_empty(HUB_TOKEN_VAR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let env = RuntimeEnv::from_lookup(|_| None);
        assert_eq!(env, RuntimeEnv::default());
    }

    #[test]
    fn test_reads_every_knob() {
        let vars: HashMap<&str, &str> = [
            (CACHE_DIR_VAR, "/tmp/weights"),
            (STAGED_ALLOC_VAR, "True"),
            (HUB_ENDPOINT_VAR, "https://hf-mirror.com"),
            (HUB_TOKEN_VAR, ""),
        ]
        .into_iter()
        .collect();
        let env = RuntimeEnv::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.cache_dir, PathBuf::from("/tmp/weights"));
        assert!(env.allocator.staged_placement);
        assert_eq!(env.hub_endpoint.as_deref(), Some("https://hf-mirror.com"));
        assert_eq!(env.hub_token, None);
    }
}
