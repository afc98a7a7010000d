//! Checkpoint Management - Training state persistence
//!
//! A checkpoint is a `checkpoint-<step>/` directory holding the trainable tensors,
//! the optimizer moments and `trainer_state.json`. It is assembled under a hidden
//! temporary name and renamed into place, so a directory with the final name is
//! always complete.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use fs2::FileExt;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const TRAINABLE_FILE: &str = "trainable.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const LOCK_FILE: &str = ".checkpoint.lock";

/// Loop counters persisted alongside the weights.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub best_metric: Option<f64>,
    pub best_step: Option<usize>,
    pub patience_used: usize,
    pub learning_rate: f64,
    pub model_id: String,
    pub saved_at: String,
}

impl TrainerState {
    pub fn stamp(mut self) -> Self {
        self.saved_at = chrono::Local::now().to_rfc3339();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step: usize,
    pub path: PathBuf,
}

impl Checkpoint {
    pub fn read_state(&self) -> Result<TrainerState> {
        let path = self.path.join(TRAINER_STATE_FILE);
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn load_trainable(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        Ok(candle_core::safetensors::load(
            self.path.join(TRAINABLE_FILE),
            device,
        )?)
    }

    pub fn load_optimizer(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        Ok(candle_core::safetensors::load(
            self.path.join(OPTIMIZER_FILE),
            device,
        )?)
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
    pattern: Regex,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            pattern: Regex::new(r"^checkpoint-(\d+)$")?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("checkpoint-{step}"))
    }

    /// Complete checkpoints, ascending by step. A missing output directory has none.
    pub fn discover(&self) -> Result<Vec<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = self.pattern.captures(name) else {
                continue;
            };
            let Ok(step) = caps[1].parse::<usize>() else {
                continue;
            };
            let path = entry.path();
            if !path.join(TRAINER_STATE_FILE).is_file() {
                debug!("Skipping incomplete checkpoint {}", path.display());
                continue;
            }
            found.push(Checkpoint { step, path });
        }
        found.sort_by_key(|c| c.step);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.discover()?.pop())
    }

    /// Writes `checkpoint-<state.global_step>` atomically.
    pub fn save(
        &self,
        state: &TrainerState,
        trainable: &HashMap<String, Tensor>,
        optimizer: &HashMap<String, Tensor>,
    ) -> Result<Checkpoint> {
        std::fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        lock_file.lock_exclusive()?;
        let written = self.write_locked(state, trainable, optimizer);
        lock_file.unlock()?;
        written
    }

    fn write_locked(
        &self,
        state: &TrainerState,
        trainable: &HashMap<String, Tensor>,
        optimizer: &HashMap<String, Tensor>,
    ) -> Result<Checkpoint> {
        let step = state.global_step;
        let tmp = self.dir.join(format!(".checkpoint-{step}.tmp"));
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        candle_core::safetensors::save(trainable, tmp.join(TRAINABLE_FILE))?;
        candle_core::safetensors::save(optimizer, tmp.join(OPTIMIZER_FILE))?;
        let file = File::create(tmp.join(TRAINER_STATE_FILE))?;
        serde_json::to_writer_pretty(file, state)?;

        let target = self.path_for(step);
        if target.exists() {
            warn!("⚠️ Replacing existing {}", target.display());
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), target.display()))?;
        info!("💾 Checkpoint saved: {}", target.display());
        Ok(Checkpoint { step, path: target })
    }

    /// Deletes all but the newest `retain` checkpoints, never touching `keep`.
    /// Returns the removed steps.
    pub fn rotate(&self, retain: usize, keep: Option<usize>) -> Result<Vec<usize>> {
        let all = self.discover()?;
        let cutoff = all.len().saturating_sub(retain.max(1));
        let mut removed = Vec::new();
        for ckpt in &all[..cutoff] {
            if Some(ckpt.step) == keep {
                continue;
            }
            match std::fs::remove_dir_all(&ckpt.path) {
                Ok(()) => {
                    info!("🗑️ Rotated out {}", ckpt.path.display());
                    removed.push(ckpt.step);
                }
                Err(e) => warn!("⚠️ Failed to remove old checkpoint {}: {}", ckpt.path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            epoch: 0,
            best_metric: None,
            best_step: None,
            patience_used: 0,
            learning_rate: 1e-3,
            model_id: "fixture".into(),
            saved_at: String::new(),
        }
        .stamp()
    }

    fn tensors() -> Result<HashMap<String, Tensor>> {
        let mut map = HashMap::new();
        map.insert("w".to_string(), Tensor::ones((2, 2), candle_core::DType::F32, &Device::Cpu)?);
        Ok(map)
    }

    #[test]
    fn test_discovery_ignores_noise() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        store.save(&state(3), &tensors()?, &tensors()?)?;
        store.save(&state(12), &tensors()?, &tensors()?)?;
        std::fs::create_dir_all(dir.path().join("checkpoint-99"))?; // no state file
        std::fs::create_dir_all(dir.path().join(".checkpoint-50.tmp"))?;
        std::fs::create_dir_all(dir.path().join("checkpoint-final"))?;

        let steps: Vec<usize> = store.discover()?.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![3, 12]);
        let latest = store.latest()?.ok_or_else(|| anyhow::anyhow!("no checkpoint"))?;
        assert_eq!(latest.step, 12);
        assert_eq!(latest.read_state()?.global_step, 12);
        assert!(!dir.path().join(".checkpoint-12.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_rotation_keeps_newest_and_best() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        for step in [1, 2, 3, 4, 5] {
            store.save(&state(step), &tensors()?, &tensors()?)?;
        }
        let removed = store.rotate(2, Some(2))?;
        assert_eq!(removed, vec![1, 3]);
        let steps: Vec<usize> = store.discover()?.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![2, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_missing_dir_is_fresh_start() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path().join("not-yet"))?;
        assert!(store.latest()?.is_none());
        Ok(())
    }
}
