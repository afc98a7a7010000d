//! One-time weight checks before a model is built: materialise tensors the files
//! lack, reject wrong shapes, and pick parameters for plain fine-tuning.

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use tracing::{info, warn};
use tune_engine::LlamaConfig;

use crate::error::{PipelineError, PipelineResult};

const INIT_STD: f64 = 0.02;

/// Fills in every tensor `cfg` expects but `tensors` lacks (norms with ones, the rest
/// from N(0, 0.02)). Returns the names it created. A present tensor with the wrong
/// shape is a load error.
pub fn materialize_missing(
    cfg: &LlamaConfig,
    tensors: &mut HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
    rng: &mut StdRng,
) -> PipelineResult<Vec<String>> {
    let normal = Normal::new(0.0, INIT_STD)
        .map_err(|e| PipelineError::ModelLoad(format!("init distribution: {e}")))?;
    let mut created = Vec::new();
    for (name, shape) in cfg.expected_tensors() {
        if let Some(t) = tensors.get(&name) {
            if t.dims() != shape.as_slice() {
                return Err(PipelineError::ModelLoad(format!(
                    "tensor {name} has shape {:?}, expected {:?}",
                    t.dims(),
                    shape
                )));
            }
            continue;
        }
        let n: usize = shape.iter().product();
        let data: Vec<f32> = if name.ends_with("norm.weight") {
            vec![1.0; n]
        } else {
            (0..n).map(|_| normal.sample(rng) as f32).collect()
        };
        let tensor = Tensor::from_vec(data, shape, device)
            .and_then(|t| t.to_dtype(dtype))
            .map_err(|e| PipelineError::ModelLoad(format!("materialising {name}: {e}")))?;
        tensors.insert(name.clone(), tensor);
        created.push(name);
    }
    if !created.is_empty() {
        warn!(
            "⚠️ Materialised {} uninitialised tensor(s): {}",
            created.len(),
            created.join(", ")
        );
    }
    Ok(created)
}

/// Name patterns for plain fine-tuning: a primary set and one escalation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfreezePolicy {
    pub primary: Vec<String>,
    pub escalation: Vec<String>,
}

impl UnfreezePolicy {
    /// Output head, norms and the last block; escalates to the block before it.
    pub fn for_layers(num_layers: usize) -> Self {
        let last = num_layers.saturating_sub(1);
        let mut escalation = Vec::new();
        if num_layers >= 2 {
            escalation.push(format!("layers.{}.", num_layers - 2));
        }
        Self {
            primary: vec![
                "lm_head".to_string(),
                "norm".to_string(),
                format!("layers.{last}."),
            ],
            escalation,
        }
    }

    /// Attempts in order: primary, then primary + escalation.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut escalated = self.primary.clone();
        escalated.extend(self.escalation.iter().cloned());
        vec![self.primary.clone(), escalated]
    }
}

/// Names in `tensors` matching any pattern, sorted.
pub fn select_trainable(tensors: &HashMap<String, Tensor>, patterns: &[String]) -> Vec<String> {
    let mut names: Vec<String> = tensors
        .keys()
        .filter(|name| patterns.iter().any(|p| name.contains(p.as_str())))
        .cloned()
        .collect();
    names.sort();
    names
}

/// Applies the unfreeze policy, escalating once if nothing matches. Selected tensors are
/// replaced in `tensors` by F32 `Var`-backed copies, which are also returned.
pub fn unfreeze(
    tensors: &mut HashMap<String, Tensor>,
    policy: &UnfreezePolicy,
) -> PipelineResult<Vec<(String, Var)>> {
    let levels = policy.levels();
    for (attempt, patterns) in levels.iter().enumerate() {
        let names = select_trainable(tensors, patterns);
        let count: usize = names
            .iter()
            .filter_map(|n| tensors.get(n))
            .map(|t| t.elem_count())
            .sum();
        if count == 0 {
            warn!(
                "⚠️ Unfreeze attempt {} ({}) matched no parameters",
                attempt + 1,
                patterns.join(", ")
            );
            continue;
        }

        let mut vars = Vec::with_capacity(names.len());
        for name in names {
            let Some(frozen) = tensors.get(&name) else {
                continue;
            };
            let var = frozen
                .to_dtype(DType::F32)
                .and_then(|t| Var::from_tensor(&t))
                .map_err(|e| PipelineError::ModelLoad(format!("unfreezing {name}: {e}")))?;
            tensors.insert(name.clone(), var.as_tensor().clone());
            vars.push((name, var));
        }
        info!(
            "🔓 Unfroze {} tensors ({} params) with patterns [{}]",
            vars.len(),
            count,
            patterns.join(", ")
        );
        return Ok(vars);
    }
    Err(PipelineError::ZeroTrainableParameters {
        attempts: levels.len(),
    })
}

pub fn parameter_count(vars: &[(String, Var)]) -> usize {
    vars.iter().map(|(_, v)| v.as_tensor().elem_count()).sum()
}
