//! LlamaConfig - Model configuration (HF `config.json` subset)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

/// Model configuration for a llama-layout decoder
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LlamaConfig {
    pub vocab_size: usize,
    #[serde(alias = "hidden_dim")]
    pub hidden_size: usize,
    pub intermediate_size: usize,
    #[serde(alias = "n_layers")]
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
}

impl LlamaConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing model config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.num_attention_heads > 0, "num_attention_heads must be > 0");
        anyhow::ensure!(
            self.hidden_size % self.num_attention_heads == 0,
            "hidden_size {} not divisible by num_attention_heads {}",
            self.hidden_size,
            self.num_attention_heads
        );
        anyhow::ensure!(
            self.num_attention_heads % self.n_kv_heads() == 0,
            "num_attention_heads {} not divisible by num_key_value_heads {}",
            self.num_attention_heads,
            self.n_kv_heads()
        );
        anyhow::ensure!(self.head_dim() % 2 == 0, "head_dim must be even for RoPE");
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn n_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Every tensor the architecture reads, with its shape, in HF naming.
    pub fn expected_tensors(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let kv = self.n_kv_heads() * self.head_dim();
        let i = self.intermediate_size;
        let mut out = vec![(
            "model.embed_tokens.weight".to_string(),
            vec![self.vocab_size, h],
        )];
        for l in 0..self.num_hidden_layers {
            let p = format!("model.layers.{l}");
            out.push((format!("{p}.input_layernorm.weight"), vec![h]));
            out.push((format!("{p}.self_attn.q_proj.weight"), vec![h, h]));
            out.push((format!("{p}.self_attn.k_proj.weight"), vec![kv, h]));
            out.push((format!("{p}.self_attn.v_proj.weight"), vec![kv, h]));
            out.push((format!("{p}.self_attn.o_proj.weight"), vec![h, h]));
            out.push((format!("{p}.post_attention_layernorm.weight"), vec![h]));
            out.push((format!("{p}.mlp.gate_proj.weight"), vec![i, h]));
            out.push((format!("{p}.mlp.up_proj.weight"), vec![i, h]));
            out.push((format!("{p}.mlp.down_proj.weight"), vec![h, i]));
        }
        out.push(("model.norm.weight".to_string(), vec![h]));
        if !self.tie_word_embeddings {
            out.push(("lm_head.weight".to_string(), vec![self.vocab_size, h]));
        }
        out
    }

    /// Rough parameter count, used for logging.
    pub fn parameter_count(&self) -> usize {
        self.expected_tensors()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    /// A small configuration for dry runs and tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            max_position_embeddings: 512,
            tie_word_embeddings: false,
            architectures: vec!["LlamaForCausalLM".to_string()],
            model_type: Some("llama".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hf_config_parses_with_defaults() -> Result<()> {
        let raw = r#"{
            "vocab_size": 32000,
            "hidden_size": 2048,
            "intermediate_size": 5632,
            "num_hidden_layers": 22,
            "num_attention_heads": 32,
            "num_key_value_heads": 4,
            "rms_norm_eps": 1e-05,
            "model_type": "llama",
            "torch_dtype": "bfloat16"
        }"#;
        let cfg: LlamaConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.n_kv_heads(), 4);
        assert_eq!(cfg.rope_theta, 10_000.0);
        assert!(!cfg.tie_word_embeddings);
        Ok(())
    }

    #[test]
    fn test_tied_embeddings_drop_lm_head() {
        let mut cfg = LlamaConfig::tiny(16);
        let untied = cfg.expected_tensors().len();
        cfg.tie_word_embeddings = true;
        assert_eq!(cfg.expected_tensors().len(), untied - 1);
        assert!(cfg
            .expected_tensors()
            .iter()
            .all(|(name, _)| name != "lm_head.weight"));
    }
}
