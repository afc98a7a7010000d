//! CausalLm - llama-layout decoder with adapter hosting
//!
//! Weights are read through a `VarBuilder` using HF tensor names. Frozen weights are
//! plain tensors; anything the caller wants trained is handed in as a `Var`-backed
//! tensor (plain fine-tuning) or attached afterwards as a LoRA adapter.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Embedding, Module, VarBuilder};
use rand::rngs::StdRng;
use std::collections::HashMap;

use crate::layers::{LoraAdapter, LoraLinear, RmsNorm};
use crate::model::{DecoderBlock, LlamaConfig};

/// Memory-saving features the runtime can honour during training.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeFeatures {
    pub gradient_checkpointing: bool,
    pub input_gradients: bool,
}

/// Adapter injection parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct LoraSettings {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
    /// Short module names, e.g. `q_proj`.
    pub targets: Vec<String>,
    /// Make the biases of wrapped modules trainable too.
    pub train_bias: bool,
}

pub struct CausalLm {
    pub embedding: Embedding,
    pub layers: Vec<DecoderBlock>,
    pub norm: RmsNorm,
    pub lm_head: LoraLinear,
    config: LlamaConfig,
    device: Device,
    dtype: DType,
}

impl CausalLm {
    pub fn load(cfg: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let embed_weight = vb.get(
            (cfg.vocab_size, cfg.hidden_size),
            "model.embed_tokens.weight",
        )?;
        let embedding = Embedding::new(embed_weight.clone(), cfg.hidden_size);

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            let prefix = format!("model.layers.{i}");
            layers.push(DecoderBlock::load(cfg, vb.pp(&prefix), &prefix, &device)?);
        }

        let norm = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;

        let lm_head = if cfg.tie_word_embeddings {
            LoraLinear::from_weight("lm_head", embed_weight, None)
        } else {
            LoraLinear::load(
                cfg.hidden_size,
                cfg.vocab_size,
                vb.pp("lm_head"),
                "lm_head".to_string(),
            )?
        };

        Ok(Self {
            embedding,
            layers,
            norm,
            lm_head,
            config: cfg.clone(),
            device,
            dtype,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// This runtime recomputes nothing and keeps every activation alive.
    pub fn features(&self) -> RuntimeFeatures {
        RuntimeFeatures::default()
    }

    /// `ids`: [batch, seq] (u32). Returns F32 logits [batch, seq, vocab].
    pub fn forward(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.embedding.forward(ids)?;
        for layer in &self.layers {
            h = layer.forward(&h, train)?;
        }
        let h = self.norm.forward(&h)?;
        self.lm_head.forward(&h, train)?.to_dtype(DType::F32)
    }

    /// Logits for the last position of a single sequence: [vocab].
    pub fn next_token_logits(&self, ids: &[u32]) -> Result<Tensor> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = self.forward(&input, false)?;
        let seq_len = logits.dim(1)?;
        logits.squeeze(0)?.get(seq_len - 1)
    }

    pub fn linears(&self) -> Vec<&LoraLinear> {
        let mut out = Vec::new();
        for layer in &self.layers {
            out.extend(layer.linears());
        }
        out.push(&self.lm_head);
        out
    }

    pub fn linears_mut(&mut self) -> Vec<&mut LoraLinear> {
        let mut out = Vec::new();
        for layer in &mut self.layers {
            out.extend(layer.linears_mut());
        }
        out.push(&mut self.lm_head);
        out
    }

    /// Wraps every linear whose short name is in `settings.targets` with a fresh adapter.
    /// Returns the new trainable variables by name, in layer order. An empty result
    /// means no module matched.
    pub fn inject_adapters(
        &mut self,
        settings: &LoraSettings,
        rng: &mut StdRng,
    ) -> Result<Vec<(String, Var)>> {
        let device = self.device.clone();
        let mut trainable = Vec::new();
        for linear in self.linears_mut() {
            if !settings
                .targets
                .iter()
                .any(|t| t.as_str() == linear.short_name())
            {
                continue;
            }
            let adapter = LoraAdapter::init(
                linear.in_features(),
                linear.out_features(),
                settings.rank,
                settings.alpha,
                settings.dropout,
                &device,
                rng,
            )?;
            let name = linear.name().to_string();
            trainable.push((format!("{name}.lora_A.weight"), adapter.a.clone()));
            trainable.push((format!("{name}.lora_B.weight"), adapter.b.clone()));
            linear.attach(adapter);

            if settings.train_bias {
                if let Some(bias) = linear.bias() {
                    let var = Var::from_tensor(&bias.to_dtype(DType::F32)?)?;
                    linear.set_bias(var.as_tensor().clone());
                    trainable.push((format!("{name}.bias"), var));
                }
            }
        }
        Ok(trainable)
    }

    /// Every base tensor by HF name (adapters excluded).
    pub fn named_weights(&self) -> Result<HashMap<String, Tensor>> {
        self.collect(|linear| Ok(linear.weight().clone()))
    }

    /// Every base tensor with adapter deltas folded in: a dense model with no adapters.
    pub fn merged_weights(&self) -> Result<HashMap<String, Tensor>> {
        self.collect(|linear| linear.merged_weight())
    }

    fn collect<F>(&self, weight_of: F) -> Result<HashMap<String, Tensor>>
    where
        F: Fn(&LoraLinear) -> Result<Tensor>,
    {
        let mut tensors = HashMap::new();
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            self.embedding.embeddings().clone(),
        );
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = format!("model.layers.{i}");
            tensors.insert(
                format!("{prefix}.input_layernorm.weight"),
                layer.input_layernorm.weight.clone(),
            );
            tensors.insert(
                format!("{prefix}.post_attention_layernorm.weight"),
                layer.post_attention_layernorm.weight.clone(),
            );
        }
        tensors.insert("model.norm.weight".to_string(), self.norm.weight.clone());

        for linear in self.linears() {
            if linear.name() == "lm_head" && self.config.tie_word_embeddings {
                continue;
            }
            tensors.insert(format!("{}.weight", linear.name()), weight_of(linear)?);
            if let Some(bias) = linear.bias() {
                tensors.insert(format!("{}.bias", linear.name()), bias.clone());
            }
        }
        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn random_model(cfg: &LlamaConfig) -> anyhow::Result<CausalLm> {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        for (name, shape) in cfg.expected_tensors() {
            map.insert(name, Tensor::randn(0f32, 0.02f32, shape, &device)?);
        }
        let vb = VarBuilder::from_tensors(map, DType::F32, &device);
        Ok(CausalLm::load(cfg, vb)?)
    }

    #[test]
    fn test_forward_shape() -> anyhow::Result<()> {
        let cfg = LlamaConfig::tiny(20);
        let model = random_model(&cfg)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu)?;
        let logits = model.forward(&ids, false)?;
        assert_eq!(logits.dims(), &[2, 4, 20]);
        Ok(())
    }

    #[test]
    fn test_inject_only_matching_targets() -> anyhow::Result<()> {
        let cfg = LlamaConfig::tiny(20);
        let mut model = random_model(&cfg)?;
        let mut rng = StdRng::seed_from_u64(0);
        let settings = LoraSettings {
            rank: 4,
            alpha: 8.0,
            dropout: 0.0,
            targets: vec!["q_proj".into(), "v_proj".into()],
            train_bias: false,
        };
        let vars = model.inject_adapters(&settings, &mut rng)?;
        // two targets x two factors x two layers
        assert_eq!(vars.len(), 8);
        assert_eq!(vars[0].0, "model.layers.0.self_attn.q_proj.lora_A.weight");

        let settings = LoraSettings {
            targets: vec!["query_key_value".into()],
            ..settings
        };
        assert!(model.inject_adapters(&settings, &mut rng)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_named_weights_cover_expected_tensors() -> anyhow::Result<()> {
        let cfg = LlamaConfig::tiny(20);
        let model = random_model(&cfg)?;
        let named = model.named_weights()?;
        for (name, shape) in cfg.expected_tensors() {
            let t = named.get(&name).ok_or_else(|| anyhow::anyhow!("missing {name}"))?;
            assert_eq!(t.dims(), shape.as_slice(), "{name}");
        }
        Ok(())
    }
}
