//! DecoderBlock - Pre-norm transformer block: attention + SwiGLU MLP

use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::{CausalSelfAttention, LoraLinear, RmsNorm, SwiGLU};
use crate::model::LlamaConfig;

/// Single decoder block with residual connections around attention and MLP
pub struct DecoderBlock {
    pub input_layernorm: RmsNorm,
    pub self_attn: CausalSelfAttention,
    pub post_attention_layernorm: RmsNorm,
    pub mlp: SwiGLU,
}

impl DecoderBlock {
    /// `vb` is rooted at `prefix` (e.g. `model.layers.3`).
    pub fn load(cfg: &LlamaConfig, vb: VarBuilder, prefix: &str, device: &Device) -> Result<Self> {
        let input_layernorm =
            RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let self_attn = CausalSelfAttention::load(
            cfg.hidden_size,
            cfg.num_attention_heads,
            cfg.n_kv_heads(),
            cfg.rope_theta,
            cfg.max_position_embeddings,
            vb.pp("self_attn"),
            &format!("{prefix}.self_attn"),
            device,
        )?;
        let post_attention_layernorm = RmsNorm::load(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let mlp = SwiGLU::load(
            cfg.hidden_size,
            cfg.intermediate_size,
            vb.pp("mlp"),
            &format!("{prefix}.mlp"),
        )?;

        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let residual = x;
        let x_norm = self.input_layernorm.forward(x)?;
        let attn_out = self.self_attn.forward(&x_norm, train)?;
        let x_mid = (residual + attn_out)?;

        let residual = &x_mid;
        let x_norm2 = self.post_attention_layernorm.forward(&x_mid)?;
        let mlp_out = self.mlp.forward(&x_norm2, train)?;
        residual + mlp_out
    }

    pub fn linears(&self) -> Vec<&LoraLinear> {
        let mut out: Vec<&LoraLinear> = self.self_attn.linears().into_iter().collect();
        out.extend(self.mlp.linears());
        out
    }

    pub fn linears_mut(&mut self) -> Vec<&mut LoraLinear> {
        let mut out: Vec<&mut LoraLinear> = self.self_attn.linears_mut().into_iter().collect();
        out.extend(self.mlp.linears_mut());
        out
    }
}
