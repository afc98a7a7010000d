//! Layers Module - Building blocks of the decoder
//!
//! - RmsNorm: Root Mean Square Layer Normalization
//! - LoraLinear: dense projection that can host a low-rank adapter
//! - SwiGLU: Gated MLP with SiLU activation
//! - CausalSelfAttention: RoPE + grouped-query causal attention

use candle_core::{Result, Tensor};

pub mod attention;
pub mod lora_linear;
pub mod rms_norm;
pub mod swiglu;

pub use attention::{CausalSelfAttention, RotaryEmbedding};
pub use lora_linear::{LoraAdapter, LoraLinear};
pub use rms_norm::RmsNorm;
pub use swiglu::SwiGLU;

// --- Helper Trait for Robust Operations ---
pub(crate) trait TensorExt {
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor> {
        let lhs = self.contiguous()?;
        let rhs = rhs.contiguous()?;
        let lhs_rank = lhs.rank();

        // Keep rhs on the lhs device; weights may be staged on the CPU.
        let rhs = if rhs.device().same_device(lhs.device()) {
            rhs
        } else {
            rhs.to_device(lhs.device())?
        };

        if lhs_rank == 1 {
            lhs.unsqueeze(0)?.matmul(&rhs)?.squeeze(0)
        } else if lhs_rank == 2 {
            lhs.matmul(&rhs)
        } else {
            let flattened = lhs.flatten(0, lhs_rank - 2)?;
            let out = flattened.matmul(&rhs)?;
            let mut new_shape = lhs.dims()[..lhs_rank - 1].to_vec();
            new_shape.push(out.dim(1)?);
            out.reshape(new_shape)
        }
    }
}
