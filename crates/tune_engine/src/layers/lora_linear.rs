//! LoraLinear - Dense projection with an optional low-rank adapter
//!
//! y = x W^T + b + dropout(x) A^T B^T * (alpha / r)
//!
//! The base weight is never touched by adapter training. `merged_weight` folds the
//! adapter delta into a standalone dense matrix.

use candle_core::{DType, Result, Tensor, Var};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::Rng;

use super::TensorExt;

/// Trainable low-rank factors attached to one projection.
#[derive(Clone)]
pub struct LoraAdapter {
    /// [rank, in]
    pub a: Var,
    /// [out, rank]
    pub b: Var,
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl LoraAdapter {
    /// Fresh adapter: A ~ U(-1/sqrt(in), 1/sqrt(in)), B = 0, so the wrapped layer starts
    /// out computing exactly the base projection.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f64,
        dropout: f32,
        device: &candle_core::Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if rank == 0 {
            candle_core::bail!("adapter rank must be > 0");
        }
        let bound = 1.0 / (in_features as f32).sqrt();
        let a_data: Vec<f32> = (0..rank * in_features)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let a = Var::from_tensor(&Tensor::from_vec(a_data, (rank, in_features), device)?)?;
        let b = Var::zeros((out_features, rank), DType::F32, device)?;
        Ok(Self {
            a,
            b,
            rank,
            alpha,
            dropout,
        })
    }

    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// delta W = B A * scale, in F32.
    pub fn delta(&self) -> Result<Tensor> {
        self.b.as_tensor().matmul(self.a.as_tensor())? * self.scale()
    }

    pub fn parameter_count(&self) -> usize {
        self.a.as_tensor().elem_count() + self.b.as_tensor().elem_count()
    }
}

/// Linear projection `[out, in]` that may host a LoRA adapter.
pub struct LoraLinear {
    name: String,
    weight: Tensor,
    bias: Option<Tensor>,
    adapter: Option<LoraAdapter>,
}

impl LoraLinear {
    pub fn load(in_dim: usize, out_dim: usize, vb: VarBuilder, name: String) -> Result<Self> {
        let weight = vb.get((out_dim, in_dim), "weight")?;
        let bias = if vb.contains_tensor("bias") {
            Some(vb.get(out_dim, "bias")?)
        } else {
            None
        };
        Ok(Self {
            name,
            weight,
            bias,
            adapter: None,
        })
    }

    pub fn from_weight(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
            adapter: None,
        }
    }

    /// Full module path, e.g. `model.layers.0.self_attn.q_proj`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path segment, e.g. `q_proj`.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn attach(&mut self, adapter: LoraAdapter) {
        self.adapter = Some(adapter);
    }

    /// Replaces the bias (used to swap a frozen bias for a trainable one).
    pub fn set_bias(&mut self, bias: Tensor) {
        self.bias = Some(bias);
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let weight = if self.weight.dtype() == x.dtype() {
            self.weight.clone()
        } else {
            self.weight.to_dtype(x.dtype())?
        };
        let mut y = x.matmul_robust(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(&bias.to_dtype(y.dtype())?)?;
        }

        let Some(adapter) = &self.adapter else {
            return Ok(y);
        };

        // Adapter path runs in F32 regardless of the base precision.
        let mut x32 = x.to_dtype(DType::F32)?;
        if train && adapter.dropout > 0.0 {
            x32 = candle_nn::ops::dropout(&x32, adapter.dropout)?;
        }
        let low = x32.matmul_robust(&adapter.a.as_tensor().t()?)?;
        let delta = (low.matmul_robust(&adapter.b.as_tensor().t()?)? * adapter.scale())?;
        let dtype = y.dtype();
        y + delta.to_dtype(dtype)?
    }

    /// Dense weight with the adapter delta folded in (or the base weight if none).
    pub fn merged_weight(&self) -> Result<Tensor> {
        match &self.adapter {
            None => Ok(self.weight.clone()),
            Some(adapter) => {
                let base = self.weight.to_dtype(DType::F32)?;
                let delta = adapter.delta()?.to_device(base.device())?;
                (base + delta)?.to_dtype(self.weight.dtype())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    #[test]
    fn test_fresh_adapter_is_identity() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let w = Tensor::randn(0f32, 1f32, (6, 4), &device)?;
        let mut layer = LoraLinear::from_weight("blk.q_proj", w, None);
        let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &device)?;
        let before = layer.forward(&x, false)?;

        layer.attach(LoraAdapter::init(4, 6, 2, 4.0, 0.0, &device, &mut rng)?);
        let after = layer.forward(&x, false)?;

        let diff = (before - after)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "B starts at zero so output must not change: {diff}");
        assert_eq!(layer.short_name(), "q_proj");
        Ok(())
    }

    #[test]
    fn test_merged_weight_matches_adapted_forward() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(11);
        let w = Tensor::randn(0f32, 1f32, (5, 8), &device)?;
        let mut layer = LoraLinear::from_weight("mlp.up_proj", w, None);
        let adapter = LoraAdapter::init(8, 5, 4, 8.0, 0.0, &device, &mut rng)?;
        adapter
            .b
            .set(&Tensor::randn(0f32, 0.5f32, (5, 4), &device)?)?;
        layer.attach(adapter);

        let x = Tensor::randn(0f32, 1f32, (3, 8), &device)?;
        let adapted = layer.forward(&x, false)?;
        let merged = LoraLinear::from_weight("mlp.up_proj", layer.merged_weight()?, None);
        let dense = merged.forward(&x, false)?;

        let diff = (adapted - dense)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "merge drifted by {diff}");
        Ok(())
    }
}
