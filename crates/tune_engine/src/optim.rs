//! AdamW with persistable state, plus host-side gradient accumulation
//!
//! The optimizer keeps its moments as plain tensors keyed by parameter name so a
//! checkpoint can round-trip them through safetensors and resume bit-for-bit.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use std::collections::HashMap;

pub use candle_nn::ParamsAdamW;

const STEP_KEY: &str = "__step__";

struct Slot {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Decoupled weight decay Adam over named variables.
pub struct AdamW {
    slots: Vec<Slot>,
    params: ParamsAdamW,
    step: usize,
}

impl AdamW {
    pub fn new(vars: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let exp_avg = var.as_tensor().zeros_like()?;
                let exp_avg_sq = var.as_tensor().zeros_like()?;
                Ok(Slot {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn vars(&self) -> Vec<Var> {
        self.slots.iter().map(|s| s.var.clone()).collect()
    }

    /// One update from per-variable gradients aligned with the constructor order.
    /// Variables without a gradient are left untouched.
    pub fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        if grads.len() != self.slots.len() {
            candle_core::bail!(
                "expected {} gradients, got {}",
                self.slots.len(),
                grads.len()
            );
        }
        self.step += 1;
        let p = &self.params;
        let lr = p.lr;
        let lambda = p.weight_decay;
        let t = self.step as f64;
        let scale_m = 1.0 / (1.0 - p.beta1.powf(t));
        let scale_v = 1.0 / (1.0 - p.beta2.powf(t));

        for (slot, grad) in self.slots.iter_mut().zip(grads) {
            let Some(grad) = grad else { continue };
            let theta = slot.var.as_tensor();
            let grad = grad.to_dtype(theta.dtype())?;
            let m = ((&slot.exp_avg * p.beta1)? + (&grad * (1.0 - p.beta1))?)?;
            let v = ((&slot.exp_avg_sq * p.beta2)? + (grad.sqr()? * (1.0 - p.beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let decayed = (theta * (1.0 - lr * lambda))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + p.eps)?)?;
            let next = (decayed - (adjusted * lr)?)?;
            slot.var.set(&next)?;
            slot.exp_avg = m;
            slot.exp_avg_sq = v;
        }
        Ok(())
    }

    /// Moments and step counter, ready for `candle_core::safetensors::save`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for slot in &self.slots {
            out.insert(format!("{}.exp_avg", slot.name), slot.exp_avg.clone());
            out.insert(format!("{}.exp_avg_sq", slot.name), slot.exp_avg_sq.clone());
        }
        let device = self
            .slots
            .first()
            .map(|s| s.var.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        out.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step as u32], &device)?,
        );
        Ok(out)
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for slot in &mut self.slots {
            let device = slot.var.device().clone();
            let dtype = slot.var.dtype();
            for (suffix, target) in [
                ("exp_avg", &mut slot.exp_avg),
                ("exp_avg_sq", &mut slot.exp_avg_sq),
            ] {
                let key = format!("{}.{suffix}", slot.name);
                let Some(t) = state.get(&key) else {
                    candle_core::bail!("optimizer state is missing {key}");
                };
                if t.dims() != slot.var.dims() {
                    candle_core::bail!(
                        "optimizer state {key} has shape {:?}, expected {:?}",
                        t.dims(),
                        slot.var.dims()
                    );
                }
                *target = t.to_device(&device)?.to_dtype(dtype)?;
            }
        }
        if let Some(step) = state.get(STEP_KEY) {
            self.step = step.to_dtype(DType::U32)?.to_vec1::<u32>()?.first().copied().unwrap_or(0) as usize;
        }
        Ok(())
    }
}

/// Sums gradients over micro-batches, aligned with a fixed variable list.
pub struct GradAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    micro_batches: usize,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vec![None; vars.len()];
        Self {
            vars,
            sums,
            micro_batches: 0,
        }
    }

    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_empty(&self) -> bool {
        self.micro_batches == 0
    }

    /// Adds `grads * weight` for every tracked variable.
    pub fn accumulate(&mut self, grads: &GradStore, weight: f64) -> Result<()> {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let g = (g.detach() * weight)?;
            *sum = Some(match sum.take() {
                Some(acc) => (acc + g)?,
                None => g,
            });
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// L2 norm over every accumulated gradient.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0f64;
        for g in self.sums.iter().flatten() {
            total += g
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Rescales so the global norm is at most `max_norm`. Returns the pre-clip norm.
    pub fn clip_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if max_norm > 0.0 && norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            for sum in self.sums.iter_mut() {
                if let Some(g) = sum.take() {
                    *sum = Some((g * factor)?);
                }
            }
        }
        Ok(norm)
    }

    /// Hands out the accumulated gradients and resets.
    pub fn take(&mut self) -> Vec<Option<Tensor>> {
        self.micro_batches = 0;
        let fresh = vec![None; self.vars.len()];
        std::mem::replace(&mut self.sums, fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(lr: f64) -> ParamsAdamW {
        ParamsAdamW {
            lr,
            weight_decay: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_adamw_moves_against_gradient() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, -1f32], &device)?;
        let mut opt = AdamW::new(vec![("w".into(), w.clone())], params(0.1))?;
        let grad = Tensor::new(&[1f32, -1f32], &device)?;
        opt.step(&[Some(grad)])?;
        let after = w.as_tensor().to_vec1::<f32>()?;
        // first Adam step is lr * sign(grad)
        assert!((after[0] - 0.9).abs() < 1e-4);
        assert!((after[1] + 0.9).abs() < 1e-4);
        assert_eq!(opt.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_state_roundtrip_restores_step_and_moments() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[0.5f32, 0.25], &device)?;
        let mut opt = AdamW::new(vec![("w".into(), w.clone())], params(0.01))?;
        opt.step(&[Some(Tensor::new(&[0.3f32, 0.1], &device)?)])?;
        opt.step(&[Some(Tensor::new(&[0.2f32, -0.4], &device)?)])?;
        let state = opt.state_tensors()?;

        let w2 = Var::new(&[0f32, 0.], &device)?;
        let mut restored = AdamW::new(vec![("w".into(), w2)], params(0.01))?;
        restored.load_state(&state)?;
        assert_eq!(restored.step_count(), 2);
        let a = state["w.exp_avg"].to_vec1::<f32>()?;
        let b = restored.state_tensors()?["w.exp_avg"].to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_clip_norm_bounds_gradients() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, 1.], &device)?;
        let loss = (w.as_tensor() * 10.0)?.sum_all()?;
        let grads = loss.backward()?;
        let mut acc = GradAccumulator::new(vec![w]);
        acc.accumulate(&grads, 1.0)?;
        acc.accumulate(&grads, 1.0)?;
        assert_eq!(acc.micro_batches(), 2);
        let norm = acc.clip_norm(1.0)?;
        assert!((norm - (800f64).sqrt()).abs() < 1e-3);
        assert!((acc.global_norm()? - 1.0).abs() < 1e-3);
        let taken = acc.take();
        assert!(taken[0].is_some());
        assert!(acc.is_empty());
        Ok(())
    }
}
