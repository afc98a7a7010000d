//! SwiGLU - Gated MLP with SiLU activation

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::LoraLinear;

/// SwiGLU MLP block (Gate, Up, Down projections)
pub struct SwiGLU {
    pub gate_proj: LoraLinear,
    pub up_proj: LoraLinear,
    pub down_proj: LoraLinear,
}

impl SwiGLU {
    pub fn load(
        hidden_dim: usize,
        intermediate_dim: usize,
        vb: VarBuilder,
        prefix: &str,
    ) -> Result<Self> {
        let gate_proj = LoraLinear::load(
            hidden_dim,
            intermediate_dim,
            vb.pp("gate_proj"),
            format!("{prefix}.gate_proj"),
        )?;
        let up_proj = LoraLinear::load(
            hidden_dim,
            intermediate_dim,
            vb.pp("up_proj"),
            format!("{prefix}.up_proj"),
        )?;
        let down_proj = LoraLinear::load(
            intermediate_dim,
            hidden_dim,
            vb.pp("down_proj"),
            format!("{prefix}.down_proj"),
        )?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x_gate = self.gate_proj.forward(x, train)?;
        let x_up = self.up_proj.forward(x, train)?;
        let silu_gate = candle_nn::ops::silu(&x_gate)?;
        let hidden = (silu_gate * x_up)?;
        self.down_proj.forward(&hidden, train)
    }

    pub fn linears(&self) -> [&LoraLinear; 3] {
        [&self.gate_proj, &self.up_proj, &self.down_proj]
    }

    pub fn linears_mut(&mut self) -> [&mut LoraLinear; 3] {
        [&mut self.gate_proj, &mut self.up_proj, &mut self.down_proj]
    }
}
