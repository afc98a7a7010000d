use super::LoraLinear;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ops::softmax_last_dim, VarBuilder};

/// Rotary Position Embedding (non-interleaved, LLaMA layout)
#[derive(Clone)]
pub struct RotaryEmbedding {
    pub cos_cache: Tensor,
    pub sin_cache: Tensor,
    pub head_dim: usize,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        // inv_freq_i = 1 / theta^(2i/dim) for i in 0..dim/2
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / (theta.powf((2 * i) as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
        })
    }

    /// Input shape: [batch, heads, seq_len, head_dim]
    pub fn apply(&self, x: &Tensor, pos: usize, seq_len: usize) -> Result<Tensor> {
        let half_dim = self.head_dim / 2;
        let (batch, heads, _, _) = x.dims4()?;

        let cos = self.cos_cache.narrow(0, pos, seq_len)?;
        let sin = self.sin_cache.narrow(0, pos, seq_len)?;
        let (cos, sin) = if cos.device().same_device(x.device()) {
            (cos, sin)
        } else {
            (cos.to_device(x.device())?, sin.to_device(x.device())?)
        };
        let cos = cos.to_dtype(x.dtype())?;
        let sin = sin.to_dtype(x.dtype())?;

        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        let cos = cos
            .unsqueeze(0)?
            .unsqueeze(0)?
            .broadcast_as((batch, heads, seq_len, half_dim))?;
        let sin = sin
            .unsqueeze(0)?
            .unsqueeze(0)?
            .broadcast_as((batch, heads, seq_len, half_dim))?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let out1 = ((&x1 * &cos)? - (&x2 * &sin)?)?;
        let out2 = ((&x1 * &sin)? + (&x2 * &cos)?)?;

        Tensor::cat(&[&out1, &out2], 3)
    }
}

pub struct CausalSelfAttention {
    pub q_proj: LoraLinear,
    pub k_proj: LoraLinear,
    pub v_proj: LoraLinear,
    pub o_proj: LoraLinear,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub scaling: f64,
    pub rotary_emb: RotaryEmbedding,
}

impl CausalSelfAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        hidden_dim: usize,
        n_heads: usize,
        n_kv_heads: usize,
        rope_theta: f64,
        max_position_embeddings: usize,
        vb: VarBuilder,
        prefix: &str,
        device: &Device,
    ) -> Result<Self> {
        let head_dim = hidden_dim / n_heads;
        let scaling = 1.0 / (head_dim as f64).sqrt();

        let q_proj = LoraLinear::load(
            hidden_dim,
            n_heads * head_dim,
            vb.pp("q_proj"),
            format!("{prefix}.q_proj"),
        )?;
        let k_proj = LoraLinear::load(
            hidden_dim,
            n_kv_heads * head_dim,
            vb.pp("k_proj"),
            format!("{prefix}.k_proj"),
        )?;
        let v_proj = LoraLinear::load(
            hidden_dim,
            n_kv_heads * head_dim,
            vb.pp("v_proj"),
            format!("{prefix}.v_proj"),
        )?;
        let o_proj = LoraLinear::load(
            n_heads * head_dim,
            hidden_dim,
            vb.pp("o_proj"),
            format!("{prefix}.o_proj"),
        )?;

        let rotary_emb =
            RotaryEmbedding::new(head_dim, max_position_embeddings, rope_theta, device)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_heads,
            n_kv_heads,
            head_dim,
            scaling,
            rotary_emb,
        })
    }

    /// Full-sequence causal attention. `x`: [batch, seq, hidden].
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b_sz, seq_len, hidden) = x.dims3()?;

        let q = self.q_proj.forward(x, train)?;
        let k = self.k_proj.forward(x, train)?;
        let v = self.v_proj.forward(x, train)?;

        // [Batch, Seq, Heads * Dim] -> [Batch, Heads, Seq, Dim]
        let q = q
            .reshape((b_sz, seq_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rotary_emb.apply(&q, 0, seq_len)?;
        let k = self.rotary_emb.apply(&k, 0, seq_len)?;

        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;

        let att = (q.matmul(&k.t()?.contiguous()?)? * self.scaling)?;
        let att = self.apply_causal_mask(&att, seq_len)?;
        let att = softmax_last_dim(&att.to_dtype(DType::F32)?)?.to_dtype(v.dtype())?;

        let y = att.matmul(&v)?;

        // [Batch, Heads, Seq, Dim] -> [Batch, Seq, Hidden]
        let y = y.transpose(1, 2)?.reshape((b_sz, seq_len, hidden))?;
        self.o_proj.forward(&y, train)
    }

    pub fn linears(&self) -> [&LoraLinear; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
    }

    pub fn linears_mut(&mut self) -> [&mut LoraLinear; 4] {
        [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
        ]
    }

    // GQA: repeat K/V heads when n_kv_heads < n_heads
    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        let n_rep = self.n_heads / self.n_kv_heads;
        if n_rep == 1 {
            return Ok(x);
        }
        let (b, n_kv, s, d) = x.dims4()?;
        Tensor::cat(&vec![&x; n_rep], 2)?.reshape((b, n_kv * n_rep, s, d))
    }

    fn apply_causal_mask(&self, att: &Tensor, seq_len: usize) -> Result<Tensor> {
        if seq_len == 1 {
            return Ok(att.clone());
        }
        // 0 where j <= i, -inf above the diagonal
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY })
            })
            .collect();
        let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), &Device::Cpu)?
            .to_dtype(att.dtype())?
            .to_device(att.device())?;
        att.broadcast_add(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_keeps_shape_and_position_zero() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dim = 8;
        let seq_len = 5;
        let rope = RotaryEmbedding::new(dim, 64, 10_000.0, &device)?;
        let q = Tensor::ones((1, 2, seq_len, dim), DType::F32, &device)?;
        let q_rot = rope.apply(&q, 0, seq_len)?;
        assert_eq!(q_rot.dims(), &[1, 2, seq_len, dim]);

        // cos(0) = 1, sin(0) = 0: position 0 is unrotated
        let first = q_rot.get(0)?.get(0)?.get(0)?.to_vec1::<f32>()?;
        assert!(first.iter().all(|v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }
}
