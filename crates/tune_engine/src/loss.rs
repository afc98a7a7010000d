//! Masked causal LM loss
//!
//! Position t predicts token t+1. Label positions holding `IGNORE_INDEX` contribute
//! nothing to either the sum or the token count.

use candle_core::{Device, Result, Tensor, D};
use candle_nn::ops;

/// Sentinel label excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Shifted targets and mask for one batch, flattened to `batch * (seq - 1)`.
pub struct LabelBatch {
    pub targets: Tensor,
    pub mask: Tensor,
    pub token_count: usize,
    pub seq_len: usize,
}

impl LabelBatch {
    /// `labels`: one row per example, all of the same length.
    pub fn from_labels(labels: &[Vec<i64>], device: &Device) -> Result<Self> {
        let seq_len = labels.first().map(|row| row.len()).unwrap_or(0);
        if seq_len < 2 {
            candle_core::bail!("need at least two positions for next-token loss, got {seq_len}");
        }
        let mut targets = Vec::with_capacity(labels.len() * (seq_len - 1));
        let mut mask = Vec::with_capacity(labels.len() * (seq_len - 1));
        for row in labels {
            if row.len() != seq_len {
                candle_core::bail!("ragged label batch: {} vs {}", row.len(), seq_len);
            }
            for &label in &row[1..] {
                if label == IGNORE_INDEX {
                    targets.push(0u32);
                    mask.push(0f32);
                } else {
                    targets.push(label as u32);
                    mask.push(1f32);
                }
            }
        }
        let token_count = mask.iter().filter(|m| **m > 0.0).count();
        let n = targets.len();
        Ok(Self {
            targets: Tensor::from_vec(targets, n, device)?,
            mask: Tensor::from_vec(mask, n, device)?,
            token_count,
            seq_len,
        })
    }
}

/// Summed negative log-likelihood over unmasked positions (scalar, F32).
pub fn masked_nll_sum(logits: &Tensor, batch: &LabelBatch) -> Result<Tensor> {
    let (b, s, v) = logits.dims3()?;
    if s != batch.seq_len {
        candle_core::bail!("logits cover {s} positions, labels {}", batch.seq_len);
    }
    let logits_flat = logits.narrow(1, 0, s - 1)?.reshape((b * (s - 1), v))?;
    let log_sm = ops::log_softmax(&logits_flat, D::Minus1)?;
    let picked = log_sm
        .gather(&batch.targets.unsqueeze(1)?, D::Minus1)?
        .squeeze(1)?;
    (picked * &batch.mask)?.sum_all()?.neg()
}

/// Mean token NLL. A batch with no supervised tokens yields a zero loss.
pub fn causal_lm_loss(logits: &Tensor, batch: &LabelBatch) -> Result<Tensor> {
    let sum = masked_nll_sum(logits, batch)?;
    if batch.token_count == 0 {
        return sum.zeros_like();
    }
    sum / batch.token_count as f64
}
