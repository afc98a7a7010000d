//! Validation loss (mean token NLL) and perplexity.

use anyhow::Result;
use candle_core::Device;
use tracing::debug;
use tune_engine::loss::masked_nll_sum;
use tune_engine::CausalLm;

use crate::collate::{Batch, TokenizedExample};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub loss: f64,
    pub perplexity: f64,
    pub tokens: usize,
}

/// `None` when `examples` has no supervised tokens.
pub fn evaluate(
    model: &CausalLm,
    examples: &[TokenizedExample],
    batch_size: usize,
    device: &Device,
) -> Result<Option<EvalResult>> {
    let mut total_nll = 0.0f64;
    let mut total_tokens = 0usize;

    for chunk in examples.chunks(batch_size.max(1)) {
        let batch = Batch::from_examples(chunk, device)?;
        if batch.labels.token_count == 0 {
            continue;
        }
        let logits = model.forward(&batch.input_ids, false)?;
        let nll = masked_nll_sum(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
        total_nll += nll;
        total_tokens += batch.labels.token_count;
        debug!("eval chunk: nll {:.4} over {} tokens", nll, batch.labels.token_count);
    }

    if total_tokens == 0 {
        return Ok(None);
    }
    let loss = total_nll / total_tokens as f64;
    Ok(Some(EvalResult {
        loss,
        perplexity: loss.exp(),
        tokens: total_tokens,
    }))
}
