//! Tokenization and batching for the causal LM objective.
//!
//! Every example becomes exactly `context_length` ids: EOS-terminated, truncated if
//! too long, right-padded if too short. Labels copy the ids and put `IGNORE_INDEX` on
//! padded positions only.

use anyhow::Result;
use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;
use tune_engine::{LabelBatch, IGNORE_INDEX};

use crate::data::TrainingExample;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::provision::TokenizerHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    pub fn real_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|m| **m == 1).count()
    }
}

pub struct Collator<'a> {
    tokenizer: &'a TokenizerHandle,
    context_length: usize,
}

impl<'a> Collator<'a> {
    pub fn new(tokenizer: &'a TokenizerHandle, context_length: usize) -> Self {
        Self {
            tokenizer,
            context_length,
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn encode(&self, text: &str) -> Result<TokenizedExample> {
        let mut ids = self.tokenizer.encode(text)?;
        ids.push(self.tokenizer.eos_id());
        ids.truncate(self.context_length);

        let real = ids.len();
        let mut attention_mask = vec![1u8; real];
        let mut labels: Vec<i64> = ids.iter().map(|&id| id as i64).collect();

        ids.resize(self.context_length, self.tokenizer.pad_id());
        attention_mask.resize(self.context_length, 0);
        labels.resize(self.context_length, IGNORE_INDEX);

        Ok(TokenizedExample {
            input_ids: ids,
            attention_mask,
            labels,
        })
    }

    /// Tokenizes in parallel; output order matches `examples`.
    pub fn encode_all(&self, examples: &[TrainingExample]) -> PipelineResult<Vec<TokenizedExample>> {
        if self.context_length < 2 {
            return Err(PipelineError::Config(format!(
                "context length {} leaves nothing to predict",
                self.context_length
            )));
        }
        let pb = ProgressBar::new(examples.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} examples")
        {
            pb.set_style(style);
        }

        let encoded: Result<Vec<TokenizedExample>> = examples
            .par_iter()
            .map(|ex| {
                let out = self.encode(ex.rendered_text());
                pb.inc(1);
                out
            })
            .collect();
        pb.finish_and_clear();

        let encoded = encoded.map_err(|e| PipelineError::at(Stage::Tokenize, e))?;
        let truncated = encoded
            .iter()
            .filter(|e| e.real_tokens() == self.context_length)
            .count();
        info!(
            "🔤 Tokenized {} examples at context {} ({} filled the window)",
            encoded.len(),
            self.context_length,
            truncated
        );
        Ok(encoded)
    }
}

/// One device-resident micro-batch.
pub struct Batch {
    pub input_ids: Tensor,
    pub labels: LabelBatch,
    pub size: usize,
}

impl Batch {
    pub fn from_examples(examples: &[TokenizedExample], device: &Device) -> candle_core::Result<Self> {
        let seq_len = examples.first().map(|e| e.input_ids.len()).unwrap_or(0);
        let flat: Vec<u32> = examples
            .iter()
            .flat_map(|e| e.input_ids.iter().copied())
            .collect();
        let input_ids = Tensor::from_vec(flat, (examples.len(), seq_len), device)?;
        let labels: Vec<Vec<i64>> = examples.iter().map(|e| e.labels.clone()).collect();
        Ok(Self {
            input_ids,
            labels: LabelBatch::from_labels(&labels, device)?,
            size: examples.len(),
        })
    }
}
