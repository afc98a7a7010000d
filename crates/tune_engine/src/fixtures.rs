//! Tiny random models for dry runs and tests.
//!
//! Writes a llama-layout `config.json` + `model.safetensors` and a word-level
//! `tokenizer.json` whose vocabulary covers the instruction template and a small
//! shell-command corpus.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

use crate::model::LlamaConfig;

pub const UNK: &str = "<unk>";
pub const PAD: &str = "<pad>";
pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

const WORDS: &[&str] = &[
    "###", "Instruction", "Response", ":", "Convert", "this", "to", "code", "list",
    "files", "find", "largest", "check", "disk", "space", "with", "a", "command", "that",
    "is", "quite", "long", "indeed", "search", "text", "in", "ls", "la", "du", "sh",
    "sort", "rh", "head", "df", "h", "grep", "r", "n", "pattern", ".", "-", "*", "|",
    "/", "\"", "'", "the", "and", "of", "show", "all", "count", "lines", "wc", "l",
];

#[derive(Clone, Debug)]
pub struct FixtureOptions {
    pub seed: u64,
    /// Emit a dedicated `<pad>` token. Without it the tokenizer only knows EOS.
    pub with_pad: bool,
    pub tie_word_embeddings: bool,
    /// Tensor names left out of `model.safetensors`.
    pub omit: Vec<String>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            with_pad: true,
            tie_word_embeddings: false,
            omit: Vec::new(),
        }
    }
}

/// Special tokens followed by the fixture word list.
pub fn vocabulary(with_pad: bool) -> Vec<String> {
    let mut specials = vec![UNK];
    if with_pad {
        specials.push(PAD);
    }
    specials.extend([BOS, EOS]);
    specials
        .into_iter()
        .chain(WORDS.iter().copied())
        .map(String::from)
        .collect()
}

/// Writes a word-level `tokenizer.json`. Returns the vocabulary size.
pub fn write_tokenizer(path: &Path, with_pad: bool) -> Result<usize> {
    let vocab = vocabulary(with_pad);
    let specials = if with_pad { 4 } else { 3 };
    let added_tokens: Vec<_> = vocab
        .iter()
        .take(specials)
        .enumerate()
        .map(|(id, content)| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();
    let ids: serde_json::Map<String, serde_json::Value> = vocab
        .iter()
        .enumerate()
        .map(|(id, tok)| (tok.clone(), json!(id)))
        .collect();

    let doc = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": ids, "unk_token": UNK }
    });
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, &doc)?;
    Ok(vocab.len())
}

/// Random weights for every tensor `cfg` expects, minus `omit`.
pub fn random_weights(
    cfg: &LlamaConfig,
    seed: u64,
    omit: &[String],
) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();
    for (name, shape) in cfg.expected_tensors() {
        if omit.contains(&name) {
            continue;
        }
        let n: usize = shape.iter().product();
        let data: Vec<f32> = if name.ends_with("norm.weight") {
            vec![1.0; n]
        } else {
            (0..n).map(|_| rng.gen_range(-0.08f32..0.08)).collect()
        };
        tensors.insert(name, Tensor::from_vec(data, shape, &Device::Cpu)?);
    }
    Ok(tensors)
}

/// Writes `config.json`, `model.safetensors` and `tokenizer.json` into `dir`.
pub fn write_tiny_model(dir: &Path, opts: &FixtureOptions) -> Result<LlamaConfig> {
    std::fs::create_dir_all(dir)?;
    let vocab_size = write_tokenizer(&dir.join("tokenizer.json"), opts.with_pad)?;
    let mut cfg = LlamaConfig::tiny(vocab_size);
    cfg.tie_word_embeddings = opts.tie_word_embeddings;
    cfg.save(dir.join("config.json"))?;

    let tensors = random_weights(&cfg, opts.seed, &opts.omit)?;
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
    tracing::debug!(
        "Wrote tiny model ({} params) to {}",
        cfg.parameter_count(),
        dir.display()
    );
    Ok(cfg)
}
