//! Tokenizer loading with guaranteed EOS and PAD ids.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{info, warn};

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];

pub struct TokenizerHandle {
    tokenizer: Tokenizer,
    eos_id: u32,
    eos_token: String,
    pad_id: u32,
    pad_token: String,
    pad_aliased: bool,
}

impl TokenizerHandle {
    /// `tokenizer_config` is the optional HF `tokenizer_config.json`.
    pub fn load(tokenizer_json: &Path, tokenizer_config: Option<&Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_json)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {e}", tokenizer_json.display()))?;
        let declared_eos = match tokenizer_config {
            Some(path) if path.exists() => config_token(path, "eos_token")?,
            _ => None,
        };
        Self::from_tokenizer(tokenizer, declared_eos)
    }

    pub fn from_tokenizer(mut tokenizer: Tokenizer, declared_eos: Option<String>) -> Result<Self> {
        let (eos_token, eos_id) = declared_eos
            .and_then(|tok| tokenizer.token_to_id(&tok).map(|id| (tok, id)))
            .or_else(|| first_known(&tokenizer, EOS_CANDIDATES))
            .ok_or_else(|| anyhow!("tokenizer defines no end-of-sequence token"))?;

        let declared_pad = tokenizer
            .get_padding()
            .map(|p| (p.pad_token.clone(), p.pad_id))
            .filter(|(tok, id)| tokenizer.token_to_id(tok) == Some(*id));
        let (pad_token, pad_id, pad_aliased) = match declared_pad
            .or_else(|| first_known(&tokenizer, PAD_CANDIDATES))
        {
            Some((tok, id)) => (tok, id, false),
            None => {
                warn!("⚠️ No pad token defined, aliasing PAD to EOS ({eos_token})");
                (eos_token.clone(), eos_id, true)
            }
        };

        // The saved tokenizer carries the pad token too.
        tokenizer.with_padding(Some(PaddingParams {
            pad_id,
            pad_token: pad_token.clone(),
            ..Default::default()
        }));
        info!(
            "✅ Tokenizer Loaded. Vocab Size: {} | EOS={} ({}) | PAD={} ({})",
            tokenizer.get_vocab_size(true),
            eos_token,
            eos_id,
            pad_token,
            pad_id
        );

        Ok(Self {
            tokenizer,
            eos_id,
            eos_token,
            pad_id,
            pad_token,
            pad_aliased,
        })
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    /// True when the tokenizer had no pad token and PAD now shares the EOS id.
    pub fn pad_aliased(&self) -> bool {
        self.pad_aliased
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Unpadded ids for `text`.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let len = encoding
            .get_attention_mask()
            .iter()
            .take_while(|m| **m == 1)
            .count();
        Ok(encoding.get_ids()[..len].to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("decode failed: {e}"))
    }

    /// Writes `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join("tokenizer.json");
        self.tokenizer
            .save(&path, true)
            .map_err(|e| anyhow!("Failed to save tokenizer {}: {e}", path.display()))
    }
}

fn first_known(tokenizer: &Tokenizer, candidates: &[&str]) -> Option<(String, u32)> {
    candidates
        .iter()
        .find_map(|tok| tokenizer.token_to_id(tok).map(|id| (tok.to_string(), id)))
}

/// Reads a special token from `tokenizer_config.json`; HF stores either a string or
/// an object with a `content` field.
fn config_token(path: &Path, key: &str) -> Result<Option<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(match json.get(key) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(obj) => obj
            .get("content")
            .and_then(|c| c.as_str())
            .map(String::from),
        None => None,
    })
}
