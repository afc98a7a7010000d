//! Single-prompt generation from a trained or exported model.

use anyhow::Result;
use clap::Args;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{debug, info};
use tune_engine::CausalLm;

use crate::config::RuntimeEnv;
use crate::data::template::PromptTemplate;
use crate::error::{PipelineResult, Stage, StageExt};
use crate::provision::{ModelProvisioner, TokenizerHandle};

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Training output directory or merged export
    #[arg(long, default_value = "./finetuned_model")]
    pub model_dir: PathBuf,

    #[arg(long)]
    pub prompt: String,

    #[arg(long, default_value_t = 100)]
    pub max_new_tokens: usize,

    #[arg(long, default_value_t = 0.7)]
    pub temperature: f64,

    #[arg(long, default_value_t = 0.9)]
    pub top_p: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, action)]
    pub force_cpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    /// Below 1e-6 decoding is greedy.
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
        }
    }

    fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    StopSequence,
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Response text with the prompt and any stop sequence removed.
    pub text: String,
    pub token_ids: Vec<u32>,
    pub stop_reason: StopReason,
}

pub struct Generator<'a> {
    model: &'a CausalLm,
    tokenizer: &'a TokenizerHandle,
    template: PromptTemplate,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a CausalLm, tokenizer: &'a TokenizerHandle) -> Self {
        Self {
            model,
            tokenizer,
            template: PromptTemplate::instruction(),
        }
    }

    pub fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation> {
        let mut ids = self.tokenizer.encode(&self.template.prompt(prompt))?;
        let prompt_len = ids.len();
        let max_positions = self.model.config().max_position_embeddings;
        let stops = self.template.stop_sequences();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut stop_reason = StopReason::Length;
        let mut text = String::new();

        for _ in 0..params.max_new_tokens {
            if ids.len() >= max_positions {
                debug!("context window full at {} tokens", ids.len());
                break;
            }
            let logits: Vec<f32> = self.model.next_token_logits(&ids)?.to_vec1()?;
            let next = if params.is_greedy() {
                argmax(&logits)
            } else {
                sample_top_p(&logits, params.temperature, params.top_p, &mut rng)?
            };
            if next == self.tokenizer.eos_id() {
                stop_reason = StopReason::Eos;
                break;
            }
            ids.push(next);

            text = self.tokenizer.decode(&ids[prompt_len..])?;
            if let Some(cut) = stops.iter().filter_map(|s| text.find(s.as_str())).min() {
                text.truncate(cut);
                stop_reason = StopReason::StopSequence;
                break;
            }
        }

        Ok(Generation {
            text: self.template.extract_response(&text).to_string(),
            token_ids: ids[prompt_len..].to_vec(),
            stop_reason,
        })
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0 as u32
}

/// Temperature-scaled nucleus sampling: keep the smallest set of tokens whose
/// probability mass reaches `top_p`.
fn sample_top_p(logits: &[f32], temperature: f64, top_p: f64, rng: &mut StdRng) -> Result<u32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;
    let mut probs: Vec<(usize, f64)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, ((l as f64 - max) / temperature).exp()))
        .collect();
    let total: f64 = probs.iter().map(|(_, p)| p).sum();
    probs.iter_mut().for_each(|(_, p)| *p /= total);
    probs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut mass = 0.0;
    let mut keep = 0;
    for (_, p) in &probs {
        mass += p;
        keep += 1;
        if mass >= top_p {
            break;
        }
    }
    probs.truncate(keep.max(1));

    let dist = WeightedIndex::new(probs.iter().map(|(_, p)| *p))?;
    Ok(probs[dist.sample(rng)].0 as u32)
}

pub fn run(args: &GenerateArgs, env: RuntimeEnv) -> PipelineResult<Generation> {
    let device = tune_engine::device_utils::select_device(args.force_cpu);
    let provisioned = ModelProvisioner::new(env).load_trained(&args.model_dir, &device)?;
    let params = SamplingParams {
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
        seed: args.seed,
    };
    let generation = Generator::new(provisioned.model.model(), &provisioned.tokenizer)
        .generate(&args.prompt, &params)
        .at_stage(Stage::Generate)?;
    info!("Prompt: {}", args.prompt);
    info!("Response: {}", generation.text);
    Ok(generation)
}
