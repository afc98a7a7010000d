//! Training Loop - gradient-accumulated AdamW over a provisioned model
//!
//! Phases: Initializing → (Resuming | FreshStart) → Training ⇄ Evaluating →
//! (EarlyStopped | Completed) → Saving → Succeeded | Failed.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tune_engine::loss::masked_nll_sum;
use tune_engine::{AdamW, GradAccumulator, ParamsAdamW};

use super::checkpoint::{Checkpoint, CheckpointStore, TrainerState};
use super::schedule::{LrSchedule, RunSchedule};
use crate::collate::{Batch, TokenizedExample};
use crate::error::{PipelineError, PipelineResult, Stage, StageExt};
use crate::evaluate::evaluate;
use crate::provision::{SavedArtifact, TokenizerHandle, Tunable};
use crate::tracking::MetricsTracker;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
const LOG_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initializing,
    Resuming,
    FreshStart,
    Training,
    Evaluating,
    EarlyStopped,
    Completed,
    Saving,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    EarlyStopped,
}

/// Written to `run_summary.json` after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: Outcome,
    pub model_id: String,
    /// First optimizer step executed by this invocation (`None` if nothing was left).
    pub first_step: Option<usize>,
    pub final_step: usize,
    pub total_steps: usize,
    pub best_metric: Option<f64>,
    pub best_step: Option<usize>,
    pub resumed_from: Option<usize>,
    pub early_stopped: bool,
    pub trainable_parameters: usize,
    pub save_strategy: String,
    pub finished_at: String,
}

pub struct RunReport {
    pub summary: RunSummary,
    pub artifact: SavedArtifact,
    pub phases: Vec<Phase>,
}

#[derive(Default)]
struct LoopState {
    global_step: usize,
    epoch: usize,
    best_metric: Option<f64>,
    best_step: Option<usize>,
    patience_used: usize,
    best_weights: Option<HashMap<String, Tensor>>,
    first_step: Option<usize>,
    last_eval_step: Option<usize>,
}

#[derive(Default)]
struct PhaseLog(Vec<Phase>);

impl PhaseLog {
    fn enter(&mut self, phase: Phase) {
        debug!("phase -> {:?}", phase);
        self.0.push(phase);
    }
}

fn fail(step: usize, e: impl Into<anyhow::Error>) -> PipelineError {
    PipelineError::TrainingFailure {
        step,
        source: e.into(),
    }
}

/// The loop error stays the reported error; a failed emergency save rides along as context.
fn with_save_error(e: PipelineError, save_err: PipelineError) -> PipelineError {
    match e {
        PipelineError::TrainingFailure { step, source } => PipelineError::TrainingFailure {
            step,
            source: source.context(format!("emergency save failed: {save_err}")),
        },
        other => other,
    }
}

pub struct TrainingOrchestrator {
    output_dir: PathBuf,
    run: RunSchedule,
    model_id: String,
    track: bool,
    stop: Arc<AtomicBool>,
}

impl TrainingOrchestrator {
    pub fn new(output_dir: impl Into<PathBuf>, run: RunSchedule, model_id: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            run,
            model_id: model_id.into(),
            track: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tracking(mut self, track: bool) -> Self {
        self.track = track;
        self
    }

    /// Raising this flag ends the run after the current optimizer step.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run(
        &self,
        model: &dyn Tunable,
        tokenizer: &TokenizerHandle,
        train: &[TokenizedExample],
        validation: &[TokenizedExample],
    ) -> PipelineResult<RunReport> {
        let mut phases = PhaseLog::default();
        phases.enter(Phase::Initializing);
        if train.is_empty() {
            return Err(PipelineError::Config("training split is empty".into()));
        }
        if model.trainable().is_empty() {
            return Err(PipelineError::Config(
                "model has no trainable tensors".into(),
            ));
        }

        let sched = &self.run.schedule;
        let store = CheckpointStore::new(&self.output_dir).at_stage(Stage::Train)?;
        let mut optimizer = AdamW::new(
            model.trainable().to_vec(),
            ParamsAdamW {
                lr: sched.learning_rate,
                weight_decay: sched.weight_decay,
                ..Default::default()
            },
        )
        .map_err(|e| fail(0, e))?;

        let mut state = LoopState::default();
        let resumed_from = match store.latest().at_stage(Stage::Train)? {
            Some(ckpt) => {
                phases.enter(Phase::Resuming);
                self.resume(&ckpt, model, &mut optimizer, &mut state, &store)
                    .map_err(|e| fail(ckpt.step, e))?;
                Some(ckpt.step)
            }
            None => {
                phases.enter(Phase::FreshStart);
                info!("No checkpoint found. Starting fresh.");
                None
            }
        };

        let mut tracker = if self.track {
            Some(MetricsTracker::open(&self.output_dir).at_stage(Stage::Train)?)
        } else {
            None
        };

        phases.enter(Phase::Training);
        let outcome = match self.train_loop(
            model,
            train,
            validation,
            &store,
            &mut optimizer,
            &mut state,
            tracker.as_mut(),
            &mut phases,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                phases.enter(Phase::Saving);
                warn!(
                    "⚠️ Training stopped at step {}: saving current weights before exiting",
                    state.global_step
                );
                let e = match model.save(&self.output_dir, tokenizer) {
                    Ok(saved) => {
                        info!("💾 Emergency save complete ({})", saved.path.display());
                        e
                    }
                    Err(save_err) => {
                        error!("❌ Emergency save failed: {save_err}");
                        with_save_error(e, save_err)
                    }
                };
                phases.enter(Phase::Failed);
                return Err(e);
            }
        };

        phases.enter(match outcome {
            Outcome::Completed => Phase::Completed,
            Outcome::EarlyStopped => Phase::EarlyStopped,
        });
        if let Some(best) = state.best_weights.take() {
            model
                .restore(&best)
                .map_err(|e| fail(state.global_step, e))?;
            info!(
                "🌟 Restored best weights from step {} (eval loss {:.4})",
                state.best_step.unwrap_or(0),
                state.best_metric.unwrap_or(f64::NAN)
            );
        }

        phases.enter(Phase::Saving);
        let artifact = model.save(&self.output_dir, tokenizer)?;

        let summary = RunSummary {
            outcome,
            model_id: self.model_id.clone(),
            first_step: state.first_step,
            final_step: state.global_step,
            total_steps: self.run.total_steps(train.len()),
            best_metric: state.best_metric,
            best_step: state.best_step,
            resumed_from,
            early_stopped: outcome == Outcome::EarlyStopped,
            trainable_parameters: model.trainable_parameters(),
            save_strategy: artifact.strategy.to_string(),
            finished_at: chrono::Local::now().to_rfc3339(),
        };
        let summary_path = self.output_dir.join(RUN_SUMMARY_FILE);
        let file = File::create(&summary_path)
            .map_err(|e| PipelineError::io(Stage::Save, &summary_path, e))?;
        serde_json::to_writer_pretty(file, &summary).map_err(|e| PipelineError::Json {
            stage: Stage::Save,
            source: e,
        })?;
        phases.enter(Phase::Succeeded);
        info!(
            "✅ Training finished ({:?}) at step {}. Output: {}",
            outcome,
            state.global_step,
            self.output_dir.display()
        );

        Ok(RunReport {
            summary,
            artifact,
            phases: phases.0,
        })
    }

    fn resume(
        &self,
        ckpt: &Checkpoint,
        model: &dyn Tunable,
        optimizer: &mut AdamW,
        state: &mut LoopState,
        store: &CheckpointStore,
    ) -> Result<()> {
        let device = model.model().device().clone();
        let saved = ckpt.read_state()?;
        model.restore(&ckpt.load_trainable(&device)?)?;
        optimizer.load_state(&ckpt.load_optimizer(&device)?)?;
        if saved.model_id != self.model_id {
            warn!(
                "⚠️ Checkpoint was written for '{}', resuming it on '{}'",
                saved.model_id, self.model_id
            );
        }

        state.global_step = saved.global_step;
        state.epoch = saved.epoch;
        state.best_metric = saved.best_metric;
        state.best_step = saved.best_step;
        state.patience_used = saved.patience_used;
        if let Some(best) = saved.best_step {
            if best == saved.global_step {
                state.best_weights = Some(model.snapshot()?);
            } else if let Some(b) = store.discover()?.into_iter().find(|c| c.step == best) {
                state.best_weights = Some(b.load_trainable(&device)?);
            } else {
                warn!("⚠️ Best checkpoint (step {best}) is gone; final weights will be kept");
            }
        }
        info!(
            "📂 Resuming from {} (step {}, epoch {})",
            ckpt.path.display(),
            saved.global_step,
            saved.epoch
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn train_loop(
        &self,
        model: &dyn Tunable,
        train: &[TokenizedExample],
        validation: &[TokenizedExample],
        store: &CheckpointStore,
        optimizer: &mut AdamW,
        state: &mut LoopState,
        mut tracker: Option<&mut MetricsTracker>,
        phases: &mut PhaseLog,
    ) -> PipelineResult<Outcome> {
        let sched = &self.run.schedule;
        let device = model.model().device().clone();
        let batches: Vec<&[TokenizedExample]> = train.chunks(sched.batch_size.max(1)).collect();
        let steps_per_epoch = self.run.steps_per_epoch(train.len());
        let total_steps = self.run.total_steps(train.len());
        let lr = LrSchedule::new(sched.learning_rate, sched.warmup_ratio, total_steps);
        let eval_enabled = !validation.is_empty();
        let mut accum = GradAccumulator::new(optimizer.vars());

        info!(
            "Starting training: {} examples | batch {} x accum {} | {} steps/epoch | {} epochs | {} trainable params",
            train.len(),
            sched.batch_size,
            sched.grad_accum,
            steps_per_epoch,
            sched.epochs,
            model.trainable_parameters()
        );
        if !eval_enabled {
            info!("ℹ️ Validation split is empty: evaluation and early stopping are disabled");
        }
        if state.global_step >= total_steps {
            info!("Checkpoint is already at step {}; nothing left to train", state.global_step);
            return Ok(Outcome::Completed);
        }

        let start_epoch = state.global_step / steps_per_epoch;
        let skip_windows = state.global_step % steps_per_epoch;
        let start_time = std::time::Instant::now();

        for epoch in start_epoch..sched.epochs {
            state.epoch = epoch;
            for (w, window) in batches.chunks(sched.grad_accum.max(1)).enumerate() {
                if epoch == start_epoch && w < skip_windows {
                    continue;
                }
                let step = state.global_step + 1;
                let current_lr = lr.at(step);
                let (loss, grad_norm) = optimizer_step(
                    model,
                    window,
                    &device,
                    optimizer,
                    &mut accum,
                    current_lr,
                    sched.max_grad_norm,
                )
                .map_err(|e| fail(step, e))?;
                state.global_step = step;
                state.first_step.get_or_insert(step);

                if step == 1 || step % LOG_INTERVAL == 0 || step == total_steps {
                    let elapsed = start_time.elapsed().as_secs_f64().max(1e-9);
                    let done = step - state.first_step.unwrap_or(step) + 1;
                    info!(
                        "Step {:4} | Loss: {:.4} | LR: {:.7} | Grad: {:.3} | Epoch {}/{} | {:.2} steps/s",
                        step,
                        loss,
                        current_lr,
                        grad_norm,
                        epoch + 1,
                        sched.epochs,
                        done as f64 / elapsed
                    );
                }

                let mut eval_loss = None;
                let mut stop_early = false;
                if eval_enabled && step % sched.eval_every.max(1) == 0 {
                    phases.enter(Phase::Evaluating);
                    (eval_loss, stop_early) = self.evaluate_step(model, validation, &device, state)?;
                    if !stop_early {
                        phases.enter(Phase::Training);
                    }
                }

                if step % sched.save_every.max(1) == 0 {
                    self.checkpoint(model, optimizer, state, store, current_lr)
                        .map_err(|e| fail(step, e))?;
                }

                if let Some(t) = tracker.as_deref_mut() {
                    if let Err(e) = t.record(step, loss, current_lr, eval_loss, grad_norm) {
                        warn!("⚠️ Failed to record metrics: {e:#}");
                    }
                }

                if self.stop.load(Ordering::SeqCst) {
                    info!("🛑 Stop requested after step {step}");
                    return Err(PipelineError::Interrupted { step });
                }
                if stop_early {
                    return Ok(Outcome::EarlyStopped);
                }
            }
        }

        if eval_enabled && state.last_eval_step != Some(state.global_step) {
            phases.enter(Phase::Evaluating);
            self.evaluate_step(model, validation, &device, state)?;
        }
        Ok(Outcome::Completed)
    }

    /// Returns the eval loss and whether patience ran out.
    fn evaluate_step(
        &self,
        model: &dyn Tunable,
        validation: &[TokenizedExample],
        device: &Device,
        state: &mut LoopState,
    ) -> PipelineResult<(Option<f64>, bool)> {
        let step = state.global_step;
        let sched = &self.run.schedule;
        let Some(result) =
            evaluate(model.model(), validation, sched.batch_size, device).map_err(|e| fail(step, e))?
        else {
            return Ok((None, false));
        };
        state.last_eval_step = Some(step);
        info!(
            "📊 Eval @ step {}: loss {:.4} | ppl {:.2} | {} tokens",
            step, result.loss, result.perplexity, result.tokens
        );

        if state.best_metric.map_or(true, |best| result.loss < best) {
            state.best_metric = Some(result.loss);
            state.best_step = Some(step);
            state.patience_used = 0;
            state.best_weights = Some(model.snapshot().map_err(|e| fail(step, e))?);
            info!("🌟 New Best Loss: {:.4} (step {})", result.loss, step);
            return Ok((Some(result.loss), false));
        }

        state.patience_used += 1;
        info!(
            "Eval loss did not improve on {:.4} ({}/{})",
            state.best_metric.unwrap_or(f64::NAN),
            state.patience_used,
            sched.patience
        );
        let exhausted = sched.patience > 0 && state.patience_used >= sched.patience;
        if exhausted {
            info!("⏹️ Early stopping at step {step}");
        }
        Ok((Some(result.loss), exhausted))
    }

    fn checkpoint(
        &self,
        model: &dyn Tunable,
        optimizer: &AdamW,
        state: &LoopState,
        store: &CheckpointStore,
        learning_rate: f64,
    ) -> Result<()> {
        let trainable: HashMap<String, Tensor> = model
            .trainable()
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().clone()))
            .collect();
        let trainer_state = TrainerState {
            global_step: state.global_step,
            epoch: state.epoch,
            best_metric: state.best_metric,
            best_step: state.best_step,
            patience_used: state.patience_used,
            learning_rate,
            model_id: self.model_id.clone(),
            saved_at: String::new(),
        }
        .stamp();
        store.save(&trainer_state, &trainable, &optimizer.state_tensors()?)?;
        store.rotate(self.run.schedule.retained_checkpoints, state.best_step)?;
        Ok(())
    }
}

/// One optimizer update over an accumulation window. Returns the token-mean loss and
/// the pre-clip gradient norm.
///
/// A window with no supervised tokens leaves the weights and optimizer moments alone
/// and reports `(0.0, 0.0)`. The caller still counts it as a step, so `global_step`
/// and the LR schedule advance past it.
fn optimizer_step(
    model: &dyn Tunable,
    window: &[&[TokenizedExample]],
    device: &Device,
    optimizer: &mut AdamW,
    accum: &mut GradAccumulator,
    lr: f64,
    max_grad_norm: f64,
) -> Result<(f64, f64)> {
    let batches = window
        .iter()
        .map(|b| Batch::from_examples(b, device))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let tokens: usize = batches.iter().map(|b| b.labels.token_count).sum();
    if tokens == 0 {
        debug!("Accumulation window has no supervised tokens, skipping update");
        return Ok((0.0, 0.0));
    }

    let mut nll_total = 0f64;
    for batch in &batches {
        if batch.labels.token_count == 0 {
            continue;
        }
        let logits = model.model().forward(&batch.input_ids, true)?;
        let nll = masked_nll_sum(&logits, &batch.labels)?;
        nll_total += nll.to_scalar::<f32>()? as f64;
        let loss = nll.affine(1.0 / tokens as f64, 0.0)?;
        let grads = loss.backward()?;
        accum.accumulate(&grads, 1.0)?;
    }

    let loss = nll_total / tokens as f64;
    if !loss.is_finite() {
        accum.take();
        anyhow::bail!("loss is not finite ({loss})");
    }
    let norm = accum.clip_norm(max_grad_norm)?;
    optimizer.set_learning_rate(lr);
    optimizer.step(&accum.take())?;
    Ok((loss, norm))
}
