mod common;

use anyhow::Result;
use candle_core::{DType, Device};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tune_engine::fixtures::FixtureOptions;
use tune_engine::IGNORE_INDEX;
use tune_llama::provision::{ModelProvisioner, TuningKind};
use tune_llama::tracking::{read_metrics, METRICS_FILE};
use tune_llama::train::checkpoint::TRAINER_STATE_FILE;
use tune_llama::train::{CheckpointStore, Outcome, Phase, TrainingOrchestrator, RUN_SUMMARY_FILE};
use tune_llama::PipelineError;

/// 5 examples, 1 held out: 4 train examples, batch 2, no accumulation = 2 steps/epoch.
const TEST_FRACTION: f64 = 0.34;

#[test]
fn test_adapter_run_completes_and_saves() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    assert_eq!(dataset.validation.len(), 1);
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    let out = root.path().join("run");
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(2, 2, 1), &p.model_id)
        .with_tracking(true)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val)?;

    assert_eq!(report.summary.final_step, 4);
    assert_eq!(report.summary.total_steps, 4);
    assert_eq!(report.summary.first_step, Some(1));
    assert_eq!(report.summary.resumed_from, None);
    assert_eq!(report.summary.save_strategy, "peft");
    assert!(report.summary.best_metric.is_some());
    assert!(out.join("adapter_model.safetensors").is_file());
    assert!(out.join("adapter_config.json").is_file());
    assert!(out.join("tokenizer.json").is_file());
    assert!(out.join(RUN_SUMMARY_FILE).is_file());

    let steps: Vec<usize> = CheckpointStore::new(&out)?
        .discover()?
        .iter()
        .map(|c| c.step)
        .collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);

    assert_eq!(
        &report.phases[..3],
        &[Phase::Initializing, Phase::FreshStart, Phase::Training]
    );
    assert!(report.phases.contains(&Phase::Evaluating));
    assert_eq!(report.phases.last(), Some(&Phase::Succeeded));

    let metrics = read_metrics(&out.join(METRICS_FILE))?;
    assert_eq!(metrics.len(), 4);
    assert!(metrics.iter().all(|m| m.loss.is_finite()));
    assert!(metrics[1].eval_loss.is_some());
    assert!(metrics[0].eval_loss.is_none());
    Ok(())
}

#[test]
fn test_resume_continues_from_latest_checkpoint() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let out = root.path().join("run");

    let first = common::provision(root.path(), &model_dir)?;
    let (train, val) = common::tokenize(&first.tokenizer, &dataset, 32)?;
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(1, 2, 1), &first.model_id)
        .run(first.model.as_ref(), &first.tokenizer, &train, &val)?;
    assert_eq!(report.summary.final_step, 2);

    let store = CheckpointStore::new(&out)?;
    let state_1 = std::fs::read(store.path_for(1).join(TRAINER_STATE_FILE))?;
    let state_2 = std::fs::read(store.path_for(2).join(TRAINER_STATE_FILE))?;

    let second = common::provision(root.path(), &model_dir)?;
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(2, 2, 1), &second.model_id)
        .run(second.model.as_ref(), &second.tokenizer, &train, &val)?;

    assert_eq!(report.summary.resumed_from, Some(2));
    assert_eq!(report.summary.first_step, Some(3));
    assert_eq!(report.summary.final_step, 4);
    assert_eq!(report.phases[1], Phase::Resuming);
    assert_eq!(std::fs::read(store.path_for(1).join(TRAINER_STATE_FILE))?, state_1);
    assert_eq!(std::fs::read(store.path_for(2).join(TRAINER_STATE_FILE))?, state_2);
    assert_eq!(store.latest()?.map(|c| c.step), Some(4));
    Ok(())
}

#[test]
fn test_stop_flag_interrupts_after_first_step() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    let out = root.path().join("run");
    let stop = Arc::new(AtomicBool::new(true));
    let result = TrainingOrchestrator::new(&out, common::quick_schedule(2, 2, 1), &p.model_id)
        .with_stop_flag(stop)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val);

    match result {
        Err(PipelineError::Interrupted { step }) => assert_eq!(step, 1),
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("run should have been interrupted"),
    }
    // emergency save, no summary
    assert!(out.join("adapter_model.safetensors").is_file());
    assert!(!out.join(RUN_SUMMARY_FILE).exists());
    assert!(CheckpointStore::new(&out)?.path_for(1).is_dir());
    Ok(())
}

#[test]
fn test_patience_exhaustion_stops_early_and_restores_best() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    // lr this high overshoots, so eval loss stops improving within a few steps
    let mut run = common::quick_schedule(4, 2, 1);
    run.schedule.eval_every = 1;
    run.schedule.patience = 1;
    run.schedule.learning_rate = 5.0;

    let out = root.path().join("run");
    let report = TrainingOrchestrator::new(&out, run, &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val)?;

    assert_eq!(report.summary.outcome, Outcome::EarlyStopped);
    assert!(report.summary.early_stopped);
    assert!(report.summary.final_step < report.summary.total_steps);
    let best_step = report
        .summary
        .best_step
        .ok_or_else(|| anyhow::anyhow!("no best step recorded"))?;
    assert!(best_step < report.summary.final_step);
    assert!(report.phases.contains(&Phase::EarlyStopped));
    assert!(!report.phases.contains(&Phase::Completed));

    let best = CheckpointStore::new(&out)?
        .discover()?
        .into_iter()
        .find(|c| c.step == best_step)
        .ok_or_else(|| anyhow::anyhow!("checkpoint-{best_step} missing"))?;
    let expected = best.load_trainable(&Device::Cpu)?;
    let restored = p.model.snapshot()?;
    assert_eq!(restored.len(), expected.len());
    for (name, value) in &restored {
        let want = expected
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("{name} not in checkpoint"))?;
        let diff = (value.to_dtype(DType::F32)? - want.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0, "{name} differs from checkpoint-{best_step}");
    }
    Ok(())
}

#[test]
fn test_failed_emergency_save_keeps_training_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    let out = root.path().join("run");
    std::fs::create_dir_all(&out)?;
    // step 1 checkpoint cannot clear its staging path
    std::fs::write(out.join(".checkpoint-1.tmp"), b"not a directory")?;
    // and neither adapter layout can be written
    std::fs::create_dir_all(out.join("adapter_model.safetensors"))?;
    std::fs::write(out.join("default"), b"not a directory")?;

    let result = TrainingOrchestrator::new(&out, common::quick_schedule(1, 2, 1), &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val);

    match result {
        Err(PipelineError::TrainingFailure { step, source }) => {
            assert_eq!(step, 1);
            let message = format!("{source:#}");
            assert!(message.contains("emergency save failed"), "{message}");
            assert!(message.contains("every adapter save mechanism failed"), "{message}");
            assert!(
                source.root_cause().downcast_ref::<std::io::Error>().is_some(),
                "{message}"
            );
        }
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("run should have failed"),
    }
    assert!(!out.join(RUN_SUMMARY_FILE).exists());
    assert!(!CheckpointStore::new(&out)?.path_for(1).exists());
    Ok(())
}

#[test]
fn test_unsupervised_windows_advance_steps_without_updates() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (mut train, _) = common::tokenize(&p.tokenizer, &dataset, 32)?;
    for ex in &mut train {
        ex.labels.fill(IGNORE_INDEX);
    }
    let before = p.model.snapshot()?;

    let out = root.path().join("run");
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(1, 2, 1), &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &train, &[])?;

    assert_eq!(report.summary.final_step, 2);
    assert_eq!(report.summary.outcome, Outcome::Completed);
    for (name, value) in p.model.snapshot()? {
        let old = before
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("{name} missing before training"))?;
        let diff = (value.to_dtype(DType::F32)? - old.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0, "{name} changed without supervised tokens");
    }
    Ok(())
}

#[test]
fn test_blocked_peft_layout_saves_adapter_only() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    let out = root.path().join("run");
    std::fs::create_dir_all(out.join("adapter_model.safetensors"))?;
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(1, 2, 1), &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val)?;
    assert_eq!(report.summary.save_strategy, "adapter-only");

    let reloaded =
        ModelProvisioner::new(common::env(root.path())).load_trained(&out, &Device::Cpu)?;
    assert_eq!(reloaded.model.kind(), TuningKind::Adapter);
    Ok(())
}

#[test]
fn test_plain_run_saves_dense_weights() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "falcon-tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    assert_eq!(p.model.kind(), TuningKind::Plain);
    let dataset = common::scenario_dataset(TEST_FRACTION)?;
    let (train, val) = common::tokenize(&p.tokenizer, &dataset, 32)?;

    let out = root.path().join("run");
    let report = TrainingOrchestrator::new(&out, common::quick_schedule(1, 2, 1), &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &train, &val)?;
    assert_eq!(report.summary.save_strategy, "dense");
    assert!(out.join("model.safetensors").is_file());
    assert!(out.join("config.json").is_file());
    Ok(())
}

#[test]
fn test_empty_train_split_is_config_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;
    let result = TrainingOrchestrator::new(root.path().join("run"), common::quick_schedule(1, 2, 1), &p.model_id)
        .run(p.model.as_ref(), &p.tokenizer, &[], &[]);
    assert!(matches!(result, Err(PipelineError::Config(_))));
    Ok(())
}
