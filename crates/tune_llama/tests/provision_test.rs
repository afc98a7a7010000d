mod common;

use anyhow::Result;
use tune_engine::fixtures::FixtureOptions;
use tune_llama::provision::{
    AdapterMode, AdapterSaveStrategy, ModelProvisioner, ProvisionRequest, TuningKind,
    UnfreezePolicy, REFERENCE_MODEL,
};
use tune_llama::profile::DeviceProfile;
use tune_llama::PipelineError;

#[test]
fn test_adapter_injected_on_llama_layout() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;

    assert_eq!(p.model.kind(), TuningKind::Adapter);
    assert!(!p.fallback_used);
    let adapter = p.adapter.clone().ok_or_else(|| anyhow::anyhow!("no adapter config"))?;
    // constrained profile: rank 8 on q_proj/v_proj
    assert_eq!(adapter.rank, 8);
    assert_eq!(adapter.target_modules, vec!["q_proj", "v_proj"]);
    assert!(p.model.trainable_parameters() > 0);
    assert!(p
        .model
        .trainable()
        .iter()
        .all(|(name, _)| name.contains(".lora_A.") || name.contains(".lora_B.")));
    Ok(())
}

#[test]
fn test_fallback_model_gets_reduced_rank() -> Result<()> {
    let root = tempfile::tempdir()?;
    let broken = root.path().join("broken");
    std::fs::create_dir_all(&broken)?;
    let reference = common::tiny_model(root.path(), "reference", &FixtureOptions::default())?;

    let mut req = common::cpu_request(&broken);
    req.fallback_models = vec![reference.to_string_lossy().to_string()];
    let p = ModelProvisioner::new(common::env(root.path())).provision(&req)?;

    assert!(p.fallback_used);
    assert_eq!(p.model_id, reference.to_string_lossy());
    assert_eq!(p.adapter.map(|a| a.rank), Some(4));
    Ok(())
}

#[test]
fn test_candidate_chain_skips_repeated_models() -> Result<()> {
    let root = tempfile::tempdir()?;
    let provisioner = ModelProvisioner::new(common::env(root.path()));

    // the default fallback is the reference model itself
    let req = ProvisionRequest::new(REFERENCE_MODEL, DeviceProfile::cpu(), candle_core::Device::Cpu);
    let chain = provisioner.candidates(&req);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].model_id, REFERENCE_MODEL);
    assert_eq!(chain[0].rank, None);

    let mut req = common::cpu_request(&root.path().join("primary"));
    req.fallback_models = vec!["other".into(), "other".into(), req.model_id.clone()];
    let chain = provisioner.candidates(&req);
    let ids: Vec<&str> = chain.iter().map(|c| c.model_id.as_str()).collect();
    assert_eq!(ids, vec![req.model_id.as_str(), "other"]);
    assert!(chain[1].rank.is_some());
    Ok(())
}

#[test]
fn test_exhausted_chain_is_model_load_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let a = root.path().join("missing-a");
    let b = root.path().join("missing-b");
    std::fs::create_dir_all(&a)?;
    std::fs::create_dir_all(&b)?;

    let mut req = common::cpu_request(&a);
    req.fallback_models = vec![b.to_string_lossy().to_string()];
    match ModelProvisioner::new(common::env(root.path())).provision(&req) {
        Err(PipelineError::ModelLoad(msg)) => {
            assert!(msg.contains("missing-a"), "{msg}");
            assert!(msg.contains("missing-b"), "{msg}");
        }
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("provisioning should have failed"),
    }
    Ok(())
}

#[test]
fn test_pad_is_aliased_when_tokenizer_has_none() -> Result<()> {
    let root = tempfile::tempdir()?;
    let opts = FixtureOptions {
        with_pad: false,
        ..Default::default()
    };
    let model_dir = common::tiny_model(root.path(), "nopad", &opts)?;
    let p = common::provision(root.path(), &model_dir)?;
    assert!(p.tokenizer.pad_aliased());
    assert_eq!(p.tokenizer.pad_id(), p.tokenizer.eos_id());
    Ok(())
}

#[test]
fn test_missing_tensors_are_materialized() -> Result<()> {
    let root = tempfile::tempdir()?;
    let opts = FixtureOptions {
        omit: vec![
            "model.norm.weight".into(),
            "model.layers.1.mlp.down_proj.weight".into(),
        ],
        ..Default::default()
    };
    let model_dir = common::tiny_model(root.path(), "partial", &opts)?;
    let p = common::provision(root.path(), &model_dir)?;
    let weights = p.model.model().named_weights()?;
    let norm: Vec<f32> = weights["model.norm.weight"].to_vec1()?;
    assert!(norm.iter().all(|v| *v == 1.0));
    Ok(())
}

#[test]
fn test_unmatched_adapter_targets_fall_back_to_unfreeze() -> Result<()> {
    let root = tempfile::tempdir()?;
    // the id says falcon, the weights are llama layout: no adapter target matches
    let model_dir = common::tiny_model(root.path(), "falcon-tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;

    assert_eq!(p.model.kind(), TuningKind::Plain);
    assert!(p.adapter.is_none());
    let names: Vec<&str> = p.model.trainable().iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"lm_head.weight"));
    assert!(names.contains(&"model.norm.weight"));
    assert!(names.iter().any(|n| n.starts_with("model.layers.1.")));
    assert!(!names.iter().any(|n| n.starts_with("model.layers.0.self_attn")));
    Ok(())
}

#[test]
fn test_unfreeze_escalates_once_then_fails() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "falcon-tiny", &FixtureOptions::default())?;
    let provisioner = ModelProvisioner::new(common::env(root.path()));

    // primary matches nothing, escalation adds a real block
    let mut req = common::cpu_request(&model_dir);
    req.unfreeze = Some(UnfreezePolicy {
        primary: vec!["does.not.exist".into()],
        escalation: vec!["layers.0.".into()],
    });
    let p = provisioner.provision(&req)?;
    assert!(p.model.trainable_parameters() > 0);
    assert!(p
        .model
        .trainable()
        .iter()
        .all(|(n, _)| n.starts_with("model.layers.0.")));

    // nothing anywhere: fatal, and never retried on another candidate
    let fallback = common::tiny_model(root.path(), "reference", &FixtureOptions::default())?;
    req.unfreeze = Some(UnfreezePolicy {
        primary: vec!["does.not.exist".into()],
        escalation: vec!["neither.does.this".into()],
    });
    req.fallback_models = vec![fallback.to_string_lossy().to_string()];
    match provisioner.provision(&req) {
        Err(PipelineError::ZeroTrainableParameters { attempts }) => assert_eq!(attempts, 2),
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("expected zero trainable parameters"),
    }
    Ok(())
}

#[test]
fn test_disabled_adapter_trains_last_block() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let mut req = common::cpu_request(&model_dir);
    req.adapter_mode = AdapterMode::Disabled;
    let p = ModelProvisioner::new(common::env(root.path())).provision(&req)?;
    assert_eq!(p.model.kind(), TuningKind::Plain);
    assert!(p.model.trainable_parameters() > 0);
    Ok(())
}

#[test]
fn test_adapter_save_falls_back_and_reloads() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = common::tiny_model(root.path(), "tiny", &FixtureOptions::default())?;
    let p = common::provision(root.path(), &model_dir)?;

    // a directory where the PEFT weights file should go makes the first mechanism fail
    let out = root.path().join("run");
    std::fs::create_dir_all(out.join("adapter_model.safetensors"))?;
    let saved = p.model.save(&out, &p.tokenizer)?;
    assert_eq!(saved.strategy, AdapterSaveStrategy::AdapterOnly.name());
    assert!(out.join("default").join("adapter_weights.safetensors").is_file());

    let reloaded = ModelProvisioner::new(common::env(root.path())).load_trained(&out, &candle_core::Device::Cpu)?;
    assert_eq!(reloaded.model.kind(), TuningKind::Adapter);
    let before = p.model.snapshot()?;
    let after = reloaded.model.snapshot()?;
    assert_eq!(before.len(), after.len());
    for (name, t) in &before {
        let diff = (t - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{name} differs by {diff}");
    }

    // both mechanisms blocked
    let blocked = root.path().join("blocked");
    std::fs::create_dir_all(blocked.join("adapter_model.safetensors"))?;
    std::fs::write(blocked.join("default"), "not a directory")?;
    match p.model.save(&blocked, &p.tokenizer) {
        Err(PipelineError::SaveFailure(msg)) => {
            assert!(msg.contains("peft") && msg.contains("adapter-only"), "{msg}")
        }
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(_) => anyhow::bail!("save should have failed"),
    }
    Ok(())
}
