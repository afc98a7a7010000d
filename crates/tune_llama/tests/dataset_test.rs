mod common;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tune_engine::fixtures;
use tune_engine::IGNORE_INDEX;
use tune_llama::collate::Collator;
use tune_llama::data::{validation_size, DatasetBuilder, AUGMENT_PREFIX};
use tune_llama::provision::TokenizerHandle;
use tune_llama::PipelineError;

#[test]
fn test_four_line_scenario_has_no_validation() -> Result<()> {
    let dataset = common::scenario_dataset(0.05)?;

    // 4 pairs + 1 input longer than 20 chars ("search text in files" is exactly 20)
    assert_eq!(dataset.len(), 5);
    assert_eq!(dataset.train.len(), 5);
    assert_eq!(dataset.validation.len(), 0);

    let augmented = dataset
        .train
        .iter()
        .filter(|e| e.input().starts_with(AUGMENT_PREFIX))
        .count();
    assert_eq!(augmented, 1);
    Ok(())
}

#[test]
fn test_augmented_size_matches_long_input_count() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(9);
    for round in 0..20 {
        let n = rng.gen_range(1..30);
        let inputs: Vec<String> = (0..n)
            .map(|i| "x".repeat(rng.gen_range(1..40)) + &i.to_string())
            .collect();
        let outputs: Vec<String> = (0..n).map(|i| format!("out {i}")).collect();
        let long = inputs.iter().filter(|s| s.chars().count() > 20).count();
        let fraction = [0.0, 0.05, 0.2, 0.5][round % 4];

        let dataset = DatasetBuilder::new(round as u64)
            .with_test_fraction(fraction)
            .build(&inputs, &outputs)?;
        assert_eq!(dataset.len(), n + long);
        assert_eq!(dataset.validation.len(), validation_size(n + long, fraction));

        let train: HashSet<&str> = dataset.train.iter().map(|e| e.rendered_text()).collect();
        assert!(dataset
            .validation
            .iter()
            .all(|e| !train.contains(e.rendered_text())));
    }
    Ok(())
}

#[test]
fn test_mismatched_files_are_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let inputs = dir.path().join("improved.nl");
    let outputs = dir.path().join("improved.cm");
    std::fs::write(&inputs, "list files\nshow all files\n")?;
    std::fs::write(&outputs, "ls\n")?;

    let err = DatasetBuilder::new(42)
        .build_from_files(&inputs, &outputs)
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected a data integrity error"))?;
    assert!(matches!(err, PipelineError::DataIntegrity { inputs: 2, outputs: 1 }));
    assert!(err.to_string().starts_with("[dataset]"));
    Ok(())
}

#[test]
fn test_labels_ignore_exactly_the_padding() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tokenizer.json");
    // No pad token: PAD is aliased to EOS
    fixtures::write_tokenizer(&path, false)?;
    let tokenizer = TokenizerHandle::load(&path, None)?;
    assert_eq!(tokenizer.pad_id(), tokenizer.eos_id());

    let dataset = common::scenario_dataset(0.0)?;
    for context in [4, 12, 32] {
        let collator = Collator::new(&tokenizer, context);
        for ex in collator.encode_all(&dataset.train)? {
            assert_eq!(ex.input_ids.len(), context);
            assert_eq!(ex.labels.len(), context);
            for i in 0..context {
                if ex.attention_mask[i] == 0 {
                    assert_eq!(ex.labels[i], IGNORE_INDEX);
                } else {
                    assert_eq!(ex.labels[i], ex.input_ids[i] as i64);
                }
            }
            // the appended EOS survives whenever the window is not full
            let real = ex.real_tokens();
            if real < context {
                assert_eq!(ex.labels[real - 1], tokenizer.eos_id() as i64);
            }
        }
    }
    Ok(())
}
