//! Typed pipeline failures. Every variant names the stage it came from, and its
//! message starts with `[<stage>]`.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dataset,
    Provision,
    Tokenize,
    Train,
    Save,
    Export,
    Generate,
    Config,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Dataset => "dataset",
            Stage::Provision => "provision",
            Stage::Tokenize => "tokenize",
            Stage::Train => "train",
            Stage::Save => "save",
            Stage::Export => "export",
            Stage::Generate => "generate",
            Stage::Config => "config",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[dataset] line count mismatch: {inputs} input lines vs {outputs} output lines")]
    DataIntegrity { inputs: usize, outputs: usize },

    #[error("[provision] model load failed: {0}")]
    ModelLoad(String),

    #[error("[provision] zero trainable parameters after {attempts} unfreeze attempt(s)")]
    ZeroTrainableParameters { attempts: usize },

    #[error("[train] failed at step {step}: {source:#}")]
    TrainingFailure {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("[train] interrupted at step {step}")]
    Interrupted { step: usize },

    #[error("[save] {0}")]
    SaveFailure(String),

    #[error("[config] {0}")]
    Config(String),

    #[error("[{stage}] {}: {source}", .path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] {source}")]
    Json {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error("[{stage}] {source:#}")]
    Other {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::DataIntegrity { .. } => Stage::Dataset,
            PipelineError::ModelLoad(_) | PipelineError::ZeroTrainableParameters { .. } => {
                Stage::Provision
            }
            PipelineError::TrainingFailure { .. } | PipelineError::Interrupted { .. } => {
                Stage::Train
            }
            PipelineError::SaveFailure(_) => Stage::Save,
            PipelineError::Config(_) => Stage::Config,
            PipelineError::Io { stage, .. }
            | PipelineError::Json { stage, .. }
            | PipelineError::Other { stage, .. } => *stage,
        }
    }

    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            stage,
            path: path.into(),
            source,
        }
    }

    pub fn at(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Other {
            stage,
            source: source.into(),
        }
    }
}

/// Attaches a stage to any error convertible into `anyhow::Error`.
pub trait StageExt<T> {
    fn at_stage(self, stage: Stage) -> PipelineResult<T>;
}

impl<T, E: Into<anyhow::Error>> StageExt<T> for std::result::Result<T, E> {
    fn at_stage(self, stage: Stage) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::at(stage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_lead_with_stage() {
        let e = PipelineError::DataIntegrity {
            inputs: 3,
            outputs: 4,
        };
        assert!(e.to_string().starts_with("[dataset]"));
        assert_eq!(e.stage(), Stage::Dataset);

        let e = PipelineError::at(Stage::Export, anyhow::anyhow!("disk full"));
        assert_eq!(e.to_string(), "[export] disk full");

        let e = PipelineError::ZeroTrainableParameters { attempts: 2 };
        assert_eq!(e.stage(), Stage::Provision);
    }
}
