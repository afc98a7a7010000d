//! Export - fold adapters into dense weights and write a serving manifest
//!
//! Layout: `<out>/merged_model/{model.safetensors, config.json, tokenizer.json}` and
//! `<out>/Modelfile`.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use fs2::FileExt;
use minijinja::{context, Environment};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RuntimeEnv;
use crate::data::template::PromptTemplate;
use crate::error::{PipelineError, PipelineResult, Stage, StageExt};
use crate::provision::{ModelProvisioner, Provisioned};

pub const MERGED_DIR: &str = "merged_model";
pub const MANIFEST_FILE: &str = "Modelfile";
const LOCK_FILE: &str = ".export.lock";

const MANIFEST_TEMPLATE: &str = r#"FROM {{ base_name }}
PARAMETER temperature {{ temperature }}
PARAMETER top_p {{ top_p }}
{% for stop in stops %}PARAMETER stop "{{ stop }}"
{% endfor %}
TEMPLATE """
{{ user_header }}
{% raw %}{{.Input}}{% endraw %}

{{ response_header }}
""""#;

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Output directory of a finished training run
    #[arg(long, default_value = "./finetuned_model")]
    pub adapter_dir: PathBuf,

    #[arg(long, default_value = "./ollama_model")]
    pub output_dir: PathBuf,

    /// Name suggested for the serving runtime
    #[arg(long, default_value = "my-finetuned-model")]
    pub model_name: String,

    #[arg(long, action)]
    pub force_cpu: bool,
}

/// Default sampling parameters and stop sequences written into the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestParams {
    pub base_name: String,
    pub temperature: f64,
    pub top_p: f64,
    pub template: PromptTemplate,
}

impl ManifestParams {
    pub fn for_base(base_model: &str) -> Self {
        Self {
            base_name: architecture_name(base_model),
            temperature: 0.7,
            top_p: 0.9,
            template: PromptTemplate::instruction(),
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("manifest", MANIFEST_TEMPLATE)?;
        let rendered = env.get_template("manifest")?.render(context! {
            base_name => self.base_name,
            temperature => format!("{}", self.temperature),
            top_p => format!("{}", self.top_p),
            stops => self.template.stop_sequences(),
            user_header => self.template.user_header(),
            response_header => self.template.response_header(),
        })?;
        Ok(rendered)
    }
}

/// Final path segment of a hub id or local path.
pub fn architecture_name(base_model: &str) -> String {
    base_model
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(base_model)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub merged_weights_path: PathBuf,
    pub tokenizer_files: Vec<PathBuf>,
    pub manifest_path: PathBuf,
}

pub struct ExportPipeline {
    provisioner: ModelProvisioner,
}

impl ExportPipeline {
    pub fn new(env: RuntimeEnv) -> Self {
        Self {
            provisioner: ModelProvisioner::new(env),
        }
    }

    /// Reloads a training output directory and exports it.
    pub fn export(&self, run_dir: &Path, output_dir: &Path, device: &Device) -> PipelineResult<ExportArtifact> {
        info!("📦 Loading trained model from {}", run_dir.display());
        let provisioned = self.provisioner.load_trained(run_dir, device)?;
        export_model(&provisioned, output_dir)
    }
}

/// Writes merged weights, config and tokenizer, then the manifest. The merged
/// directory is built under a temporary name and renamed into place.
pub fn export_model(provisioned: &Provisioned, output_dir: &Path) -> PipelineResult<ExportArtifact> {
    let model = provisioned.model.as_ref();
    info!(
        "🔀 Merging {:?} model ({} adapter tensors)",
        model.kind(),
        model.trainable().len()
    );
    let merged = model.merge().at_stage(Stage::Export)?;

    std::fs::create_dir_all(output_dir).map_err(|e| PipelineError::io(Stage::Export, output_dir, e))?;
    let lock_file = File::create(output_dir.join(LOCK_FILE))
        .map_err(|e| PipelineError::io(Stage::Export, output_dir, e))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| PipelineError::io(Stage::Export, output_dir, e))?;

    let written = (|| -> Result<ExportArtifact> {
        let tmp = output_dir.join(format!(".{MERGED_DIR}.tmp"));
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        candle_core::safetensors::save(&merged, tmp.join("model.safetensors"))
            .context("writing merged weights")?;
        model.model().config().save(tmp.join("config.json"))?;
        provisioned.tokenizer.save(&tmp)?;

        let target = output_dir.join(MERGED_DIR);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&tmp, &target)?;

        let manifest = ManifestParams::for_base(&provisioned.model_id).render()?;
        let manifest_path = output_dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, manifest)?;

        Ok(ExportArtifact {
            merged_weights_path: target.join("model.safetensors"),
            tokenizer_files: vec![target.join("tokenizer.json")],
            manifest_path,
        })
    })();

    lock_file
        .unlock()
        .map_err(|e| PipelineError::io(Stage::Export, output_dir, e))?;
    let artifact = written.at_stage(Stage::Export)?;
    info!("✅ Merged model saved to {}", artifact.merged_weights_path.display());
    info!("   Manifest: {}", artifact.manifest_path.display());
    Ok(artifact)
}

pub fn run(args: &ExportArgs, env: RuntimeEnv) -> PipelineResult<ExportArtifact> {
    let device = tune_engine::device_utils::select_device(args.force_cpu);
    let artifact = ExportPipeline::new(env).export(&args.adapter_dir, &args.output_dir, &device)?;
    info!("To create the served model, run:");
    info!(
        "  ollama create {} -f {}",
        args.model_name,
        artifact.manifest_path.display()
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_layout() -> Result<()> {
        let text = ManifestParams::for_base("TinyLlama/TinyLlama-1.1B-Chat-v1.0").render()?;
        let expected = "FROM TinyLlama-1.1B-Chat-v1.0\n\
PARAMETER temperature 0.7\n\
PARAMETER top_p 0.9\n\
PARAMETER stop \"### Instruction:\"\n\
PARAMETER stop \"### Response:\"\n\
\n\
TEMPLATE \"\"\"\n\
### Instruction:\n\
{{.Input}}\n\
\n\
### Response:\n\
\"\"\"";
        assert_eq!(text, expected);
        Ok(())
    }

    #[test]
    fn test_architecture_name() {
        assert_eq!(architecture_name("meta-llama/Llama-2-7b-chat-hf"), "Llama-2-7b-chat-hf");
        assert_eq!(architecture_name("/tmp/models/tiny/"), "tiny");
        assert_eq!(architecture_name("plain"), "plain");
    }
}
