use crate::export::ExportArgs;
use crate::generate::GenerateArgs;
use crate::scaffold::ScaffoldArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "LoRA fine-tuning pipeline for llama-layout models", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fine-tune a model on paired instruction/response files
    Train(TrainArgs),

    /// Merge a trained adapter into its base and write a serving manifest
    Export(ExportArgs),

    /// Generate a response for one prompt
    Generate(GenerateArgs),

    /// Write a tiny random model (and optional sample data) for dry runs
    Scaffold(ScaffoldArgs),
}
