//! Dry-run material: a tiny random model and a handful of paired lines.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use tracing::info;
use tune_engine::fixtures::{self, FixtureOptions};

const SAMPLE_PAIRS: &[(&str, &str)] = &[
    ("list files", "ls -la"),
    ("find largest files", "du -sh * | sort -rh | head"),
    ("check disk space with a command that is quite long indeed", "df -h"),
    ("search text in files", "grep -rn pattern ."),
    ("count lines in files", "wc -l *"),
    ("show all files", "ls -la"),
];

#[derive(Args, Debug, Clone)]
pub struct ScaffoldArgs {
    #[arg(long, default_value = "./tiny_model")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Leave the pad token out so it gets aliased to EOS
    #[arg(long, action)]
    pub no_pad: bool,

    /// Also write `improved.nl` / `improved.cm` sample files into this directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

pub fn run(args: &ScaffoldArgs) -> Result<()> {
    let opts = FixtureOptions {
        seed: args.seed,
        with_pad: !args.no_pad,
        ..Default::default()
    };
    let cfg = fixtures::write_tiny_model(&args.output_dir, &opts)?;
    info!(
        "✅ Tiny model written to {} ({} params, vocab {})",
        args.output_dir.display(),
        cfg.parameter_count(),
        cfg.vocab_size
    );

    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)?;
        let inputs: Vec<&str> = SAMPLE_PAIRS.iter().map(|(i, _)| *i).collect();
        let outputs: Vec<&str> = SAMPLE_PAIRS.iter().map(|(_, o)| *o).collect();
        std::fs::write(dir.join("improved.nl"), inputs.join("\n"))?;
        std::fs::write(dir.join("improved.cm"), outputs.join("\n"))?;
        info!("   Sample data: {}", dir.display());
    }
    Ok(())
}
