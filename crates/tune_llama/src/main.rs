use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tune_llama::cli::{Cli, Commands};
use tune_llama::config::RuntimeEnv;
use tune_llama::{export, generate, scaffold, train};

fn main() -> Result<()> {
    // 1. Setup File Logging
    let file_appender = tracing_appender::rolling::daily("logs", "tune_llama.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // 2. Setup Console Logging
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    // 3. Combine Subscribers
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer()) // Stdout
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        ) // File
        .init();

    // 4. Setup Panic Hook
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "🔥 CRASH detected at {}: {}", location, msg);
        eprintln!("🔥 CRASH detected at {}: {}", location, msg);
    }));

    info!("🚀 tune_llama started.");

    let cli = Cli::parse();
    let env = RuntimeEnv::from_env();

    match cli.command {
        Commands::Train(args) => {
            let stop = install_stop_handler()?;
            let report = train::run(&args, env, stop).map_err(fatal)?;
            info!(
                "Final step {} | best eval loss {}",
                report.summary.final_step,
                report
                    .summary
                    .best_metric
                    .map(|m| format!("{m:.4}"))
                    .unwrap_or_else(|| "n/a".into())
            );
        }
        Commands::Export(args) => {
            export::run(&args, env).map_err(fatal)?;
        }
        Commands::Generate(args) => {
            let generation = generate::run(&args, env).map_err(fatal)?;
            println!("{}", generation.text);
        }
        Commands::Scaffold(args) => scaffold::run(&args)?,
    }

    Ok(())
}

/// First Ctrl+C raises the stop flag (the run saves and exits); a second one exits now.
fn install_stop_handler() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let c = ctrl_c_count.clone();

    ctrlc::set_handler(move || {
        let count = c.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("\n\n🛑 Ctrl+C detected! Finishing current step and saving...");
            info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
            s.store(true, Ordering::SeqCst);
        } else {
            error!("\n⚠️  Force quit! Exiting immediately without saving.");
            std::process::exit(1);
        }
    })?;
    Ok(stop)
}

fn fatal(e: tune_llama::PipelineError) -> anyhow::Error {
    error!("❌ Stage '{}' failed: {}", e.stage(), e);
    e.into()
}
