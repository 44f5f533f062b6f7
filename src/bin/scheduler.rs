//! `seekarr-scheduler`: drives the continuous (or one-shot) search loop.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use seekarr::admission::Pacer;
use seekarr::config::load_config;
use seekarr::engine::Engine;
use seekarr::logging::setup_logging;
use seekarr::scheduler::run_scheduler;
use seekarr::store::Store;

/// Autonomous search orchestrator for Radarr/Sonarr instances.
#[derive(Parser, Debug)]
#[command(name = "seekarr-scheduler")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long)]
    config: String,
    /// Run one cycle and exit.
    #[arg(long)]
    once: bool,
    /// Ignore due time and run enabled instances immediately.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let runtime_config = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::from(2);
        }
    };
    setup_logging(&runtime_config.app.log_level);

    if runtime_config.radarr_instances.is_empty() && runtime_config.sonarr_instances.is_empty() {
        tracing::error!("No instances configured. Add radarr.instances and/or sonarr.instances.");
        return ExitCode::from(1);
    }

    let store = match Store::open(&runtime_config.app.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, "failed to open state store");
            return ExitCode::from(2);
        }
    };

    let engine = Arc::new(Engine::new(runtime_config, store, Arc::new(Pacer::new())));

    if args.once {
        return match engine.run_cycle(args.force, None).await {
            Ok(stats) => {
                tracing::info!(stats = %stats.as_json(), "cycle complete");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(error = %err, "cycle failed");
                ExitCode::from(2)
            }
        };
    }

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopped by user.");
            shutdown_signal.cancel();
        }
    });

    run_scheduler(engine, None, args.force, shutdown).await;
    ExitCode::SUCCESS
}
