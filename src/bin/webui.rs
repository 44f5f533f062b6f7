//! `seekarr-webui`: status/settings dashboard and manual run trigger.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use seekarr::admission::Pacer;
use seekarr::config::load_config;
use seekarr::engine::Engine;
use seekarr::logging::setup_logging;
use seekarr::store::Store;
use seekarr::webui::{auth, routes, AppState};

/// Web UI for seekarr: status, per-instance settings, and manual run triggers.
#[derive(Parser, Debug)]
#[command(name = "seekarr-webui")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long)]
    config: String,
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Listen port.
    #[arg(long, default_value_t = 8788)]
    port: u16,
    /// Allow binding a non-loopback address.
    #[arg(long)]
    allow_public: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = std::fs::canonicalize(&args.config).unwrap_or_else(|_| PathBuf::from(&args.config));

    let runtime_config = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::from(2);
        }
    };
    setup_logging(&runtime_config.app.log_level);

    let host: IpAddr = match args.host.parse() {
        Ok(ip) => ip,
        Err(err) => {
            eprintln!("invalid --host {}: {err}", args.host);
            return ExitCode::from(2);
        }
    };
    if !host.is_loopback() && !args.allow_public {
        eprintln!("refusing to bind non-loopback address {host} without --allow-public");
        return ExitCode::from(2);
    }

    let store = match Store::open(&runtime_config.app.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, "failed to open state store");
            return ExitCode::from(2);
        }
    };

    let password_hash = match store.get_webui_password_hash() {
        Ok(hash) => hash,
        Err(err) => {
            tracing::error!(error = %err, "failed to read web UI password hash");
            return ExitCode::from(2);
        }
    };
    let password_hash = password_hash.or_else(|| {
        let env_pw = std::env::var("SEEKARR_WEBUI_PASSWORD").ok()?;
        let env_pw = env_pw.trim();
        if env_pw.is_empty() {
            return None;
        }
        let hash = auth::hash_password(env_pw);
        if let Err(err) = store.set_webui_password_hash(&hash) {
            tracing::error!(error = %err, "failed to persist bootstrap password from SEEKARR_WEBUI_PASSWORD");
        }
        Some(hash)
    });

    let engine = Arc::new(Engine::new(runtime_config, store.clone(), Arc::new(Pacer::new())));
    let state = AppState::new(engine, store, config_path, password_hash);
    state.spawn_autorun_loops();

    let app = routes::build_router(state);
    let addr = SocketAddr::new(host, args.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind Web UI listener");
            return ExitCode::from(2);
        }
    };
    tracing::info!(%addr, "seekarr-webui listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "web server error");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
