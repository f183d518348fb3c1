use std::{path::PathBuf, sync::Arc};

use clap::Parser;

mod checks;
mod config;
mod db;
mod models;
mod observability;
mod reconcile;
mod reports;
mod routes;
mod sources;

/// CLI arguments for the billing reconciler
#[derive(Parser, Debug)]
#[command(version, about = "Billable usage reconciler", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to reconciler.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the reconciler server (default)
    Serve,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Serve) | None => {
            run_server(args.config.as_deref()).await;
        }
    }
}

/// Resolve the config path.
///
/// There is no default config to fall back on: the service is useless without
/// database and source credentials, so a missing config is a startup error.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<PathBuf, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(path);
    }

    let cwd_config = PathBuf::from("reconciler.toml");
    if cwd_config.exists() {
        return Ok(cwd_config);
    }

    Err("No config file found. Pass --config <path> or create reconciler.toml in the working directory.".to_string())
}

async fn run_server(explicit_config_path: Option<&str>) {
    let config_path = match resolve_config_path(explicit_config_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match config::ReconcilerConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // Initialize observability (tracing, metrics)
    observability::init_tracing(&config.observability).expect("Failed to initialize tracing");

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    tracing::info!(
        config_file = %config_path.display(),
        "Starting billing reconciler"
    );

    let state = Arc::new(config);
    let stop = checks::StopSignal::new();

    let check_handles = vec![
        (
            "usage",
            tokio::spawn(checks::start_usage_check(state.clone(), stop.clone())),
        ),
        (
            "access",
            tokio::spawn(checks::start_access_check(state.clone(), stop.clone())),
        ),
    ];

    let app = routes::build_app(state.clone());

    let bind_addr = state.server.socket_addr();
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then wait for the check loops
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop, check_handles))
        .await
        .unwrap();
}

async fn shutdown_signal(
    stop: checks::StopSignal,
    check_handles: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for background checks to complete...");

    // Wake the check loops out of their inter-cycle sleep
    stop.stop();

    // An in-flight cycle finishes before the loop observes the signal, so
    // allow it a generous window before giving up
    for (name, handle) in check_handles {
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(30), handle).await {
            tracing::warn!(check = name, error = %e, "Timeout waiting for check loop to stop");
        }
    }

    tracing::info!("Shutdown complete");
}
