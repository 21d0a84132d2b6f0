//! Lifecycle runner binary.
//!
//! Serves a minimal HTTP router under the lifecycle orchestrator:
//!
//! ```text
//! CLI flags ─┐
//!            ├─▶ LifecycleConfig ─▶ logging ─▶ orchestrator ─▶ HttpServer
//! TOML file ─┘                                      │
//!                                 SIGINT/SIGTERM ───┘
//! ```
//!
//! Exit codes: 0 after a clean or signalled shutdown, 1 when a worker
//! failed, 2 when configuration or signal registration failed.

use std::path::PathBuf;
use std::process::ExitCode;

use axum::{routing::get, Json, Router};
use clap::Parser;
use serde_json::{json, Value};

use server_lifecycle::config::{read_config, validate_config, LifecycleConfig, WorkerPolicy};
use server_lifecycle::observability::init_logging;
use server_lifecycle::{run_server, run_server_ignoring_failures, HttpServer, RunError};

#[derive(Parser, Debug)]
#[command(name = "server-lifecycle")]
#[command(about = "Run an HTTP server with graceful, signal-driven shutdown", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override shutdown.graceful_timeout_ms.
    #[arg(long)]
    graceful_timeout_ms: Option<u64>,

    /// Log and ignore worker failures instead of ending the run.
    #[arg(long)]
    ignore_failures: bool,
}

impl Cli {
    /// File values, then flag overrides, then a single validation pass.
    fn into_config(self) -> Result<LifecycleConfig, String> {
        let mut config = match &self.config {
            Some(path) => read_config(path).map_err(|e| format!("{}: {}", path.display(), e))?,
            None => LifecycleConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(timeout) = self.graceful_timeout_ms {
            config.shutdown.graceful_timeout_ms = timeout;
        }
        if self.ignore_failures {
            config.shutdown.policy = WorkerPolicy::IgnoreFailures;
        }

        validate_config(&config).map_err(|errors| {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })?;
        Ok(config)
    }
}

fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/healthz", get(healthz))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        graceful_timeout_ms = config.shutdown.graceful_timeout_ms,
        policy = ?config.shutdown.policy,
        "Configuration loaded"
    );

    let timeout = config.shutdown.graceful_timeout();
    let bind_address = config.listener.bind_address.clone();
    let http = config.http.clone();

    match config.shutdown.policy {
        WorkerPolicy::Aggregate => {
            let result = run_server(
                move |ctx, group| HttpServer::from_config(ctx, group, &bind_address, &http, router()),
                timeout,
            )
            .await;

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(RunError::Signalled(signal)) => {
                    tracing::info!(signal = %signal, "Exited on signal");
                    ExitCode::SUCCESS
                }
                Err(RunError::Worker(e)) => {
                    tracing::error!(error = %e, "Exited on worker failure");
                    ExitCode::from(1)
                }
                Err(e @ RunError::SignalRegistration(_)) => {
                    tracing::error!(error = %e, "Could not start");
                    ExitCode::from(2)
                }
            }
        }
        WorkerPolicy::IgnoreFailures => {
            run_server_ignoring_failures(
                move |ctx, counter| HttpServer::from_config(ctx, counter, &bind_address, &http, router()),
                timeout,
            )
            .await;
            ExitCode::SUCCESS
        }
    }
}
