//! Server DevTools - demo entry point.
//!
//! Starts a capture session from the environment and keeps the process alive
//! with:
//! - Structured JSON logging, captured and streamed to observers
//! - A periodic heartbeat log
//! - An optional HTTP probe, captured as network records
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`server_devtools::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! SERVER_DEVTOOLS_PORT=3001 \
//! SERVER_DEVTOOLS_PROBE_URL=https://example.com \
//! cargo run --bin server-devtools
//!
//! # In another terminal
//! websocat ws://127.0.0.1:3001
//! ```

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use server_devtools::capture::client::CapturingClient;
use server_devtools::config::SessionConfig;

/// Interval between heartbeat logs (and probes).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Optional URL fetched on every heartbeat.
const PROBE_URL_VAR: &str = "SERVER_DEVTOOLS_PROBE_URL";

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  SERVER_DEVTOOLS_HOST                    - Listen host (default: 127.0.0.1)");
            eprintln!("  SERVER_DEVTOOLS_PORT                    - Listen port (default: 3001)");
            eprintln!("  SERVER_DEVTOOLS_MAX_LOGS                - Log history size (default: 10000)");
            eprintln!("  SERVER_DEVTOOLS_MAX_REQUESTS            - Request history size (default: 5000)");
            eprintln!("  SERVER_DEVTOOLS_TRUNCATE_BODY_BYTES     - Body truncation limit (default: 1000000)");
            eprintln!("  SERVER_DEVTOOLS_CAPTURE_REQUEST_BODIES  - true/false (default: true)");
            eprintln!("  SERVER_DEVTOOLS_CAPTURE_RESPONSE_BODIES - true/false (default: true)");
            eprintln!("  SERVER_DEVTOOLS_REDACT_HEADERS          - Comma-separated header names");
            eprintln!("  SERVER_DEVTOOLS_DISABLED                - Turn capture off entirely");
            eprintln!("  RUST_LOG                                - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    let session = server_devtools::start(config);
    match session.local_addr() {
        Some(addr) => info!(address = %addr, "Observers can connect"),
        None if session.is_enabled() => warn!("Running without an observer listener"),
        None => info!("Capture disabled"),
    }

    let probe_url = env::var(PROBE_URL_VAR).ok().filter(|url| !url.is_empty());
    let heartbeat = tokio::spawn(heartbeat(server_devtools::capturing_client(), probe_url));

    shutdown_signal().await;

    heartbeat.abort();
    session.shutdown();

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - The capture layer, so observers see this process's own logs
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(server_devtools::log_layer())
        .init();
}

/// Logs on every tick and fetches `probe_url`, if set.
async fn heartbeat(client: CapturingClient, probe_url: Option<String>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut beats: u64 = 0;

    loop {
        interval.tick().await;
        beats += 1;
        info!(target: "demo", beats, "Heartbeat");

        if let Some(url) = probe_url.as_deref() {
            match probe(&client, url).await {
                Ok(status) => info!(target: "demo", url, status, "Probe finished"),
                Err(err) => warn!(target: "demo", url, error = %format!("{err:#}"), "Probe failed"),
            }
        }
    }
}

async fn probe(client: &CapturingClient, url: &str) -> anyhow::Result<u16> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;
    let status = response.status().as_u16();
    response
        .bytes()
        .await
        .context("failed to read probe response")?;
    Ok(status)
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
