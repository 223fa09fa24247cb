//! babble relay server -- in-memory broadcast chat relay.
//!
//! An axum WebSocket server that fans every chat line and join/leave notice
//! out to all connected clients. Nothing is persisted; a restart starts
//! with an empty room.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3003
//! cargo run --bin babble-relay
//!
//! # Run on custom address
//! cargo run --bin babble-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! BABBLE_ADDR=127.0.0.1:8080 cargo run --bin babble-relay
//! ```

use std::path::Path;

use babble_relay::config::{RelayCliArgs, RelayConfig};
use babble_relay::server::{self, ServerState};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    tracing::info!(addr = %config.bind_addr, "starting babble relay server");

    let state = ServerState::from_config(&config);

    let handle = match server::start_server_with_state(&config.bind_addr, state.clone()).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            handle
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    state.shutdown();

    if let Err(e) = handle.await {
        tracing::error!(error = %e, "relay server task failed");
    }
}

/// Initialize logging to stdout, or to a file when one is configured.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(|p| Some((p.parent()?, p.file_name()?)))
    else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Waits for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
