//! Binary entry point for the caravel session server.
//!
//! Runs inside the provisioned container: an SSH listener for sessions and
//! an HTTP liveness endpoint for the platform's health checks.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use caravel::server::{self, ServerConfig, ServerError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    init_tracing();
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<(), ServerError> {
    let config = ServerConfig::load_without_cli_args()?;
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    tracing::info!("starting caravel-server");
    let result = server::start(&cancel, &config).await;
    if cancel.is_cancelled() {
        // Give in-flight session relays a moment to unwind before exit.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::info!("shutdown complete");
    }
    result
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for interrupts");
                    return;
                }
            }
            () = terminate => {}
        }
        tracing::info!("signal received, shutting down");
        cancel.cancel();
    });
}

fn report_error(err: &ServerError) {
    let mut stderr = io::stderr();
    drop(writeln!(stderr, "error: {err}"));
}
