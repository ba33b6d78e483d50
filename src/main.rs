//! Binary entry point for the caravel CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use caravel::cli::{Cli, RunCommand};
use caravel::config::{PlatformApiConfig, RunConfig};
use caravel::platform::http::HttpPlatformClient;
use caravel::run::{RunError, RunOrchestrator};
use caravel::transport::ExecSinks;
use caravel::transport::ssh::SshTransport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("platform client error: {0}")]
    Platform(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Run(#[from] RunError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
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

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let mut config = run_config_from(args);
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    caravel::keys::ensure_key_material(&mut config)
        .map_err(|err| CliError::Config(err.to_string()))?;

    let api_config =
        PlatformApiConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let platform =
        HttpPlatformClient::new(&api_config).map_err(|err| CliError::Platform(err.to_string()))?;
    let transport = SshTransport::new(&config.private_key)
        .map_err(|err| CliError::Transport(err.to_string()))?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let orchestrator = RunOrchestrator::new(platform, transport);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let sinks = ExecSinks {
        stdout: &mut stdout,
        stderr: &mut stderr,
    };

    match orchestrator.run(&cancel, &config, sinks).await {
        Ok(()) => {
            tracing::info!("run complete");
            Ok(0)
        }
        Err(RunError::Cancelled { message }) => {
            tracing::info!(%message, "run cancelled, shutting down");
            // Give detached relay tasks a moment to unwind before exit.
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            tracing::info!("shutdown complete");
            Ok(0)
        }
        Err(err) => match err.remote_exit_code() {
            Some(code) => Ok(i32::try_from(code).unwrap_or(1)),
            None => Err(CliError::Run(err)),
        },
    }
}

fn run_config_from(args: RunCommand) -> RunConfig {
    RunConfig {
        public_key: args.public_key,
        private_key: args.private_key,
        app_name: args.name,
        plan: args.plan,
        image_type: args.image_type,
        image_name: args.image_name,
        commands: args.command,
        command_file: args.command_file.map(Utf8PathBuf::from),
        sync_dir: args.sync_dir.map(Utf8PathBuf::from),
        upload_only: args.upload_only,
        download_only: args.download_only,
        boot_timeout: Duration::from_secs(args.boot_timeout),
        exec_timeout: Duration::from_secs(args.exec_timeout),
    }
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

fn report_error(err: &CliError) {
    let mut stderr = io::stderr();
    drop(writeln!(stderr, "error: {err}"));
}
