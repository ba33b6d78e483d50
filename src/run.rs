//! Orchestrates end-to-end remote runs on ephemeral compute units.
//!
//! The run workflow provisions a compute unit, powers it on, waits for it to
//! report running, resolves the public shell endpoint, uploads inputs,
//! executes the command, downloads results, and tears the unit down. Every
//! bounded phase races completion against its timeout and against
//! cancellation; teardown is attempted on every path once a unit exists.

use std::fmt::Display;
use std::time::{Duration, Instant};

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{
    COMMAND_ENV, DEFAULT_BASE_COMMAND, PUBLIC_KEY_ENV, REMOTE_TMP_DIR, REMOTE_WORK_DIR, RunConfig,
};
use crate::platform::{
    ComputeUnit, CreateRequest, Endpoint, LIVENESS_PORT, LifecycleState, PlatformClient,
    PlatformError, SHELL_PORT, ServiceInfo,
};
use crate::staging::{StagingArea, StagingError};
use crate::transport::{ExecSinks, SessionTransport, TransportError};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced while performing a remote run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised when key material cannot be generated.
    #[error(transparent)]
    Key(#[from] crate::keys::KeyError),
    /// Raised when the run configuration fails validation.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Raised when provisioning a compute unit fails.
    #[error("failed to create compute unit: {0}")]
    Provision(#[source] PlatformError),
    /// Raised when the power-on request fails.
    #[error("failed to power on compute unit: {message}")]
    PowerOn {
        /// Description including any teardown note.
        message: String,
        /// Provider-specific error.
        #[source]
        source: PlatformError,
    },
    /// Raised when a platform read fails during the readiness wait.
    #[error("readiness check failed: {message}")]
    Platform {
        /// Description including any teardown note.
        message: String,
        /// Provider-specific error.
        #[source]
        source: PlatformError,
    },
    /// Raised when the unit does not report running before the boot timeout.
    #[error("compute unit did not become ready: {message}")]
    BootTimeout {
        /// Description including any teardown note.
        message: String,
    },
    /// Raised when the run is cancelled.
    #[error("run cancelled: {message}")]
    Cancelled {
        /// Description including any teardown note.
        message: String,
    },
    /// Raised when the running unit publishes no shell port mapping.
    #[error("no public endpoint for the shell port: {message}")]
    Endpoint {
        /// Description including any teardown note.
        message: String,
    },
    /// Raised when an upload or download fails.
    #[error("transfer failed: {message}")]
    Transfer {
        /// Description including any teardown note.
        message: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when a transfer exceeds the exec timeout.
    #[error("transfer timed out: {message}")]
    TransferTimeout {
        /// Description including any teardown note.
        message: String,
    },
    /// Raised when remote execution fails before producing an exit status.
    #[error("remote execution failed: {message}")]
    Exec {
        /// Description including any teardown note.
        message: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when remote execution exceeds the exec timeout. The output
    /// relay is abandoned; the remote process may keep running until
    /// teardown removes it.
    #[error("remote execution timed out: {message}")]
    ExecTimeout {
        /// Description including any teardown note.
        message: String,
    },
    /// Raised when the remote command exits non-zero.
    #[error("remote command exited with status {code}: {message}")]
    CommandFailed {
        /// Description including any teardown note.
        message: String,
        /// Remote exit code.
        code: u32,
    },
    /// Raised when promoting downloaded results into the sync dir fails.
    #[error("failed to place downloaded results: {message}")]
    Staging {
        /// Description including any teardown note.
        message: String,
        /// Underlying staging error.
        #[source]
        source: StagingError,
    },
    /// Raised when teardown fails after the run itself succeeded.
    #[error("failed to remove compute unit: {message}")]
    Teardown {
        /// Description of the teardown failure.
        message: String,
    },
}

impl RunError {
    /// Returns the remote exit code when the run failed because the command
    /// itself exited non-zero.
    #[must_use]
    pub const fn remote_exit_code(&self) -> Option<u32> {
        match self {
            Self::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

enum Raced<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn race<T>(
    cancel: &CancellationToken,
    limit: Duration,
    operation: impl Future<Output = T>,
) -> Raced<T> {
    tokio::select! {
        value = operation => Raced::Done(value),
        () = cancel.cancelled() => Raced::Cancelled,
        () = sleep(limit) => Raced::TimedOut,
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Executes the remote run flow using the provided platform and transport.
#[derive(Debug)]
pub struct RunOrchestrator<P, T> {
    platform: P,
    transport: T,
    poll_interval: Duration,
    cleanup_timeout: Duration,
}

impl<P, T> RunOrchestrator<P, T>
where
    P: PlatformClient,
    T: SessionTransport,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(platform: P, transport: T) -> Self {
        Self {
            platform,
            transport,
            poll_interval: READY_POLL_INTERVAL,
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }

    /// Overrides the readiness polling interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the teardown timeout.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Runs the end-to-end workflow.
    ///
    /// Remote output streams into `sinks` as it arrives. Once a compute unit
    /// exists, teardown is attempted exactly once on every path; a teardown
    /// failure is appended to the primary error, or surfaced as
    /// [`RunError::Teardown`] when the run itself succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when any phase fails, times out, or is
    /// cancelled, and when the remote command exits non-zero.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        sinks: ExecSinks<'_>,
    ) -> Result<(), RunError> {
        config.validate()?;
        let boot_deadline = Instant::now() + config.boot_timeout;

        let unit = self.provision(cancel, config, boot_deadline).await?;
        tracing::info!(app_id = %unit.app_id, "compute unit created");

        self.power_on_or_destroy(cancel, &unit, boot_deadline)
            .await?;
        let service = self
            .wait_ready_or_destroy(cancel, &unit, boot_deadline)
            .await?;
        let endpoint = self.resolve_endpoint_or_destroy(&unit, &service).await?;
        tracing::info!(endpoint = %endpoint, "compute unit ready");

        if !config.download_only {
            self.upload_or_destroy(cancel, config, &unit, &endpoint)
                .await?;
        }

        let code = self
            .exec_or_destroy(cancel, config, &unit, &endpoint, sinks)
            .await?;

        if code != 0 {
            let message = self.destroy_with_note(&unit, &"skipping download").await;
            return Err(RunError::CommandFailed { message, code });
        }

        if !config.upload_only {
            self.download_or_destroy(cancel, config, &unit, &endpoint)
                .await?;
        }

        self.cleanup(&unit)
            .await
            .map_err(|message| RunError::Teardown { message })
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        deadline: Instant,
    ) -> Result<ComputeUnit, RunError> {
        let request = CreateRequest::builder()
            .name(&config.app_name)
            .image(config.image())
            .plan(&config.plan)
            .tcp_port(LIVENESS_PORT)
            .tcp_port(SHELL_PORT)
            .env(PUBLIC_KEY_ENV, &config.public_key)
            .env(COMMAND_ENV, DEFAULT_BASE_COMMAND)
            .build()
            .map_err(RunError::Provision)?;
        match race(cancel, remaining(deadline), self.platform.create_app(&request)).await {
            Raced::Done(result) => result.map_err(RunError::Provision),
            Raced::TimedOut => Err(RunError::BootTimeout {
                message: String::from("creation did not complete within the boot timeout"),
            }),
            Raced::Cancelled => Err(RunError::Cancelled {
                message: String::from("cancelled before the compute unit was created"),
            }),
        }
    }

    async fn power_on_or_destroy(
        &self,
        cancel: &CancellationToken,
        unit: &ComputeUnit,
        deadline: Instant,
    ) -> Result<(), RunError> {
        match race(
            cancel,
            remaining(deadline),
            self.platform.power_on(&unit.service_id),
        )
        .await
        {
            Raced::Done(Ok(())) => Ok(()),
            Raced::Done(Err(err)) => {
                let message = self.destroy_with_note(unit, &err).await;
                Err(RunError::PowerOn {
                    message,
                    source: err,
                })
            }
            Raced::TimedOut => Err(self.boot_timeout_error(unit).await),
            Raced::Cancelled => Err(self.cancelled_error(unit, "during power-on").await),
        }
    }

    async fn wait_ready_or_destroy(
        &self,
        cancel: &CancellationToken,
        unit: &ComputeUnit,
        deadline: Instant,
    ) -> Result<ServiceInfo, RunError> {
        loop {
            if Instant::now() >= deadline {
                return Err(self.boot_timeout_error(unit).await);
            }
            let service = match race(
                cancel,
                remaining(deadline),
                self.platform.read_service(&unit.service_id),
            )
            .await
            {
                Raced::Done(Ok(service)) => service,
                Raced::Done(Err(err)) => {
                    let message = self.destroy_with_note(unit, &err).await;
                    return Err(RunError::Platform {
                        message,
                        source: err,
                    });
                }
                Raced::TimedOut => return Err(self.boot_timeout_error(unit).await),
                Raced::Cancelled => {
                    return Err(self.cancelled_error(unit, "while waiting for boot").await);
                }
            };
            if service.state == LifecycleState::Running {
                return Ok(service);
            }
            tracing::debug!(state = ?service.state, "compute unit not ready yet");
            match race(cancel, remaining(deadline), sleep(self.poll_interval)).await {
                Raced::Done(()) => {}
                Raced::TimedOut => return Err(self.boot_timeout_error(unit).await),
                Raced::Cancelled => {
                    return Err(self.cancelled_error(unit, "while waiting for boot").await);
                }
            }
        }
    }

    async fn resolve_endpoint_or_destroy(
        &self,
        unit: &ComputeUnit,
        service: &ServiceInfo,
    ) -> Result<Endpoint, RunError> {
        match service.endpoint_for(SHELL_PORT) {
            Some(endpoint) => Ok(endpoint),
            None => {
                let reason = format!("no port mapping published for container port {SHELL_PORT}");
                let message = self.destroy_with_note(unit, &reason).await;
                Err(RunError::Endpoint { message })
            }
        }
    }

    async fn upload_or_destroy(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        unit: &ComputeUnit,
        endpoint: &Endpoint,
    ) -> Result<(), RunError> {
        if let Some(path) = &config.command_file {
            self.transfer_or_destroy(
                cancel,
                config,
                unit,
                "command file upload",
                self.transport.send_file(endpoint, path, REMOTE_TMP_DIR),
            )
            .await?;
        }
        if let Some(dir) = config.existing_sync_dir() {
            self.transfer_or_destroy(
                cancel,
                config,
                unit,
                "sync dir upload",
                self.transport.send_dir(endpoint, dir, REMOTE_WORK_DIR),
            )
            .await?;
        }
        Ok(())
    }

    async fn download_or_destroy(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        unit: &ComputeUnit,
        endpoint: &Endpoint,
    ) -> Result<(), RunError> {
        let Some(dest) = config.sync_dir.as_deref() else {
            return Ok(());
        };
        let staging = match StagingArea::create() {
            Ok(staging) => staging,
            Err(err) => {
                let message = self.destroy_with_note(unit, &err).await;
                return Err(RunError::Staging {
                    message,
                    source: err,
                });
            }
        };
        self.transfer_or_destroy(
            cancel,
            config,
            unit,
            "result download",
            self.transport
                .receive_dir(endpoint, REMOTE_WORK_DIR, staging.path()),
        )
        .await?;
        if let Err(err) = staging.promote(dest) {
            let message = self.destroy_with_note(unit, &err).await;
            return Err(RunError::Staging {
                message,
                source: err,
            });
        }
        Ok(())
    }

    async fn transfer_or_destroy(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        unit: &ComputeUnit,
        what: &str,
        operation: impl Future<Output = Result<(), TransportError>>,
    ) -> Result<(), RunError> {
        match race(cancel, config.exec_timeout, operation).await {
            Raced::Done(Ok(())) => Ok(()),
            Raced::Done(Err(err)) => {
                let reason = format!("{what}: {err}");
                let message = self.destroy_with_note(unit, &reason).await;
                Err(RunError::Transfer {
                    message,
                    source: err,
                })
            }
            Raced::TimedOut => {
                let message = self.destroy_with_note(unit, &what).await;
                Err(RunError::TransferTimeout { message })
            }
            Raced::Cancelled => Err(self.cancelled_error(unit, what).await),
        }
    }

    async fn exec_or_destroy(
        &self,
        cancel: &CancellationToken,
        config: &RunConfig,
        unit: &ComputeUnit,
        endpoint: &Endpoint,
        sinks: ExecSinks<'_>,
    ) -> Result<u32, RunError> {
        let command = remote_command(config);
        tracing::info!(%command, "executing remote command");
        match race(
            cancel,
            config.exec_timeout,
            self.transport.exec(endpoint, &command, sinks),
        )
        .await
        {
            Raced::Done(Ok(code)) => Ok(code),
            Raced::Done(Err(err)) => {
                let message = self.destroy_with_note(unit, &err).await;
                Err(RunError::Exec {
                    message,
                    source: err,
                })
            }
            Raced::TimedOut => {
                let message = self
                    .destroy_with_note(unit, &"output relay abandoned")
                    .await;
                Err(RunError::ExecTimeout { message })
            }
            Raced::Cancelled => Err(self.cancelled_error(unit, "during remote execution").await),
        }
    }

    async fn boot_timeout_error(&self, unit: &ComputeUnit) -> RunError {
        let reason = String::from("boot timeout elapsed");
        let message = self.destroy_with_note(unit, &reason).await;
        RunError::BootTimeout { message }
    }

    async fn cancelled_error(&self, unit: &ComputeUnit, phase: &str) -> RunError {
        let message = self.destroy_with_note(unit, &phase).await;
        RunError::Cancelled { message }
    }

    /// Tears the unit down under an independent timeout: confirm the app
    /// still exists, then delete it. Deliberately not subject to the run's
    /// cancellation token so an interrupted run still cleans up.
    async fn cleanup(&self, unit: &ComputeUnit) -> Result<(), String> {
        let teardown = async {
            self.platform.read_app(&unit.app_id).await?;
            self.platform.delete_app(&unit.app_id).await
        };
        match tokio::time::timeout(self.cleanup_timeout, teardown).await {
            Ok(Ok(())) => {
                tracing::info!(app_id = %unit.app_id, "compute unit removed");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(app_id = %unit.app_id, error = %err, "teardown failed");
                Err(err.to_string())
            }
            Err(_) => {
                let message = format!(
                    "teardown timed out after {} seconds",
                    self.cleanup_timeout.as_secs()
                );
                tracing::warn!(app_id = %unit.app_id, "{message}");
                Err(message)
            }
        }
    }

    async fn destroy_with_note<E: Display>(&self, unit: &ComputeUnit, err: &E) -> String {
        let teardown_error = self.cleanup(unit).await.err();
        append_teardown_note(err.to_string(), teardown_error.as_ref())
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

/// Builds the remote command line: the uploaded script run through the base
/// command when a command file is configured, the joined tokens otherwise.
#[must_use]
pub fn remote_command(config: &RunConfig) -> String {
    if let Some(name) = config.command_file_name() {
        let remote_path = format!("{REMOTE_TMP_DIR}/{name}");
        format!("{DEFAULT_BASE_COMMAND} {}", escape(remote_path.into()))
    } else {
        config.commands.join(" ")
    }
}
