//! Capability interface for moving bytes to and from a provisioned shell
//! service.
//!
//! The orchestrator only ever talks to the remote side through
//! [`SessionTransport`]; the production adapter lives in
//! [`crate::transport::ssh`] and tests substitute in-memory fakes.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::platform::Endpoint;

pub mod ssh;

/// Output sinks for one remote command execution.
///
/// Remote stdout and stderr stream into these writers as bytes arrive; the
/// binaries wire them to the process std streams, tests wire them to
/// buffers.
pub struct ExecSinks<'w> {
    /// Receives remote standard output.
    pub stdout: &'w mut (dyn AsyncWrite + Unpin + Send),
    /// Receives remote standard error.
    pub stderr: &'w mut (dyn AsyncWrite + Unpin + Send),
}

impl std::fmt::Debug for ExecSinks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSinks").finish_non_exhaustive()
    }
}

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Minimal interface implemented by shell-service transports.
///
/// Every operation dials its own authenticated connection and tears it down
/// before returning; there is no session state shared between calls.
pub trait SessionTransport: Send + Sync {
    /// Runs `command` remotely, streaming output into `sinks`, and returns
    /// the remote exit code.
    fn exec<'a, 'w: 'a>(
        &'a self,
        target: &'a Endpoint,
        command: &'a str,
        sinks: ExecSinks<'w>,
    ) -> TransportFuture<'a, u32>;

    /// Copies one local file into `remote_dir`, keeping its file name.
    fn send_file<'a>(
        &'a self,
        target: &'a Endpoint,
        local: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()>;

    /// Copies the contents of `local_dir` into `remote_dir`, recursing and
    /// preserving relative structure.
    fn send_dir<'a>(
        &'a self,
        target: &'a Endpoint,
        local_dir: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()>;

    /// Copies the remote tree rooted at `remote_dir` into `local_dir`,
    /// recursing and preserving relative structure.
    fn receive_dir<'a>(
        &'a self,
        target: &'a Endpoint,
        remote_dir: &'a str,
        local_dir: &'a Utf8Path,
    ) -> TransportFuture<'a, ()>;
}

/// Errors raised by session transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Raised when the supplied private key cannot be decoded.
    #[error("invalid private key: {0}")]
    Key(#[from] russh::keys::Error),
    /// Raised when the remote side rejects our credentials.
    #[error("authentication rejected by {target}")]
    AuthRejected {
        /// Endpoint that rejected the key.
        target: String,
    },
    /// Raised by the SSH protocol layer.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    /// Raised by the SFTP subsystem.
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    /// Raised by local filesystem access during a transfer.
    #[error("local i/o error at {path}: {source}")]
    LocalIo {
        /// Local path involved in the failure.
        path: String,
        /// Underlying filesystem error.
        source: std::io::Error,
    },
    /// Raised when a remote path that must be a directory is not one.
    #[error("remote path {path} exists but is not a directory")]
    RemotePath {
        /// Offending remote path.
        path: String,
    },
    /// Raised when output cannot be written to a configured sink.
    #[error("output sink error: {0}")]
    Sink(#[source] std::io::Error),
    /// Raised when the remote closes an exec channel without reporting an
    /// exit status.
    #[error("remote closed without an exit status")]
    MissingExitStatus,
}
