//! Per-channel session actor.
//!
//! Channel activity arrives as [`SessionEvent`]s over an mpsc queue; the
//! actor owns the child process and its pipes or pty, so no relay shares
//! mutable state. Pipe-mode teardown is guarded by a single-fire latch:
//! whichever relay finishes first (or an inbound signal) wins and runs the
//! only teardown, which closes stdin, reaps the child, reports the exit
//! status, and closes the channel.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pty_process::Size;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use russh::keys::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

use crate::server::ServerError;

const RELAY_BUF_SIZE: usize = 8192;

/// Immutable settings shared by every session of one server.
pub(crate) struct SessionSettings {
    /// Base command sessions run.
    pub base_command: String,
    /// The single key accepted for authentication.
    pub allowed_key: PublicKey,
}

/// Channel activity forwarded from the connection handler.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A pty was requested before the command started.
    Pty {
        /// Terminal type to export as `TERM`.
        term: String,
        /// Initial width in columns.
        cols: u32,
        /// Initial height in rows.
        rows: u32,
    },
    /// The client resized its terminal.
    WindowChange {
        /// New width in columns.
        cols: u32,
        /// New height in rows.
        rows: u32,
    },
    /// The client requested command execution.
    Exec {
        /// Raw command line from the exec request.
        command: String,
    },
    /// The client requested an interactive shell.
    Shell,
    /// Input bytes for the child.
    Data {
        /// Raw bytes from the channel.
        bytes: Vec<u8>,
    },
    /// The client closed its write side.
    Eof,
    /// The client sent a signal; it terminates the session and is not
    /// forwarded to the child.
    Signal,
}

/// Latch that lets exactly one caller win the race to tear a session down.
#[derive(Debug, Default)]
pub(crate) struct FireOnce(AtomicBool);

impl FireOnce {
    /// Returns `true` for the first caller only.
    pub(crate) fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct TeardownTrigger {
    latch: FireOnce,
    notify: Notify,
}

impl TeardownTrigger {
    fn fire(&self) {
        if self.latch.fire() {
            self.notify.notify_one();
        }
    }
}

struct PtyParams {
    term: String,
    cols: u32,
    rows: u32,
}

/// Runs one session to completion.
pub(crate) async fn run(
    settings: Arc<SessionSettings>,
    handle: Handle,
    id: ChannelId,
    mut events: UnboundedReceiver<SessionEvent>,
) {
    let mut pty_params = None;
    let command_arg = loop {
        match events.recv().await {
            Some(SessionEvent::Pty { term, cols, rows }) => {
                pty_params = Some(PtyParams { term, cols, rows });
            }
            Some(SessionEvent::WindowChange { cols, rows }) => {
                if let Some(params) = &mut pty_params {
                    params.cols = cols;
                    params.rows = rows;
                }
            }
            Some(SessionEvent::Exec { command }) => break Some(command),
            Some(SessionEvent::Shell) => break None,
            Some(SessionEvent::Data { .. }) => {}
            Some(SessionEvent::Eof | SessionEvent::Signal) | None => {
                close_channel(&handle, id).await;
                return;
            }
        }
    };

    let result = match pty_params {
        Some(params) => {
            terminal_session(&settings, &handle, id, &params, command_arg, &mut events).await
        }
        None => pipe_session(&settings, &handle, id, command_arg, &mut events).await,
    };
    if let Err(err) = result {
        tracing::error!(error = %err, "session failed");
        let message = CryptoVec::from_slice(format!("{err}\n").as_bytes());
        drop(handle.extended_data(id, 1, message).await);
        close_channel(&handle, id).await;
    }
}

/// Terminal mode: the child runs on a pty, bytes relay both ways, window
/// changes resize the pty, and the session closes without an exit status
/// once either side stops.
async fn terminal_session(
    settings: &SessionSettings,
    handle: &Handle,
    id: ChannelId,
    params: &PtyParams,
    command_arg: Option<String>,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> Result<(), ServerError> {
    let mut pty = pty_process::Pty::new()?;
    pty.resize(Size::new(clamp_dim(params.rows), clamp_dim(params.cols)))?;
    let pts = pty.pts()?;

    let mut command = pty_process::Command::new(&settings.base_command);
    if let Some(arg) = &command_arg {
        command.args(["-c", arg]);
    }
    command.env("TERM", &params.term);
    let mut child = command.spawn(&pts)?;
    drop(pts);
    let (mut pty_out, mut pty_in) = pty.into_split();

    let mut buf = vec![0_u8; RELAY_BUF_SIZE];
    loop {
        tokio::select! {
            read = pty_out.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let Some(chunk) = buf.get(..n) else { break };
                if handle.data(id, CryptoVec::from_slice(chunk)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(SessionEvent::Data { bytes }) => {
                    if pty_in.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(SessionEvent::WindowChange { cols, rows }) => {
                    if let Err(err) = pty_in.resize(Size::new(clamp_dim(rows), clamp_dim(cols))) {
                        tracing::debug!(error = %err, "pty resize failed");
                    }
                }
                Some(SessionEvent::Eof | SessionEvent::Signal) | None => break,
                Some(_) => {}
            },
        }
    }

    match child.wait().await {
        Ok(status) => tracing::debug!(?status, "terminal session child exited"),
        Err(err) => tracing::warn!(error = %err, "failed to reap terminal session child"),
    }
    close_channel(handle, id).await;
    Ok(())
}

/// Pipe mode: three concurrent relays feed the channel; the first to finish
/// (or an inbound signal, or client EOF) fires teardown exactly once.
async fn pipe_session(
    settings: &SessionSettings,
    handle: &Handle,
    id: ChannelId,
    command_arg: Option<String>,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> Result<(), ServerError> {
    let mut command = tokio::process::Command::new(&settings.base_command);
    if let Some(arg) = &command_arg {
        command.args(["-c", arg]);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let trigger = Arc::new(TeardownTrigger {
        latch: FireOnce::default(),
        notify: Notify::new(),
    });

    if let Some(stdout) = stdout {
        tokio::spawn(relay_output(
            stdout,
            handle.clone(),
            id,
            None,
            Arc::clone(&trigger),
        ));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(relay_output(
            stderr,
            handle.clone(),
            id,
            Some(1),
            Arc::clone(&trigger),
        ));
    }

    loop {
        tokio::select! {
            () = trigger.notify.notified() => break,
            event = events.recv() => match event {
                Some(SessionEvent::Data { bytes }) => {
                    if let Some(pipe) = stdin.as_mut() {
                        if pipe.write_all(&bytes).await.is_err() {
                            trigger.fire();
                        }
                    }
                }
                Some(SessionEvent::Eof | SessionEvent::Signal) | None => {
                    trigger.fire();
                }
                Some(_) => {}
            },
        }
    }

    // Teardown: close stdin so the child sees EOF, reap it, report status.
    drop(stdin.take());
    match reap_exit_code(&mut child).await? {
        Some(code) => {
            if handle.exit_status_request(id, code).await.is_err() {
                tracing::debug!("peer gone before exit status was sent");
            }
        }
        None => {
            tracing::error!("child exited without a usable exit code");
        }
    }
    close_channel(handle, id).await;
    Ok(())
}

/// Waits for the child and returns its exit code, or `None` when it was
/// killed by a signal and has no code to report.
async fn reap_exit_code(child: &mut tokio::process::Child) -> Result<Option<u32>, ServerError> {
    let status = child.wait().await?;
    Ok(status.code().and_then(|code| u32::try_from(code).ok()))
}

async fn relay_output(
    mut source: impl tokio::io::AsyncRead + Unpin,
    handle: Handle,
    id: ChannelId,
    ext: Option<u32>,
    trigger: Arc<TeardownTrigger>,
) {
    let mut buf = vec![0_u8; RELAY_BUF_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Some(chunk) = buf.get(..n) else { break };
        let payload = CryptoVec::from_slice(chunk);
        let sent = match ext {
            Some(ext_type) => handle.extended_data(id, ext_type, payload).await,
            None => handle.data(id, payload).await,
        };
        if sent.is_err() {
            break;
        }
    }
    trigger.fire();
}

async fn close_channel(handle: &Handle, id: ChannelId) {
    drop(handle.eof(id).await);
    drop(handle.close(id).await);
}

fn clamp_dim(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
