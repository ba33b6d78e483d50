//! Interactive remote session server.
//!
//! The server runs inside the provisioned container and exposes two
//! listeners: an SSH endpoint that hands each authenticated channel to a
//! session actor, and a trivial HTTP liveness endpoint the platform's
//! health checks probe. Authentication accepts exactly one identity: the
//! `root` user presenting the key injected at provisioning time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use ortho_config::OrthoConfig;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use serde::Deserialize;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PublicKey};
use russh::server::Server as _;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::platform::{LIVENESS_PORT, SHELL_PORT};

pub mod session;

use session::{SessionEvent, SessionSettings};

const AUTH_USER: &str = "root";
const DEFAULT_BASE_COMMAND: &str = "/bin/sh";

/// Session server configuration, loaded via `ortho-config` from
/// configuration files and `CARAVEL_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CARAVEL")]
pub struct ServerConfig {
    /// Authorized public key in authorized-keys form.
    #[ortho_config(default = String::new())]
    pub public_key: String,
    /// Base command for sessions.
    #[ortho_config(default = "/bin/sh".to_owned())]
    pub command: String,
    /// Address the SSH listener binds.
    #[ortho_config(default = "0.0.0.0".to_owned())]
    pub shell_addr: String,
    /// Port the SSH listener binds.
    #[ortho_config(default = 2222_u16)]
    pub shell_port: u16,
    /// Address the liveness listener binds.
    #[ortho_config(default = "0.0.0.0".to_owned())]
    pub health_addr: String,
    /// Port the liveness listener binds.
    #[ortho_config(default = 8080_u16)]
    pub health_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            command: DEFAULT_BASE_COMMAND.to_owned(),
            shell_addr: String::from("0.0.0.0"),
            shell_port: SHELL_PORT,
            health_addr: String::from("0.0.0.0"),
            health_port: LIVENESS_PORT,
        }
    }
}

impl ServerConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ServerError> {
        Self::load_from_iter([std::ffi::OsString::from("caravel-server")])
            .map_err(|err| ServerError::Config(err.to_string()))
    }

    /// Validates the configuration and parses the authorized key.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the key is missing or malformed or a
    /// port is zero.
    pub fn authorized_key(&self) -> Result<PublicKey, ServerError> {
        if self.public_key.trim().is_empty() {
            return Err(ServerError::Config(String::from(
                "missing authorized key: set CARAVEL_PUBLIC_KEY",
            )));
        }
        if self.shell_port == 0 || self.health_port == 0 {
            return Err(ServerError::Config(String::from(
                "listen ports must be non-zero",
            )));
        }
        PublicKey::from_openssh(self.public_key.trim())
            .map_err(|err| ServerError::Config(format!("invalid authorized key: {err}")))
    }
}

/// Errors raised while running the session server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Raised when configuration is missing or malformed.
    #[error("invalid server configuration: {0}")]
    Config(String),
    /// Raised by the SSH protocol layer.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    /// Raised when generating the ephemeral host key fails.
    #[error("host key generation failed: {0}")]
    HostKey(#[from] russh::keys::ssh_key::Error),
    /// Raised when a listener cannot be bound or serves an error.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    /// Raised when a pty cannot be allocated or resized.
    #[error("pty error: {0}")]
    Pty(#[from] pty_process::Error),
}

/// Runs both listeners until one fails or `cancel` fires.
///
/// Cancellation is the graceful path and returns `Ok(())`; callers decide
/// how long to linger while detached relay tasks unwind.
///
/// # Errors
///
/// Returns [`ServerError`] when configuration is invalid, the host key
/// cannot be generated, or either listener fails.
pub async fn start(cancel: &CancellationToken, config: &ServerConfig) -> Result<(), ServerError> {
    let allowed_key = config.authorized_key()?;
    let settings = Arc::new(SessionSettings {
        base_command: config.command.clone(),
        allowed_key,
    });

    // The container is brand new on every boot, so the host key is too.
    let host_key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        ..russh::server::Config::default()
    });

    let mut server = ShellServer {
        settings: Arc::clone(&settings),
    };
    let shell_addr = (config.shell_addr.clone(), config.shell_port);
    let health_addr = format!("{}:{}", config.health_addr, config.health_port);
    tracing::info!(
        shell = %format!("{}:{}", config.shell_addr, config.shell_port),
        health = %health_addr,
        "session server starting"
    );

    tokio::select! {
        result = server.run_on_address(ssh_config, shell_addr) => Ok(result?),
        result = serve_liveness(&health_addr) => result,
        () = cancel.cancelled() => {
            tracing::info!("session server shutting down");
            Ok(())
        }
    }
}

async fn serve_liveness(addr: &str) -> Result<(), ServerError> {
    let router = Router::new().route("/", get(|| async { "OK" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

struct ShellServer {
    settings: Arc<SessionSettings>,
}

impl russh::server::Server for ShellServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ClientHandler {
        ClientHandler {
            settings: Arc::clone(&self.settings),
            peer: peer_addr,
            user: None,
            channel: None,
        }
    }
}

/// Per-connection handler that authenticates the peer and forwards channel
/// activity to the session actor as events.
struct ClientHandler {
    settings: Arc<SessionSettings>,
    peer: Option<SocketAddr>,
    user: Option<String>,
    channel: Option<(ChannelId, mpsc::UnboundedSender<SessionEvent>)>,
}

impl ClientHandler {
    fn forward(&self, id: ChannelId, event: SessionEvent) {
        if let Some((channel_id, sender)) = &self.channel {
            if *channel_id == id {
                // A closed receiver means the actor already tore down.
                drop(sender.send(event));
            }
        }
    }
}

impl Handler for ClientHandler {
    type Error = ServerError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let accepted =
            user == AUTH_USER && public_key.key_data() == self.settings.allowed_key.key_data();
        if accepted {
            tracing::info!(user, peer = ?self.peer, "connection authenticated");
            self.user = Some(user.to_owned());
            Ok(Auth::Accept)
        } else {
            tracing::warn!(user, peer = ?self.peer, "authentication rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = channel.id();
        self.channel = Some((id, sender));
        tokio::spawn(session::run(
            Arc::clone(&self.settings),
            session.handle(),
            id,
            receiver,
        ));
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            SessionEvent::Pty {
                term: term.to_owned(),
                cols: col_width,
                rows: row_height,
            },
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            SessionEvent::WindowChange {
                cols: col_width,
                rows: row_height,
            },
        );
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.forward(channel, SessionEvent::Exec { command });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, SessionEvent::Shell);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            SessionEvent::Data {
                bytes: data.to_vec(),
            },
        );
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, SessionEvent::Eof);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: russh::Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::info!(?signal, "session received signal");
        self.forward(channel, SessionEvent::Signal);
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        if let Some(user) = &self.user {
            tracing::info!(user, peer = ?self.peer, "connection closed");
        }
    }
}
