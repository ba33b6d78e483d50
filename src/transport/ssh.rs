//! Production [`SessionTransport`] over SSH.
//!
//! Command execution uses an exec channel; file movement uses the SFTP
//! subsystem. Each operation dials, authenticates as `root` with the run's
//! private key, does its work and disconnects. Host keys are accepted
//! blindly: the peer is an ephemeral container created seconds earlier whose
//! host key has never been seen before.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use russh::client::{AuthResult, Config, Handle, Handler};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;

use crate::platform::Endpoint;
use crate::transport::{ExecSinks, SessionTransport, TransportError, TransportFuture};

const REMOTE_USER: &str = "root";
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SSH + SFTP implementation of [`SessionTransport`].
pub struct SshTransport {
    config: Arc<Config>,
    key: Arc<PrivateKey>,
}

impl SshTransport {
    /// Builds a transport from an OpenSSH-encoded private key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Key`] when the key cannot be decoded.
    pub fn new(private_key: &str) -> Result<Self, TransportError> {
        let key = decode_secret_key(private_key, None)?;
        let config = Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Config::default()
        };
        Ok(Self {
            config: Arc::new(config),
            key: Arc::new(key),
        })
    }

    async fn connect(&self, target: &Endpoint) -> Result<Handle<ClientHandler>, TransportError> {
        let mut handle = russh::client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            ClientHandler,
        )
        .await?;
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth_key = PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg);
        match handle.authenticate_publickey(REMOTE_USER, auth_key).await? {
            AuthResult::Success => Ok(handle),
            AuthResult::Failure { .. } => Err(TransportError::AuthRejected {
                target: target.to_string(),
            }),
        }
    }

    async fn exec_inner(
        &self,
        target: &Endpoint,
        command: &str,
        sinks: ExecSinks<'_>,
    ) -> Result<u32, TransportError> {
        let handle = self.connect(target).await?;
        let result = run_exec_channel(&handle, command, sinks).await;
        disconnect(&handle).await;
        result
    }

    async fn send_file_inner(
        &self,
        target: &Endpoint,
        local: &Utf8Path,
        remote_dir: &str,
    ) -> Result<(), TransportError> {
        let handle = self.connect(target).await?;
        let result = async {
            let sftp = open_sftp(&handle).await?;
            ensure_remote_dir(&sftp, remote_dir).await?;
            let name = local.file_name().ok_or_else(|| TransportError::LocalIo {
                path: local.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path has no file name",
                ),
            })?;
            upload_file(&sftp, local, &remote_join(remote_dir, name)).await
        }
        .await;
        disconnect(&handle).await;
        result
    }

    async fn send_dir_inner(
        &self,
        target: &Endpoint,
        local_dir: &Utf8Path,
        remote_dir: &str,
    ) -> Result<(), TransportError> {
        let handle = self.connect(target).await?;
        let result = async {
            let sftp = open_sftp(&handle).await?;
            let mut stack = vec![(local_dir.to_owned(), remote_dir.to_owned())];
            while let Some((local_base, remote_base)) = stack.pop() {
                ensure_remote_dir(&sftp, &remote_base).await?;
                for entry in local_entries(&local_base)? {
                    let child_remote = remote_join(&remote_base, entry.file_name());
                    let file_type = entry.file_type().map_err(|source| TransportError::LocalIo {
                        path: entry.path().to_string(),
                        source,
                    })?;
                    if file_type.is_dir() {
                        stack.push((entry.path().to_owned(), child_remote));
                    } else {
                        upload_file(&sftp, entry.path(), &child_remote).await?;
                    }
                }
            }
            Ok(())
        }
        .await;
        disconnect(&handle).await;
        result
    }

    async fn receive_dir_inner(
        &self,
        target: &Endpoint,
        remote_dir: &str,
        local_dir: &Utf8Path,
    ) -> Result<(), TransportError> {
        let handle = self.connect(target).await?;
        let result = async {
            let sftp = open_sftp(&handle).await?;
            let mut stack = vec![(
                remote_dir.trim_end_matches('/').to_owned(),
                local_dir.to_owned(),
            )];
            while let Some((remote_base, local_base)) = stack.pop() {
                tokio::fs::create_dir_all(&local_base)
                    .await
                    .map_err(|source| TransportError::LocalIo {
                        path: local_base.to_string(),
                        source,
                    })?;
                for entry in sftp.read_dir(&remote_base).await? {
                    let name = entry.file_name();
                    let remote_child = remote_join(&remote_base, &name);
                    let local_child = local_base.join(&name);
                    if entry.metadata().is_dir() {
                        stack.push((remote_child, local_child));
                    } else {
                        download_file(&sftp, &remote_child, &local_child).await?;
                    }
                }
            }
            Ok(())
        }
        .await;
        disconnect(&handle).await;
        result
    }
}

impl SessionTransport for SshTransport {
    fn exec<'a, 'w: 'a>(
        &'a self,
        target: &'a Endpoint,
        command: &'a str,
        sinks: ExecSinks<'w>,
    ) -> TransportFuture<'a, u32> {
        Box::pin(self.exec_inner(target, command, sinks))
    }

    fn send_file<'a>(
        &'a self,
        target: &'a Endpoint,
        local: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.send_file_inner(target, local, remote_dir))
    }

    fn send_dir<'a>(
        &'a self,
        target: &'a Endpoint,
        local_dir: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.send_dir_inner(target, local_dir, remote_dir))
    }

    fn receive_dir<'a>(
        &'a self,
        target: &'a Endpoint,
        remote_dir: &'a str,
        local_dir: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.receive_dir_inner(target, remote_dir, local_dir))
    }
}

async fn run_exec_channel(
    handle: &Handle<ClientHandler>,
    command: &str,
    sinks: ExecSinks<'_>,
) -> Result<u32, TransportError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                sinks
                    .stdout
                    .write_all(data)
                    .await
                    .map_err(TransportError::Sink)?;
            }
            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                sinks
                    .stderr
                    .write_all(data)
                    .await
                    .map_err(TransportError::Sink)?;
            }
            ChannelMsg::ExitStatus {
                exit_status: status,
            } => exit_status = Some(status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    sinks.stdout.flush().await.map_err(TransportError::Sink)?;
    sinks.stderr.flush().await.map_err(TransportError::Sink)?;
    if let Err(err) = channel.close().await {
        tracing::debug!(error = %err, "exec channel close failed");
    }
    exit_status.ok_or(TransportError::MissingExitStatus)
}

async fn open_sftp(handle: &Handle<ClientHandler>) -> Result<SftpSession, TransportError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    Ok(SftpSession::new(channel.into_stream()).await?)
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(err) = handle
        .disconnect(Disconnect::ByApplication, "done", "en")
        .await
    {
        tracing::debug!(error = %err, "ssh disconnect failed");
    }
}

/// Creates each missing component of `remote_dir` in turn, root first.
async fn ensure_remote_dir(sftp: &SftpSession, remote_dir: &str) -> Result<(), TransportError> {
    let mut current = String::new();
    for segment in remote_dir.split('/').filter(|segment| !segment.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match sftp.metadata(&current).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(TransportError::RemotePath {
                    path: current.clone(),
                });
            }
            Err(_) => sftp.create_dir(&current).await?,
        }
    }
    Ok(())
}

async fn upload_file(
    sftp: &SftpSession,
    local: &Utf8Path,
    remote_path: &str,
) -> Result<(), TransportError> {
    let mut local_file =
        tokio::fs::File::open(local)
            .await
            .map_err(|source| TransportError::LocalIo {
                path: local.to_string(),
                source,
            })?;
    let flags = OpenFlags::WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::TRUNCATE);
    let mut remote_file = sftp.open_with_flags(remote_path, flags).await?;
    tokio::io::copy(&mut local_file, &mut remote_file)
        .await
        .map_err(|source| TransportError::LocalIo {
            path: local.to_string(),
            source,
        })?;
    remote_file
        .flush()
        .await
        .map_err(|source| TransportError::LocalIo {
            path: remote_path.to_owned(),
            source,
        })?;
    remote_file
        .shutdown()
        .await
        .map_err(|source| TransportError::LocalIo {
            path: remote_path.to_owned(),
            source,
        })?;
    Ok(())
}

async fn download_file(
    sftp: &SftpSession,
    remote_path: &str,
    local: &Utf8Path,
) -> Result<(), TransportError> {
    let mut remote_file = sftp.open(remote_path).await?;
    let mut local_file =
        tokio::fs::File::create(local)
            .await
            .map_err(|source| TransportError::LocalIo {
                path: local.to_string(),
                source,
            })?;
    tokio::io::copy(&mut remote_file, &mut local_file)
        .await
        .map_err(|source| TransportError::LocalIo {
            path: local.to_string(),
            source,
        })?;
    local_file
        .flush()
        .await
        .map_err(|source| TransportError::LocalIo {
            path: local.to_string(),
            source,
        })?;
    Ok(())
}

fn local_entries(dir: &Utf8Path) -> Result<Vec<camino::Utf8DirEntry>, TransportError> {
    let reader = dir
        .read_dir_utf8()
        .map_err(|source| TransportError::LocalIo {
            path: dir.to_string(),
            source,
        })?;
    reader
        .map(|entry| {
            entry.map_err(|source| TransportError::LocalIo {
                path: dir.to_string(),
                source,
            })
        })
        .collect()
}

fn remote_join(base: &str, name: &str) -> String {
    format!("{}/{name}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_join_collapses_trailing_slash() {
        assert_eq!(remote_join("/workdir/", "out.txt"), "/workdir/out.txt");
        assert_eq!(remote_join("/tmp", "task.sh"), "/tmp/task.sh");
    }

    #[test]
    fn new_rejects_garbage_key_material() {
        let result = SshTransport::new("not a key");
        assert!(matches!(result, Err(TransportError::Key(_))));
    }

    #[test]
    fn new_accepts_generated_key_material() {
        let pair = crate::keys::KeyPair::generate().expect("key generation succeeds");
        assert!(SshTransport::new(&pair.private_key).is_ok());
    }
}
