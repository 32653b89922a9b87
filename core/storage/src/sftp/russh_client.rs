//! SFTP over russh.

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::transport::{RemoteKind, SftpAuth, SftpChannel, SftpConnector, SftpTarget};
use imghost_common::{Error, Result};

const PROVIDER: &str = "sftp";

/// Connector that opens real SSH sessions.
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

/// Host key policy: accept anything unless a fingerprint is pinned.
struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.expected {
            Some(expected) if expected.trim() != actual => {
                warn!(host = %self.host, actual = %actual, "SFTP host key does not match pinned fingerprint");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                debug!(host = %self.host, fingerprint = %actual, "Accepting unpinned SFTP host key");
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl SftpConnector for RusshConnector {
    async fn connect(&self, target: &SftpTarget) -> Result<Box<dyn SftpChannel>> {
        let addr = format!("{}:{}", target.host, target.port);
        info!(addr = %addr, user = %target.username, "Connecting to SFTP server");

        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        let handler = HostKeyCheck {
            host: target.host.clone(),
            expected: target.host_fingerprint.clone(),
        };

        let mut handle = tokio::time::timeout(
            target.connect_timeout,
            client::connect(
                Arc::new(config),
                (target.host.as_str(), target.port),
                handler,
            ),
        )
        .await
        .map_err(|_| Error::connectivity(PROVIDER, format!("Connection to {} timed out", addr)))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                Error::auth(PROVIDER, format!("Host key for {} was rejected", addr))
            }
            other => Error::connectivity(PROVIDER, other.to_string()),
        })?;

        let authenticated = match &target.auth {
            SftpAuth::Password(password) => handle
                .authenticate_password(&target.username, password.as_str())
                .await
                .map_err(|e| Error::connectivity(PROVIDER, e.to_string()))?,
            SftpAuth::KeyFile { path, passphrase } => {
                let key = russh::keys::load_secret_key(
                    path,
                    passphrase.as_ref().map(|p| p.as_str()),
                )
                .map_err(|e| {
                    Error::Configuration(format!(
                        "Cannot load SFTP key {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&target.username, key_with_hash)
                    .await
                    .map_err(|e| Error::connectivity(PROVIDER, e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(Error::auth(
                PROVIDER,
                format!("Authentication rejected for {}@{}", target.username, addr),
            ));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::connectivity(PROVIDER, e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::connectivity(PROVIDER, format!("SFTP subsystem unavailable: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::connectivity(PROVIDER, e.to_string()))?;

        info!(addr = %addr, "SFTP session established");
        Ok(Box::new(RusshChannel { handle, sftp }))
    }
}

struct RusshChannel {
    handle: client::Handle<HostKeyCheck>,
    sftp: SftpSession,
}

fn map_error(path: &str, err: SftpError) -> Error {
    match &err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => Error::NotFound(format!("SFTP path not found: {}", path)),
            StatusCode::PermissionDenied => {
                Error::auth(PROVIDER, format!("Permission denied: {}", path))
            }
            _ => Error::connectivity(PROVIDER, format!("{}: {}", path, err)),
        },
        _ => Error::connectivity(PROVIDER, format!("{}: {}", path, err)),
    }
}

fn io_error(path: &str, err: std::io::Error) -> Error {
    Error::connectivity(PROVIDER, format!("{}: {}", path, err))
}

#[async_trait]
impl SftpChannel for RusshChannel {
    fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>> {
        match self.sftp.metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(RemoteKind::Directory)),
            Ok(meta) if meta.is_regular() => Ok(Some(RemoteKind::File)),
            Ok(_) => Ok(Some(RemoteKind::Other)),
            Err(e) => match map_error(path, e) {
                Error::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_error(path, e))?;
        file.write_all(data).await.map_err(|e| io_error(path, e))?;
        file.flush().await.map_err(|e| io_error(path, e))?;
        file.shutdown().await.map_err(|e| io_error(path, e))?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.sftp.open(path).await.map_err(|e| map_error(path, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(data)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_error(from, e))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::connectivity(PROVIDER, e.to_string()))
    }
}
