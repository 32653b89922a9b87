//! Connection seam for the SFTP backend.
//!
//! The backend talks to an [`SftpChannel`] obtained from an [`SftpConnector`].
//! Production uses the russh connector; tests plug in the in-memory one.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::object_store::timeout_from_config;
use imghost_common::{Credentials, Error, ProviderConfig, Result};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Connect timeout when the provider config sets none.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a remote path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Anything else (symlink, device, ...).
    Other,
}

/// How to authenticate against the SSH server.
pub enum SftpAuth {
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Private key file, optionally passphrase-protected.
    KeyFile {
        /// Path to the private key.
        path: PathBuf,
        /// Passphrase for an encrypted key.
        passphrase: Option<Zeroizing<String>>,
    },
}

impl fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password([REDACTED])"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
        }
    }
}

/// Everything needed to open an SFTP session.
#[derive(Debug)]
pub struct SftpTarget {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Authentication method.
    pub auth: SftpAuth,
    /// Expected `SHA256:...` host key fingerprint; any key is accepted when unset.
    pub host_fingerprint: Option<String>,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl SftpTarget {
    /// Assemble a target from decrypted credentials and provider config.
    ///
    /// A password wins over a key file when both are present.
    ///
    /// # Errors
    /// - `MissingKeys` if host, username or an auth method is absent
    /// - `Configuration` if `port` or `timeout_secs` is malformed
    pub fn from_parts(credentials: &Credentials, config: &ProviderConfig) -> Result<Self> {
        let host = required(credentials, "host")?;
        let username = required(credentials, "username")?;

        let port = match credentials.get("port") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                Error::Configuration(format!("SFTP port must be 1-65535, got '{}'", raw))
            })?,
            None => DEFAULT_PORT,
        };

        let auth = match (credentials.get("password"), credentials.get("key_file")) {
            (Some(password), _) => SftpAuth::Password(Zeroizing::new(password.to_string())),
            (None, Some(key_file)) => SftpAuth::KeyFile {
                path: PathBuf::from(key_file),
                passphrase: credentials
                    .get("key_passphrase")
                    .map(|p| Zeroizing::new(p.to_string())),
            },
            (None, None) => {
                return Err(Error::missing_keys(
                    "sftp",
                    vec!["password or key_file".to_string()],
                ))
            }
        };

        Ok(Self {
            host,
            port,
            username,
            auth,
            host_fingerprint: config.get_str("host_fingerprint"),
            connect_timeout: timeout_from_config(config)?.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

fn required(credentials: &Credentials, key: &str) -> Result<String> {
    credentials
        .get(key)
        .map(str::to_string)
        .ok_or_else(|| Error::missing_keys("sftp", vec![key.to_string()]))
}

/// An open SFTP session.
///
/// Paths are remote paths as the server understands them. Errors are already
/// mapped: a missing path is `NotFound`, a refused operation is `Auth`,
/// anything else is `Connectivity`.
#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// Whether the underlying transport is still usable.
    fn is_open(&self) -> bool;

    /// Look up a path; `Ok(None)` when it does not exist.
    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>>;

    /// Create a single directory. Fails if it already exists.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Create or truncate a file and write `data` to it.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a whole file.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Remove a file.
    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Rename a file. Servers may refuse to replace an existing target.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Shut the session down.
    async fn close(&self) -> Result<()>;
}

/// Opens SFTP sessions.
#[async_trait]
pub trait SftpConnector: Send + Sync {
    /// Connect, authenticate and start the SFTP subsystem.
    ///
    /// # Errors
    /// - `Auth` if the server rejects the credentials or host key
    /// - `Connectivity` on network failure or timeout
    async fn connect(&self, target: &SftpTarget) -> Result<Box<dyn SftpChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pairs: &[(&str, &str)]) -> Credentials {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_password_target() {
        let target = SftpTarget::from_parts(
            &creds(&[("host", "files.example.com"), ("username", "deploy"), ("password", "pw")]),
            &ProviderConfig::new(),
        )
        .unwrap();
        assert_eq!(target.port, DEFAULT_PORT);
        assert_eq!(target.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(matches!(target.auth, SftpAuth::Password(_)));
        assert!(!format!("{:?}", target).contains("pw\""));
    }

    #[test]
    fn test_key_file_target() {
        let config: ProviderConfig = [("host_fingerprint", "SHA256:abc"), ("timeout_secs", "5")]
            .into_iter()
            .collect();
        let target = SftpTarget::from_parts(
            &creds(&[
                ("host", "h"),
                ("username", "u"),
                ("port", "2222"),
                ("key_file", "/home/u/.ssh/id_ed25519"),
                ("key_passphrase", "secret"),
            ]),
            &config,
        )
        .unwrap();
        assert_eq!(target.port, 2222);
        assert_eq!(target.host_fingerprint.as_deref(), Some("SHA256:abc"));
        assert_eq!(target.connect_timeout, Duration::from_secs(5));
        match target.auth {
            SftpAuth::KeyFile { path, passphrase } => {
                assert_eq!(path, PathBuf::from("/home/u/.ssh/id_ed25519"));
                assert_eq!(passphrase.as_deref().map(String::as_str), Some("secret"));
            }
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_bad_port() {
        let err = SftpTarget::from_parts(
            &creds(&[("host", "h"), ("username", "u"), ("password", "p"), ("port", "99999")]),
            &ProviderConfig::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
