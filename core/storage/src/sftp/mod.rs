//! SFTP backend.
//!
//! The backend owns at most one live session, modelled as an explicit
//! `Disconnected` / `Connected` state. Every operation goes through
//! `ensure_connected`, which is the only place a transition happens: it
//! connects on first use and reconnects when the server dropped the session.
//!
//! Uploads create missing directories one level at a time and write through a
//! temporary sibling that is renamed into place, so readers never observe a
//! half-written object.

mod memory;
mod russh_client;
mod transport;

pub use memory::MemorySftp;
pub use russh_client::RusshConnector;
pub use transport::{
    RemoteKind, SftpAuth, SftpChannel, SftpConnector, SftpTarget, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_PORT,
};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::object_store::encode_key;
use crate::requirements::check_keys;
use imghost_common::{Credentials, Error, ProviderConfig, ProviderType, Result, StoragePath};

enum ConnectionState {
    Disconnected,
    Connected(Box<dyn SftpChannel>),
}

impl ConnectionState {
    fn channel(&self) -> Result<&dyn SftpChannel> {
        match self {
            Self::Connected(channel) => Ok(channel.as_ref()),
            Self::Disconnected => Err(Error::connectivity("sftp", "not connected")),
        }
    }
}

/// SFTP backend.
///
/// Config: `remote_path`, optional `host_fingerprint` and `timeout_secs`.
/// Credentials: `host`, `username`, one of `password` / `key_file`, optional
/// `port` and `key_passphrase`.
pub struct SftpBackend {
    target: SftpTarget,
    remote_path: String,
    connector: Arc<dyn SftpConnector>,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for SftpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpBackend")
            .field("host", &self.target.host)
            .field("port", &self.target.port)
            .field("username", &self.target.username)
            .field("remote_path", &self.remote_path)
            .finish_non_exhaustive()
    }
}

impl SftpBackend {
    /// Build an SFTP backend that connects through russh.
    ///
    /// No connection is made until the first operation.
    ///
    /// # Errors
    /// - `MissingKeys` if required config or credential keys are absent
    /// - `Configuration` if `port` or `timeout_secs` is malformed
    pub fn new(credentials: &Credentials, config: &ProviderConfig) -> Result<Self> {
        Self::with_connector(credentials, config, Arc::new(RusshConnector))
    }

    /// Build an SFTP backend over a custom connector.
    pub fn with_connector(
        credentials: &Credentials,
        config: &ProviderConfig,
        connector: Arc<dyn SftpConnector>,
    ) -> Result<Self> {
        check_keys(ProviderType::Sftp, config, credentials)?;
        let remote_path = config
            .get_str("remote_path")
            .ok_or_else(|| Error::missing_keys("sftp", vec!["remote_path".to_string()]))?;
        let target = SftpTarget::from_parts(credentials, config)?;

        Ok(Self {
            target,
            remote_path,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
        })
    }

    /// Whether a session is currently held.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Connected(_))
    }

    async fn ensure_connected(&self) -> Result<MutexGuard<'_, ConnectionState>> {
        let mut state = self.state.lock().await;

        let usable = matches!(&*state, ConnectionState::Connected(channel) if channel.is_open());
        if !usable {
            if let ConnectionState::Connected(stale) =
                std::mem::replace(&mut *state, ConnectionState::Disconnected)
            {
                debug!(host = %self.target.host, "SFTP session lost, reconnecting");
                if let Err(e) = stale.close().await {
                    debug!(error = %e, "Closing stale SFTP session failed");
                }
            }
            let channel = self.connector.connect(&self.target).await?;
            *state = ConnectionState::Connected(channel);
        }
        Ok(state)
    }

    fn remote_file(&self, path: &StoragePath) -> String {
        format!(
            "{}/{}",
            self.remote_path.trim_end_matches('/'),
            path.as_key()
        )
    }
}

/// Directories from `base` down to `dir`, shortest first.
///
/// Nothing above `base` is visited; a `dir` outside `base` falls back to every
/// prefix of `dir`.
fn dirs_under(base: &str, dir: &str) -> Vec<String> {
    let base = base.trim_end_matches('/');
    let rest = match dir.strip_prefix(base) {
        Some(rest) if !base.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
        _ => return ancestors(dir),
    };
    let mut current = base.to_string();
    let mut out = vec![current.clone()];
    for component in rest.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        out.push(current.clone());
    }
    out
}

/// Every directory prefix of `dir`, shortest first.
fn ancestors(dir: &str) -> Vec<String> {
    let absolute = dir.starts_with('/');
    let mut current = String::new();
    let mut out = Vec::new();
    for component in dir.split('/').filter(|c| !c.is_empty()) {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(component);
        out.push(current.clone());
    }
    out
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

/// Create `dir` and any missing ancestors below `base`.
///
/// An ancestor that already exists as a directory counts as created. Stops at
/// the first ancestor that can neither be found nor created.
async fn create_dirs(channel: &dyn SftpChannel, base: &str, dir: &str) -> Result<()> {
    for ancestor in dirs_under(base, dir) {
        match channel.stat(&ancestor).await? {
            Some(RemoteKind::Directory) => continue,
            Some(_) => {
                return Err(Error::InvalidInput(format!(
                    "SFTP path {} exists and is not a directory",
                    ancestor
                )))
            }
            None => {}
        }

        if let Err(e) = channel.mkdir(&ancestor).await {
            // created concurrently by someone else
            if let Ok(Some(RemoteKind::Directory)) = channel.stat(&ancestor).await {
                continue;
            }
            warn!(dir = %ancestor, error = %e, "Cannot create SFTP directory");
            return Err(e);
        }
        debug!(dir = %ancestor, "Created SFTP directory");
    }
    Ok(())
}

/// Move `temp` onto `target`.
///
/// SFTPv3 rename does not replace an existing file, so an existing target is
/// first moved aside and put back if the second rename fails.
async fn replace_file(channel: &dyn SftpChannel, temp: &str, target: &str) -> Result<()> {
    let first = match channel.rename(temp, target).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if channel.stat(target).await? != Some(RemoteKind::File) {
        return Err(first);
    }

    let aside = format!("{}.old-{}", target, &Uuid::new_v4().simple().to_string()[..8]);
    channel.rename(target, &aside).await?;
    match channel.rename(temp, target).await {
        Ok(()) => {
            if let Err(e) = channel.remove_file(&aside).await {
                warn!(path = %aside, error = %e, "Failed to remove replaced SFTP file");
            }
            Ok(())
        }
        Err(e) => {
            if let Err(restore) = channel.rename(&aside, target).await {
                warn!(path = %target, error = %restore, "Failed to restore previous SFTP file");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Sftp
    }

    async fn upload(&self, data: Bytes, path: &StoragePath) -> Result<StoragePath> {
        let state = self.ensure_connected().await?;
        let channel = state.channel()?;
        let target = self.remote_file(path);

        if let Some(dir) = parent_dir(&target) {
            if channel.stat(dir).await? != Some(RemoteKind::Directory) {
                create_dirs(channel, &self.remote_path, dir).await?;
            }
        }

        let temp = format!("{}.part-{}", target, &Uuid::new_v4().simple().to_string()[..8]);
        if let Err(e) = channel.write_file(&temp, &data).await {
            let _ = channel.remove_file(&temp).await;
            return Err(e);
        }

        if let Err(e) = replace_file(channel, &temp, &target).await {
            let _ = channel.remove_file(&temp).await;
            return Err(e);
        }

        info!(path = %target, size = data.len(), "Uploaded via SFTP");
        Ok(path.clone())
    }

    async fn download(&self, path: &StoragePath) -> Result<Bytes> {
        let state = self.ensure_connected().await?;
        let data = state.channel()?.read_file(&self.remote_file(path)).await?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let state = self.ensure_connected().await?;
        match state.channel()?.remove_file(&self.remote_file(path)).await {
            Err(Error::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        let state = self.ensure_connected().await?;
        Ok(state
            .channel()?
            .stat(&self.remote_file(path))
            .await?
            .is_some())
    }

    fn url(&self, path: &StoragePath) -> String {
        let port = if self.target.port == DEFAULT_PORT {
            String::new()
        } else {
            format!(":{}", self.target.port)
        };
        let base = self.remote_path.trim_matches('/');
        let key = encode_key(path);
        if base.is_empty() {
            format!("sftp://{}{}/{}", self.target.host, port, key)
        } else {
            format!("sftp://{}{}/{}/{}", self.target.host, port, base, key)
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let ConnectionState::Connected(channel) =
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        {
            channel.close().await?;
            debug!(host = %self.target.host, "SFTP session closed");
        }
        Ok(())
    }
}

impl Drop for SftpBackend {
    fn drop(&mut self) {
        let ConnectionState::Connected(channel) =
            std::mem::replace(self.state.get_mut(), ConnectionState::Disconnected)
        else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let host = self.target.host.clone();
                runtime.spawn(async move {
                    if let Err(e) = channel.close().await {
                        debug!(host = %host, error = %e, "SFTP disconnect on drop failed");
                    }
                });
                debug!(host = %self.target.host, "Disconnecting SFTP session on drop");
            }
            Err(_) => {
                debug!(host = %self.target.host, "Dropped SFTP session without a runtime to disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/srv/images";

    fn creds() -> Credentials {
        [("host", "files.example.com"), ("username", "deploy"), ("password", "pw")]
            .into_iter()
            .collect()
    }

    fn config(remote_path: &str) -> ProviderConfig {
        [("remote_path", remote_path)].into_iter().collect()
    }

    fn backend(server: &MemorySftp) -> SftpBackend {
        SftpBackend::with_connector(&creds(), &config(ROOT), Arc::new(server.clone())).unwrap()
    }

    #[test]
    fn test_debug_hides_credentials() {
        let backend = backend(&MemorySftp::default());
        let text = format!("{:?}", backend);
        assert!(text.contains("files.example.com"));
        assert!(!text.contains("pw"));
    }

    #[test]
    fn test_missing_keys() {
        let creds: Credentials = [("host", "h")].into_iter().collect();
        let err = SftpBackend::new(&creds, &ProviderConfig::new()).unwrap_err();
        match err {
            Error::MissingKeys { keys, .. } => assert_eq!(
                keys,
                vec!["remote_path", "username", "password or key_file"]
            ),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(ancestors("rel/dir"), vec!["rel", "rel/dir"]);
        assert!(ancestors("/").is_empty());
    }

    #[test]
    fn test_dirs_under_base() {
        assert_eq!(
            dirs_under("/srv/images/", "/srv/images/u/2024"),
            vec!["/srv/images", "/srv/images/u", "/srv/images/u/2024"]
        );
        assert_eq!(dirs_under("uploads", "uploads"), vec!["uploads"]);
        // a sibling sharing the prefix is not under the base
        assert_eq!(dirs_under("/srv/img", "/srv/images/a"), ancestors("/srv/images/a"));
        assert_eq!(dirs_under("/", "/a/b"), vec!["/a", "/a/b"]);
    }

    #[tokio::test]
    async fn test_nothing_above_remote_path_is_touched() {
        // chroot-like server: "/" is not writable and "/srv" is not visible
        let server = MemorySftp::with_dirs([ROOT]);
        server.make_read_only("/");
        let backend = backend(&server);
        let path = StoragePath::parse("user_1/2024/a.jpg").unwrap();

        backend.upload(Bytes::from_static(b"a"), &path).await.unwrap();
        assert!(server.has_dir("/srv/images/user_1/2024"));
        assert!(!server.has_dir("/srv"));
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_file() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);
        let path = StoragePath::parse("keep.png").unwrap();

        backend.upload(Bytes::from_static(b"v1"), &path).await.unwrap();
        server.fail_renames_from(".part-");
        assert!(backend
            .upload(Bytes::from_static(b"v2"), &path)
            .await
            .unwrap_err()
            .is_connectivity());

        assert_eq!(server.file("/srv/images/keep.png").unwrap(), b"v1");
        assert_eq!(server.file_paths(), vec!["/srv/images/keep.png"]);
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);

        assert_eq!(server.connect_count(), 0);
        assert!(!backend.is_connected().await);

        backend
            .exists(&StoragePath::parse("a.jpg").unwrap())
            .await
            .unwrap();
        assert_eq!(server.connect_count(), 1);
        assert!(backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_exists_upload_download_creates_dirs() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);
        let path = StoragePath::parse("user_1/2024/05/photo.jpg").unwrap();
        let data = Bytes::from_static(b"jpeg data");

        assert!(!backend.exists(&path).await.unwrap());
        backend.upload(data.clone(), &path).await.unwrap();
        assert!(backend.exists(&path).await.unwrap());
        assert_eq!(backend.download(&path).await.unwrap(), data);

        assert!(server.has_dir("/srv/images/user_1"));
        assert!(server.has_dir("/srv/images/user_1/2024/05"));
        assert_eq!(
            server.file_paths(),
            vec!["/srv/images/user_1/2024/05/photo.jpg"]
        );
        // one session reused for every call
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_upload_overwrites_existing() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);
        let path = StoragePath::parse("x.png").unwrap();

        backend.upload(Bytes::from_static(b"v1"), &path).await.unwrap();
        backend.upload(Bytes::from_static(b"v2"), &path).await.unwrap();

        assert_eq!(server.file("/srv/images/x.png").unwrap(), b"v2");
        assert_eq!(server.file_paths().len(), 1);
    }

    #[tokio::test]
    async fn test_mkdir_stops_at_unresolvable_ancestor() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        server.make_read_only(ROOT);
        let backend = backend(&server);
        let path = StoragePath::parse("user_9/img.gif").unwrap();

        let err = backend
            .upload(Bytes::from_static(b"gif"), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert!(!server.has_dir("/srv/images/user_9"));
        assert!(server.file_paths().is_empty());
    }

    #[tokio::test]
    async fn test_existing_directories_are_fine() {
        let server = MemorySftp::with_dirs(["/srv", ROOT, "/srv/images/user_1"]);
        let backend = backend(&server);
        let path = StoragePath::parse("user_1/2025/a.webp").unwrap();

        backend.upload(Bytes::from_static(b"w"), &path).await.unwrap();
        assert!(server.has_dir("/srv/images/user_1/2025"));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);
        let path = StoragePath::parse("r.jpg").unwrap();

        backend.upload(Bytes::from_static(b"r"), &path).await.unwrap();
        server.drop_sessions();
        assert_eq!(backend.download(&path).await.unwrap(), Bytes::from_static(b"r"));
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let backend = backend(&server);
        let path = StoragePath::parse("gone.jpg").unwrap();

        backend.upload(Bytes::from_static(b"g"), &path).await.unwrap();
        backend.delete(&path).await.unwrap();
        backend.delete(&path).await.unwrap();
        assert!(!backend.exists(&path).await.unwrap());
        assert!(backend.download(&path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        server.refuse_logins(true);
        let backend = backend(&server);

        let err = backend
            .exists(&StoragePath::parse("a").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert!(!backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_and_drop_release_session() {
        let server = MemorySftp::with_dirs(["/srv", ROOT]);
        let path = StoragePath::parse("c.jpg").unwrap();

        let backend = backend(&server);
        backend.exists(&path).await.unwrap();
        assert_eq!(server.open_sessions(), 1);
        backend.close().await.unwrap();
        assert_eq!(server.open_sessions(), 0);
        assert!(!backend.is_connected().await);

        let dropped = self::backend(&server);
        dropped.exists(&path).await.unwrap();
        assert_eq!(server.open_sessions(), 1);
        drop(dropped);
        // the disconnect runs on the runtime
        tokio::task::yield_now().await;
        assert_eq!(server.open_sessions(), 0);
    }

    #[test]
    fn test_url() {
        let server = MemorySftp::default();
        let path = StoragePath::parse("user_1/a.jpg").unwrap();
        assert_eq!(
            backend(&server).url(&path),
            "sftp://files.example.com/srv/images/user_1/a.jpg"
        );

        let mut creds = creds();
        creds.insert("port", "2222");
        let custom =
            SftpBackend::with_connector(&creds, &config("uploads/"), Arc::new(server)).unwrap();
        assert_eq!(
            custom.url(&path),
            "sftp://files.example.com:2222/uploads/user_1/a.jpg"
        );
    }
}
