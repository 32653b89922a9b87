//! In-memory SFTP server for testing.
//!
//! Mimics the SFTPv3 behaviors the backend has to cope with: `mkdir` fails on
//! existing directories, writes need an existing parent, and `rename` refuses
//! to replace an existing file.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::transport::{RemoteKind, SftpChannel, SftpConnector, SftpTarget};
use imghost_common::{Error, Result};

#[derive(Default)]
struct RemoteFs {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    read_only: HashSet<String>,
}

impl RemoteFs {
    fn kind(&self, path: &str) -> Option<RemoteKind> {
        if self.dirs.contains(path) {
            Some(RemoteKind::Directory)
        } else if self.files.contains_key(path) {
            Some(RemoteKind::File)
        } else {
            None
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            None | Some(("", _)) => true,
            Some((parent, _)) => self.dirs.contains(parent),
        }
    }

    fn parent_writable(&self, path: &str) -> bool {
        let parent = match path.rsplit_once('/') {
            None => "",
            Some(("", _)) => "/",
            Some((parent, _)) => parent,
        };
        !self.read_only.contains(parent)
    }
}

/// Shared in-memory SFTP server; every connection sees the same files.
#[derive(Clone, Default)]
pub struct MemorySftp {
    fs: Arc<Mutex<RemoteFs>>,
    connects: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    refuse_logins: Arc<AtomicBool>,
    failing_renames: Arc<Mutex<Option<String>>>,
}

impl MemorySftp {
    /// Create a server with the given directories already present.
    pub fn with_dirs<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let server = Self::default();
        {
            let mut fs = server.fs();
            fs.dirs.insert("/".to_string());
            fs.dirs.extend(dirs.into_iter().map(Into::into));
        }
        server
    }

    fn fs(&self) -> MutexGuard<'_, RemoteFs> {
        self.fs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `mkdir` and file creation fail with permission denied inside `dir`.
    pub fn make_read_only(&self, dir: impl Into<String>) {
        self.fs().read_only.insert(dir.into());
    }

    /// Reject all subsequent logins.
    pub fn refuse_logins(&self, refuse: bool) {
        self.refuse_logins.store(refuse, Ordering::SeqCst);
    }

    /// Make renames fail whose source path contains `pattern`.
    pub fn fail_renames_from(&self, pattern: impl Into<String>) {
        *self
            .failing_renames
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pattern.into());
    }

    /// Simulate the server dropping every open session.
    pub fn drop_sessions(&self) {
        for open in self.sessions.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// Total successful connections so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions that are currently open.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }

    /// Contents of a remote file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs().files.get(path).cloned()
    }

    /// Whether a remote directory exists.
    pub fn has_dir(&self, path: &str) -> bool {
        self.fs().dirs.contains(path)
    }

    /// All remote file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.fs().files.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl SftpConnector for MemorySftp {
    async fn connect(&self, target: &SftpTarget) -> Result<Box<dyn SftpChannel>> {
        if self.refuse_logins.load(Ordering::SeqCst) {
            return Err(Error::auth(
                "sftp",
                format!("Authentication rejected for {}", target.username),
            ));
        }
        let open = Arc::new(AtomicBool::new(true));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(open.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            server: self.clone(),
            open,
        }))
    }
}

struct MemoryChannel {
    server: MemorySftp,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn live(&self) -> Result<MutexGuard<'_, RemoteFs>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::connectivity("sftp", "connection lost"));
        }
        Ok(self.server.fs())
    }
}

fn denied(path: &str) -> Error {
    Error::auth("sftp", format!("Permission denied: {}", path))
}

fn no_such_file(path: &str) -> Error {
    Error::NotFound(format!("SFTP path not found: {}", path))
}

#[async_trait]
impl SftpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>> {
        Ok(self.live()?.kind(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut fs = self.live()?;
        if fs.kind(path).is_some() {
            return Err(Error::connectivity("sftp", format!("Failure: {}", path)));
        }
        if !fs.parent_exists(path) {
            return Err(no_such_file(path));
        }
        if !fs.parent_writable(path) {
            return Err(denied(path));
        }
        fs.dirs.insert(path.to_string());
        Ok(())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut fs = self.live()?;
        if !fs.parent_exists(path) {
            return Err(no_such_file(path));
        }
        if !fs.parent_writable(path) {
            return Err(denied(path));
        }
        fs.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.live()?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| no_such_file(path))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.live()?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| no_such_file(path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let failing = self
            .server
            .failing_renames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if failing.is_some_and(|pattern| from.contains(&pattern)) {
            return Err(Error::connectivity("sftp", format!("Failure: rename {}", from)));
        }
        let mut fs = self.live()?;
        if fs.kind(to).is_some() {
            return Err(Error::connectivity("sftp", format!("Failure: {} exists", to)));
        }
        let data = fs.files.remove(from).ok_or_else(|| no_such_file(from))?;
        fs.files.insert(to.to_string(), data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
