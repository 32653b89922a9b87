//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::StorageBackend;
use imghost_common::{Error, ProviderType, Result, StoragePath};

#[derive(Default)]
struct Faults {
    upload: AtomicBool,
    download: AtomicBool,
    delete: AtomicBool,
    exists: AtomicBool,
}

/// In-memory storage backend.
///
/// Clones share the same objects, so a test can keep a handle while the code
/// under test builds and drops its own. Individual operations can be made to
/// fail with a connectivity error.
#[derive(Clone)]
pub struct MemoryBackend {
    kind: ProviderType,
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
    faults: Arc<Faults>,
    closes: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create an empty backend that reports itself as `kind`.
    pub fn new(kind: ProviderType) -> Self {
        Self {
            kind,
            objects: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make uploads fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.faults.upload.store(fail, Ordering::SeqCst);
    }

    /// Make downloads fail.
    pub fn fail_downloads(&self, fail: bool) {
        self.faults.download.store(fail, Ordering::SeqCst);
    }

    /// Make deletes fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.faults.delete.store(fail, Ordering::SeqCst);
    }

    /// Make existence checks fail.
    pub fn fail_exists(&self, fail: bool) {
        self.faults.exists.store(fail, Ordering::SeqCst);
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether an object is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// How many times `close` was called across all clones.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::connectivity(
                self.kind.as_str(),
                format!("injected {} failure", op),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn provider_type(&self) -> ProviderType {
        self.kind
    }

    async fn upload(&self, data: Bytes, path: &StoragePath) -> Result<StoragePath> {
        self.check(&self.faults.upload, "upload")?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.as_key(), data);
        Ok(path.clone())
    }

    async fn download(&self, path: &StoragePath) -> Result<Bytes> {
        self.check(&self.faults.download, "download")?;
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path.as_key())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", path)))
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.check(&self.faults.delete, "delete")?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path.as_key());
        Ok(())
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.check(&self.faults.exists, "exists")?;
        Ok(self.contains(&path.as_key()))
    }

    fn url(&self, path: &StoragePath) -> String {
        format!("memory://{}/{}", self.kind, path)
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
