//! Shared fixtures for catalog tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use imghost_common::{Credentials, Error, ProviderRecord, ProviderType, Result};
use imghost_crypto::{CredentialVault, VaultKey};
use imghost_storage::{BackendBuilder, MemoryBackend, StorageBackend};

pub(crate) fn test_vault() -> Arc<CredentialVault> {
    Arc::new(CredentialVault::new(VaultKey::generate()))
}

pub(crate) fn creds(pairs: &[(&str, &str)]) -> Credentials {
    pairs.iter().copied().collect()
}

/// Hands out clones of one shared [`MemoryBackend`] for every provider.
#[derive(Clone)]
pub(crate) struct StaticBackends {
    backend: MemoryBackend,
    fail: Arc<AtomicBool>,
}

impl Default for StaticBackends {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::new(ProviderType::S3),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl StaticBackends {
    pub(crate) fn backend(&self) -> MemoryBackend {
        self.backend.clone()
    }

    pub(crate) fn fail_builds(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl BackendBuilder for StaticBackends {
    fn build(&self, _provider: &ProviderRecord) -> Result<Box<dyn StorageBackend>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Decryption("injected build failure".to_string()));
        }
        Ok(Box::new(self.backend.clone()))
    }
}
