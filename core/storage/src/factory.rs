//! Backend factory: turns a persisted provider record into a live backend.
//!
//! This is the only place where a provider type tag selects behavior.

use std::sync::Arc;
use tracing::debug;

use crate::azure::AzureBackend;
use crate::backend::StorageBackend;
use crate::gcs::GcsBackend;
use crate::s3::S3Backend;
use crate::sftp::{RusshConnector, SftpBackend, SftpConnector};
use imghost_common::{ProviderRecord, ProviderType, Result};
use imghost_crypto::CredentialVault;

/// Something that can build a backend for a provider record.
///
/// The catalog depends on this rather than on [`BackendFactory`] so tests can
/// hand out in-memory backends.
pub trait BackendBuilder: Send + Sync {
    /// Build a backend for `provider`.
    ///
    /// # Errors
    /// - `UnsupportedProvider` for unknown type tags
    /// - `Decryption` if the sealed credentials cannot be opened
    /// - `MissingKeys` / `Configuration` if config or credentials are incomplete
    fn build(&self, provider: &ProviderRecord) -> Result<Box<dyn StorageBackend>>;
}

/// Builds real backends, decrypting credentials through the vault.
pub struct BackendFactory {
    vault: Arc<CredentialVault>,
    sftp: Arc<dyn SftpConnector>,
}

impl BackendFactory {
    /// Create a factory that opens SFTP sessions through russh.
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self {
            vault,
            sftp: Arc::new(RusshConnector),
        }
    }

    /// Replace the SFTP connector.
    pub fn with_sftp_connector(mut self, connector: Arc<dyn SftpConnector>) -> Self {
        self.sftp = connector;
        self
    }
}

impl BackendBuilder for BackendFactory {
    fn build(&self, provider: &ProviderRecord) -> Result<Box<dyn StorageBackend>> {
        let kind = provider.kind()?;
        let credentials = self.vault.decrypt(&provider.encrypted_credentials)?;
        let config = &provider.config;
        debug!(provider_id = %provider.id, kind = %kind, "Building storage backend");

        let backend: Box<dyn StorageBackend> = match kind {
            ProviderType::S3 => Box::new(S3Backend::new(&credentials, config)?),
            ProviderType::Azure => Box::new(AzureBackend::new(&credentials, config)?),
            ProviderType::Gcs => Box::new(GcsBackend::new(&credentials, config)?),
            ProviderType::Sftp => Box::new(SftpBackend::with_connector(
                &credentials,
                config,
                self.sftp.clone(),
            )?),
        };
        Ok(backend)
    }
}
