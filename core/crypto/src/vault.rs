//! Credential vault: seals provider credential maps at rest.

use tracing::debug;
use zeroize::Zeroizing;

use crate::aead::{open, seal};
use crate::keys::VaultKey;
use imghost_common::{Credentials, Error, Result, SealedCredentials, Settings};

/// Associated data binding sealed blobs to their purpose.
const CREDENTIALS_CONTEXT: &[u8] = b"imghost.provider-credentials";

/// Seals and opens provider credentials with the process-wide key.
///
/// The key is injected at construction; the vault never reads settings or
/// the environment on its own.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    key: VaultKey,
}

impl CredentialVault {
    /// Create a vault around an explicit key.
    pub fn new(key: VaultKey) -> Self {
        Self { key }
    }

    /// Create a vault from process settings.
    ///
    /// # Errors
    /// - `Configuration` if no key is configured or the key is malformed
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let text = settings.require_encryption_key()?;
        Ok(Self::new(VaultKey::from_base64(text)?))
    }

    /// Seal a credential map.
    ///
    /// The map is serialized canonically (keys in sorted order) before sealing.
    ///
    /// # Errors
    /// - `Crypto` if serialization or encryption fails
    pub fn encrypt(&self, credentials: &Credentials) -> Result<SealedCredentials> {
        let plaintext = serde_json::to_vec(credentials)
            .map(Zeroizing::new)
            .map_err(|e| Error::Crypto(format!("Failed to encode credentials: {}", e)))?;
        let sealed = seal(&self.key, &plaintext, CREDENTIALS_CONTEXT)?;
        debug!(keys = credentials.len(), "Sealed provider credentials");
        Ok(SealedCredentials::from_bytes(sealed))
    }

    /// Open sealed credentials.
    ///
    /// # Errors
    /// - `Decryption` for tampered, truncated, foreign-key or malformed blobs;
    ///   no partial map is ever returned
    pub fn decrypt(&self, sealed: &SealedCredentials) -> Result<Credentials> {
        let plaintext = open(&self.key, sealed.as_bytes(), CREDENTIALS_CONTEXT)?;
        serde_json::from_slice(&plaintext)
            .map_err(|_| Error::Decryption("Sealed credentials are malformed".to_string()))
    }
}
