//! The credential encryption key.
//!
//! The key zeroizes its memory on drop and never prints its bytes.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use imghost_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Process-wide key used to seal provider credentials.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    key: [u8; KEY_LENGTH],
}

impl VaultKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Parse a key from its base64 text (standard or URL-safe alphabet).
    ///
    /// # Errors
    /// - `Configuration` if the text is not base64 or does not decode to KEY_LENGTH bytes
    pub fn from_base64(text: &str) -> Result<Self> {
        let text = text.trim();
        let decoded = STANDARD
            .decode(text)
            .or_else(|_| URL_SAFE.decode(text))
            .map(Zeroizing::new)
            .map_err(|_| Error::Configuration("Encryption key is not valid base64".to_string()))?;

        if decoded.len() != KEY_LENGTH {
            return Err(Error::Configuration(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                decoded.len()
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&decoded);
        Ok(Self { key })
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        Self { key }
    }

    /// Encode the key as standard base64, suitable for the settings file.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.key))
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let key = VaultKey::generate();
        let text = key.to_base64();
        let parsed = VaultKey::from_base64(&text).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_url_safe_alphabet_accepted() {
        let key = VaultKey::from_bytes([0xFB; KEY_LENGTH]);
        let text = URL_SAFE.encode(key.as_bytes());
        assert!(text.contains('-') || text.contains('_'));
        assert_eq!(VaultKey::from_base64(&text).unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = VaultKey::from_base64(&STANDARD.encode([1u8; 16])).unwrap_err();
        assert!(err.is_configuration());
        assert!(VaultKey::from_base64("not base64!").unwrap_err().is_configuration());
    }

    #[test]
    fn test_generate_differs() {
        assert_ne!(VaultKey::generate().as_bytes(), VaultKey::generate().as_bytes());
    }

    #[test]
    fn test_debug_redacted() {
        let key = VaultKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "VaultKey([REDACTED])");
    }
}
