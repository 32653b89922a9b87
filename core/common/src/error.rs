//! Common error types for imghost.

use thiserror::Error;

/// Top-level error type for imghost operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration (including the encryption key).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Required provider config or credential keys are absent.
    ///
    /// This is a configuration error; `keys` lists exactly the missing keys,
    /// config keys first, in declaration order.
    #[error("Configuration error: missing required keys for {provider}: {}", keys.join(", "))]
    MissingKeys {
        /// Provider type the keys were required for.
        provider: String,
        /// The keys that were absent.
        keys: Vec<String>,
    },

    /// Sealed credentials could not be opened (tampered, corrupt, or wrong key).
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Sealing credentials failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or service failure against a storage provider.
    #[error("Connectivity error ({provider}): {message}")]
    Connectivity {
        /// Provider type that failed.
        provider: String,
        /// Underlying failure description.
        message: String,
    },

    /// The storage provider rejected the supplied credentials.
    #[error("Authentication error ({provider}): {message}")]
    Auth {
        /// Provider type that failed.
        provider: String,
        /// Underlying failure description.
        message: String,
    },

    /// Provider type string has no backend.
    #[error("Unsupported storage provider: {0}")]
    UnsupportedProvider(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Resource is still referenced and cannot be removed.
    #[error("Protected: {0}")]
    Protected(String),

    /// Persistence layer failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connectivity error for a provider.
    pub fn connectivity(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error for a provider.
    pub fn auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a missing-keys configuration error.
    pub fn missing_keys(provider: impl Into<String>, keys: Vec<String>) -> Self {
        Self::MissingKeys {
            provider: provider.into(),
            keys,
        }
    }

    /// Whether this is a configuration error of either shape.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::MissingKeys { .. })
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this is a connectivity or authentication failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Auth { .. })
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_message_lists_keys() {
        let err = Error::missing_keys(
            "s3",
            vec!["access_key_id".to_string(), "secret_access_key".to_string()],
        );
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing required keys for s3: access_key_id, secret_access_key"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::auth("azure", "forbidden").is_connectivity());
        assert!(Error::connectivity("gcs", "reset").is_connectivity());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Decryption("bad".into()).is_configuration());
    }
}
