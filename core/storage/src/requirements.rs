//! Required configuration and credential keys per provider type.

use imghost_common::{Credentials, Error, ProviderConfig, ProviderType, Result};

/// Keys a provider type cannot be built without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRequirements {
    /// Required non-secret config keys.
    pub config: &'static [&'static str],
    /// Required credential keys.
    pub credentials: &'static [&'static str],
    /// Credential keys of which at least one must be present.
    pub any_credential: &'static [&'static str],
}

impl KeyRequirements {
    /// Requirements for a provider type.
    pub fn for_type(kind: ProviderType) -> Self {
        match kind {
            ProviderType::S3 => Self {
                config: &["bucket"],
                credentials: &["access_key_id", "secret_access_key"],
                any_credential: &[],
            },
            ProviderType::Azure => Self {
                config: &["container"],
                credentials: &["account_name", "account_key"],
                any_credential: &[],
            },
            ProviderType::Gcs => Self {
                config: &["bucket"],
                credentials: &["credentials_json"],
                any_credential: &[],
            },
            ProviderType::Sftp => Self {
                config: &["remote_path"],
                credentials: &["host", "username"],
                any_credential: &["password", "key_file"],
            },
        }
    }

    /// Config keys absent from `config`, in declaration order.
    pub fn missing_config(&self, config: &ProviderConfig) -> Vec<String> {
        self.config
            .iter()
            .filter(|key| !config.has(key))
            .map(|key| key.to_string())
            .collect()
    }

    /// Credential keys absent from `credentials`, in declaration order.
    ///
    /// An unsatisfied either-or group is reported as a single `a or b` entry.
    pub fn missing_credentials(&self, credentials: &Credentials) -> Vec<String> {
        let mut missing: Vec<String> = self
            .credentials
            .iter()
            .filter(|key| !credentials.has(key))
            .map(|key| key.to_string())
            .collect();

        if !self.any_credential.is_empty()
            && !self.any_credential.iter().any(|key| credentials.has(key))
        {
            missing.push(self.any_credential.join(" or "));
        }
        missing
    }
}

/// Validate config keys only.
///
/// # Errors
/// - `MissingKeys` listing exactly the absent config keys
pub fn check_config(kind: ProviderType, config: &ProviderConfig) -> Result<()> {
    let missing = KeyRequirements::for_type(kind).missing_config(config);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::missing_keys(kind.as_str(), missing))
    }
}

/// Validate config and credential keys together.
///
/// # Errors
/// - `MissingKeys` listing every absent key, config keys first
pub fn check_keys(
    kind: ProviderType,
    config: &ProviderConfig,
    credentials: &Credentials,
) -> Result<()> {
    let requirements = KeyRequirements::for_type(kind);
    let mut missing = requirements.missing_config(config);
    missing.extend(requirements.missing_credentials(credentials));
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::missing_keys(kind.as_str(), missing))
    }
}
