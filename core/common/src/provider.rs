//! Storage provider kinds and the persisted provider record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::secrets::{ProviderConfig, SealedCredentials};
use crate::types::{ProviderId, UserId};
use crate::Error;

/// The closed set of supported storage provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Amazon S3 (or S3-compatible) object storage.
    S3,
    /// Azure Blob Storage.
    Azure,
    /// Google Cloud Storage.
    Gcs,
    /// Remote directory over SFTP.
    Sftp,
}

impl ProviderType {
    /// Every supported provider type.
    pub const ALL: [ProviderType; 4] = [Self::S3, Self::Azure, Self::Gcs, Self::Sftp];

    /// The persisted type tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Azure => "azure",
            Self::Gcs => "gcs",
            Self::Sftp => "sftp",
        }
    }

    /// Human-readable label.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::S3 => "AWS S3",
            Self::Azure => "Azure Blob Storage",
            Self::Gcs => "Google Cloud Storage",
            Self::Sftp => "SFTP",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            "gcs" => Ok(Self::Gcs),
            "sftp" => Ok(Self::Sftp),
            other => Err(Error::UnsupportedProvider(other.to_string())),
        }
    }
}

/// A storage provider as persisted.
///
/// `provider_type` is kept as the stored string; it is only interpreted when a
/// backend is built, so rows written by other versions surface as
/// `UnsupportedProvider` at that point instead of failing to load.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    /// Row id.
    pub id: ProviderId,
    /// Owning user.
    pub user_id: UserId,
    /// Friendly name, unique per owner.
    pub name: String,
    /// Provider type tag (`s3`, `azure`, `gcs`, `sftp`).
    pub provider_type: String,
    /// Whether this is the owner's default provider.
    pub is_default: bool,
    /// Whether the provider may be used for new uploads.
    pub is_active: bool,
    /// Non-secret configuration.
    pub config: ProviderConfig,
    /// Credentials sealed by the vault.
    pub encrypted_credentials: SealedCredentials,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ProviderRecord {
    /// Parse the stored type tag.
    ///
    /// # Errors
    /// - `UnsupportedProvider` for unknown tags
    pub fn kind(&self) -> crate::Result<ProviderType> {
        self.provider_type.parse()
    }
}
