//! Process settings.
//!
//! Settings are read once at startup from an optional JSON file and then
//! overridden from the environment. The credential encryption key is carried
//! here as its base64 text and handed to the vault at construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Environment variable holding the base64 credential encryption key.
pub const ENCRYPTION_KEY_ENV: &str = "STORAGE_ENCRYPTION_KEY";

/// Environment variable overriding the database location.
pub const DATABASE_ENV: &str = "IMGHOST_DATABASE";

/// Upload acceptance limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Maximum accepted upload size in bytes.
    pub max_file_size: u64,
    /// Accepted content types.
    pub allowed_content_types: Vec<String>,
}

impl UploadSettings {
    /// Default max file size: 50MB.
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

    /// Check if a content type is accepted.
    pub fn is_content_type_allowed(&self, content_type: &str) -> bool {
        self.allowed_content_types.iter().any(|t| t == content_type)
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size: Self::DEFAULT_MAX_FILE_SIZE,
            allowed_content_types: ["image/jpeg", "image/jpg", "image/png", "image/gif", "image/webp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Parameters for the image optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeSettings {
    /// JPEG quality (1-100).
    pub quality: u8,
    /// Maximum output width in pixels.
    pub max_width: u32,
    /// Maximum output height in pixels.
    pub max_height: u32,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            quality: 85,
            max_width: 2048,
            max_height: 2048,
        }
    }
}

/// Process-wide settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base64-encoded 32-byte credential encryption key.
    pub encryption_key: Option<String>,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Upload limits.
    pub upload: UploadSettings,
    /// Optimizer parameters.
    pub optimize: OptimizeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            encryption_key: None,
            database_path: default_database_path(),
            upload: UploadSettings::default(),
            optimize: OptimizeSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional JSON file, then apply environment overrides.
    ///
    /// # Errors
    /// - The file exists but cannot be read
    /// - The file is not valid settings JSON
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Read settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Deserialize settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid settings: {}", e)))
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENCRYPTION_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.encryption_key = Some(key);
        }
        if let Some(db) = lookup(DATABASE_ENV).filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(db);
        }
    }

    /// Get the configured encryption key text.
    ///
    /// # Errors
    /// - `Configuration` if no key is configured
    pub fn require_encryption_key(&self) -> Result<&str> {
        self.encryption_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{} is not configured; credential operations are unavailable",
                    ENCRYPTION_KEY_ENV
                ))
            })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_path", &self.database_path)
            .field("upload", &self.upload)
            .field("optimize", &self.optimize)
            .finish()
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imghost")
        .join("imghost.db")
}
