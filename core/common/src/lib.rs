//! Common utilities and types shared across imghost crates.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, identifiers, storage paths, secret containers, provider
//! records, and process settings.

pub mod error;
pub mod provider;
pub mod secrets;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use provider::{ProviderRecord, ProviderType};
pub use secrets::{Credentials, ProviderConfig, SealedCredentials};
pub use settings::{OptimizeSettings, Settings, UploadSettings};
pub use types::{ImageId, ProviderId, StoragePath, UserId};
