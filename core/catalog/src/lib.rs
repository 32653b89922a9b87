//! Provider registry and image catalog for imghost.
//!
//! This module provides:
//! - SQLite persistence for provider and image records
//! - The provider registry (user-scoped CRUD, one default per user)
//! - Image optimization and storage key generation
//! - The upload orchestrator that ties providers, backends and records together
//!
//! # Architecture
//! The catalog sits between the outer surface (the CLI) and the storage
//! backends. It owns every database write; backends never see the database
//! and the database never sees plaintext credentials.

pub mod db;
pub mod images;
pub mod optimize;
pub mod paths;
pub mod providers;
pub mod registry;
pub mod service;

#[cfg(test)]
mod testing;

pub use db::Database;
pub use images::{ImageRecord, ImageStats, ImageStore, NewImage};
pub use optimize::{ImageInfo, ImageOptimizer, Optimized, RasterOptimizer};
pub use paths::generate_storage_path;
pub use providers::{NewProvider, ProviderStore};
pub use registry::{
    ConnectionReport, CreateProvider, ProviderInfo, ProviderRegistry, ProviderUpdate,
    CONNECTION_TEST_PATH,
};
pub use service::{ImageService, UploadRequest};

use std::fmt;
use std::sync::Arc;

use imghost_common::{Result, Settings};
use imghost_crypto::CredentialVault;
use imghost_storage::{BackendBuilder, BackendFactory};

/// Fully wired registry and image service over one database.
pub struct Catalog {
    /// Provider management.
    pub providers: ProviderRegistry,
    /// Image upload and lifecycle.
    pub images: ImageService,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

impl Catalog {
    /// Open the database named in `settings` and wire real backends.
    ///
    /// # Errors
    /// - `Configuration` if the encryption key is missing or malformed
    /// - `Database` if the database cannot be opened
    pub fn open(settings: &Settings) -> Result<Self> {
        let vault = Arc::new(CredentialVault::from_settings(settings)?);
        let db = Database::open(&settings.database_path)?;
        let backends: Arc<dyn BackendBuilder> = Arc::new(BackendFactory::new(Arc::clone(&vault)));
        Ok(Self::with_parts(db, vault, backends, settings))
    }

    /// Wire a catalog from explicit parts.
    pub fn with_parts(
        db: Database,
        vault: Arc<CredentialVault>,
        backends: Arc<dyn BackendBuilder>,
        settings: &Settings,
    ) -> Self {
        let store = ProviderStore::new(db.clone());
        let providers = ProviderRegistry::new(store.clone(), vault, Arc::clone(&backends));
        let images = ImageService::new(
            ImageStore::new(db),
            store,
            backends,
            Arc::new(RasterOptimizer),
        )
        .with_settings(settings.upload.clone(), settings.optimize);
        Self { providers, images }
    }
}
