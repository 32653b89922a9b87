//! Provider registry: user-scoped CRUD over storage providers.
//!
//! Credentials only enter through [`ProviderRegistry::create`] and
//! [`ProviderRegistry::update`], where they are sealed immediately. Nothing
//! returned from here carries credentials.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::providers::{NewProvider, ProviderStore};
use imghost_common::{
    Credentials, Error, ProviderConfig, ProviderId, ProviderRecord, ProviderType, Result,
    StoragePath, UserId,
};
use imghost_crypto::CredentialVault;
use imghost_storage::{check_config, BackendBuilder, KeyRequirements};

/// Key looked up by [`ProviderRegistry::test_connection`].
pub const CONNECTION_TEST_PATH: &str = "_connection_test_";

/// A provider as shown to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    /// Record id.
    pub id: ProviderId,
    /// Display name, unique per user.
    pub name: String,
    /// Type tag (`s3`, `azure`, `gcs`, `sftp`).
    pub provider_type: String,
    /// Human-readable type label.
    pub provider_type_display: String,
    /// Whether uploads without an explicit provider go here.
    pub is_default: bool,
    /// Whether the provider accepts uploads.
    pub is_active: bool,
    /// Non-secret configuration.
    pub config: ProviderConfig,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl From<&ProviderRecord> for ProviderInfo {
    fn from(record: &ProviderRecord) -> Self {
        let display = record
            .kind()
            .map(|k| k.display_name().to_string())
            .unwrap_or_else(|_| record.provider_type.clone());
        Self {
            id: record.id,
            name: record.name.clone(),
            provider_type: record.provider_type.clone(),
            provider_type_display: display,
            is_default: record.is_default,
            is_active: record.is_active,
            config: record.config.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Input for [`ProviderRegistry::create`].
#[derive(Debug, Clone)]
pub struct CreateProvider {
    /// Display name, unique per user.
    pub name: String,
    /// Type tag; unknown tags are rejected.
    pub provider_type: String,
    /// Non-secret configuration; required keys are checked.
    pub config: ProviderConfig,
    /// Raw credentials; `None` stores an empty credential set.
    pub credentials: Option<Credentials>,
    /// Make this the user's only default provider.
    pub is_default: bool,
    /// Accept uploads right away.
    pub is_active: bool,
}

/// Partial changes for [`ProviderRegistry::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    /// New display name.
    pub name: Option<String>,
    /// Replacement configuration.
    pub config: Option<ProviderConfig>,
    /// Replacement credentials, sealed before storage.
    pub credentials: Option<Credentials>,
    /// Set or clear the default flag.
    pub is_default: Option<bool>,
    /// Activate or deactivate.
    pub is_active: Option<bool>,
}

/// Outcome of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    /// Whether the store answered the lookup.
    pub success: bool,
    /// Outcome description, including the failure cause.
    pub message: String,
}

impl ConnectionReport {
    fn ok() -> Self {
        Self {
            success: true,
            message: "Connection successful".to_string(),
        }
    }

    fn failed(err: &Error) -> Self {
        Self {
            success: false,
            message: format!("Connection failed: {}", err),
        }
    }
}

/// User-scoped provider management.
pub struct ProviderRegistry {
    store: ProviderStore,
    vault: Arc<CredentialVault>,
    backends: Arc<dyn BackendBuilder>,
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("Provider name cannot be empty".to_string()));
    }
    Ok(name.to_string())
}

fn validate_credentials(kind: ProviderType, credentials: &Credentials) -> Result<()> {
    let missing = KeyRequirements::for_type(kind).missing_credentials(credentials);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::missing_keys(kind.as_str(), missing))
    }
}

impl ProviderRegistry {
    /// Create a registry.
    pub fn new(
        store: ProviderStore,
        vault: Arc<CredentialVault>,
        backends: Arc<dyn BackendBuilder>,
    ) -> Self {
        Self {
            store,
            vault,
            backends,
        }
    }

    /// Register a provider for `user_id`.
    ///
    /// # Errors
    /// - `UnsupportedProvider` for unknown type tags
    /// - `MissingKeys` if required config keys, or keys of supplied credentials, are absent
    /// - `AlreadyExists` if the user already has a provider with this name
    pub fn create(&self, user_id: UserId, request: CreateProvider) -> Result<ProviderInfo> {
        let kind: ProviderType = request.provider_type.parse()?;
        let name = validate_name(&request.name)?;
        check_config(kind, &request.config)?;

        let credentials = request.credentials.unwrap_or_default();
        if !credentials.is_empty() {
            validate_credentials(kind, &credentials)?;
        }
        let sealed = self.vault.encrypt(&credentials)?;

        let record = self.store.insert(NewProvider {
            user_id,
            name,
            provider_type: kind.as_str().to_string(),
            is_default: request.is_default,
            is_active: request.is_active,
            config: request.config,
            encrypted_credentials: sealed,
        })?;
        info!(user = %user_id, provider = %record.id, kind = %kind, "Storage provider created");
        Ok(ProviderInfo::from(&record))
    }

    /// The user's providers, default first.
    pub fn list(&self, user_id: UserId) -> Result<Vec<ProviderInfo>> {
        Ok(self
            .store
            .list(user_id)?
            .iter()
            .map(ProviderInfo::from)
            .collect())
    }

    /// One of the user's providers.
    pub fn get(&self, user_id: UserId, id: ProviderId) -> Result<ProviderInfo> {
        Ok(ProviderInfo::from(&self.store.get(user_id, id)?))
    }

    /// Apply partial changes.
    ///
    /// New credentials replace the stored ones entirely and are sealed before
    /// anything is written.
    pub fn update(
        &self,
        user_id: UserId,
        id: ProviderId,
        changes: ProviderUpdate,
    ) -> Result<ProviderInfo> {
        let mut record = self.store.get(user_id, id)?;
        let kind = record.kind()?;

        if let Some(name) = changes.name {
            record.name = validate_name(&name)?;
        }
        if let Some(config) = changes.config {
            check_config(kind, &config)?;
            record.config = config;
        }
        if let Some(credentials) = changes.credentials {
            validate_credentials(kind, &credentials)?;
            record.encrypted_credentials = self.vault.encrypt(&credentials)?;
        }
        if let Some(is_default) = changes.is_default {
            record.is_default = is_default;
        }
        if let Some(is_active) = changes.is_active {
            record.is_active = is_active;
        }

        let updated = self.store.update(&record)?;
        info!(user = %user_id, provider = %id, "Storage provider updated");
        Ok(ProviderInfo::from(&updated))
    }

    /// Delete a provider.
    ///
    /// # Errors
    /// - `Protected` while images still reference it
    pub fn delete(&self, user_id: UserId, id: ProviderId) -> Result<()> {
        self.store.delete(user_id, id)?;
        info!(user = %user_id, provider = %id, "Storage provider deleted");
        Ok(())
    }

    /// Make `id` the user's only default provider.
    pub fn set_default(&self, user_id: UserId, id: ProviderId) -> Result<ProviderInfo> {
        let record = self.store.set_default(user_id, id)?;
        info!(user = %user_id, provider = %id, "Default storage provider changed");
        Ok(ProviderInfo::from(&record))
    }

    /// Build the provider's backend and look up a fixed key.
    ///
    /// Backend failures (including build failures) are reported in the
    /// returned [`ConnectionReport`].
    ///
    /// # Errors
    /// - `NotFound` if the provider does not exist or belongs to someone else
    pub async fn test_connection(
        &self,
        user_id: UserId,
        id: ProviderId,
    ) -> Result<ConnectionReport> {
        let record = self.store.get(user_id, id)?;
        let backend = match self.backends.build(&record) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(provider = %id, error = %e, "Connection test could not build backend");
                return Ok(ConnectionReport::failed(&e));
            }
        };

        let key = StoragePath::parse(CONNECTION_TEST_PATH)?;
        let outcome = backend.exists(&key).await;
        if let Err(e) = backend.close().await {
            warn!(provider = %id, error = %e, "Failed to close backend after connection test");
        }

        Ok(match outcome {
            Ok(_) => ConnectionReport::ok(),
            Err(e) => {
                warn!(provider = %id, error = %e, "Connection test failed");
                ConnectionReport::failed(&e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::{creds, test_vault, StaticBackends};
    use imghost_common::SealedCredentials;

    fn registry() -> (ProviderRegistry, StaticBackends) {
        let backends = StaticBackends::default();
        let registry = ProviderRegistry::new(
            ProviderStore::new(Database::in_memory().unwrap()),
            test_vault(),
            Arc::new(backends.clone()),
        );
        (registry, backends)
    }

    fn s3_request(name: &str, is_default: bool) -> CreateProvider {
        CreateProvider {
            name: name.to_string(),
            provider_type: "s3".to_string(),
            config: [("bucket", "b"), ("region", "us-east-1")].into_iter().collect(),
            credentials: Some(creds(&[("access_key_id", "AKIA"), ("secret_access_key", "s")])),
            is_default,
            is_active: true,
        }
    }

    #[test]
    fn test_create_seals_credentials() {
        let (registry, _) = registry();
        let info = registry.create(UserId(1), s3_request("main", true)).unwrap();
        assert_eq!(info.provider_type_display, "AWS S3");
        assert!(info.is_default);

        let record = registry.store.get(UserId(1), info.id).unwrap();
        assert_ne!(record.encrypted_credentials, SealedCredentials::from_bytes(Vec::new()));
        let opened = registry.vault.decrypt(&record.encrypted_credentials).unwrap();
        assert_eq!(opened.get("access_key_id"), Some("AKIA"));

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("AKIA"));
        assert!(!json.contains("secret_access_key"));
    }

    #[test]
    fn test_create_validation() {
        let (registry, _) = registry();

        let mut bad_type = s3_request("x", false);
        bad_type.provider_type = "dropbox".to_string();
        assert!(matches!(
            registry.create(UserId(1), bad_type),
            Err(Error::UnsupportedProvider(_))
        ));

        let mut no_bucket = s3_request("x", false);
        no_bucket.config = ProviderConfig::new();
        assert!(registry.create(UserId(1), no_bucket).unwrap_err().is_configuration());

        let mut half_creds = s3_request("x", false);
        half_creds.credentials = Some(creds(&[("access_key_id", "AKIA")]));
        match registry.create(UserId(1), half_creds) {
            Err(Error::MissingKeys { keys, .. }) => assert_eq!(keys, vec!["secret_access_key"]),
            other => panic!("unexpected: {:?}", other),
        }

        let mut blank = s3_request("  ", false);
        blank.credentials = None;
        assert!(matches!(
            registry.create(UserId(1), blank),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_default_moves() {
        let (registry, _) = registry();
        let a = registry.create(UserId(1), s3_request("a", true)).unwrap();
        let b = registry.create(UserId(1), s3_request("b", false)).unwrap();

        registry.set_default(UserId(1), b.id).unwrap();
        let list = registry.list(UserId(1)).unwrap();
        assert_eq!(list[0].id, b.id);
        assert_eq!(list.iter().filter(|p| p.is_default).count(), 1);

        registry
            .update(
                UserId(1),
                a.id,
                ProviderUpdate {
                    is_default: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        let defaults: Vec<ProviderId> = registry
            .list(UserId(1))
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .map(|p| p.id)
            .collect();
        assert_eq!(defaults, vec![a.id]);
    }

    #[test]
    fn test_update_reseals_credentials() {
        let (registry, _) = registry();
        let info = registry.create(UserId(1), s3_request("main", false)).unwrap();
        let before = registry.store.get(UserId(1), info.id).unwrap().encrypted_credentials;

        registry
            .update(
                UserId(1),
                info.id,
                ProviderUpdate {
                    credentials: Some(creds(&[("access_key_id", "NEW"), ("secret_access_key", "t")])),
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let record = registry.store.get(UserId(1), info.id).unwrap();
        assert_ne!(record.encrypted_credentials, before);
        assert_eq!(record.name, "renamed");
        let opened = registry.vault.decrypt(&record.encrypted_credentials).unwrap();
        assert_eq!(opened.get("access_key_id"), Some("NEW"));
    }

    #[test]
    fn test_scoped_to_owner() {
        let (registry, _) = registry();
        let info = registry.create(UserId(1), s3_request("main", true)).unwrap();

        assert!(registry.get(UserId(2), info.id).unwrap_err().is_not_found());
        assert!(registry.list(UserId(2)).unwrap().is_empty());
        assert!(registry
            .update(UserId(2), info.id, ProviderUpdate::default())
            .unwrap_err()
            .is_not_found());
        assert!(registry.delete(UserId(2), info.id).unwrap_err().is_not_found());
        registry.delete(UserId(1), info.id).unwrap();
    }

    #[tokio::test]
    async fn test_connection_success_and_failure() {
        let (registry, backends) = registry();
        let info = registry.create(UserId(1), s3_request("main", true)).unwrap();

        let report = registry.test_connection(UserId(1), info.id).await.unwrap();
        assert!(report.success, "{}", report.message);
        assert_eq!(backends.backend().close_count(), 1);

        backends.backend().fail_exists(true);
        let report = registry.test_connection(UserId(1), info.id).await.unwrap();
        assert!(!report.success);
        assert!(report.message.contains("injected exists failure"));
        assert_eq!(backends.backend().close_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_build_failure_is_reported() {
        let (registry, backends) = registry();
        let info = registry.create(UserId(1), s3_request("main", true)).unwrap();
        backends.fail_builds(true);

        let report = registry.test_connection(UserId(1), info.id).await.unwrap();
        assert!(!report.success);

        assert!(registry
            .test_connection(UserId(1), ProviderId(999))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
