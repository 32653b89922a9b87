//! Azure Blob Storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{services, Operator};
use tracing::debug;

use crate::backend::StorageBackend;
use crate::object_store::{build_operator, encode_key, ObjectStore};
use crate::requirements::{check_config, check_keys};
use imghost_common::{Credentials, Error, ProviderConfig, ProviderType, Result, StoragePath};

/// Azure backend.
///
/// Config: `container`, optional `endpoint`.
/// Credentials: `account_name`, `account_key`.
#[derive(Debug)]
pub struct AzureBackend {
    container: String,
    endpoint: String,
    store: ObjectStore,
}

impl AzureBackend {
    /// Build an Azure backend.
    ///
    /// # Errors
    /// - `MissingKeys` if required config or credential keys are absent
    /// - `Configuration` if the client cannot be set up
    pub fn new(credentials: &Credentials, config: &ProviderConfig) -> Result<Self> {
        check_keys(ProviderType::Azure, config, credentials)?;
        let container = container(config)?;
        let account_name = credentials
            .get("account_name")
            .ok_or_else(|| Error::missing_keys("azure", vec!["account_name".to_string()]))?;
        let account_key = credentials
            .get("account_key")
            .ok_or_else(|| Error::missing_keys("azure", vec!["account_key".to_string()]))?;
        let endpoint = endpoint(config, account_name);

        let builder = services::Azblob::default()
            .container(&container)
            .endpoint(&endpoint)
            .account_name(account_name)
            .account_key(account_key);

        let operator = build_operator(ProviderType::Azure, builder, config)?;
        debug!(container = %container, endpoint = %endpoint, "Azure backend ready");
        Ok(Self {
            container,
            endpoint,
            store: ObjectStore::new(ProviderType::Azure, operator),
        })
    }

    /// Build an Azure backend over an existing operator.
    ///
    /// `account_name` only shapes the URL when no `endpoint` is configured.
    pub fn with_operator(
        config: &ProviderConfig,
        account_name: &str,
        operator: Operator,
    ) -> Result<Self> {
        check_config(ProviderType::Azure, config)?;
        Ok(Self {
            container: container(config)?,
            endpoint: endpoint(config, account_name),
            store: ObjectStore::new(ProviderType::Azure, operator),
        })
    }
}

fn container(config: &ProviderConfig) -> Result<String> {
    config
        .get_str("container")
        .ok_or_else(|| Error::missing_keys("azure", vec!["container".to_string()]))
}

fn endpoint(config: &ProviderConfig, account_name: &str) -> String {
    config
        .get_str("endpoint")
        .map(|e| e.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account_name))
}

#[async_trait]
impl StorageBackend for AzureBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Azure
    }

    async fn upload(&self, data: Bytes, path: &StoragePath) -> Result<StoragePath> {
        self.store.write(path, data).await?;
        Ok(path.clone())
    }

    async fn download(&self, path: &StoragePath) -> Result<Bytes> {
        self.store.read(path).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.store.delete(path).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.store.exists(path).await
    }

    fn url(&self, path: &StoragePath) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, encode_key(path))
    }
}
