//! Google Cloud Storage backend.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use opendal::{services, Operator};
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

use crate::backend::StorageBackend;
use crate::object_store::{build_operator, encode_key, ObjectStore};
use crate::requirements::{check_config, check_keys};
use imghost_common::{Credentials, Error, ProviderConfig, ProviderType, Result, StoragePath};

/// Service-account fields the credential document must carry.
const SERVICE_ACCOUNT_FIELDS: [&str; 2] = ["client_email", "private_key"];

/// GCS backend.
///
/// Config: `bucket`.
/// Credentials: `credentials_json` (a service-account key document).
#[derive(Debug)]
pub struct GcsBackend {
    bucket: String,
    store: ObjectStore,
}

impl GcsBackend {
    /// Build a GCS backend.
    ///
    /// # Errors
    /// - `MissingKeys` if required config or credential keys are absent
    /// - `Configuration` if `credentials_json` is not a service-account document
    pub fn new(credentials: &Credentials, config: &ProviderConfig) -> Result<Self> {
        check_keys(ProviderType::Gcs, config, credentials)?;
        let bucket = bucket(config)?;
        let document = credentials
            .get("credentials_json")
            .ok_or_else(|| Error::missing_keys("gcs", vec!["credentials_json".to_string()]))?;
        validate_service_account(document)?;

        let encoded = Zeroizing::new(STANDARD.encode(document));
        let builder = services::Gcs::default()
            .bucket(&bucket)
            .credential(&encoded);

        let operator = build_operator(ProviderType::Gcs, builder, config)?;
        debug!(bucket = %bucket, "GCS backend ready");
        Ok(Self {
            bucket,
            store: ObjectStore::new(ProviderType::Gcs, operator),
        })
    }

    /// Build a GCS backend over an existing operator.
    pub fn with_operator(config: &ProviderConfig, operator: Operator) -> Result<Self> {
        check_config(ProviderType::Gcs, config)?;
        Ok(Self {
            bucket: bucket(config)?,
            store: ObjectStore::new(ProviderType::Gcs, operator),
        })
    }
}

fn bucket(config: &ProviderConfig) -> Result<String> {
    config
        .get_str("bucket")
        .ok_or_else(|| Error::missing_keys("gcs", vec!["bucket".to_string()]))
}

/// Parse the credential document and check it names a service account.
fn validate_service_account(document: &str) -> Result<()> {
    let parsed: Value = serde_json::from_str(document)
        .map_err(|_| Error::Configuration("credentials_json is not valid JSON".to_string()))?;
    let Value::Object(fields) = parsed else {
        return Err(Error::Configuration(
            "credentials_json must be a JSON object".to_string(),
        ));
    };

    let missing: Vec<&str> = SERVICE_ACCOUNT_FIELDS
        .iter()
        .copied()
        .filter(|f| !matches!(fields.get(*f), Some(Value::String(s)) if !s.is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Configuration(format!(
            "credentials_json is missing {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for GcsBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gcs
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
        format!(
            "https://storage.googleapis.com/{}/{}",
            self.bucket,
            encode_key(path)
        )
    }
}
