//! Amazon S3 (and S3-compatible) backend.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{services, Operator};
use tracing::debug;

use crate::backend::StorageBackend;
use crate::object_store::{build_operator, encode_key, ObjectStore};
use crate::requirements::{check_config, check_keys};
use imghost_common::{Credentials, Error, ProviderConfig, ProviderType, Result, StoragePath};

/// Region used when the config names none.
pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 backend.
///
/// Config: `bucket`, optional `region` and `endpoint`.
/// Credentials: `access_key_id`, `secret_access_key`.
#[derive(Debug)]
pub struct S3Backend {
    bucket: String,
    region: String,
    endpoint: Option<String>,
    store: ObjectStore,
}

impl S3Backend {
    /// Build an S3 backend.
    ///
    /// # Errors
    /// - `MissingKeys` if required config or credential keys are absent
    /// - `Configuration` if the client cannot be set up
    pub fn new(credentials: &Credentials, config: &ProviderConfig) -> Result<Self> {
        check_keys(ProviderType::S3, config, credentials)?;
        let (bucket, region, endpoint) = Self::read_config(config)?;
        let access_key_id = credentials
            .get("access_key_id")
            .ok_or_else(|| Error::missing_keys("s3", vec!["access_key_id".to_string()]))?;
        let secret_access_key = credentials
            .get("secret_access_key")
            .ok_or_else(|| Error::missing_keys("s3", vec!["secret_access_key".to_string()]))?;

        let mut builder = services::S3::default()
            .bucket(&bucket)
            .region(&region)
            .access_key_id(access_key_id)
            .secret_access_key(secret_access_key);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint(endpoint);
        }

        let operator = build_operator(ProviderType::S3, builder, config)?;
        debug!(bucket = %bucket, region = %region, "S3 backend ready");
        Ok(Self::from_parts(bucket, region, endpoint, operator))
    }

    /// Build an S3 backend over an existing operator.
    ///
    /// Only config keys are validated; the operator carries its own access.
    pub fn with_operator(config: &ProviderConfig, operator: Operator) -> Result<Self> {
        check_config(ProviderType::S3, config)?;
        let (bucket, region, endpoint) = Self::read_config(config)?;
        Ok(Self::from_parts(bucket, region, endpoint, operator))
    }

    fn read_config(config: &ProviderConfig) -> Result<(String, String, Option<String>)> {
        let bucket = config
            .get_str("bucket")
            .ok_or_else(|| Error::missing_keys("s3", vec!["bucket".to_string()]))?;
        let region = config
            .get_str("region")
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = config
            .get_str("endpoint")
            .map(|e| e.trim_end_matches('/').to_string());
        Ok((bucket, region, endpoint))
    }

    fn from_parts(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        operator: Operator,
    ) -> Self {
        Self {
            bucket,
            region,
            endpoint,
            store: ObjectStore::new(ProviderType::S3, operator),
        }
    }

    /// Configured bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Effective region.
    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::S3
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
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint, self.bucket, encode_key(path)),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket,
                self.region,
                encode_key(path)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ProviderConfig {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn memory_backend(cfg: &ProviderConfig) -> S3Backend {
        let operator = Operator::new(services::Memory::default()).unwrap().finish();
        S3Backend::with_operator(cfg, operator).unwrap()
    }

    #[test]
    fn test_bucket_only_lists_missing_credentials() {
        let err = S3Backend::new(&Credentials::new(), &config(&[("bucket", "b")])).unwrap_err();
        match err {
            Error::MissingKeys { provider, keys } => {
                assert_eq!(provider, "s3");
                assert_eq!(keys, vec!["access_key_id", "secret_access_key"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_region_defaults() {
        let creds: Credentials = [("access_key_id", "AKIA"), ("secret_access_key", "s")]
            .into_iter()
            .collect();
        let backend = S3Backend::new(&creds, &config(&[("bucket", "b")])).unwrap();
        assert_eq!(backend.region(), DEFAULT_REGION);
        assert_eq!(backend.bucket(), "b");
    }

    #[tokio::test]
    async fn test_exists_upload_download() {
        let backend = memory_backend(&config(&[("bucket", "b"), ("region", "us-east-1")]));
        let path = StoragePath::parse("user_1/2024/05/photo.jpg").unwrap();
        let data = Bytes::from_static(b"\xff\xd8\xff\xe0jpeg-bytes");

        assert!(!backend.exists(&path).await.unwrap());
        let stored = backend.upload(data.clone(), &path).await.unwrap();
        assert_eq!(stored, path);
        assert!(backend.exists(&path).await.unwrap());
        assert_eq!(backend.download(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_upload_overwrites_and_delete_is_idempotent() {
        let backend = memory_backend(&config(&[("bucket", "b")]));
        let path = StoragePath::parse("k.png").unwrap();

        backend.upload(Bytes::from_static(b"one"), &path).await.unwrap();
        backend.upload(Bytes::from_static(b"two"), &path).await.unwrap();
        assert_eq!(backend.download(&path).await.unwrap(), Bytes::from_static(b"two"));

        backend.delete(&path).await.unwrap();
        backend.delete(&path).await.unwrap();
        assert!(!backend.exists(&path).await.unwrap());
        assert!(backend.download(&path).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_urls() {
        let path = StoragePath::parse("user_1/a b.jpg").unwrap();

        let aws = memory_backend(&config(&[("bucket", "pics"), ("region", "eu-west-1")]));
        assert_eq!(
            aws.url(&path),
            "https://pics.s3.eu-west-1.amazonaws.com/user_1/a%20b.jpg"
        );

        let minio = memory_backend(&config(&[
            ("bucket", "pics"),
            ("endpoint", "http://localhost:9000/"),
        ]));
        assert_eq!(minio.url(&path), "http://localhost:9000/pics/user_1/a%20b.jpg");
    }
}
