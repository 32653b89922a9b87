//! Upload orchestration.
//!
//! [`ImageService`] ties the pieces together for one request: it validates the
//! upload, picks the provider, optimizes, writes to the remote store, and
//! records the result. Backends are built per request and closed before the
//! call returns.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::images::{ImageRecord, ImageStats, ImageStore, NewImage};
use crate::optimize::ImageOptimizer;
use crate::paths::generate_storage_path;
use crate::providers::ProviderStore;
use imghost_common::{
    Error, ImageId, OptimizeSettings, ProviderId, ProviderRecord, Result, UploadSettings, UserId,
};
use imghost_storage::{BackendBuilder, StorageBackend};

/// One image upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Client-supplied file name. Only its extension reaches the storage key.
    pub filename: String,
    /// Declared MIME type; must be an allowed image type.
    pub content_type: String,
    /// Raw file contents.
    pub data: Bytes,
    /// Explicit provider; `None` uses the user's active default.
    pub provider_id: Option<ProviderId>,
    /// Re-encode before storing when the catalog allows it.
    pub optimize: bool,
    /// Free-form labels kept with the record.
    pub tags: Vec<String>,
}

/// Image upload and lifecycle service.
pub struct ImageService {
    images: ImageStore,
    providers: ProviderStore,
    backends: Arc<dyn BackendBuilder>,
    optimizer: Arc<dyn ImageOptimizer>,
    upload: UploadSettings,
    optimize: OptimizeSettings,
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

fn optimization_percentage(original: u64, optimized: u64) -> Option<f64> {
    if original == 0 {
        return None;
    }
    let pct = (original as f64 - optimized as f64) / original as f64 * 100.0;
    Some((pct * 100.0).round() / 100.0)
}

async fn release(backend: Box<dyn StorageBackend>, provider_id: ProviderId) {
    if let Err(e) = backend.close().await {
        warn!(provider = %provider_id, error = %e, "Failed to close storage backend");
    }
}

impl ImageService {
    /// Create a service.
    pub fn new(
        images: ImageStore,
        providers: ProviderStore,
        backends: Arc<dyn BackendBuilder>,
        optimizer: Arc<dyn ImageOptimizer>,
    ) -> Self {
        Self {
            images,
            providers,
            backends,
            optimizer,
            upload: UploadSettings::default(),
            optimize: OptimizeSettings::default(),
        }
    }

    /// Replace the upload limits and optimizer parameters.
    pub fn with_settings(mut self, upload: UploadSettings, optimize: OptimizeSettings) -> Self {
        self.upload = upload;
        self.optimize = optimize;
        self
    }

    fn validate(&self, request: &UploadRequest) -> Result<()> {
        if request.filename.trim().is_empty() {
            return Err(Error::InvalidInput("Filename cannot be empty".to_string()));
        }
        if request.data.is_empty() {
            return Err(Error::InvalidInput("Uploaded file is empty".to_string()));
        }
        let size = request.data.len() as u64;
        if size > self.upload.max_file_size {
            return Err(Error::InvalidInput(format!(
                "File size {} exceeds maximum of {} bytes",
                size, self.upload.max_file_size
            )));
        }
        if !self.upload.is_content_type_allowed(&request.content_type) {
            return Err(Error::InvalidInput(format!(
                "Content type '{}' is not allowed",
                request.content_type
            )));
        }
        Ok(())
    }

    fn resolve_provider(
        &self,
        user_id: UserId,
        provider_id: Option<ProviderId>,
    ) -> Result<ProviderRecord> {
        match provider_id {
            Some(id) => {
                let record = self.providers.get(user_id, id)?;
                if !record.is_active {
                    return Err(Error::InvalidInput(format!(
                        "Storage provider '{}' is not active",
                        record.name
                    )));
                }
                Ok(record)
            }
            None => self.providers.active_default(user_id)?.ok_or_else(|| {
                Error::InvalidInput("No storage provider configured".to_string())
            }),
        }
    }

    /// Load an image's provider and build its backend.
    fn backend_for(&self, image: &ImageRecord) -> Result<Box<dyn StorageBackend>> {
        let provider = self.providers.get_by_id(image.provider_id)?;
        self.backends.build(&provider)
    }

    /// Store an image and record it.
    ///
    /// The remote write happens before the record is inserted. If the insert
    /// fails, the remote object is removed again on a best-effort basis.
    ///
    /// # Errors
    /// - `InvalidInput` for empty, oversized, unsupported, or undecodable
    ///   uploads, and when no usable provider can be resolved
    /// - `NotFound` if an explicit provider does not belong to the user
    /// - any backend build or upload error
    pub async fn upload(&self, user_id: UserId, request: UploadRequest) -> Result<ImageRecord> {
        self.validate(&request)?;
        let provider = self.resolve_provider(user_id, request.provider_id)?;
        let info = self.optimizer.inspect(&request.data)?;
        let original_size = request.data.len() as u64;

        let mut metadata = serde_json::Map::new();
        let (payload, optimized_size) = if request.optimize {
            let optimizer = Arc::clone(&self.optimizer);
            let settings = self.optimize;
            let data = request.data.clone();
            let optimized = tokio::task::spawn_blocking(move || optimizer.optimize(&data, &settings))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
            metadata = optimized.metadata;
            let size = optimized.data.len() as u64;
            (Bytes::from(optimized.data), Some(size))
        } else {
            (request.data.clone(), None)
        };
        metadata
            .entry("format")
            .or_insert_with(|| info.format.clone().into());

        let path = generate_storage_path(user_id, &request.filename, Utc::now())?;
        let backend = self.backends.build(&provider)?;

        let stored = match backend.upload(payload, &path).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(provider = %provider.id, path = %path, error = %e, "Upload failed");
                release(backend, provider.id).await;
                return Err(e);
            }
        };

        let inserted = self.images.insert(NewImage {
            user_id,
            provider_id: provider.id,
            original_filename: request.filename,
            file_size: original_size,
            content_type: request.content_type,
            storage_path: stored.clone(),
            width: Some(info.width),
            height: Some(info.height),
            is_optimized: optimized_size.is_some(),
            optimized_size,
            optimization_percentage: optimized_size
                .and_then(|size| optimization_percentage(original_size, size)),
            tags: normalize_tags(request.tags),
            metadata,
        });

        let record = match inserted {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %stored, error = %e, "Recording upload failed, removing stored object");
                if let Err(cleanup) = backend.delete(&stored).await {
                    error!(path = %stored, error = %cleanup, "Failed to remove orphaned object");
                }
                release(backend, provider.id).await;
                return Err(e);
            }
        };
        release(backend, provider.id).await;

        info!(
            user = %user_id,
            image = %record.id,
            provider = %provider.id,
            size = original_size,
            optimized = record.is_optimized,
            "Image uploaded"
        );
        Ok(record)
    }

    /// Remove an image from its store and from the catalog.
    ///
    /// Remote failures are logged and do not keep the record alive.
    pub async fn delete(&self, user_id: UserId, id: ImageId) -> Result<()> {
        let image = self.images.get(user_id, id)?;
        match self.backend_for(&image) {
            Ok(backend) => {
                if let Err(e) = backend.delete(&image.storage_path).await {
                    error!(image = %id, path = %image.storage_path, error = %e, "Failed to delete stored object");
                }
                release(backend, image.provider_id).await;
            }
            Err(e) => {
                error!(image = %id, error = %e, "Could not reach storage to delete image");
            }
        }
        self.images.delete(user_id, id)?;
        info!(user = %user_id, image = %id, "Image deleted");
        Ok(())
    }

    /// One of the user's images.
    pub fn get(&self, user_id: UserId, id: ImageId) -> Result<ImageRecord> {
        self.images.get(user_id, id)
    }

    /// The user's images, newest first.
    pub fn list(&self, user_id: UserId) -> Result<Vec<ImageRecord>> {
        self.images.list(user_id)
    }

    /// Replace an image's tags.
    pub fn update_tags(&self, user_id: UserId, id: ImageId, tags: Vec<String>) -> Result<ImageRecord> {
        self.images.update_tags(user_id, id, &normalize_tags(tags))
    }

    /// Fetch the stored bytes of an image.
    pub async fn download(&self, user_id: UserId, id: ImageId) -> Result<Bytes> {
        let image = self.images.get(user_id, id)?;
        let backend = self.backend_for(&image)?;
        let result = backend.download(&image.storage_path).await;
        release(backend, image.provider_id).await;
        debug!(image = %id, ok = result.is_ok(), "Image downloaded");
        result
    }

    /// Public URL of an image.
    pub async fn url(&self, user_id: UserId, id: ImageId) -> Result<String> {
        let image = self.images.get(user_id, id)?;
        let backend = self.backend_for(&image)?;
        let url = backend.url(&image.storage_path);
        release(backend, image.provider_id).await;
        Ok(url)
    }

    /// Count and size totals for the user's images.
    pub fn stats(&self, user_id: UserId) -> Result<ImageStats> {
        self.images.stats(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::optimize::tests::noisy_jpeg;
    use crate::optimize::RasterOptimizer;
    use crate::providers::NewProvider;
    use crate::testing::StaticBackends;
    use imghost_common::SealedCredentials;
    use imghost_storage::MemoryBackend;

    struct Fixture {
        service: ImageService,
        providers: ProviderStore,
        backend: MemoryBackend,
        db: Database,
    }

    fn add_provider(store: &ProviderStore, user: i64, name: &str, is_default: bool, is_active: bool) -> ProviderId {
        store
            .insert(NewProvider {
                user_id: UserId(user),
                name: name.to_string(),
                provider_type: "s3".to_string(),
                is_default,
                is_active,
                config: [("bucket", "b")].into_iter().collect(),
                encrypted_credentials: SealedCredentials::from_bytes(vec![1, 2, 3]),
            })
            .unwrap()
            .id
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let providers = ProviderStore::new(db.clone());
        let backends = StaticBackends::default();
        let backend = backends.backend();
        let service = ImageService::new(
            ImageStore::new(db.clone()),
            providers.clone(),
            Arc::new(backends),
            Arc::new(RasterOptimizer),
        );
        Fixture {
            service,
            providers,
            backend,
            db,
        }
    }

    fn jpeg_request(optimize: bool) -> UploadRequest {
        UploadRequest {
            filename: "photo.JPG".to_string(),
            content_type: "image/jpeg".to_string(),
            data: Bytes::from(noisy_jpeg(100, 100)),
            provider_id: None,
            optimize,
            tags: vec!["trip".to_string(), " trip ".to_string(), "".to_string()],
        }
    }

    #[tokio::test]
    async fn test_upload_optimized_jpeg() {
        let fx = fixture();
        let provider = add_provider(&fx.providers, 1, "main", true, true);

        let request = jpeg_request(true);
        let original_size = request.data.len() as u64;
        let image = fx.service.upload(UserId(1), request).await.unwrap();

        assert_eq!(image.provider_id, provider);
        assert_eq!(image.file_size, original_size);
        assert!(image.is_optimized);
        let optimized = image.optimized_size.unwrap();
        assert!(optimized <= original_size);
        assert!(image.optimization_percentage.unwrap() >= 0.0);
        assert_eq!((image.width, image.height), (Some(100), Some(100)));
        assert_eq!(image.tags, vec!["trip"]);
        assert_eq!(image.metadata["format"], "JPEG");

        let key = image.storage_path.as_key();
        assert!(key.starts_with("user_1/"));
        assert!(key.ends_with(".jpg"));
        assert!(fx.backend.contains(&key));
        assert_eq!(fx.backend.close_count(), 1);

        let stored = fx.service.download(UserId(1), image.id).await.unwrap();
        assert_eq!(stored.len() as u64, optimized);
    }

    #[tokio::test]
    async fn test_upload_without_optimization() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);

        let request = jpeg_request(false);
        let data = request.data.clone();
        let image = fx.service.upload(UserId(1), request).await.unwrap();

        assert!(!image.is_optimized);
        assert_eq!(image.optimized_size, None);
        assert_eq!(image.optimization_percentage, None);
        assert_eq!(fx.service.download(UserId(1), image.id).await.unwrap(), data);

        let url = fx.service.url(UserId(1), image.id).await.unwrap();
        assert_eq!(url, format!("memory://s3/{}", image.storage_path));
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);

        let mut empty = jpeg_request(false);
        empty.data = Bytes::new();
        assert!(matches!(fx.service.upload(UserId(1), empty).await, Err(Error::InvalidInput(_))));

        let mut wrong_type = jpeg_request(false);
        wrong_type.content_type = "application/pdf".to_string();
        assert!(matches!(
            fx.service.upload(UserId(1), wrong_type).await,
            Err(Error::InvalidInput(_))
        ));

        let mut not_an_image = jpeg_request(false);
        not_an_image.data = Bytes::from_static(b"definitely not a jpeg");
        assert!(fx.service.upload(UserId(1), not_an_image).await.is_err());

        let limited = fixture();
        add_provider(&limited.providers, 1, "main", true, true);
        let service = limited.service.with_settings(
            UploadSettings {
                max_file_size: 10,
                ..UploadSettings::default()
            },
            OptimizeSettings::default(),
        );
        assert!(matches!(
            service.upload(UserId(1), jpeg_request(false)).await,
            Err(Error::InvalidInput(_))
        ));

        assert_eq!(fx.backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_resolution() {
        let fx = fixture();

        match fx.service.upload(UserId(1), jpeg_request(false)).await {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains("No storage provider")),
            other => panic!("unexpected: {:?}", other.map(|r| r.id)),
        }

        // an inactive default does not count
        add_provider(&fx.providers, 1, "paused", true, false);
        assert!(fx.service.upload(UserId(1), jpeg_request(false)).await.is_err());

        let inactive = fx.providers.list(UserId(1)).unwrap()[0].id;
        let mut explicit = jpeg_request(false);
        explicit.provider_id = Some(inactive);
        assert!(matches!(
            fx.service.upload(UserId(1), explicit).await,
            Err(Error::InvalidInput(_))
        ));

        let foreign = add_provider(&fx.providers, 2, "theirs", true, true);
        let mut stolen = jpeg_request(false);
        stolen.provider_id = Some(foreign);
        assert!(fx
            .service
            .upload(UserId(1), stolen)
            .await
            .unwrap_err()
            .is_not_found());

        let secondary = add_provider(&fx.providers, 1, "secondary", false, true);
        let mut chosen = jpeg_request(false);
        chosen.provider_id = Some(secondary);
        let image = fx.service.upload(UserId(1), chosen).await.unwrap();
        assert_eq!(image.provider_id, secondary);
    }

    #[tokio::test]
    async fn test_upload_failure_creates_no_record() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);
        fx.backend.fail_uploads(true);

        let err = fx.service.upload(UserId(1), jpeg_request(false)).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(fx.service.list(UserId(1)).unwrap().is_empty());
        assert_eq!(fx.backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_removes_stored_object() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);
        fx.db
            .conn()
            .execute_batch(
                "CREATE TRIGGER reject_images BEFORE INSERT ON images
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();

        assert!(fx.service.upload(UserId(1), jpeg_request(false)).await.is_err());
        assert_eq!(fx.backend.object_count(), 0);
        assert_eq!(fx.backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_survives_remote_failure() {
        let fx = fixture();
        let provider = add_provider(&fx.providers, 1, "main", true, true);
        let image = fx.service.upload(UserId(1), jpeg_request(false)).await.unwrap();

        // provider is protected while the image exists
        assert!(matches!(
            fx.providers.delete(UserId(1), provider),
            Err(Error::Protected(_))
        ));

        fx.backend.fail_deletes(true);
        fx.service.delete(UserId(1), image.id).await.unwrap();
        assert!(fx.service.get(UserId(1), image.id).unwrap_err().is_not_found());
        assert!(fx.backend.contains(&image.storage_path.as_key()));

        fx.providers.delete(UserId(1), provider).unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_object() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);
        let image = fx.service.upload(UserId(1), jpeg_request(false)).await.unwrap();

        assert!(fx.service.delete(UserId(2), image.id).await.unwrap_err().is_not_found());
        fx.service.delete(UserId(1), image.id).await.unwrap();
        assert_eq!(fx.backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_tags_and_stats() {
        let fx = fixture();
        add_provider(&fx.providers, 1, "main", true, true);
        let plain = fx.service.upload(UserId(1), jpeg_request(false)).await.unwrap();
        let optimized = fx.service.upload(UserId(1), jpeg_request(true)).await.unwrap();

        let tagged = fx
            .service
            .update_tags(UserId(1), plain.id, vec!["a".into(), "b".into(), "a".into()])
            .unwrap();
        assert_eq!(tagged.tags, vec!["a", "b"]);

        let stats = fx.service.stats(UserId(1)).unwrap();
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.optimized_images, 1);
        assert_eq!(
            stats.total_size_bytes,
            (plain.file_size + optimized.file_size) as i64
        );
        assert_eq!(
            stats.total_saved_bytes,
            optimized.file_size as i64 - optimized.optimized_size.unwrap() as i64
        );
        assert_eq!(fx.service.list(UserId(1)).unwrap()[0].id, optimized.id);
    }

    #[test]
    fn test_optimization_percentage() {
        assert_eq!(optimization_percentage(200, 50), Some(75.0));
        assert_eq!(optimization_percentage(100, 150), Some(-50.0));
        assert_eq!(optimization_percentage(0, 10), None);
    }
}
