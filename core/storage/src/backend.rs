//! Storage backend trait definition.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use std::pin::Pin;

use imghost_common::{ProviderType, Result, StoragePath};

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A live adapter over one remote store, built from a provider's decrypted
/// credentials and config.
///
/// Instances are request-scoped: build one, use it, call [`close`], drop it.
/// Implementations hold no state shared with other instances.
///
/// [`close`]: StorageBackend::close
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The provider type this backend talks to.
    fn provider_type(&self) -> ProviderType;

    /// Store `data` at `path`, replacing any existing object.
    ///
    /// # Postconditions
    /// - The object at `path` holds exactly `data`
    /// - Returns the path the object was written to
    ///
    /// # Errors
    /// - `Connectivity` / `Auth` on network or permission failures
    async fn upload(&self, data: Bytes, path: &StoragePath) -> Result<StoragePath>;

    /// Store a byte stream at `path`.
    ///
    /// The stream is buffered fully before anything is written, so a failing
    /// stream never leaves a partial object behind.
    async fn upload_stream(&self, mut data: ByteStream, path: &StoragePath) -> Result<StoragePath> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        self.upload(buffer.freeze(), path).await
    }

    /// Fetch the full content of the object at `path`.
    ///
    /// # Errors
    /// - `NotFound` if no object exists at `path`
    /// - `Connectivity` / `Auth` on network or permission failures
    async fn download(&self, path: &StoragePath) -> Result<Bytes>;

    /// Fetch the object at `path` as a stream.
    async fn download_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        let data = self.download(path).await?;
        Ok(Box::pin(stream::once(async move { Ok(data) })))
    }

    /// Remove the object at `path`.
    ///
    /// Deleting an absent object succeeds.
    ///
    /// # Errors
    /// - `Connectivity` / `Auth` on network or permission failures
    async fn delete(&self, path: &StoragePath) -> Result<()>;

    /// Check whether an object exists at `path`.
    ///
    /// Absence is `Ok(false)`, never an error.
    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// Best-effort locator for the object. Not necessarily an HTTP URL.
    fn url(&self, path: &StoragePath) -> String;

    /// Release any held connection. The backend must not be used afterwards.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use imghost_common::Error;

    #[tokio::test]
    async fn test_upload_stream_buffers_chunks() {
        let backend = MemoryBackend::new(ProviderType::S3);
        let path = StoragePath::parse("a/b.bin").unwrap();
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];

        backend
            .upload_stream(Box::pin(stream::iter(chunks)), &path)
            .await
            .unwrap();

        assert_eq!(backend.download(&path).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_failed_stream_writes_nothing() {
        let backend = MemoryBackend::new(ProviderType::S3);
        let path = StoragePath::parse("broken.bin").unwrap();
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(Error::connectivity("s3", "stream reset")),
        ];

        let result = backend
            .upload_stream(Box::pin(stream::iter(chunks)), &path)
            .await;

        assert!(result.is_err());
        assert!(!backend.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_download_stream() {
        let backend = MemoryBackend::new(ProviderType::Gcs);
        let path = StoragePath::parse("x.png").unwrap();
        backend.upload(Bytes::from_static(b"png"), &path).await.unwrap();

        let mut stream = backend.download_stream(&path).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"png");
    }
}
