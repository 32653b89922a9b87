//! Shared plumbing for the OpenDAL-backed object stores (S3, Azure, GCS).

use bytes::Bytes;
use opendal::layers::TimeoutLayer;
use opendal::{Builder, ErrorKind, Operator};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::Duration;
use tracing::debug;

use imghost_common::{Error, ProviderConfig, ProviderType, Result, StoragePath};

/// Characters escaped inside a single URL path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Config key holding the per-request timeout in seconds.
pub const TIMEOUT_KEY: &str = "timeout_secs";

/// Read the optional `timeout_secs` config key.
///
/// # Errors
/// - `Configuration` if the value is not a positive integer
pub fn timeout_from_config(config: &ProviderConfig) -> Result<Option<Duration>> {
    let Some(raw) = config.get_str(TIMEOUT_KEY) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(Error::Configuration(format!(
            "{} must be a positive integer, got '{}'",
            TIMEOUT_KEY, raw
        ))),
    }
}

/// Finish an OpenDAL builder into an operator, applying the configured timeout.
pub(crate) fn build_operator<B: Builder>(
    kind: ProviderType,
    builder: B,
    config: &ProviderConfig,
) -> Result<Operator> {
    let timeout = timeout_from_config(config)?;
    let operator = Operator::new(builder)
        .map_err(|e| Error::Configuration(format!("{}: {}", kind.display_name(), e)))?
        .finish();

    Ok(match timeout {
        Some(timeout) => operator.layer(TimeoutLayer::new().with_timeout(timeout)),
        None => operator,
    })
}

/// Percent-encode each component of a key for use in a URL path.
pub(crate) fn encode_key(path: &StoragePath) -> String {
    path.components()
        .iter()
        .map(|c| utf8_percent_encode(c, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Translate an OpenDAL error into the common taxonomy.
fn map_error(kind: ProviderType, path: &StoragePath, err: opendal::Error) -> Error {
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound(format!("{} object not found: {}", kind, path)),
        ErrorKind::PermissionDenied => Error::auth(kind.as_str(), err.to_string()),
        ErrorKind::ConfigInvalid => Error::Configuration(err.to_string()),
        _ => Error::connectivity(kind.as_str(), err.to_string()),
    }
}

/// Object operations shared by every OpenDAL-backed variant.
#[derive(Debug, Clone)]
pub(crate) struct ObjectStore {
    kind: ProviderType,
    operator: Operator,
}

impl ObjectStore {
    pub(crate) fn new(kind: ProviderType, operator: Operator) -> Self {
        Self { kind, operator }
    }

    pub(crate) async fn write(&self, path: &StoragePath, data: Bytes) -> Result<()> {
        let size = data.len();
        self.operator
            .write(&path.as_key(), data)
            .await
            .map_err(|e| map_error(self.kind, path, e))?;
        debug!(provider = %self.kind, path = %path, size, "Object written");
        Ok(())
    }

    pub(crate) async fn read(&self, path: &StoragePath) -> Result<Bytes> {
        let buffer = self
            .operator
            .read(&path.as_key())
            .await
            .map_err(|e| map_error(self.kind, path, e))?;
        Ok(buffer.to_bytes())
    }

    pub(crate) async fn delete(&self, path: &StoragePath) -> Result<()> {
        match self.operator.delete(&path.as_key()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_error(self.kind, path, e)),
        }
    }

    pub(crate) async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match self.operator.stat(&path.as_key()).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_error(self.kind, path, e)),
        }
    }
}
