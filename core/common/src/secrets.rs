//! Provider credential and configuration containers.
//!
//! `Credentials` hold plaintext secrets and only ever live in memory; they are
//! zeroized on drop and never printed. `SealedCredentials` is the opaque blob
//! persisted in their place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Decrypted provider secrets (access keys, passwords, service-account JSON).
///
/// Backed by an ordered map so the serialized form is canonical.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    /// Create an empty credential map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build credentials from a JSON object.
    ///
    /// String values are kept as-is; numbers, booleans and nested documents are
    /// stored as their JSON text. Null values are skipped.
    ///
    /// # Errors
    /// - `value` is not a JSON object
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidInput(
                "Credentials must be a JSON object".to_string(),
            ));
        };
        let mut creds = Self::new();
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::String(s) => creds.insert(key, s),
                other => creds.insert(key, other.to_string()),
            }
        }
        Ok(creds)
    }

    /// Insert or replace a secret.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(mut old) = self.0.insert(key.into(), value.into()) {
            old.zeroize();
        }
    }

    /// Get a non-empty secret value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether a non-empty value is present for `key`.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Names of the stored secrets (values are never exposed this way).
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut creds = Self::new();
        for (k, v) in iter {
            creds.insert(k, v);
        }
        creds
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED; {} keys])", self.0.len())
    }
}

/// Non-secret provider configuration (bucket, region, container, remote path).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig(BTreeMap<String, Value>);

impl ProviderConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a JSON object.
    ///
    /// # Errors
    /// - `value` is not a JSON object
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            Value::Null => Ok(Self::new()),
            _ => Err(Error::InvalidInput(
                "Provider config must be a JSON object".to_string(),
            )),
        }
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a value as a non-empty string.
    ///
    /// Numbers and booleans are rendered as text; null and empty strings read as absent.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Whether a usable value is present for `key`.
    pub fn has(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    /// Get a raw JSON value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Serialize to a JSON string for storage.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from a stored JSON string.
    pub fn parse_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ProviderConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Credentials sealed by the credential vault. Opaque outside the crypto crate.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredentials(Vec<u8>);

impl SealedCredentials {
    /// Wrap sealed bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the sealed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the sealed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SealedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedCredentials({} bytes)", self.0.len())
    }
}
