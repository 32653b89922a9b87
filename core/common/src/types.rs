//! Common types used throughout imghost.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the raw row id.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Identifier of the user owning providers and images.
    UserId
);
row_id!(
    /// Identifier of a storage provider record.
    ProviderId
);
row_id!(
    /// Identifier of an image record.
    ImageId
);

/// A key inside a provider's namespace (bucket, container, or remote directory).
///
/// Paths are relative: leading and trailing separators are stripped and
/// components are joined with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath {
    components: Vec<String>,
}

impl StoragePath {
    /// Create a path from string components.
    ///
    /// # Preconditions
    /// - At least one component
    /// - Components must not be empty, `.` or `..`
    /// - Components must not contain path separators
    ///
    /// # Errors
    /// - Returns error if any component is invalid
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        if components.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Storage path cannot be empty".to_string(),
            ));
        }
        for comp in &components {
            if comp.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot be empty".to_string(),
                ));
            }
            if comp == "." || comp == ".." {
                return Err(crate::Error::InvalidInput(format!(
                    "Path component '{}' is not allowed",
                    comp
                )));
            }
            if comp.contains('/') || comp.contains('\\') {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot contain separators".to_string(),
                ));
            }
        }
        Ok(Self { components })
    }

    /// Parse a key string into a StoragePath.
    ///
    /// Uses '/' as separator.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Storage path cannot be empty".to_string(),
            ));
        }
        Self::from_components(trimmed.split('/').map(String::from).collect())
    }

    /// Get the parent path, if this path has more than one component.
    pub fn parent(&self) -> Option<Self> {
        if self.components.len() < 2 {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(Self { components })
    }

    /// Get the object name (last component).
    pub fn name(&self) -> &str {
        self.components
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The key as a `/`-joined string without a leading separator.
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

impl TryFrom<String> for StoragePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<StoragePath> for String {
    fn from(path: StoragePath) -> Self {
        path.as_key()
    }
}
