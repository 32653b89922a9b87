//! Parsing of provider config and credentials given on the command line.

use anyhow::{bail, Context, Result};
use std::path::Path;

use imghost_common::{Credentials, ProviderConfig};

/// Split a `key=value` argument.
pub fn parse_pair(arg: &str) -> Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .with_context(|| format!("Expected key=value, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Empty key in '{}'", arg);
    }
    Ok((key.to_string(), value.to_string()))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Build provider config from an optional JSON file plus `key=value` pairs.
///
/// Pairs override keys from the file.
pub fn provider_config(file: Option<&Path>, pairs: &[String]) -> Result<ProviderConfig> {
    let mut config = match file {
        Some(path) => ProviderConfig::from_json(read_json(path)?)?,
        None => ProviderConfig::new(),
    };
    for pair in pairs {
        let (key, value) = parse_pair(pair)?;
        config.insert(key, value);
    }
    Ok(config)
}

/// Build credentials the same way as [`provider_config`].
///
/// Returns `None` when neither a file nor pairs were given.
pub fn credentials(file: Option<&Path>, pairs: &[String]) -> Result<Option<Credentials>> {
    if file.is_none() && pairs.is_empty() {
        return Ok(None);
    }
    let mut credentials = match file {
        Some(path) => Credentials::from_json(read_json(path)?)?,
        None => Credentials::new(),
    };
    for pair in pairs {
        let (key, value) = parse_pair(pair)?;
        credentials.insert(key, value);
    }
    Ok(Some(credentials))
}

/// Content type for an image file, from its extension.
pub fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
