//! Storage key generation for uploaded images.

use chrono::{DateTime, Datelike, Utc};
use std::path::Path;
use uuid::Uuid;

use imghost_common::{Result, StoragePath, UserId};

/// Generate a unique key for an upload.
///
/// Layout: `user_{id}/{YYYY}/{MM}/{YYYYmmdd_HHMMSS}_{8 hex}{.ext}`. The
/// extension is taken from `filename`, lower-cased and stripped to ASCII
/// alphanumerics; nothing else from the client filename reaches the key.
pub fn generate_storage_path(
    user_id: UserId,
    filename: &str,
    now: DateTime<Utc>,
) -> Result<StoragePath> {
    let extension: String = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    let unique = Uuid::new_v4().simple().to_string();
    let mut name = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &unique[..8]);
    if !extension.is_empty() {
        name.push('.');
        name.push_str(&extension);
    }

    StoragePath::from_components(vec![
        format!("user_{}", user_id),
        format!("{:04}", now.year()),
        format!("{:02}", now.month()),
        name,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()
    }

    #[test]
    fn test_layout() {
        let path = generate_storage_path(UserId(42), "Holiday Photo.JPG", at()).unwrap();
        let parts = path.components();

        assert_eq!(&parts[..3], &["user_42", "2024", "03"]);
        let name = &parts[3];
        assert!(name.starts_with("20240307_140509_"), "{}", name);
        assert!(name.ends_with(".jpg"));
        let hex = &name["20240307_140509_".len()..name.len() - ".jpg".len()];
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_extension_sanitized() {
        let path = generate_storage_path(UserId(1), "evil.p/n\\g", at()).unwrap();
        assert!(path.name().split('.').count() <= 2);
        assert!(!path.name().contains('\\'));

        let bare = generate_storage_path(UserId(1), "noext", at()).unwrap();
        assert!(!bare.name().contains('.'));
    }

    #[test]
    fn test_unique() {
        let a = generate_storage_path(UserId(1), "a.png", at()).unwrap();
        let b = generate_storage_path(UserId(1), "a.png", at()).unwrap();
        assert_ne!(a, b);
    }
}
