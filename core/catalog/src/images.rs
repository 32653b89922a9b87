//! Image record persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{map_error, Database};
use crate::providers::{parse_timestamp, timestamp};
use imghost_common::{Error, ImageId, ProviderId, Result, StoragePath, UserId};

const COLUMNS: &str = "id, user_id, storage_provider_id, original_filename, file_size, \
                       content_type, storage_path, width, height, is_optimized, optimized_size, \
                       optimization_percentage, tags, metadata, created_at, updated_at";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn round_mb(bytes: i64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

/// A stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Row id.
    pub id: ImageId,
    /// Owning user.
    pub user_id: UserId,
    /// Provider holding the bytes.
    pub provider_id: ProviderId,
    /// Filename as uploaded.
    pub original_filename: String,
    /// Size of the uploaded file in bytes.
    pub file_size: u64,
    /// Declared content type.
    pub content_type: String,
    /// Key inside the provider.
    pub storage_path: StoragePath,
    /// Width of the uploaded image.
    pub width: Option<u32>,
    /// Height of the uploaded image.
    pub height: Option<u32>,
    /// Whether the stored bytes are the optimized rendition.
    pub is_optimized: bool,
    /// Size of the optimized rendition.
    pub optimized_size: Option<u64>,
    /// Reduction relative to the original; negative when optimizing grew the file.
    pub optimization_percentage: Option<f64>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Optimizer and format metadata.
    pub metadata: Map<String, Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// File size in MB, rounded to two decimals.
    pub fn size_mb(&self) -> f64 {
        round_mb(self.file_size as i64)
    }

    /// Optimized size in MB, rounded to two decimals.
    pub fn optimized_size_mb(&self) -> Option<f64> {
        self.optimized_size.map(|s| round_mb(s as i64))
    }
}

/// Fields for an image that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub original_filename: String,
    pub file_size: u64,
    pub content_type: String,
    pub storage_path: StoragePath,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub is_optimized: bool,
    pub optimized_size: Option<u64>,
    pub optimization_percentage: Option<f64>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Aggregate numbers over a user's images.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageStats {
    pub total_images: u64,
    pub total_size_bytes: i64,
    pub total_size_mb: f64,
    pub optimized_images: u64,
    /// Bytes saved by optimization; negative if optimization grew files overall.
    pub total_saved_bytes: i64,
    pub total_saved_mb: f64,
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let storage_path: String = row.get(6)?;
    let tags: String = row.get(12)?;
    let metadata: String = row.get(13)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;
    Ok(ImageRecord {
        id: ImageId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        provider_id: ProviderId(row.get(2)?),
        original_filename: row.get(3)?,
        file_size: row.get::<_, i64>(4)?.max(0) as u64,
        content_type: row.get(5)?,
        storage_path: StoragePath::parse(&storage_path).map_err(|e| conversion_error(6, e))?,
        width: row.get(7)?,
        height: row.get(8)?,
        is_optimized: row.get(9)?,
        optimized_size: row.get::<_, Option<i64>>(10)?.map(|s| s.max(0) as u64),
        optimization_percentage: row.get(11)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(12, e))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(13, e))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Repository for image records.
#[derive(Clone)]
pub struct ImageStore {
    db: Database,
}

impl ImageStore {
    /// Create a store over a database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an image.
    ///
    /// # Errors
    /// - `InvalidInput` if the referenced provider does not exist
    pub fn insert(&self, new: NewImage) -> Result<ImageRecord> {
        let tags = to_json(&new.tags)?;
        let metadata = to_json(&new.metadata)?;
        let now = timestamp(Utc::now());
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO images
             (user_id, storage_provider_id, original_filename, file_size, content_type,
              storage_path, width, height, is_optimized, optimized_size,
              optimization_percentage, tags, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                new.user_id.get(),
                new.provider_id.get(),
                new.original_filename,
                new.file_size as i64,
                new.content_type,
                new.storage_path.as_key(),
                new.width,
                new.height,
                new.is_optimized,
                new.optimized_size.map(|s| s as i64),
                new.optimization_percentage,
                tags,
                metadata,
                now,
            ],
        )
        .map_err(|e| match map_error(e, "insert image") {
            Error::Protected(_) => Error::InvalidInput(format!(
                "Storage provider {} does not exist",
                new.provider_id
            )),
            other => other,
        })?;
        let id = ImageId(conn.last_insert_rowid());
        drop(conn);
        self.get(new.user_id, id)
    }

    /// Load one of the user's images.
    ///
    /// # Errors
    /// - `NotFound` if the image does not exist or belongs to someone else
    pub fn get(&self, user_id: UserId, id: ImageId) -> Result<ImageRecord> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {} FROM images WHERE id = ?1 AND user_id = ?2", COLUMNS),
                params![id.get(), user_id.get()],
                from_row,
            )
            .optional()
            .map_err(|e| map_error(e, "load image"))?
            .ok_or_else(|| Error::NotFound(format!("Image {}", id)))
    }

    /// The user's images, newest first.
    pub fn list(&self, user_id: UserId) -> Result<Vec<ImageRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM images WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
                COLUMNS
            ))
            .map_err(|e| map_error(e, "list images"))?;
        let rows = stmt
            .query_map(params![user_id.get()], from_row)
            .map_err(|e| map_error(e, "list images"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_error(e, "list images"))
    }

    /// Replace an image's tags.
    pub fn update_tags(&self, user_id: UserId, id: ImageId, tags: &[String]) -> Result<ImageRecord> {
        let changed = self
            .db
            .conn()
            .execute(
                "UPDATE images SET tags = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
                params![to_json(&tags)?, timestamp(Utc::now()), id.get(), user_id.get()],
            )
            .map_err(|e| map_error(e, "update image tags"))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Image {}", id)));
        }
        self.get(user_id, id)
    }

    /// Delete one of the user's images.
    pub fn delete(&self, user_id: UserId, id: ImageId) -> Result<()> {
        let changed = self
            .db
            .conn()
            .execute(
                "DELETE FROM images WHERE id = ?1 AND user_id = ?2",
                params![id.get(), user_id.get()],
            )
            .map_err(|e| map_error(e, "delete image"))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Image {}", id)));
        }
        Ok(())
    }

    /// Count and size totals for the user's images.
    pub fn stats(&self, user_id: UserId) -> Result<ImageStats> {
        let (total_images, total_size, optimized_images, total_saved): (i64, i64, i64, i64) = self
            .db
            .conn()
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(file_size), 0),
                        COALESCE(SUM(is_optimized), 0),
                        COALESCE(SUM(CASE WHEN is_optimized = 1 AND optimized_size IS NOT NULL
                                          THEN file_size - optimized_size ELSE 0 END), 0)
                 FROM images WHERE user_id = ?1",
                params![user_id.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| map_error(e, "image stats"))?;

        Ok(ImageStats {
            total_images: total_images.max(0) as u64,
            total_size_bytes: total_size,
            total_size_mb: round_mb(total_size),
            optimized_images: optimized_images.max(0) as u64,
            total_saved_bytes: total_saved,
            total_saved_mb: round_mb(total_saved),
        })
    }
}
