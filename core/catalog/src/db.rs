//! SQLite persistence for provider and image records.

use rusqlite::{ffi, Connection, ErrorCode, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use imghost_common::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage_providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL DEFAULT '{}',
    encrypted_credentials BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, name)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_providers_one_default
    ON storage_providers(user_id) WHERE is_default = 1;

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    storage_provider_id INTEGER NOT NULL
        REFERENCES storage_providers(id) ON DELETE RESTRICT,
    original_filename TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    is_optimized INTEGER NOT NULL DEFAULT 0,
    optimized_size INTEGER,
    optimization_percentage REAL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_images_user_created ON images(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_images_provider ON images(storage_provider_id);
"#;

/// Shared handle to the catalog database.
///
/// Cloning is cheap; all clones use the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Create or open the database file and apply the schema.
    ///
    /// # Errors
    /// - The parent directory cannot be created
    /// - The database cannot be opened or migrated
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| map_error(e, "open database"))?;
        let db = Self::init(conn)?;
        info!(path = %path.display(), "Catalog database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_error(e, "open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| map_error(e, "configure database"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| map_error(e, "configure database"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_error(e, "apply schema"))?;
        debug!("Catalog schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside an `IMMEDIATE` transaction, committing on success.
    ///
    /// The write lock is taken up front, so two writers for the same rows
    /// serialize instead of interleaving.
    pub(crate) fn write_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_error(e, "begin transaction"))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| map_error(e, "commit transaction"))?;
        Ok(value)
    }
}

/// Map a rusqlite error into the common taxonomy.
///
/// Foreign-key violations become `Protected`, unique violations become
/// `AlreadyExists`, a missing row becomes `NotFound`.
pub(crate) fn map_error(err: rusqlite::Error, context: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
            match code.extended_code {
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    Error::Protected(format!("{}: record is still referenced", context))
                }
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    Error::AlreadyExists(context.to_string())
                }
                _ => Error::Database(format!("{}: {}", context, err)),
            }
        }
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound(context.to_string()),
        _ => Error::Database(format!("{}: {}", context, err)),
    }
}
