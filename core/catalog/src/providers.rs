//! Provider record persistence.
//!
//! Every write that sets `is_default` clears the flag on the owner's other
//! providers inside the same `IMMEDIATE` transaction; a partial unique index
//! backs the invariant at the schema level.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::db::{map_error, Database};
use imghost_common::{
    Error, ProviderConfig, ProviderId, ProviderRecord, Result, SealedCredentials, UserId,
};

const COLUMNS: &str = "id, user_id, name, provider_type, is_default, is_active, config, \
                       encrypted_credentials, created_at, updated_at";

/// Fields for a provider that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewProvider {
    /// Owning user.
    pub user_id: UserId,
    /// Friendly name, unique per owner.
    pub name: String,
    /// Provider type tag.
    pub provider_type: String,
    /// Make this the owner's default.
    pub is_default: bool,
    /// Usable for new uploads.
    pub is_active: bool,
    /// Non-secret configuration.
    pub config: ProviderConfig,
    /// Sealed credentials.
    pub encrypted_credentials: SealedCredentials,
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ProviderRecord> {
    let config: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(ProviderRecord {
        id: ProviderId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        name: row.get(2)?,
        provider_type: row.get(3)?,
        is_default: row.get(4)?,
        is_active: row.get(5)?,
        config: ProviderConfig::parse_json(&config).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        encrypted_credentials: SealedCredentials::from_bytes(row.get(7)?),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn clear_defaults(tx: &Transaction<'_>, user_id: UserId, keep: Option<ProviderId>) -> Result<()> {
    tx.execute(
        "UPDATE storage_providers SET is_default = 0, updated_at = ?1
         WHERE user_id = ?2 AND is_default = 1 AND id IS NOT ?3",
        params![timestamp(Utc::now()), user_id.get(), keep.map(ProviderId::get)],
    )
    .map_err(|e| map_error(e, "clear default provider"))?;
    Ok(())
}

fn fetch(tx: &rusqlite::Connection, user_id: UserId, id: ProviderId) -> Result<ProviderRecord> {
    tx.query_row(
        &format!(
            "SELECT {} FROM storage_providers WHERE id = ?1 AND user_id = ?2",
            COLUMNS
        ),
        params![id.get(), user_id.get()],
        from_row,
    )
    .optional()
    .map_err(|e| map_error(e, "load provider"))?
    .ok_or_else(|| Error::NotFound(format!("Storage provider {}", id)))
}

/// Repository for provider records.
#[derive(Clone)]
pub struct ProviderStore {
    db: Database,
}

impl ProviderStore {
    /// Create a store over a database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a provider.
    ///
    /// # Errors
    /// - `AlreadyExists` if the owner already has a provider with this name
    pub fn insert(&self, new: NewProvider) -> Result<ProviderRecord> {
        let config = new.config.to_json()?;
        self.db.write_transaction(|tx| {
            if new.is_default {
                clear_defaults(tx, new.user_id, None)?;
            }
            let now = timestamp(Utc::now());
            tx.execute(
                "INSERT INTO storage_providers
                 (user_id, name, provider_type, is_default, is_active, config,
                  encrypted_credentials, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.user_id.get(),
                    new.name,
                    new.provider_type,
                    new.is_default,
                    new.is_active,
                    config,
                    new.encrypted_credentials.as_bytes(),
                    now,
                ],
            )
            .map_err(|e| map_error(e, &format!("Storage provider named '{}'", new.name)))?;
            fetch(tx, new.user_id, ProviderId(tx.last_insert_rowid()))
        })
    }

    /// Load one of the user's providers.
    ///
    /// # Errors
    /// - `NotFound` if the provider does not exist or belongs to someone else
    pub fn get(&self, user_id: UserId, id: ProviderId) -> Result<ProviderRecord> {
        fetch(&self.db.conn(), user_id, id)
    }

    /// Load a provider by id regardless of owner.
    pub fn get_by_id(&self, id: ProviderId) -> Result<ProviderRecord> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {} FROM storage_providers WHERE id = ?1", COLUMNS),
                params![id.get()],
                from_row,
            )
            .optional()
            .map_err(|e| map_error(e, "load provider"))?
            .ok_or_else(|| Error::NotFound(format!("Storage provider {}", id)))
    }

    /// The user's providers, default first, then newest first.
    pub fn list(&self, user_id: UserId) -> Result<Vec<ProviderRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM storage_providers WHERE user_id = ?1
                 ORDER BY is_default DESC, created_at DESC, id DESC",
                COLUMNS
            ))
            .map_err(|e| map_error(e, "list providers"))?;
        let rows = stmt
            .query_map(params![user_id.get()], from_row)
            .map_err(|e| map_error(e, "list providers"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_error(e, "list providers"))
    }

    /// The user's default provider if it is active.
    pub fn active_default(&self, user_id: UserId) -> Result<Option<ProviderRecord>> {
        self.db
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM storage_providers
                     WHERE user_id = ?1 AND is_default = 1 AND is_active = 1",
                    COLUMNS
                ),
                params![user_id.get()],
                from_row,
            )
            .optional()
            .map_err(|e| map_error(e, "load default provider"))
    }

    /// Persist every mutable field of `record`.
    ///
    /// # Errors
    /// - `NotFound` if the record no longer exists for its owner
    /// - `AlreadyExists` if the new name clashes with another provider
    pub fn update(&self, record: &ProviderRecord) -> Result<ProviderRecord> {
        let config = record.config.to_json()?;
        self.db.write_transaction(|tx| {
            if record.is_default {
                clear_defaults(tx, record.user_id, Some(record.id))?;
            }
            let changed = tx
                .execute(
                    "UPDATE storage_providers
                     SET name = ?1, is_default = ?2, is_active = ?3, config = ?4,
                         encrypted_credentials = ?5, updated_at = ?6
                     WHERE id = ?7 AND user_id = ?8",
                    params![
                        record.name,
                        record.is_default,
                        record.is_active,
                        config,
                        record.encrypted_credentials.as_bytes(),
                        timestamp(Utc::now()),
                        record.id.get(),
                        record.user_id.get(),
                    ],
                )
                .map_err(|e| map_error(e, &format!("Storage provider named '{}'", record.name)))?;
            if changed == 0 {
                return Err(Error::NotFound(format!("Storage provider {}", record.id)));
            }
            fetch(tx, record.user_id, record.id)
        })
    }

    /// Make `id` the user's only default provider.
    ///
    /// # Errors
    /// - `NotFound` if the provider does not exist or belongs to someone else
    pub fn set_default(&self, user_id: UserId, id: ProviderId) -> Result<ProviderRecord> {
        self.db.write_transaction(|tx| {
            fetch(tx, user_id, id)?;
            clear_defaults(tx, user_id, Some(id))?;
            tx.execute(
                "UPDATE storage_providers SET is_default = 1, updated_at = ?1
                 WHERE id = ?2 AND user_id = ?3",
                params![timestamp(Utc::now()), id.get(), user_id.get()],
            )
            .map_err(|e| map_error(e, "set default provider"))?;
            fetch(tx, user_id, id)
        })
    }

    /// Delete one of the user's providers.
    ///
    /// # Errors
    /// - `NotFound` if the provider does not exist or belongs to someone else
    /// - `Protected` while images still reference it
    pub fn delete(&self, user_id: UserId, id: ProviderId) -> Result<()> {
        let context = format!("Storage provider {}", id);
        self.db.write_transaction(|tx| {
            fetch(tx, user_id, id)?;
            let referenced: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM images WHERE storage_provider_id = ?1)",
                    params![id.get()],
                    |row| row.get(0),
                )
                .map_err(|e| map_error(e, &context))?;
            if referenced {
                return Err(Error::Protected(format!(
                    "{} is still used by stored images",
                    context
                )));
            }
            tx.execute(
                "DELETE FROM storage_providers WHERE id = ?1 AND user_id = ?2",
                params![id.get(), user_id.get()],
            )
            .map_err(|e| map_error(e, &context))?;
            Ok(())
        })
    }
}
