//! SQLite key/value store holding the encrypted blobs.
//!
//! Every value is written with a single upsert, so a blob is either replaced
//! whole or left as it was. Changes spanning several keys go through
//! [`BlobStore::replace_all`], which commits them in one transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::{StorageError, StorageResult};

const UPSERT: &str = r#"
    INSERT INTO secure_storage (key, value) VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#;

/// Current schema version.
#[cfg(test)]
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Thin wrapper over the `secure_storage` table.
pub struct BlobStore {
    conn: Connection,
}

impl BlobStore {
    /// Open or create a store at the given path.
    ///
    /// The parent directory is created if missing. Pending migrations run on
    /// open.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StorageResult<i32> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn run_migrations(&mut self) -> StorageResult<()> {
        let current_version = self.schema_version()?;

        if current_version < 1 {
            self.migrate_v1()?;
        }

        Ok(())
    }

    /// Migration to version 1: Initial schema.
    fn migrate_v1(&mut self) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secure_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            [],
        )?;

        tx.execute("PRAGMA user_version = 1", [])?;

        tx.commit()?;
        Ok(())
    }

    /// Get the value stored under `key`.
    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM secure_storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.conn.execute(UPSERT, params![key, value])?;
        Ok(())
    }

    /// Apply several changes atomically.
    ///
    /// `Some(value)` stores the value under the key and `None` deletes the
    /// key. If any statement fails the transaction rolls back and the store
    /// is left exactly as it was.
    pub fn replace_all(&mut self, changes: &[(&str, Option<&str>)]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        for &(key, value) in changes {
            match value {
                Some(value) => tx.execute(UPSERT, params![key, value])?,
                None => tx.execute("DELETE FROM secure_storage WHERE key = ?1", params![key])?,
            };
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete every stored value.
    pub fn clear(&self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM secure_storage", [])?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}
