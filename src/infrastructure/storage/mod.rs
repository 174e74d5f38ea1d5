//! Persistent key-value storage scoped per extension

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::application::errors::StorageError;

/// SQLite-backed key-value store. Each extension sees its own namespace;
/// keys are unique per extension.
pub struct ExtensionStore {
    conn: Mutex<Connection>,
}

impl ExtensionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ext_storage (
                ext TEXT NOT NULL,
                k   TEXT NOT NULL,
                v   TEXT NOT NULL,
                PRIMARY KEY (ext, k)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, ext: &str, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::NotFound("storage lock poisoned".to_string()))?;
        let value = conn
            .query_row(
                "SELECT v FROM ext_storage WHERE ext = ?1 AND k = ?2",
                params![ext, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, ext: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::NotFound("storage lock poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO ext_storage (ext, k, v) VALUES (?1, ?2, ?3)
             ON CONFLICT (ext, k) DO UPDATE SET v = excluded.v",
            params![ext, key, value],
        )?;
        debug!("storage set {}/{}", ext, key);
        Ok(())
    }

    pub fn remove(&self, ext: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::NotFound("storage lock poisoned".to_string()))?;
        let n = conn.execute(
            "DELETE FROM ext_storage WHERE ext = ?1 AND k = ?2",
            params![ext, key],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let store = ExtensionStore::open_in_memory().unwrap();
        store.set("story", "count", "42").unwrap();
        assert_eq!(store.get("story", "count").unwrap().as_deref(), Some("42"));
        assert_eq!(store.get("story", "missing").unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = ExtensionStore::open_in_memory().unwrap();
        store.set("story", "k", "a").unwrap();
        store.set("deck", "k", "b").unwrap();
        assert_eq!(store.get("story", "k").unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("deck", "k").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn set_overwrites_and_remove_deletes() {
        let store = ExtensionStore::open_in_memory().unwrap();
        store.set("story", "k", "a").unwrap();
        store.set("story", "k", "b").unwrap();
        assert_eq!(store.get("story", "k").unwrap().as_deref(), Some("b"));
        assert!(store.remove("story", "k").unwrap());
        assert!(!store.remove("story", "k").unwrap());
        assert_eq!(store.get("story", "k").unwrap(), None);
    }
}
