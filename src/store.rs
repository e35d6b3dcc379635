//! Durable string-keyed local store used as the fallback/cache layer.
//!
//! Every operation is infallible from the caller's point of view: store
//! errors are logged and swallowed, unreadable values read as absent.

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::db;
use crate::error::FacadeError;

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// True when values survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Workspace-backed store (`kv` table of the workspace database).
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Option<String> {
        match db::kv_get(&self.conn, key) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "kv read failed");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = db::kv_set(&self.conn, key, value) {
            tracing::warn!(key, error = %e, "kv write failed");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = db::kv_remove(&self.conn, key) {
            tracing::warn!(key, error = %e, "kv delete failed");
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        db::kv_keys_with_prefix(&self.conn, prefix).unwrap_or_else(|e| {
            tracing::warn!(prefix, error = %e, "kv scan failed");
            Vec::new()
        })
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Process-local store, used until a workspace is selected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn is_durable(&self) -> bool {
        false
    }
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            let e = FacadeError::Serialization(e.to_string());
            tracing::debug!(key, error = %e, "cached value unreadable; treating as empty");
            None
        }
    }
}

pub fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => store.set(key, &raw),
        Err(e) => tracing::warn!(key, error = %e, "value not serializable; cache left unchanged"),
    }
}
