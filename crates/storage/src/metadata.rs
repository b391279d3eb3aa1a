//! Reserved metadata stores
//!
//! Durable engine metadata (collection catalog entries, the replica-set
//! config document, coordinator records for in-progress cross-shard
//! transactions) lives in reserved record stores, addressed by string key.
//! Values are serde-serialized with bincode by the typed accessors.

use crate::traits::{Direction, RecordStore, StorageEngine};
use crate::uow::UnitOfWork;
use parking_lot::Mutex;
use rook_core::{Document, Error, RecordId, Result, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Ident of the store enumerating collections and indexes.
pub const CATALOG_IDENT: &str = "_rook_catalog";
/// Ident of the store holding the replica-set configuration document.
pub const REPL_CONFIG_IDENT: &str = "_rook_replset";
/// Ident of the store holding one document per in-progress cross-shard
/// transaction this node coordinates.
pub const COORDINATOR_IDENT: &str = "_rook_coordinators";

/// String-keyed durable metadata over a reserved record store.
pub struct MetadataStore {
    rs: Arc<dyn RecordStore>,
    /// key → record id of the row that holds it.
    rids: Mutex<HashMap<String, RecordId>>,
}

impl MetadataStore {
    /// Open (and if necessary create) the reserved store `ident`.
    pub fn open(engine: &dyn StorageEngine, ident: &str) -> Self {
        let rs = engine.get_or_create_record_store(ident);
        let mut rids = HashMap::new();
        let mut cursor = rs.cursor(Direction::Forward);
        while let Some((rid, doc)) = cursor.next() {
            if let Some(Value::String(key)) = doc.get("_k") {
                rids.insert(key.clone(), rid);
            }
        }
        Self {
            rs,
            rids: Mutex::new(rids),
        }
    }

    /// Store raw bytes under `key`, replacing any existing row.
    pub fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut doc = Document::new();
        doc.push("_k", key);
        doc.push("_v", Value::Binary(bytes));

        let mut uow = UnitOfWork::new();
        let mut rids = self.rids.lock();
        if let Some(rid) = rids.get(key).copied() {
            self.rs.update(&mut uow, rid, doc)?;
        } else {
            let rid = self.rs.insert(&mut uow, doc)?;
            rids.insert(key.to_string(), rid);
        }
        drop(rids);
        uow.commit();
        Ok(())
    }

    /// Read raw bytes stored under `key`.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let rid = *self.rids.lock().get(key)?;
        let doc = self.rs.find(rid)?;
        match doc.get("_v") {
            Some(Value::Binary(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Delete the row under `key`. Returns true when a row existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut rids = self.rids.lock();
        let Some(rid) = rids.remove(key) else {
            return Ok(false);
        };
        let mut uow = UnitOfWork::new();
        self.rs.remove(&mut uow, rid)?;
        uow.commit();
        Ok(true)
    }

    /// All keys with the given prefix.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .rids
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Serialize `value` and store it under `key`.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| Error::internal(format!("metadata encode failed: {}", e)))?;
        self.put_bytes(key, bytes)
    }

    /// Load and deserialize the value under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_bytes(key) {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::internal(format!("metadata decode failed: {}", e))),
        }
    }
}
