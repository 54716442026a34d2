//! Shared fixtures for integration scenarios

use coalesce::{EntityStore, OpenStore, Record, SqliteStore};
use serde_json::Value;
use std::sync::Arc;

/// Fresh in-memory store.
pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().expect("in-memory store"))
}

/// Insert `(id, payload)` rows into a collection.
pub fn insert(store: &Arc<SqliteStore>, collection: &str, rows: &[(&str, Value)]) {
    let records: Vec<Record> = rows
        .iter()
        .map(|(id, payload)| Record::from_value(*id, payload.clone()))
        .collect();
    store
        .insert_many(collection, &records)
        .expect("seed records");
}
