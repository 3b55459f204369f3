//! Storage seams used by the workers and the master-lookup service.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{Key, Metadata, Record};

/// Record storage as seen by the execution pipeline. Concurrent writers are
/// excluded by the scheduler's logical locks, so implementations only need
/// to be internally consistent per call.
pub trait Storage: Send + Sync {
    fn read(&self, key: &Key) -> Option<Record>;
    fn write(&self, key: &Key, record: Record);
    fn delete(&self, key: &Key) -> bool;
}

/// Mastership lookup used by the server to answer forwarder queries.
pub trait MasterLookup: Send + Sync {
    fn master_metadata(&self, key: &Key) -> Option<Metadata>;
}

/// In-memory storage engine.
#[derive(Debug, Default)]
pub struct MemStorage {
    table: RwLock<HashMap<Key, Record>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &Key) -> Option<Record> {
        self.table.read().expect("storage lock poisoned").get(key).cloned()
    }

    fn write(&self, key: &Key, record: Record) {
        self.table
            .write()
            .expect("storage lock poisoned")
            .insert(key.clone(), record);
    }

    fn delete(&self, key: &Key) -> bool {
        self.table
            .write()
            .expect("storage lock poisoned")
            .remove(key)
            .is_some()
    }
}

impl MasterLookup for MemStorage {
    fn master_metadata(&self, key: &Key) -> Option<Metadata> {
        self.table
            .read()
            .expect("storage lock poisoned")
            .get(key)
            .map(|record| record.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_delete() {
        let storage = MemStorage::new();
        let key = Key::from("A");
        assert!(storage.read(&key).is_none());

        storage.write(&key, Record::new("valA", 0, 0));
        assert_eq!(storage.read(&key).unwrap().value, "valA");
        assert_eq!(storage.master_metadata(&key), Some(Metadata::new(0, 0)));

        assert!(storage.delete(&key));
        assert!(!storage.delete(&key));
        assert!(storage.read(&key).is_none());
    }
}
