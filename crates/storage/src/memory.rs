//! Non-persistent object store.
//!
//! Objects live only in memory. Changes to them are never logged, and
//! the store starts empty whichever way it is opened.

use crate::config::StoreConfig;
use crate::table::{ObjectTable, StoreCounters};
use objmgr_core::{
    ManagedObject, ObjectStore, ObjectStoreId, OpenMode, Result, StoredObjectId, Token,
};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Object store that keeps everything in memory.
pub struct MemoryObjectStore {
    table: ObjectTable,
}

impl MemoryObjectStore {
    /// Create a store. Fails if the configuration is invalid.
    pub fn new(config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|weak: &Weak<MemoryObjectStore>| {
            let store: Weak<dyn ObjectStore> = weak.clone();
            MemoryObjectStore {
                table: ObjectTable::new(config, store),
            }
        }))
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by stored objects.
    pub fn used(&self) -> u64 {
        self.table.space().used()
    }

    /// Bytes reserved for uncommitted objects.
    pub fn reserved(&self) -> u64 {
        self.table.space().reserved()
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> StoreCounters {
        self.table.counters()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn identifier(&self) -> ObjectStoreId {
        self.table.id()
    }

    fn name(&self) -> &str {
        &self.table.config().name
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn allocate(&self, object: &Arc<ManagedObject>) -> Result<Token> {
        self.table.allocate(object)
    }

    fn like(&self, id: StoredObjectId) -> Token {
        self.table.identity().like(id)
    }

    fn contains(&self, id: StoredObjectId) -> bool {
        self.table.contains(id)
    }

    fn load(&self, id: StoredObjectId) -> Result<Option<Vec<u8>>> {
        self.table.load(id)
    }

    fn add(&self, object: &ManagedObject, requires_current_checkpoint: bool) -> Result<()> {
        self.table.add(object, requires_current_checkpoint)
    }

    fn remove(&self, token: &Token, requires_current_checkpoint: bool) -> Result<()> {
        self.table.remove(token, requires_current_checkpoint)
    }

    fn reserve(&self, delta: i64, pacing: bool) -> Result<()> {
        self.table.reserve(delta, pacing)
    }

    fn flush(&self) -> Result<()> {
        self.table.count_flush();
        Ok(())
    }

    fn open(&self, mode: OpenMode) -> Result<()> {
        self.table.replace_all(Vec::new(), 0);
        debug!(target: "objmgr::store", store = %self.name(), ?mode, "Opened memory store");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.table.close();
        debug!(target: "objmgr::store", store = %self.name(), "Closed memory store");
        Ok(())
    }

    fn tokens(&self) -> HashSet<Token> {
        self.table.tokens()
    }
}
