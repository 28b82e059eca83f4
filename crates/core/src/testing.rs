//! Minimal in-memory store for unit tests in this crate.

use crate::error::Result;
use crate::identity::IdentityMap;
use crate::managed::ManagedObject;
use crate::token::Token;
use crate::traits::{ObjectStore, OpenMode};
use crate::types::{ObjectStoreId, StoredObjectId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Store that counts how often object bytes are loaded.
pub(crate) struct CountingStore {
    id: ObjectStoreId,
    identity: IdentityMap,
    objects: DashMap<StoredObjectId, Vec<u8>>,
    loads: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<CountingStore>| {
            let store: Weak<dyn ObjectStore> = weak.clone();
            CountingStore {
                id: ObjectStoreId(id),
                identity: IdentityMap::new(ObjectStoreId(id), store),
                objects: DashMap::new(),
                loads: AtomicUsize::new(0),
            }
        })
    }

    pub(crate) fn put_raw(&self, id: StoredObjectId, bytes: Vec<u8>) {
        self.objects.insert(id, bytes);
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn identity(&self) -> &IdentityMap {
        &self.identity
    }
}

impl ObjectStore for CountingStore {
    fn identifier(&self) -> ObjectStoreId {
        self.id
    }

    fn name(&self) -> &str {
        "counting"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn allocate(&self, object: &Arc<ManagedObject>) -> Result<Token> {
        self.identity.allocate(object)
    }

    fn like(&self, id: StoredObjectId) -> Token {
        self.identity.like(id)
    }

    fn contains(&self, id: StoredObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    fn load(&self, id: StoredObjectId) -> Result<Option<Vec<u8>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Widen the race window for concurrent loaders
        thread::sleep(Duration::from_millis(10));
        Ok(self.objects.get(&id).map(|bytes| bytes.clone()))
    }

    fn add(&self, object: &ManagedObject, _requires_current_checkpoint: bool) -> Result<()> {
        if let Some(token) = object.token() {
            self.objects.insert(token.object_id(), object.payload());
        }
        Ok(())
    }

    fn remove(&self, token: &Token, _requires_current_checkpoint: bool) -> Result<()> {
        self.objects.remove(&token.object_id());
        Ok(())
    }

    fn reserve(&self, _delta: i64, _pacing: bool) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn open(&self, _mode: OpenMode) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.identity.invalidate_all();
        Ok(())
    }

    fn tokens(&self) -> HashSet<Token> {
        self.identity.tokens()
    }
}
