//! Object table shared by the store implementations.
//!
//! Holds the committed bytes of every stored object, the identity map
//! that hands out tokens, and the space account. The stores add what is
//! specific to them (a snapshot file, nothing at all) around it.

use crate::config::StoreConfig;
use crate::space::SpaceAccount;
use dashmap::DashMap;
use objmgr_core::{
    Error, IdentityMap, ManagedObject, ObjectStore, ObjectStoreId, Result, StoredObjectId, Token,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Cumulative store counters.
///
/// These accumulate over the lifetime of the store and are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounters {
    /// Objects stored by committing transactions
    pub adds: u64,
    /// Objects removed by committing transactions
    pub removes: u64,
    /// Objects loaded into memory through their tokens
    pub loads: u64,
    /// Flushes that made the contents durable
    pub flushes: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    adds: AtomicU64,
    removes: AtomicU64,
    loads: AtomicU64,
    flushes: AtomicU64,
}

/// Committed objects, tokens and space of one store.
pub(crate) struct ObjectTable {
    config: StoreConfig,
    identity: IdentityMap,
    objects: DashMap<StoredObjectId, Vec<u8>>,
    space: SpaceAccount,
    counters: AtomicCounters,
    closed: AtomicBool,
}

impl ObjectTable {
    pub(crate) fn new(config: StoreConfig, store: Weak<dyn ObjectStore>) -> Self {
        let id = config.store_id();
        ObjectTable {
            identity: IdentityMap::new(id, store),
            objects: DashMap::new(),
            space: SpaceAccount::new(id, config.capacity, config.full_policy),
            counters: AtomicCounters::default(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn id(&self) -> ObjectStoreId {
        self.config.store_id()
    }

    pub(crate) fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub(crate) fn space(&self) -> &SpaceAccount {
        &self.space
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn counters(&self) -> StoreCounters {
        StoreCounters {
            adds: self.counters.adds.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_flush(&self) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state(
                format!("object store {}", self.config.name),
                "Closed",
                operation,
            ));
        }
        Ok(())
    }

    pub(crate) fn allocate(&self, object: &Arc<ManagedObject>) -> Result<Token> {
        self.check_open("allocate in")?;
        self.identity.allocate(object)
    }

    pub(crate) fn contains(&self, id: StoredObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub(crate) fn load(&self, id: StoredObjectId) -> Result<Option<Vec<u8>>> {
        self.check_open("load from")?;
        let bytes = self.objects.get(&id).map(|entry| entry.value().clone());
        if bytes.is_some() {
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(bytes)
    }

    pub(crate) fn add(&self, object: &ManagedObject, requires_current_checkpoint: bool) -> Result<()> {
        self.check_open("add to")?;
        let token = object.token().ok_or_else(|| {
            Error::invalid_state("object without token", object.state(), "store")
        })?;
        if token.store_id() != self.id() {
            return Err(Error::UnknownStore(token.store_id()));
        }

        let payload = object.payload();
        let new_len = payload.len() as u64;
        let old_len = self
            .objects
            .insert(token.object_id(), payload)
            .map_or(0, |old| old.len() as u64);
        self.space.replace_used(old_len, new_len);
        self.counters.adds.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "objmgr::store",
            store = %self.config.name,
            object = %token.id(),
            len = new_len,
            requires_current_checkpoint,
            "Stored object"
        );
        Ok(())
    }

    pub(crate) fn remove(&self, token: &Token, requires_current_checkpoint: bool) -> Result<()> {
        self.check_open("remove from")?;
        if let Some((_, old)) = self.objects.remove(&token.object_id()) {
            self.space.replace_used(old.len() as u64, 0);
            self.counters.removes.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "objmgr::store",
                store = %self.config.name,
                object = %token.id(),
                requires_current_checkpoint,
                "Removed object"
            );
        }
        Ok(())
    }

    pub(crate) fn reserve(&self, delta: i64, pacing: bool) -> Result<()> {
        if delta > 0 {
            self.check_open("reserve in")?;
        }
        self.space.reserve(delta, pacing)
    }

    /// Copy of every stored object, ordered by identity.
    pub(crate) fn snapshot(&self) -> Vec<(StoredObjectId, Vec<u8>)> {
        let mut entries: Vec<_> = self
            .objects
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    /// Replace the contents, e.g. with a snapshot read back from disk.
    pub(crate) fn replace_all(&self, entries: Vec<(StoredObjectId, Vec<u8>)>, sequence: u64) {
        self.objects.clear();
        let mut used = 0;
        let mut highest = sequence;
        for (id, bytes) in entries {
            used += bytes.len() as u64;
            highest = highest.max(id.0);
            self.objects.insert(id, bytes);
        }
        self.space.reset(used);
        self.identity.set_sequence(highest);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.identity.invalidate_all();
    }

    pub(crate) fn tokens(&self) -> HashSet<Token> {
        self.identity.tokens()
    }
}
