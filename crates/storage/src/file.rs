//! Persistent single-file object store.
//!
//! Committed objects are kept in memory and written out as a whole by
//! [`flush`](ObjectStore::flush), which the checkpoint coordinator calls
//! between `CheckpointStart` and `CheckpointEnd`. The file therefore only
//! ever holds committed data, and everything committed after the last
//! flush is redone from the log at warm start.
//!
//! # Flush
//!
//! Adds and removes share a read lock that the flush takes exclusively
//! while it copies the table, so the snapshot is a single point in time:
//! a change made before the flush started is in it.

use crate::config::StoreConfig;
use crate::snapshot::{self, snapshot_path};
use crate::table::{ObjectTable, StoreCounters};
use objmgr_core::{
    ManagedObject, ObjectStore, ObjectStoreId, OpenMode, Result, StoredObjectId, Token,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info};

/// Object store persisted to one snapshot file.
pub struct FileObjectStore {
    path: PathBuf,
    table: ObjectTable,
    flush_lock: RwLock<()>,
}

impl FileObjectStore {
    /// Create a store whose file lives in `dir`. Nothing is read until
    /// the store is opened.
    pub fn new(dir: &Path, config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(dir)?;
        let path = snapshot_path(dir, &config.name);
        Ok(Arc::new_cyclic(|weak: &Weak<FileObjectStore>| {
            let store: Weak<dyn ObjectStore> = weak.clone();
            FileObjectStore {
                path,
                table: ObjectTable::new(config, store),
                flush_lock: RwLock::new(()),
            }
        }))
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
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

    fn remove_file(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl ObjectStore for FileObjectStore {
    fn identifier(&self) -> ObjectStoreId {
        self.table.id()
    }

    fn name(&self) -> &str {
        &self.table.config().name
    }

    fn is_persistent(&self) -> bool {
        true
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
        let _guard = self.flush_lock.read();
        self.table.add(object, requires_current_checkpoint)
    }

    fn remove(&self, token: &Token, requires_current_checkpoint: bool) -> Result<()> {
        let _guard = self.flush_lock.read();
        self.table.remove(token, requires_current_checkpoint)
    }

    fn reserve(&self, delta: i64, pacing: bool) -> Result<()> {
        self.table.reserve(delta, pacing)
    }

    fn flush(&self) -> Result<()> {
        let started = Instant::now();
        let (bytes, objects) = {
            let _guard = self.flush_lock.write();
            let entries = self.table.snapshot();
            let bytes = snapshot::encode(
                self.table.id(),
                self.table.identity().sequence(),
                &entries,
            );
            (bytes, entries.len())
        };
        snapshot::write_atomic(&self.path, &bytes)?;
        self.table.count_flush();
        debug!(
            target: "objmgr::store",
            store = %self.name(),
            objects,
            bytes = bytes.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Flushed store"
        );
        Ok(())
    }

    fn open(&self, mode: OpenMode) -> Result<()> {
        Self::remove_file(&self.path.with_extension("store.tmp"))?;
        match mode {
            OpenMode::Cold => {
                Self::remove_file(&self.path)?;
                self.table.replace_all(Vec::new(), 0);
                info!(target: "objmgr::store", store = %self.name(), "Opened empty file store");
            }
            OpenMode::Warm => {
                let loaded = snapshot::read(&self.path, self.table.id())?;
                let (entries, sequence) = loaded
                    .map(|s| (s.entries, s.sequence))
                    .unwrap_or_default();
                let objects = entries.len();
                self.table.replace_all(entries, sequence);
                info!(
                    target: "objmgr::store",
                    store = %self.name(),
                    objects,
                    sequence = self.table.identity().sequence(),
                    "Loaded file store"
                );
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.table.close();
        debug!(target: "objmgr::store", store = %self.name(), "Closed file store");
        Ok(())
    }

    fn tokens(&self) -> HashSet<Token> {
        self.table.tokens()
    }
}
