//! Crash and Restart Tests for objmgr-engine
//!
//! These tests verify that a warm start rebuilds exactly the committed state:
//!
//! 1. **Commit vs Backout** - committed adds survive a restart, backed out ones never appear
//! 2. **Orphans** - a unit of work with no outcome in the log is backed out
//! 3. **Two-Phase Commit** - a prepared unit is backed out at recovery
//! 4. **Optimistic Replace** - one record, all or none of its changes after replay
//! 5. **Checkpoints** - truncation keeps open units recoverable through their restatement
//! 6. **User Records** - handed back to the handler during replay
//!
//! A crash is simulated by forgetting the object manager and any open
//! transaction handles, so nothing is backed out, flushed or closed.

use objmgr_concurrency::{OptimisticUpdate, TransactionCallback};
use objmgr_core::{LogicalUnitOfWork, ManagedObject, ObjectStore, Result, StoredObjectId};
use objmgr_engine::{ManagerState, ObjectManager, ObjectManagerConfig, UserRecordHandler};
use objmgr_storage::{FileObjectStore, StoreConfig};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open(dir: &Path) -> (ObjectManager, Arc<FileObjectStore>) {
    open_with(dir, ObjectManagerConfig::for_testing())
}

fn open_with(dir: &Path, config: ObjectManagerConfig) -> (ObjectManager, Arc<FileObjectStore>) {
    let store = FileObjectStore::new(dir, StoreConfig::new(1, "durable")).unwrap();
    let manager = ObjectManager::builder(dir)
        .with_config(config)
        .with_store(store.clone())
        .open()
        .unwrap();
    (manager, store)
}

fn stored(store: &FileObjectStore, id: StoredObjectId) -> Option<Vec<u8>> {
    store
        .get(&store.like(id))
        .unwrap()
        .map(|object| object.payload())
}

/// Allocate and add one object per payload; returns their identities.
fn add_all(
    store: &Arc<FileObjectStore>,
    txn: &objmgr_concurrency::Transaction,
    payloads: &[&str],
) -> Vec<StoredObjectId> {
    payloads
        .iter()
        .map(|payload| {
            let object = ManagedObject::new(payload.as_bytes().to_vec());
            let token = store.allocate(&object).unwrap();
            txn.add(&object).unwrap();
            token.object_id()
        })
        .collect()
}

#[test]
fn test_committed_adds_survive_restart() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["A", "B"]);
        txn.commit(false).unwrap();
        manager.shutdown().unwrap();
        ids
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.state(), ManagerState::WarmStarted);
    assert_eq!(stored(&store, ids[0]), Some(b"A".to_vec()));
    assert_eq!(stored(&store, ids[1]), Some(b"B".to_vec()));
}

#[test]
fn test_committed_adds_survive_crash() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["A", "B"]);
        txn.commit(false).unwrap();
        std::mem::forget(manager);
        ids
    };

    let (manager, store) = open(dir.path());
    let stats = manager.recovery_stats().unwrap();
    assert_eq!(stats.units_seen, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.orphans, 0);
    assert_eq!(stored(&store, ids[0]), Some(b"A".to_vec()));
    assert_eq!(stored(&store, ids[1]), Some(b"B".to_vec()));
}

#[test]
fn test_backed_out_adds_never_stored() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["A", "B"]);
        txn.backout(false).unwrap();
        assert_eq!(stored(&store, ids[0]), None);
        assert_eq!(stored(&store, ids[1]), None);
        std::mem::forget(manager);
        ids
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.recovery_stats().unwrap().backed_out, 1);
    assert_eq!(stored(&store, ids[0]), None);
    assert_eq!(stored(&store, ids[1]), None);
    assert!(store.is_empty());
}

#[test]
fn test_orphaned_add_is_backed_out() {
    let dir = TempDir::new().unwrap();
    let id = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["orphan"]);
        // Any forced write puts the add on disk
        manager.write_user_record(b"marker".to_vec()).unwrap();
        std::mem::forget(txn);
        std::mem::forget(manager);
        ids[0]
    };

    let (manager, store) = open(dir.path());
    let stats = manager.recovery_stats().unwrap();
    assert_eq!(stats.orphans, 1);
    assert_eq!(stats.backed_out, 1);
    assert_eq!(stats.committed, 0);
    assert_eq!(stored(&store, id), None);
    assert_eq!(manager.active_transactions(), 0);
}

#[test]
fn test_replaced_object_reverts_when_orphaned() {
    let dir = TempDir::new().unwrap();
    let id = {
        let (manager, store) = open(dir.path());
        let setup = manager.begin().unwrap();
        let object = ManagedObject::new(b"before".to_vec());
        let token = store.allocate(&object).unwrap();
        setup.add(&object).unwrap();
        setup.commit(false).unwrap();

        let txn = manager.begin().unwrap();
        txn.lock(&object).unwrap();
        object.set_payload(b"after".to_vec());
        txn.replace(&object).unwrap();
        manager.write_user_record(Vec::new()).unwrap();
        std::mem::forget(txn);
        std::mem::forget(manager);
        token.object_id()
    };

    let (_manager, store) = open(dir.path());
    assert_eq!(stored(&store, id), Some(b"before".to_vec()));
}

#[test]
fn test_committed_delete_survives_crash() {
    let dir = TempDir::new().unwrap();
    let (kept, deleted) = {
        let (manager, store) = open(dir.path());
        let setup = manager.begin().unwrap();
        let keep = ManagedObject::new(b"keep".to_vec());
        let doomed = ManagedObject::new(b"doomed".to_vec());
        let kept = store.allocate(&keep).unwrap().object_id();
        let deleted = store.allocate(&doomed).unwrap().object_id();
        setup.add(&keep).unwrap();
        setup.add(&doomed).unwrap();
        setup.commit(false).unwrap();
        manager.checkpoint().unwrap();

        let txn = manager.begin().unwrap();
        txn.delete(&doomed).unwrap();
        txn.commit(false).unwrap();
        std::mem::forget(manager);
        (kept, deleted)
    };

    let (_manager, store) = open(dir.path());
    assert_eq!(stored(&store, kept), Some(b"keep".to_vec()));
    assert_eq!(stored(&store, deleted), None);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, LogicalUnitOfWork)>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

impl TransactionCallback for Recorder {
    fn post_commit(&self, unit: &LogicalUnitOfWork) {
        self.events.lock().push(("post_commit".to_string(), unit.clone()));
    }

    fn post_backout(&self, unit: &LogicalUnitOfWork) {
        self.events.lock().push(("post_backout".to_string(), unit.clone()));
    }

    fn recovery_completed(&self, unit: &LogicalUnitOfWork) {
        self.events
            .lock()
            .push(("recovery_completed".to_string(), unit.clone()));
    }
}

#[test]
fn test_prepared_unit_is_backed_out_at_recovery() {
    let dir = TempDir::new().unwrap();
    let (id, unit) = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        txn.set_xid(b"branch-7".to_vec()).unwrap();
        let ids = add_all(&store, &txn, &["in doubt"]);
        txn.prepare().unwrap();
        let unit = txn.unit().unwrap();
        std::mem::forget(txn);
        std::mem::forget(manager);
        (ids[0], unit)
    };

    let recorder = Arc::new(Recorder::default());
    let store = FileObjectStore::new(dir.path(), StoreConfig::new(1, "durable")).unwrap();
    let manager = ObjectManager::builder(dir.path())
        .with_config(ObjectManagerConfig::for_testing())
        .with_store(store.clone())
        .with_recovery_callback(recorder.clone())
        .open()
        .unwrap();

    let stats = manager.recovery_stats().unwrap();
    assert_eq!(stats.in_doubt, 1);
    assert_eq!(stats.backed_out, 1);
    assert_eq!(stored(&store, id), None);
    assert_eq!(recorder.events(), vec!["recovery_completed", "post_backout"]);
    let recovered = recorder.events.lock()[0].1.clone();
    assert_eq!(recovered, unit);
    assert_eq!(recovered.xid.as_deref(), Some(&b"branch-7"[..]));
}

#[test]
fn test_new_units_do_not_reuse_recovered_ids() {
    let dir = TempDir::new().unwrap();
    let old_unit = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        add_all(&store, &txn, &["x"]);
        let unit = txn.unit().unwrap();
        txn.commit(false).unwrap();
        std::mem::forget(manager);
        unit
    };

    let (manager, _store) = open(dir.path());
    let txn = manager.begin().unwrap();
    assert!(txn.unit().unwrap().id > old_unit.id);
}

#[test]
fn test_optimistic_replace_all_applied_after_crash() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let objects: Vec<_> = (0..3u8)
            .map(|i| ManagedObject::new(vec![i; 10]))
            .collect();
        let ids: Vec<_> = objects
            .iter()
            .map(|object| store.allocate(object).unwrap().object_id())
            .collect();
        let update = objects
            .iter()
            .fold(OptimisticUpdate::new(), |update, object| update.add(object));

        let txn = manager.begin().unwrap();
        txn.optimistic_replace(&update).unwrap();
        txn.commit(false).unwrap();
        std::mem::forget(manager);
        ids
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.recovery_stats().unwrap().committed, 1);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(stored(&store, *id), Some(vec![i as u8; 10]));
    }
}

#[test]
fn test_optimistic_replace_none_applied_when_never_forced() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let objects: Vec<_> = (0..3u8)
            .map(|i| ManagedObject::new(vec![i; 10]))
            .collect();
        let ids: Vec<_> = objects
            .iter()
            .map(|object| store.allocate(object).unwrap().object_id())
            .collect();
        let update = objects
            .iter()
            .fold(OptimisticUpdate::new(), |update, object| update.add(object));

        let txn = manager.begin().unwrap();
        txn.optimistic_replace(&update).unwrap();
        // The record is still in the page buffer when the process dies
        std::mem::forget(txn);
        std::mem::forget(manager);
        ids
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.recovery_stats().unwrap().units_seen, 0);
    for id in ids {
        assert_eq!(stored(&store, id), None);
    }
}

#[test]
fn test_checkpointed_units_are_not_replayed() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open(dir.path());
        let mut ids = Vec::new();
        for round in 0..5 {
            let txn = manager.begin().unwrap();
            ids.extend(add_all(&store, &txn, &[&round.to_string()]));
            txn.commit(false).unwrap();
            if round == 2 {
                manager.checkpoint().unwrap();
            }
        }
        std::mem::forget(manager);
        ids
    };

    let (manager, store) = open(dir.path());
    // The first three are in the store snapshot the checkpoint flushed
    assert_eq!(manager.recovery_stats().unwrap().committed, 2);
    for (round, id) in ids.into_iter().enumerate() {
        assert_eq!(stored(&store, id), Some(round.to_string().into_bytes()));
    }
}

#[test]
fn test_open_unit_survives_truncation_through_restatement() {
    let dir = TempDir::new().unwrap();
    let id = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["long lived"]);
        manager.checkpoint().unwrap();
        manager.checkpoint().unwrap();
        txn.commit(false).unwrap();
        std::mem::forget(manager);
        ids[0]
    };

    let (manager, store) = open(dir.path());
    let stats = manager.recovery_stats().unwrap();
    assert_eq!(stats.units_seen, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stored(&store, id), Some(b"long lived".to_vec()));
}

#[test]
fn test_restated_orphan_is_backed_out() {
    let dir = TempDir::new().unwrap();
    let id = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["never committed"]);
        manager.checkpoint().unwrap();
        std::mem::forget(txn);
        std::mem::forget(manager);
        ids[0]
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.recovery_stats().unwrap().orphans, 1);
    assert_eq!(stored(&store, id), None);
}

#[test]
fn test_shutdown_with_open_transaction_backs_it_out_next_time() {
    let dir = TempDir::new().unwrap();
    let id = {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        let ids = add_all(&store, &txn, &["open at shutdown"]);
        manager.shutdown().unwrap();
        assert!(txn.add(&ManagedObject::new(Vec::new())).is_err());
        ids[0]
    };

    let (manager, store) = open(dir.path());
    assert_eq!(manager.recovery_stats().unwrap().orphans, 1);
    assert_eq!(stored(&store, id), None);
}

#[derive(Default)]
struct Collect {
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl UserRecordHandler for Collect {
    fn replay(&self, payload: &[u8]) -> Result<()> {
        self.payloads.lock().push(payload.to_vec());
        Ok(())
    }
}

#[test]
fn test_user_records_replayed_in_order() {
    let dir = TempDir::new().unwrap();
    {
        let (manager, _store) = open(dir.path());
        manager.write_user_record(b"first".to_vec()).unwrap();
        manager.write_user_record(b"second".to_vec()).unwrap();
        std::mem::forget(manager);
    }

    let handler = Arc::new(Collect::default());
    let store = FileObjectStore::new(dir.path(), StoreConfig::new(1, "durable")).unwrap();
    let manager = ObjectManager::builder(dir.path())
        .with_config(ObjectManagerConfig::for_testing())
        .with_store(store)
        .with_user_record_handler(handler.clone())
        .open()
        .unwrap();

    assert_eq!(manager.recovery_stats().unwrap().user_records, 2);
    assert_eq!(
        *handler.payloads.lock(),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
}

#[test]
fn test_unknown_store_in_log_refuses_open() {
    let dir = TempDir::new().unwrap();
    {
        let (manager, store) = open(dir.path());
        let txn = manager.begin().unwrap();
        add_all(&store, &txn, &["x"]);
        txn.commit(false).unwrap();
        std::mem::forget(manager);
    }

    let other = FileObjectStore::new(dir.path(), StoreConfig::new(2, "other")).unwrap();
    let err = ObjectManager::builder(dir.path())
        .with_config(ObjectManagerConfig::for_testing())
        .with_store(other)
        .open()
        .unwrap_err();
    assert!(matches!(err, objmgr_core::Error::UnknownStore(_)));
}

#[test]
fn test_concurrent_commits_all_recovered() {
    const THREADS: usize = 4;
    const PER_THREAD: u8 = 10;

    let dir = TempDir::new().unwrap();
    let ids = {
        let (manager, store) = open_with(
            dir.path(),
            ObjectManagerConfig::for_testing().with_log_pages(512),
        );
        let ids = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let (manager, store, ids) = (&manager, &store, &ids);
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        let txn = manager.begin().unwrap();
                        let payload = format!("{}-{}", thread, i);
                        let id = add_all(store, &txn, &[payload.as_str()])[0];
                        txn.commit(false).unwrap();
                        ids.lock().push((id, payload.into_bytes()));
                    }
                });
            }
        });
        std::mem::forget(manager);
        ids.into_inner()
    };

    let (manager, store) = open_with(
        dir.path(),
        ObjectManagerConfig::for_testing().with_log_pages(512),
    );
    assert_eq!(
        manager.recovery_stats().unwrap().committed,
        (THREADS * PER_THREAD as usize) as u64
    );
    for (id, payload) in ids {
        assert_eq!(stored(&store, id), Some(payload));
    }
}
