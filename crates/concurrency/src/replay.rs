//! Rebuilding transactions from the log
//!
//! At warm start every data record is redone against a transaction that
//! stands in for the unit of work that wrote it. Redo puts the logged
//! contents into the resident object, locks it for the stand-in and
//! remembers the committed contents as the before-image, so the unit of
//! work can afterwards be committed or backed out like a live one.
//!
//! Stores are not touched by redo; only the commit that follows changes
//! them. Store space is not reserved again either.

use crate::internal::{Change, Inclusion, InternalTransaction, TxnInner};
use crate::reservation::{object_space, token_space};
use objmgr_core::{
    LogSequenceNumber, LogicalUnitOfWork, ManagedObject, ObjectState, Result, Token, TokenId, TransactionState,
    TransitionEvent,
};
use objmgr_durability::{OptimisticBatch, TransactionCheckpoint};
use tracing::trace;

impl InternalTransaction {
    /// Stand in for `unit`, the logged unit of work being replayed.
    pub fn adopt_unit(&self, unit: LogicalUnitOfWork) {
        self.inner.lock().unit = unit;
    }

    /// Redo an add record.
    pub fn redo_add(&self, token: &Token, payload: Vec<u8>, lsn: LogSequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::InvolvePersistent)?;
        self.redo_locked(&mut inner, token, Change::Add, payload, lsn)
    }

    /// Redo a replace record.
    pub fn redo_replace(
        &self,
        token: &Token,
        payload: Vec<u8>,
        lsn: LogSequenceNumber,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::InvolvePersistent)?;
        self.redo_locked(&mut inner, token, Change::Replace, payload, lsn)
    }

    /// Redo a delete record.
    pub fn redo_delete(&self, token: &Token, lsn: LogSequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::InvolvePersistent)?;
        self.redo_locked(&mut inner, token, Change::Delete, Vec::new(), lsn)
    }

    /// Redo an optimistic replace record. `resolve` turns logged
    /// identities back into tokens.
    pub fn redo_optimistic_replace<F>(
        &self,
        batch: &OptimisticBatch,
        lsn: LogSequenceNumber,
        resolve: F,
    ) -> Result<()>
    where
        F: Fn(TokenId) -> Result<Token>,
    {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::InvolveOptimisticPersistent)?;
        self.redo_batch(&mut inner, batch, lsn, &resolve)
    }

    /// Redo the restatement of a transaction written by a checkpoint.
    ///
    /// The recorded state decides how far the unit of work had got: a
    /// prepared one comes back prepared, and one caught between its
    /// commit or backout call and the terminal record comes back
    /// committing or backing out.
    pub fn redo_checkpoint<F>(
        &self,
        state: TransactionState,
        checkpoint: &TransactionCheckpoint,
        lsn: LogSequenceNumber,
        resolve: F,
    ) -> Result<()>
    where
        F: Fn(TokenId) -> Result<Token>,
    {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::InvolvePersistentFromCheckpoint)?;

        for object in &checkpoint.added {
            let token = resolve(object.token)?;
            self.redo_locked(&mut inner, &token, Change::Add, object.payload.clone(), lsn)?;
        }
        for object in &checkpoint.replaced {
            let token = resolve(object.token)?;
            self.redo_locked(&mut inner, &token, Change::Replace, object.payload.clone(), lsn)?;
        }
        for id in &checkpoint.deleted {
            let token = resolve(*id)?;
            self.redo_locked(&mut inner, &token, Change::Delete, Vec::new(), lsn)?;
        }
        self.redo_batch(&mut inner, &checkpoint.optimistic, lsn, &resolve)?;

        if state.is_committing() {
            inner.state = TransactionState::CommittingPersistent;
        } else if state.is_backing_out() {
            inner.state = TransactionState::BackingOutPersistent;
        } else if state.is_prepared() {
            inner.state = self.check(&inner, TransitionEvent::Prepare)?;
        }
        trace!(
            target: "objmgr::recovery",
            txn = self.id(),
            unit = inner.unit.id,
            recorded = ?state,
            state = ?inner.state,
            lsn,
            "Checkpointed transaction redone"
        );
        Ok(())
    }

    fn redo_locked(
        &self,
        inner: &mut TxnInner,
        token: &Token,
        change: Change,
        payload: Vec<u8>,
        lsn: LogSequenceNumber,
    ) -> Result<()> {
        let store = token.store()?;
        let id = token.id();
        let owner = self.id();

        let (object, state, logged, space) = match change {
            Change::Add | Change::Replace => {
                let before = match change {
                    Change::Add => None,
                    _ => store.load(id.object)?,
                };
                let object = token.set_managed_object(ManagedObject::new(payload.clone()))?;
                let added = change == Change::Add
                    || (object.is_locked_by(owner) && object.state() == ObjectState::Added);
                let state = if added {
                    ObjectState::Added
                } else {
                    ObjectState::Replaced
                };
                object.restore_for_recovery(owner, state, before);
                let space = object_space(payload.len());
                (object, state, Some(payload), space)
            }
            Change::Delete => {
                let object = match token.get_managed_object()? {
                    Some(object) => object,
                    None => token.set_managed_object(ManagedObject::restored(Vec::new()))?,
                };
                let ours = object.is_locked_by(owner);
                let state = if ours && object.state() == ObjectState::Added {
                    ObjectState::MustBeDeleted
                } else {
                    ObjectState::ToBeDeleted
                };
                let before = (!ours).then(|| object.payload());
                object.restore_for_recovery(owner, state, before);
                (object, state, None, token_space())
            }
        };

        let delta = inner.reservation(space);
        inner.log_space_reserved += delta;
        let inclusion = inner
            .included
            .entry(id)
            .or_insert_with(|| Inclusion::new(&object, token.clone(), store));
        inclusion.lsn = lsn;
        inclusion.logged = logged;
        inclusion.optimistic = false;
        trace!(
            target: "objmgr::recovery",
            txn = owner,
            object = %id,
            ?state,
            lsn,
            "Object redone"
        );
        Ok(())
    }

    fn redo_batch<F>(
        &self,
        inner: &mut TxnInner,
        batch: &OptimisticBatch,
        lsn: LogSequenceNumber,
        resolve: &F,
    ) -> Result<()>
    where
        F: Fn(TokenId) -> Result<Token>,
    {
        for object in &batch.to_add {
            let token = resolve(object.token)?;
            self.redo_locked(inner, &token, Change::Add, object.payload.clone(), lsn)?;
        }
        for id in &batch.to_delete {
            let token = resolve(*id)?;
            self.redo_locked(inner, &token, Change::Delete, Vec::new(), lsn)?;
        }
        for logged in &batch.to_replace {
            let token = resolve(logged.token)?;
            self.redo_unlocked(inner, &token, logged.payload.clone(), lsn)?;
        }
        for id in &batch.to_notify {
            if !inner.notify.contains(id) {
                inner.notify.push(*id);
            }
        }
        Ok(())
    }

    /// Optimistic replace of an object the unit of work has not locked.
    fn redo_unlocked(
        &self,
        inner: &mut TxnInner,
        token: &Token,
        payload: Vec<u8>,
        lsn: LogSequenceNumber,
    ) -> Result<()> {
        let store = token.store()?;
        let id = token.id();
        let (object, image) = match token.resident() {
            Some(object) => {
                let image = object.payload();
                object.set_payload(payload.clone());
                (object, Some(image))
            }
            None => {
                let image = store.load(id.object)?;
                let object = token.set_managed_object(ManagedObject::restored(payload.clone()))?;
                (object, image)
            }
        };

        let delta = inner.reservation(object_space(payload.len()));
        inner.log_space_reserved += delta;
        let inclusion = inner.included.entry(id).or_insert_with(|| {
            let mut inclusion = Inclusion::new(&object, token.clone(), store);
            inclusion.optimistic = true;
            inclusion
        });
        if inclusion.optimistic && inclusion.recovered_image.is_none() {
            inclusion.recovered_image = image;
        }
        inclusion.lsn = lsn;
        inclusion.logged = Some(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::env::TransactionEnv;
    use objmgr_core::{ManagedObject, ObjectState, ObjectStore, OpenMode, TransactionState};
    use objmgr_durability::{LoggedObject, NullLog, OptimisticBatch, TransactionCheckpoint};
    use objmgr_storage::{FileObjectStore, StoreConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn durable(dir: &std::path::Path) -> Arc<FileObjectStore> {
        let store = FileObjectStore::new(dir, StoreConfig::new(1, "durable")).unwrap();
        store.open(OpenMode::Cold).unwrap();
        store
    }

    #[test]
    fn test_redo_add_then_backout_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        let token = store.like(objmgr_core::StoredObjectId(7));

        txn.redo_add(&token, b"orphan".to_vec(), 3).unwrap();
        assert_eq!(txn.state(), TransactionState::ActivePersistent);
        assert!(txn.log_space_reserved() > 0);
        let object = token.resident().unwrap();
        assert_eq!(object.state(), ObjectState::Added);

        txn.backout(false).unwrap();
        assert!(!store.contains(token.object_id()));
        assert!(token.get_managed_object().unwrap().is_none());
    }

    #[test]
    fn test_redo_replace_restores_committed_image_on_backout() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let object = ManagedObject::new(b"committed".to_vec());
        let token = store.allocate(&object).unwrap();
        store.add(&object, false).unwrap();
        drop(object);

        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        txn.redo_replace(&token, b"uncommitted".to_vec(), 5).unwrap();
        assert_eq!(token.resident().unwrap().payload(), b"uncommitted");

        txn.backout(false).unwrap();
        assert_eq!(token.get_managed_object().unwrap().unwrap().payload(), b"committed");
        assert_eq!(store.load(token.object_id()).unwrap().unwrap(), b"committed");
    }

    #[test]
    fn test_redo_optimistic_commit_applies_whole_batch() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let existing = ManagedObject::new(b"old".to_vec());
        let replaced = store.allocate(&existing).unwrap();
        store.add(&existing, false).unwrap();
        let added = store.like(objmgr_core::StoredObjectId(20));

        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        let batch = OptimisticBatch {
            to_add: vec![LoggedObject::new(added.id(), b"fresh".to_vec())],
            to_replace: vec![LoggedObject::new(replaced.id(), b"new".to_vec())],
            ..Default::default()
        };
        let resolver = Arc::clone(&store);
        txn.redo_optimistic_replace(&batch, 9, move |id| Ok(resolver.like(id.object)))
            .unwrap();
        txn.commit(false).unwrap();

        assert_eq!(store.load(added.object_id()).unwrap().unwrap(), b"fresh");
        assert_eq!(store.load(replaced.object_id()).unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_redo_optimistic_backout_restores_resident_image() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let existing = ManagedObject::new(b"old".to_vec());
        let token = store.allocate(&existing).unwrap();
        store.add(&existing, false).unwrap();

        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        let batch = OptimisticBatch {
            to_replace: vec![LoggedObject::new(token.id(), b"new".to_vec())],
            ..Default::default()
        };
        let resolver = Arc::clone(&store);
        txn.redo_optimistic_replace(&batch, 2, move |id| Ok(resolver.like(id.object)))
            .unwrap();
        assert_eq!(existing.payload(), b"new");

        txn.backout(false).unwrap();
        assert_eq!(existing.payload(), b"old");
        assert_eq!(store.load(token.object_id()).unwrap().unwrap(), b"old");
    }

    #[test]
    fn test_redo_checkpoint_keeps_prepared_state() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let token = store.like(objmgr_core::StoredObjectId(3));
        let checkpoint = TransactionCheckpoint {
            added: vec![LoggedObject::new(token.id(), b"in doubt".to_vec())],
            ..Default::default()
        };

        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        let resolver = Arc::clone(&store);
        txn.redo_checkpoint(
            TransactionState::PreparedPersistent,
            &checkpoint,
            11,
            move |id| Ok(resolver.like(id.object)),
        )
        .unwrap();
        assert_eq!(txn.state(), TransactionState::PreparedPersistent);
        assert_eq!(txn.included_count(), 1);
    }

    #[test]
    fn test_redo_checkpoint_of_committing_unit_commits() {
        let dir = tempdir().unwrap();
        let store = durable(dir.path());
        let token = store.like(objmgr_core::StoredObjectId(4));
        let checkpoint = TransactionCheckpoint {
            added: vec![LoggedObject::new(token.id(), b"decided".to_vec())],
            ..Default::default()
        };

        let env = TransactionEnv::new(Arc::new(NullLog::new()), 8);
        let txn = env.begin_internal().unwrap();
        let resolver = Arc::clone(&store);
        txn.redo_checkpoint(
            TransactionState::CommittingPersistent,
            &checkpoint,
            11,
            move |id| Ok(resolver.like(id.object)),
        )
        .unwrap();
        assert_eq!(txn.state(), TransactionState::CommittingPersistent);
        txn.commit(false).unwrap();
        assert_eq!(store.load(token.object_id()).unwrap().unwrap(), b"decided");
    }
}
