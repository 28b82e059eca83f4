//! The transaction state machine
//!
//! An [`InternalTransaction`] carries one unit of work at a time. It
//! locks the objects it changes, logs every change to a persistent store
//! before the change can reach that store, and applies or undoes the
//! changes when the unit of work completes.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. pre-prepare if still active          callbacks may refuse here
//! 2. StartCommit                          Committing{I,Np,P}
//! 3. Commit record, forced                persistent units only; releases
//!                                         the log space reserved so far
//! 4. apply each included object           store.add / store.remove
//! 5. Commit                               Inactive, locks released
//! 6. complete                             new unit of work, or Terminated
//! ```
//!
//! A crash before step 3 leaves only data records in the log, and
//! recovery backs the unit of work out. A crash after it redoes the
//! changes from the log.
//!
//! ## Locking
//!
//! `inner` guards the transaction's own state and is held while a record
//! is written and while the outcome is applied to the stores, so a
//! checkpoint of this transaction never observes half a commit.
//! `completion` serializes prepare, commit and backout, and is held while
//! callbacks run. Object locks are always taken without holding `inner`.

use crate::callback::TransactionCallback;
use crate::env::TransactionEnv;
use crate::reservation::{object_space, token_space, transaction_overhead};
use crate::transaction::OptimisticUpdate;
use objmgr_core::{
    Error, LogSequenceNumber, LogicalUnitOfWork, ManagedObject, ObjectState, ObjectStore, Result,
    StoreAction, Token, TokenId, TransactionState, TransitionEvent, TxnId, MAX_XID_SIZE,
};
use objmgr_durability::{LogRecord, LoggedObject, OptimisticBatch, TransactionCheckpoint};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace};

/// An object taking part in the current unit of work.
pub(crate) struct Inclusion {
    pub(crate) object: Arc<ManagedObject>,
    pub(crate) token: Token,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) persistent: bool,
    /// Sequence number of the last record naming the object; 0 if never logged
    pub(crate) lsn: LogSequenceNumber,
    /// Bytes written to the log for it
    pub(crate) logged: Option<Vec<u8>>,
    /// Store space reserved for it
    pub(crate) store_reserved: u64,
    /// Included by an optimistic replace without a lock
    pub(crate) optimistic: bool,
    /// Contents to put back if a replayed optimistic replace is backed out
    pub(crate) recovered_image: Option<Vec<u8>>,
}

impl Inclusion {
    pub(crate) fn new(object: &Arc<ManagedObject>, token: Token, store: Arc<dyn ObjectStore>) -> Self {
        Inclusion {
            object: Arc::clone(object),
            persistent: store.is_persistent(),
            token,
            store,
            lsn: 0,
            logged: None,
            store_reserved: 0,
            optimistic: false,
            recovered_image: None,
        }
    }
}

pub(crate) struct TxnInner {
    pub(crate) state: TransactionState,
    pub(crate) unit: LogicalUnitOfWork,
    pub(crate) included: FxHashMap<TokenId, Inclusion>,
    pub(crate) callbacks: Vec<Arc<dyn TransactionCallback>>,
    /// Persistent tokens named by optimistic replaces, kept for checkpoints
    pub(crate) notify: Vec<TokenId>,
    pub(crate) log_space_reserved: i64,
    pub(crate) requires_checkpoint: bool,
    pub(crate) use_count: u64,
}

impl TxnInner {
    /// Included objects ordered by identity, so stores see a stable order.
    fn sorted(&self) -> Vec<&Inclusion> {
        let mut all: Vec<&Inclusion> = self.included.values().collect();
        all.sort_by_key(|inclusion| inclusion.token.id());
        all
    }

    /// Account for `delta` more reserved log bytes, adding the per-unit
    /// overhead on the first persistent change.
    pub(crate) fn reservation(&self, delta: i64) -> i64 {
        if self.log_space_reserved == 0 {
            delta + transaction_overhead()
        } else {
            delta
        }
    }
}

/// What a locked change does to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Add,
    Replace,
    Delete,
}

/// Transaction engine behind a [`Transaction`](crate::Transaction) handle.
pub struct InternalTransaction {
    id: TxnId,
    env: Weak<TransactionEnv>,
    completion: Mutex<()>,
    pub(crate) inner: Mutex<TxnInner>,
}

impl InternalTransaction {
    pub(crate) fn new(id: TxnId, unit: u64, env: Weak<TransactionEnv>) -> Self {
        InternalTransaction {
            id,
            env,
            completion: Mutex::new(()),
            inner: Mutex::new(TxnInner {
                state: TransactionState::Inactive,
                unit: LogicalUnitOfWork::new(unit),
                included: FxHashMap::default(),
                callbacks: Vec::new(),
                notify: Vec::new(),
                log_space_reserved: 0,
                requires_checkpoint: false,
                use_count: 0,
            }),
        }
    }

    /// Transaction identifier; also the lock owner of its objects.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Current logical unit of work.
    pub fn unit(&self) -> LogicalUnitOfWork {
        self.inner.lock().unit.clone()
    }

    /// Log bytes reserved by the current unit of work.
    pub fn log_space_reserved(&self) -> i64 {
        self.inner.lock().log_space_reserved
    }

    /// Number of objects in the current unit of work.
    pub fn included_count(&self) -> usize {
        self.inner.lock().included.len()
    }

    /// Whether the object with this identity is in the current unit of work.
    pub fn includes(&self, token: TokenId) -> bool {
        self.inner.lock().included.contains_key(&token)
    }

    /// Units of work completed so far.
    pub fn use_count(&self) -> u64 {
        self.inner.lock().use_count
    }

    pub(crate) fn describe(&self) -> String {
        format!("transaction {}", self.id)
    }

    pub(crate) fn env(&self) -> Result<Arc<TransactionEnv>> {
        self.env
            .upgrade()
            .ok_or_else(|| Error::invalid_state(self.describe(), "Detached", "use"))
    }

    /// The state `event` leads to, or an invalid state error.
    pub(crate) fn check(&self, inner: &TxnInner, event: TransitionEvent) -> Result<TransactionState> {
        let next = inner.state.next(event);
        if next == TransactionState::Error {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                event.operation(),
            ));
        }
        Ok(next)
    }

    fn check_now(&self, event: TransitionEvent) -> Result<()> {
        let inner = self.inner.lock();
        self.check(&inner, event).map(|_| ())
    }

    pub(crate) fn resolve(object: &ManagedObject) -> Result<(Token, Arc<dyn ObjectStore>)> {
        let token = object
            .token()
            .cloned()
            .ok_or_else(|| Error::invalid_state("unallocated object", object.state(), "include"))?;
        let store = token.store()?;
        Ok((token, store))
    }

    pub(crate) fn involve_event(persistent: bool) -> TransitionEvent {
        if persistent {
            TransitionEvent::InvolvePersistent
        } else {
            TransitionEvent::InvolveNonPersistent
        }
    }

    // ========================================================================
    // Locking changes
    // ========================================================================

    /// Lock `object` for this transaction, waiting while another holds it.
    pub fn lock(&self, object: &Arc<ManagedObject>) -> Result<()> {
        let (token, store) = Self::resolve(object)?;
        self.check_now(TransitionEvent::InvolveNonPersistent)?;
        object.lock(self.id)?;

        let mut inner = self.inner.lock();
        if let Err(e) = self.check(&inner, TransitionEvent::InvolveNonPersistent) {
            drop(inner);
            object.unlock(self.id);
            return Err(e);
        }
        inner
            .included
            .entry(token.id())
            .or_insert_with(|| Inclusion::new(object, token, store));
        Ok(())
    }

    /// Add a newly allocated object.
    pub fn add(&self, object: &Arc<ManagedObject>, extra_log_space: u64) -> Result<()> {
        let (token, store) = Self::resolve(object)?;
        self.check_now(Self::involve_event(store.is_persistent()))?;
        object.lock(self.id)?;
        if let Err(e) = object.mark_added(self.id) {
            object.unlock(self.id);
            return Err(e);
        }
        let reserved = object.payload_len() as u64;
        if let Err(e) = store.reserve(reserved as i64, true) {
            object.revert_added(self.id);
            object.unlock(self.id);
            return Err(e);
        }
        self.log_change(object, token, Arc::clone(&store), Change::Add, reserved, extra_log_space)
            .map_err(|e| {
                object.revert_added(self.id);
                object.unlock(self.id);
                let _ = store.reserve(-(reserved as i64), false);
                e
            })
    }

    /// Log the new contents of an object this transaction has locked.
    pub fn replace(&self, object: &Arc<ManagedObject>, extra_log_space: u64) -> Result<()> {
        let (token, store) = Self::resolve(object)?;
        self.check_now(Self::involve_event(store.is_persistent()))?;
        let previous = object.state();
        object.mark_replaced(self.id)?;
        let reserved = object.payload_len() as u64;
        if let Err(e) = store.reserve(reserved as i64, true) {
            object.revert_to_locked(self.id, previous);
            return Err(e);
        }
        self.log_change(object, token, Arc::clone(&store), Change::Replace, reserved, extra_log_space)
            .map_err(|e| {
                object.revert_to_locked(self.id, previous);
                let _ = store.reserve(-(reserved as i64), false);
                e
            })
    }

    /// Delete a stored object, locking it first.
    pub fn delete(&self, object: &Arc<ManagedObject>, extra_log_space: u64) -> Result<()> {
        let (token, store) = Self::resolve(object)?;
        self.check_now(Self::involve_event(store.is_persistent()))?;
        object.lock(self.id)?;
        let previous = object.state();
        if let Err(e) = object.mark_deleted(self.id) {
            object.unlock(self.id);
            return Err(e);
        }
        self.log_change(object, token, store, Change::Delete, 0, extra_log_space)
            .map_err(|e| {
                object.revert_to_locked(self.id, previous);
                object.unlock(self.id);
                e
            })
    }

    fn log_change(
        &self,
        object: &Arc<ManagedObject>,
        token: Token,
        store: Arc<dyn ObjectStore>,
        change: Change,
        store_reserved: u64,
        extra_log_space: u64,
    ) -> Result<()> {
        let persistent = store.is_persistent();
        let mut inner = self.inner.lock();
        let next = self.check(&inner, Self::involve_event(persistent))?;

        let (lsn, logged) = if persistent {
            let env = self.env()?;
            let unit = inner.unit.clone();
            let (record, logged, space) = match change {
                Change::Add | Change::Replace => {
                    let payload = object.payload();
                    let space = object_space(payload.len());
                    let entry = LoggedObject::new(token.id(), payload.clone());
                    let record = if change == Change::Add {
                        LogRecord::Add { unit, state: next, object: entry }
                    } else {
                        LogRecord::Replace { unit, state: next, object: entry }
                    };
                    (record, Some(payload), space)
                }
                Change::Delete => {
                    let record = LogRecord::Delete {
                        unit,
                        state: next,
                        token: token.id(),
                    };
                    (record, None, token_space())
                }
            };
            let delta = inner.reservation(extra_log_space as i64 + space);
            let lsn = env.write(&record, delta, true, false)?;
            inner.log_space_reserved += delta;
            (lsn, logged)
        } else {
            (0, None)
        };

        inner.state = next;
        let id = token.id();
        let inclusion = inner
            .included
            .entry(id)
            .or_insert_with(|| Inclusion::new(object, token, store));
        inclusion.lsn = lsn;
        inclusion.logged = logged;
        inclusion.store_reserved += store_reserved;
        inclusion.optimistic = false;
        trace!(
            target: "objmgr::txn",
            txn = self.id,
            unit = inner.unit.id,
            object = %id,
            ?change,
            lsn,
            "Object included"
        );
        Ok(())
    }

    // ========================================================================
    // Optimistic replace
    // ========================================================================

    /// Apply a batch of changes logged as a single record.
    ///
    /// Objects to add or delete are locked as by [`add`](Self::add) and
    /// [`delete`](Self::delete). Objects to replace are not locked: if the
    /// unit of work backs out, restoring them is up to the caller.
    pub fn optimistic_replace(&self, update: &OptimisticUpdate) -> Result<()> {
        let resolve_all = |objects: &[Arc<ManagedObject>]| -> Result<Vec<_>> {
            objects
                .iter()
                .map(|object| Self::resolve(object).map(|(token, store)| (Arc::clone(object), token, store)))
                .collect()
        };
        let to_add = resolve_all(&update.to_add)?;
        let to_replace = resolve_all(&update.to_replace)?;
        let to_delete = resolve_all(&update.to_delete)?;
        let mut notify = Vec::new();
        for token in &update.to_notify {
            if token.store()?.is_persistent() {
                notify.push(token.id());
            }
        }

        let persistent = to_add
            .iter()
            .chain(&to_replace)
            .chain(&to_delete)
            .any(|(_, _, store)| store.is_persistent())
            || !notify.is_empty();
        let event = if persistent {
            TransitionEvent::InvolveOptimisticPersistent
        } else {
            TransitionEvent::InvolveOptimisticNonPersistent
        };
        self.check_now(event)?;

        let mut undo = Undo::new(self.id);
        for (object, _, _) in &to_add {
            object.lock(self.id)?;
            undo.locked.push(Arc::clone(object));
            object.mark_added(self.id)?;
            undo.added.push(Arc::clone(object));
        }
        for (object, _, _) in &to_delete {
            object.lock(self.id)?;
            undo.locked.push(Arc::clone(object));
            let previous = object.state();
            object.mark_deleted(self.id)?;
            undo.deleted.push((Arc::clone(object), previous));
        }
        for (object, _, _) in &to_replace {
            object.check_optimistic_replace()?;
        }
        let mut reserved: FxHashMap<TokenId, u64> = FxHashMap::default();
        for (object, token, store) in to_add.iter().chain(&to_replace) {
            let bytes = object.payload_len() as u64;
            store.reserve(bytes as i64, true)?;
            undo.reservations.push((Arc::clone(store), bytes));
            *reserved.entry(token.id()).or_default() += bytes;
        }

        let outcome = {
            let mut inner = self.inner.lock();
            let next = self.check(&inner, event)?;
            let mut batch = OptimisticBatch::default();
            let mut logged: FxHashMap<TokenId, Vec<u8>> = FxHashMap::default();
            let mut space = 0;
            for (list, entries) in [(&mut batch.to_add, &to_add), (&mut batch.to_replace, &to_replace)] {
                for (object, token, store) in entries {
                    if store.is_persistent() {
                        let payload = object.payload();
                        space += object_space(payload.len());
                        logged.insert(token.id(), payload.clone());
                        list.push(LoggedObject::new(token.id(), payload));
                    }
                }
            }
            for (_, token, store) in &to_delete {
                if store.is_persistent() {
                    space += token_space();
                    batch.to_delete.push(token.id());
                }
            }
            space += notify.len() as i64 * token_space();
            batch.to_notify = notify.clone();

            let lsn = if persistent {
                let env = self.env()?;
                let delta = inner.reservation(update.extra_log_space as i64 + space);
                let record = LogRecord::OptimisticReplace {
                    unit: inner.unit.clone(),
                    state: next,
                    batch,
                };
                let lsn = env.write(&record, delta, true, false)?;
                inner.log_space_reserved += delta;
                lsn
            } else {
                0
            };

            inner.state = next;
            let locked = to_add.iter().chain(&to_delete).map(|entry| (entry, false));
            let unlocked = to_replace.iter().map(|entry| (entry, true));
            for ((object, token, store), optimistic) in locked.chain(unlocked) {
                let id = token.id();
                let bytes = reserved.remove(&id).unwrap_or(0);
                let inclusion = match inner.included.entry(id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let mut inclusion = Inclusion::new(object, token.clone(), Arc::clone(store));
                        inclusion.optimistic = optimistic;
                        entry.insert(inclusion)
                    }
                };
                if inclusion.persistent {
                    inclusion.lsn = lsn;
                    inclusion.logged = logged.get(&id).cloned();
                }
                inclusion.store_reserved += bytes;
            }
            for id in notify {
                if !inner.notify.contains(&id) {
                    inner.notify.push(id);
                }
            }
            debug!(
                target: "objmgr::txn",
                txn = self.id,
                unit = inner.unit.id,
                adds = to_add.len(),
                replaces = to_replace.len(),
                deletes = to_delete.len(),
                lsn,
                "Optimistic replace logged"
            );
            (persistent, inner.unit.clone(), inner.callbacks.clone())
        };
        undo.disarm();

        let (logged, unit, callbacks) = outcome;
        if logged {
            for callback in &callbacks {
                callback.optimistic_replace_logged(&unit);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Outcome
    // ========================================================================

    /// Register `callback` for the outcome of the current unit of work.
    pub fn request_callback(&self, callback: Arc<dyn TransactionCallback>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::RequestCallback)?;
        inner.callbacks.push(callback);
        Ok(())
    }

    /// Set the two-phase commit branch identifier of the current unit of work.
    pub fn set_xid(&self, xid: Vec<u8>) -> Result<()> {
        if xid.len() > MAX_XID_SIZE {
            return Err(Error::InvalidOperation(format!(
                "XID of {} bytes exceeds {} bytes",
                xid.len(),
                MAX_XID_SIZE
            )));
        }
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Terminated {
            return Err(Error::invalid_state(self.describe(), inner.state, "set the XID of"));
        }
        inner.unit.xid = Some(xid);
        Ok(())
    }

    fn pre_prepare(&self) -> Result<()> {
        let (unit, callbacks) = {
            let mut inner = self.inner.lock();
            inner.state = self.check(&inner, TransitionEvent::PrePrepare)?;
            (inner.unit.clone(), inner.callbacks.clone())
        };
        for callback in &callbacks {
            callback.pre_prepare(&unit)?;
        }
        Ok(())
    }

    /// Phase one of two-phase commit. No changes are accepted afterwards.
    pub fn prepare(&self) -> Result<()> {
        let _completion = self.completion.lock();
        self.pre_prepare()?;
        let mut inner = self.inner.lock();
        let next = self.check(&inner, TransitionEvent::Prepare)?;
        if inner.state == TransactionState::PrePreparedPersistent {
            let record = LogRecord::Prepare {
                unit: inner.unit.clone(),
                state: next,
            };
            self.env()?.write(&record, 0, true, true)?;
        }
        inner.state = next;
        debug!(target: "objmgr::txn", txn = self.id, unit = inner.unit.id, "Prepared");
        Ok(())
    }

    /// Commit the current unit of work.
    ///
    /// With `reuse` the transaction starts a new unit of work, otherwise
    /// it terminates.
    pub fn commit(&self, reuse: bool) -> Result<()> {
        self.complete_with(true, reuse)
    }

    /// Back out the current unit of work.
    ///
    /// Locked objects get their before-image back. Objects changed by an
    /// optimistic replace are left as they are.
    pub fn backout(&self, reuse: bool) -> Result<()> {
        self.complete_with(false, reuse)
    }

    fn complete_with(&self, commit: bool, reuse: bool) -> Result<()> {
        let _completion = self.completion.lock();
        let started = Instant::now();
        let env = self.env()?;
        let (start, finish) = if commit {
            (TransitionEvent::StartCommit, TransitionEvent::Commit)
        } else {
            (TransitionEvent::StartBackout, TransitionEvent::Backout)
        };

        if matches!(
            self.state(),
            TransactionState::Inactive
                | TransactionState::ActiveNonPersistent
                | TransactionState::ActivePersistent
        ) {
            self.pre_prepare()?;
        }
        let (unit, callbacks) = {
            let mut inner = self.inner.lock();
            inner.state = self.check(&inner, start)?;
            (inner.unit.clone(), inner.callbacks.clone())
        };
        for callback in &callbacks {
            if commit {
                callback.pre_commit(&unit);
            } else {
                callback.pre_backout(&unit);
            }
        }

        let (persistent, objects, failure) = {
            let mut inner = self.inner.lock();
            let persistent = matches!(
                inner.state,
                TransactionState::CommittingPersistent | TransactionState::BackingOutPersistent
            );
            if persistent {
                let record = if commit {
                    LogRecord::Commit { unit: unit.clone(), state: inner.state }
                } else {
                    LogRecord::Backout { unit: unit.clone(), state: inner.state }
                };
                env.write(&record, -inner.log_space_reserved, true, true)?;
                inner.log_space_reserved = 0;
            }

            let requires_current = inner.requires_checkpoint || env.checkpoint_starting();
            let mut failure = None;
            for inclusion in inner.sorted() {
                let applied = if commit {
                    self.commit_object(inclusion, requires_current)
                } else {
                    self.backout_object(inclusion)
                };
                if let Err(e) = applied {
                    failure.get_or_insert(e);
                }
            }
            let objects = inner.included.len();
            inner.state = self.check(&inner, finish)?;
            (persistent, objects, failure)
        };

        for callback in &callbacks {
            if commit {
                callback.post_commit(&unit);
            } else {
                callback.post_backout(&unit);
            }
        }
        self.complete(&env, reuse);
        env.count_outcome(commit, persistent);
        info!(
            target: "objmgr::txn",
            txn = self.id,
            unit = unit.id,
            outcome = if commit { "commit" } else { "backout" },
            persistent,
            objects,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Unit of work complete"
        );
        match failure {
            Some(e) => Err(env.report(e)),
            None => Ok(()),
        }
    }

    fn commit_object(&self, inclusion: &Inclusion, requires_current: bool) -> Result<()> {
        let object = &inclusion.object;
        let applied = if object.is_locked_by(self.id) {
            let stored = match object.commit_action(self.id)? {
                StoreAction::Add => inclusion.store.add(object, requires_current),
                StoreAction::Remove => inclusion.store.remove(&inclusion.token, requires_current),
                StoreAction::None => Ok(()),
            };
            let completed = object.complete_commit(self.id);
            stored.and(completed)
        } else if inclusion.optimistic && object.state() != ObjectState::Deleted {
            inclusion.store.add(object, requires_current)
        } else {
            Ok(())
        };
        self.release_store_space(inclusion);
        applied
    }

    fn backout_object(&self, inclusion: &Inclusion) -> Result<()> {
        let object = &inclusion.object;
        let restored = if object.is_locked_by(self.id) {
            object.backout(self.id)
        } else {
            if let Some(image) = &inclusion.recovered_image {
                object.set_payload(image.clone());
            }
            Ok(())
        };
        self.release_store_space(inclusion);
        restored
    }

    fn release_store_space(&self, inclusion: &Inclusion) {
        if inclusion.store_reserved > 0 {
            let _ = inclusion
                .store
                .reserve(-(inclusion.store_reserved as i64), false);
        }
    }

    fn complete(&self, env: &TransactionEnv, reuse: bool) {
        let mut inner = self.inner.lock();
        inner.included.clear();
        inner.callbacks.clear();
        inner.notify.clear();
        inner.requires_checkpoint = false;
        inner.log_space_reserved = 0;
        inner.use_count += 1;
        inner.unit = LogicalUnitOfWork::new(env.next_unit_id());
        if !reuse {
            inner.state = inner.state.next(TransitionEvent::Terminate);
            env.deregister(self.id);
        }
    }

    /// Terminate an inactive transaction.
    pub fn terminate(&self) -> Result<()> {
        let _completion = self.completion.lock();
        let mut inner = self.inner.lock();
        inner.state = self.check(&inner, TransitionEvent::Terminate)?;
        if let Some(env) = self.env.upgrade() {
            env.deregister(self.id);
        }
        Ok(())
    }

    /// Refuse everything from now on, whatever the state.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.state = inner.state.next(TransitionEvent::Shutdown);
    }

    /// Called after replay, before forward processing starts.
    pub fn recovery_completed(&self) {
        let (unit, callbacks) = {
            let inner = self.inner.lock();
            (inner.unit.clone(), inner.callbacks.clone())
        };
        for callback in &callbacks {
            callback.recovery_completed(&unit);
        }
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    /// Flag the transaction for the checkpoint that is starting, if its
    /// state means it owes the log a record.
    pub fn set_requires_checkpoint(&self) {
        let mut inner = self.inner.lock();
        inner.requires_checkpoint = inner.state.requires_checkpoint();
    }

    /// Write a record restating every persistent change logged at or
    /// before `forced_lsn`, so that the log before it can be truncated.
    pub fn checkpoint(&self, forced_lsn: LogSequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        // The unit of work may have completed since it was flagged
        if !inner.requires_checkpoint || !inner.state.requires_checkpoint() {
            inner.requires_checkpoint = false;
            return Ok(());
        }

        let mut checkpoint = TransactionCheckpoint::default();
        for inclusion in inner.sorted() {
            if !inclusion.persistent || inclusion.lsn == 0 || inclusion.lsn > forced_lsn {
                continue;
            }
            let id = inclusion.token.id();
            let logged = || LoggedObject::new(id, inclusion.logged.clone().unwrap_or_default());
            if inclusion.object.is_locked_by(self.id) {
                match inclusion.object.state() {
                    ObjectState::Added => checkpoint.added.push(logged()),
                    ObjectState::Replaced => checkpoint.replaced.push(logged()),
                    ObjectState::ToBeDeleted => checkpoint.deleted.push(id),
                    _ => {}
                }
            } else if inclusion.logged.is_some() {
                checkpoint.optimistic.to_replace.push(logged());
            }
        }
        checkpoint.optimistic.to_notify = inner.notify.clone();

        let record = LogRecord::CheckpointTransaction {
            unit: inner.unit.clone(),
            state: inner.state,
            checkpoint,
        };
        self.env()?.write(&record, 0, false, false)?;
        inner.requires_checkpoint = false;
        trace!(
            target: "objmgr::checkpoint",
            txn = self.id,
            unit = inner.unit.id,
            state = ?inner.state,
            "Transaction checkpointed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for InternalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InternalTransaction")
            .field("id", &self.id)
            .field("unit", &inner.unit)
            .field("state", &inner.state)
            .field("included", &inner.included.len())
            .field("log_space_reserved", &inner.log_space_reserved)
            .finish()
    }
}

/// Object changes made ahead of logging an optimistic replace, undone
/// unless the record is written.
struct Undo {
    txn: TxnId,
    armed: bool,
    locked: Vec<Arc<ManagedObject>>,
    added: Vec<Arc<ManagedObject>>,
    deleted: Vec<(Arc<ManagedObject>, ObjectState)>,
    reservations: Vec<(Arc<dyn ObjectStore>, u64)>,
}

impl Undo {
    fn new(txn: TxnId) -> Self {
        Undo {
            txn,
            armed: true,
            locked: Vec::new(),
            added: Vec::new(),
            deleted: Vec::new(),
            reservations: Vec::new(),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Undo {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for object in &self.added {
            object.revert_added(self.txn);
        }
        for (object, previous) in &self.deleted {
            object.revert_to_locked(self.txn, *previous);
        }
        for object in &self.locked {
            object.unlock(self.txn);
        }
        for (store, bytes) in &self.reservations {
            let _ = store.reserve(-(*bytes as i64), false);
        }
    }
}
