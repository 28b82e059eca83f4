//! Managed objects: shared, interior-mutable cells whose lifecycle is
//! driven by transactions and object stores.
//!
//! A managed object holds the serialized form of an application value.
//! Every holder shares one `Arc<ManagedObject>`; recovery and
//! [`Token::set_managed_object`](crate::Token::set_managed_object) update
//! the cell in place so existing holders observe the new contents.
//!
//! # Locking
//!
//! A transaction locks an object before changing it. The first lock taken
//! by a transaction captures a before-image that backout restores. A
//! second transaction asking for the lock blocks until the owner commits
//! or backs out.

use crate::error::{Error, Result};
use crate::token::Token;
use crate::types::TxnId;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Lifecycle state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectState {
    /// A state error occurred
    Error = 0,
    /// Not yet part of a transaction
    Constructed = 1,
    /// Added by the owning transaction
    Added = 2,
    /// Locked with intent to replace
    Locked = 3,
    /// Replaced by the owning transaction
    Replaced = 4,
    /// Deleted by the owning transaction
    ToBeDeleted = 5,
    /// Added and deleted by the same transaction, gone whatever the outcome
    MustBeDeleted = 6,
    /// Removed from its store
    Deleted = 7,
    /// Stored and not involved in any transaction
    Ready = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectEvent {
    Add,
    Lock,
    Replace,
    OptimisticReplace,
    Delete,
    Commit,
    Backout,
}

use ObjectState::{
    Added as AD, Constructed as CO, Deleted as DE, Error as ER, Locked as LO,
    MustBeDeleted as MB, Ready as RE, Replaced as RP, ToBeDeleted as TB,
};

type Table = [ObjectState; 9];

const ADD: Table = [ER, AD, ER, ER, ER, ER, ER, ER, ER];
const LOCK: Table = [ER, CO, AD, LO, RP, TB, MB, ER, LO];
const REPLACE: Table = [ER, ER, AD, RP, RP, ER, ER, ER, ER];
const OPTIMISTIC_REPLACE: Table = [ER, CO, AD, LO, RP, TB, MB, DE, RE];
// ToBeDeleted and MustBeDeleted are accepted again when a checkpoint is replayed.
const DELETE: Table = [ER, ER, MB, TB, TB, TB, TB, ER, TB];
const COMMIT: Table = [ER, ER, RE, RE, RE, DE, DE, ER, ER];
const BACKOUT: Table = [ER, ER, DE, RE, RE, RE, DE, ER, ER];

impl ObjectEvent {
    fn table(self) -> &'static Table {
        match self {
            ObjectEvent::Add => &ADD,
            ObjectEvent::Lock => &LOCK,
            ObjectEvent::Replace => &REPLACE,
            ObjectEvent::OptimisticReplace => &OPTIMISTIC_REPLACE,
            ObjectEvent::Delete => &DELETE,
            ObjectEvent::Commit => &COMMIT,
            ObjectEvent::Backout => &BACKOUT,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            ObjectEvent::Add => "add",
            ObjectEvent::Lock => "lock",
            ObjectEvent::Replace => "replace",
            ObjectEvent::OptimisticReplace => "optimistically replace",
            ObjectEvent::Delete => "delete",
            ObjectEvent::Commit => "commit",
            ObjectEvent::Backout => "back out",
        }
    }
}

impl ObjectState {
    fn next(self, event: ObjectEvent) -> ObjectState {
        event.table()[self as usize]
    }
}

/// What the owning store has to do when a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Store the current payload
    Add,
    /// Remove the object from the store
    Remove,
    /// Nothing changed
    None,
}

struct ObjectInner {
    state: ObjectState,
    payload: Vec<u8>,
    before_image: Option<Vec<u8>>,
    lock_owner: Option<TxnId>,
    locks_taken: u32,
    update_sequence: u64,
}

/// An application object under transactional control.
pub struct ManagedObject {
    token: OnceLock<Token>,
    inner: Mutex<ObjectInner>,
    lock_released: Condvar,
}

impl ManagedObject {
    /// Wrap serialized bytes in a new, not yet allocated object.
    pub fn new(payload: Vec<u8>) -> Arc<Self> {
        Self::with_state(payload, ObjectState::Constructed)
    }

    /// Serialize `value` with bincode into a new object.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Arc<Self>> {
        Ok(Self::new(bincode::serialize(value)?))
    }

    /// Object materialized from a store's bytes.
    pub fn restored(payload: Vec<u8>) -> Arc<Self> {
        Self::with_state(payload, ObjectState::Ready)
    }

    fn with_state(payload: Vec<u8>, state: ObjectState) -> Arc<Self> {
        Arc::new(ManagedObject {
            token: OnceLock::new(),
            inner: Mutex::new(ObjectInner {
                state,
                payload,
                before_image: None,
                lock_owner: None,
                locks_taken: 0,
                update_sequence: 0,
            }),
            lock_released: Condvar::new(),
        })
    }

    /// Deserialize the payload with bincode.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        let inner = self.inner.lock();
        Ok(bincode::deserialize(&inner.payload)?)
    }

    /// Replace the payload with the bincode form of `value`.
    pub fn set_value<T: Serialize>(&self, value: &T) -> Result<()> {
        self.set_payload(bincode::serialize(value)?);
        Ok(())
    }

    /// Copy of the serialized payload.
    pub fn payload(&self) -> Vec<u8> {
        self.inner.lock().payload.clone()
    }

    /// Length of the serialized payload.
    pub fn payload_len(&self) -> usize {
        self.inner.lock().payload.len()
    }

    /// Overwrite the payload in memory.
    ///
    /// The change only becomes durable through a transaction: lock the
    /// object, change it, then replace it.
    pub fn set_payload(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.payload = payload;
        inner.update_sequence += 1;
    }

    /// Number of in-memory updates applied to this object.
    pub fn update_sequence(&self) -> u64 {
        self.inner.lock().update_sequence
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObjectState {
        self.inner.lock().state
    }

    /// Owning token, once the object has been allocated or loaded.
    pub fn token(&self) -> Option<&Token> {
        self.token.get()
    }

    pub(crate) fn bind_token(&self, token: Token) -> Result<()> {
        let bound = self.token.get_or_init(|| token.clone());
        if bound.id() != token.id() {
            return Err(Error::invalid_state(
                format!("object {}", bound.id()),
                self.state(),
                "rebind to another token",
            ));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self.token.get() {
            Some(token) => format!("object {}", token.id()),
            None => "unallocated object".to_string(),
        }
    }

    /// Transaction holding the lock, if any.
    pub fn locked_by(&self) -> Option<TxnId> {
        self.inner.lock().lock_owner
    }

    /// Whether `txn` holds the lock.
    pub fn is_locked_by(&self, txn: TxnId) -> bool {
        self.inner.lock().lock_owner == Some(txn)
    }

    /// Lock the object for `txn`, waiting while another transaction holds it.
    ///
    /// The first lock taken by a transaction captures the before-image.
    pub fn lock(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        while matches!(inner.lock_owner, Some(owner) if owner != txn) {
            self.lock_released.wait(&mut inner);
        }
        self.lock_held(&mut inner, txn)
    }

    /// Lock without waiting. Returns `false` if another transaction holds it.
    pub fn try_lock(&self, txn: TxnId) -> Result<bool> {
        let mut inner = self.inner.lock();
        if matches!(inner.lock_owner, Some(owner) if owner != txn) {
            return Ok(false);
        }
        self.lock_held(&mut inner, txn)?;
        Ok(true)
    }

    fn lock_held(&self, inner: &mut ObjectInner, txn: TxnId) -> Result<()> {
        let next = inner.state.next(ObjectEvent::Lock);
        if next == ObjectState::Error {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                ObjectEvent::Lock.operation(),
            ));
        }
        if inner.lock_owner.is_none() {
            inner.lock_owner = Some(txn);
            inner.before_image = Some(inner.payload.clone());
        }
        inner.locks_taken += 1;
        inner.state = next;
        Ok(())
    }

    /// Release a lock taken by `txn` without any change, e.g. when the
    /// operation that needed it failed.
    pub fn unlock(&self, txn: TxnId) {
        let mut inner = self.inner.lock();
        if inner.lock_owner != Some(txn) {
            return;
        }
        inner.locks_taken = inner.locks_taken.saturating_sub(1);
        if inner.locks_taken == 0 {
            if inner.state == ObjectState::Locked {
                inner.state = ObjectState::Ready;
            }
            inner.lock_owner = None;
            inner.before_image = None;
            drop(inner);
            self.lock_released.notify_all();
        }
    }

    fn transition_owned(&self, txn: TxnId, event: ObjectEvent) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = inner.state.next(event);
        if inner.lock_owner != Some(txn) || next == ObjectState::Error {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                event.operation(),
            ));
        }
        inner.state = next;
        Ok(())
    }

    /// Constructed → Added, for an object locked by `txn`.
    pub fn mark_added(&self, txn: TxnId) -> Result<()> {
        self.transition_owned(txn, ObjectEvent::Add)
    }

    /// Locked → Replaced, for an object locked by `txn`.
    pub fn mark_replaced(&self, txn: TxnId) -> Result<()> {
        self.transition_owned(txn, ObjectEvent::Replace)
    }

    /// Mark an object locked by `txn` for deletion.
    pub fn mark_deleted(&self, txn: TxnId) -> Result<()> {
        self.transition_owned(txn, ObjectEvent::Delete)
    }

    /// Undo `mark_added` after the add could not be logged.
    pub fn revert_added(&self, txn: TxnId) {
        let mut inner = self.inner.lock();
        if inner.lock_owner == Some(txn) && inner.state == ObjectState::Added {
            inner.state = ObjectState::Constructed;
        }
    }

    /// Undo `mark_replaced` or `mark_deleted` after the change could not
    /// be logged, back to the plain locked state.
    pub fn revert_to_locked(&self, txn: TxnId, previous: ObjectState) {
        let mut inner = self.inner.lock();
        if inner.lock_owner == Some(txn) {
            inner.state = previous;
        }
    }

    /// Check that the object may be optimistically replaced.
    pub fn check_optimistic_replace(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.state.next(ObjectEvent::OptimisticReplace) == ObjectState::Error {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                ObjectEvent::OptimisticReplace.operation(),
            ));
        }
        Ok(())
    }

    /// What commit of `txn` means for the store.
    pub fn commit_action(&self, txn: TxnId) -> Result<StoreAction> {
        let inner = self.inner.lock();
        if inner.lock_owner != Some(txn) {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                ObjectEvent::Commit.operation(),
            ));
        }
        Ok(match inner.state {
            ObjectState::Added | ObjectState::Replaced => StoreAction::Add,
            ObjectState::ToBeDeleted | ObjectState::MustBeDeleted => StoreAction::Remove,
            _ => StoreAction::None,
        })
    }

    /// Finish commit for `txn` after the store was updated, releasing the lock.
    pub fn complete_commit(&self, txn: TxnId) -> Result<()> {
        self.complete(txn, ObjectEvent::Commit, false)
    }

    /// Back out the changes made under `txn`, restoring the before-image
    /// and releasing the lock.
    pub fn backout(&self, txn: TxnId) -> Result<()> {
        self.complete(txn, ObjectEvent::Backout, true)
    }

    fn complete(&self, txn: TxnId, event: ObjectEvent, restore: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = inner.state.next(event);
        if inner.lock_owner != Some(txn) || next == ObjectState::Error {
            return Err(Error::invalid_state(
                self.describe(),
                inner.state,
                event.operation(),
            ));
        }
        if restore && next == ObjectState::Ready {
            if let Some(before) = inner.before_image.take() {
                inner.payload = before;
                inner.update_sequence += 1;
            }
        }
        inner.state = next;
        inner.lock_owner = None;
        inner.locks_taken = 0;
        inner.before_image = None;
        drop(inner);
        self.lock_released.notify_all();
        Ok(())
    }

    /// Copy the payload of `other` into this cell, keeping state and lock.
    pub fn become_clone_of(&self, other: &ManagedObject) {
        if std::ptr::eq(self, other) {
            return;
        }
        let payload = other.payload();
        self.set_payload(payload);
    }

    /// Force state and owner while a transaction is rebuilt from the log.
    ///
    /// `before_image` is what backout will restore if the recovered
    /// transaction turns out to be an orphan.
    pub fn restore_for_recovery(
        &self,
        txn: TxnId,
        state: ObjectState,
        before_image: Option<Vec<u8>>,
    ) {
        let mut inner = self.inner.lock();
        if inner.lock_owner != Some(txn) {
            inner.before_image = before_image;
        }
        inner.lock_owner = Some(txn);
        inner.locks_taken = inner.locks_taken.max(1);
        inner.state = state;
    }

    /// Put the object into the error state; used when its store goes away.
    pub fn mark_error(&self) {
        let mut inner = self.inner.lock();
        inner.state = ObjectState::Error;
        inner.lock_owner = None;
        drop(inner);
        self.lock_released.notify_all();
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManagedObject")
            .field("token", &self.token.get().map(|t| t.id()))
            .field("state", &inner.state)
            .field("payload_len", &inner.payload.len())
            .field("lock_owner", &inner.lock_owner)
            .finish()
    }
}
