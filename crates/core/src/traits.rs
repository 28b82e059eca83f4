//! Core trait definitions
//!
//! [`ObjectStore`] is the capability the transaction and recovery engine
//! needs from a store. How objects are laid out on disk is up to the
//! implementation.

use crate::error::Result;
use crate::managed::ManagedObject;
use crate::token::Token;
use crate::types::{ObjectStoreId, StoredObjectId};
use std::collections::HashSet;
use std::sync::Arc;

/// How a store is opened by its object manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// A new log was created: start from an empty store
    Cold,
    /// The log is being replayed: load the last flushed contents
    Warm,
}

/// What a store does when a reservation does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPolicy {
    /// Refuse immediately with a store-full error
    Fail,
    /// Wait up to the given time for space to be released
    Wait(std::time::Duration),
}

/// Storage capability used by transactions and recovery.
///
/// Implementations must be thread-safe. Objects reach a store only when a
/// transaction commits, and a store is flushed only by a checkpoint, so a
/// persistent store never holds data the log does not describe.
pub trait ObjectStore: Send + Sync {
    /// Identifier of this store within its object manager.
    fn identifier(&self) -> ObjectStoreId;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Whether changes to objects in this store are logged and survive a
    /// restart. Non-persistent stores are never logged.
    fn is_persistent(&self) -> bool;

    /// Assign a fresh, never reused identity to `object` and return its token.
    fn allocate(&self, object: &Arc<ManagedObject>) -> Result<Token>;

    /// The canonical token for `id`, registering one if none is live.
    fn like(&self, id: StoredObjectId) -> Token;

    /// The stored object behind `token`, or `None` if it is not stored.
    fn get(&self, token: &Token) -> Result<Option<Arc<ManagedObject>>> {
        if !self.contains(token.object_id()) {
            return Ok(None);
        }
        token.get_managed_object()
    }

    /// Whether an object with this identity is stored.
    fn contains(&self, id: StoredObjectId) -> bool;

    /// Raw bytes of a stored object, used when a token loads its object.
    fn load(&self, id: StoredObjectId) -> Result<Option<Vec<u8>>>;

    /// Store the current payload of `object`.
    ///
    /// `requires_current_checkpoint` is set while a checkpoint is running
    /// and the change must be part of the flush that ends it. The provided
    /// stores flush a complete snapshot of their committed objects, so for
    /// them the flag is advisory and every stored change reaches the next
    /// flush whatever its value.
    fn add(&self, object: &ManagedObject, requires_current_checkpoint: bool) -> Result<()>;

    /// Remove the object behind `token`. Removing an absent object is a no-op.
    ///
    /// `requires_current_checkpoint` has the same meaning as for [`add`](Self::add).
    fn remove(&self, token: &Token, requires_current_checkpoint: bool) -> Result<()>;

    /// Reserve (positive) or release (negative) space ahead of adds.
    ///
    /// With `pacing` the caller accepts being held back by the store's
    /// [`FullPolicy`]; without it a full store refuses at once.
    fn reserve(&self, delta: i64, pacing: bool) -> Result<()>;

    /// Make the current contents durable.
    fn flush(&self) -> Result<()>;

    /// Prepare the store for use by an object manager.
    fn open(&self, mode: OpenMode) -> Result<()>;

    /// Detach from the object manager and invalidate all tokens.
    fn close(&self) -> Result<()>;

    /// Every live token of this store.
    fn tokens(&self) -> HashSet<Token>;
}
