//! Identifier types shared by every layer.
//!
//! - [`ObjectStoreId`]: identifies one object store inside an object manager
//! - [`StoredObjectId`]: per-store sequence number of a stored object
//! - [`TokenId`]: the (store, object) pair a [`Token`](crate::Token) stands for
//! - [`LogicalUnitOfWork`]: groups every log record written by one transaction
//! - [`LogSequenceNumber`]: position of a record in the write order of the log

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic number assigned to every record written to the log.
pub type LogSequenceNumber = u64;

/// Identifier of an internal transaction object.
///
/// Unlike a [`LogicalUnitOfWork`], this stays the same when a transaction
/// is reused, and it is what managed objects record as their lock owner.
pub type TxnId = u64;

/// Maximum length in bytes of a two-phase commit branch identifier.
pub const MAX_XID_SIZE: usize = 140;

/// Identifier of an object store, unique within one object manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectStoreId(pub u32);

impl fmt::Display for ObjectStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// Sequence number of an object within its store. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoredObjectId(pub u64);

impl fmt::Display for StoredObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity behind a token, detached from any live instance.
///
/// This is what log records carry: recovery turns it back into the
/// canonical [`Token`](crate::Token) through the owning store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    /// Store that owns the object
    pub store: ObjectStoreId,
    /// Sequence number inside that store
    pub object: StoredObjectId,
}

impl TokenId {
    /// Create a token identity from raw numbers.
    pub fn new(store: u32, object: u64) -> Self {
        TokenId {
            store: ObjectStoreId(store),
            object: StoredObjectId(object),
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store.0, self.object.0)
    }
}

/// Identifier grouping all log records of one transaction into an
/// all-or-nothing unit.
///
/// A transaction gets a fresh unit each time it is reused. The optional
/// XID names the branch when the transaction takes part in an external
/// two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalUnitOfWork {
    /// Unique identifier, never reused by one object manager
    pub id: u64,
    /// Two-phase commit branch identifier, at most [`MAX_XID_SIZE`] bytes
    pub xid: Option<Vec<u8>>,
}

impl LogicalUnitOfWork {
    /// Create a unit of work without an XID.
    pub fn new(id: u64) -> Self {
        LogicalUnitOfWork { id, xid: None }
    }
}

impl fmt::Display for LogicalUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "luw-{}", self.id)
    }
}
