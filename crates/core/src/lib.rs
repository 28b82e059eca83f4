//! Core types and traits for the object manager
//!
//! This crate defines the foundational types used throughout the system:
//! - Identifiers: ObjectStoreId, StoredObjectId, TokenId, LogicalUnitOfWork
//! - Token: canonical handle for a stored object, one live instance per identity
//! - ManagedObject: shared cell holding an object's serialized state and lock
//! - IdentityMap: per-store registry of live tokens and the sequence counter
//! - TransactionState: transaction state machine tables
//! - ObjectStore: the storage capability transactions and recovery rely on
//! - Error: error taxonomy shared by every crate

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
pub mod error;
pub mod identity;
pub mod managed;
pub mod token;
pub mod traits;
pub mod txn_state;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types and traits
pub use error::{Error, IoFailure, Result};
pub use identity::IdentityMap;
pub use managed::{ManagedObject, ObjectState, StoreAction};
pub use token::Token;
pub use traits::{FullPolicy, ObjectStore, OpenMode};
pub use txn_state::{TransactionState, TransitionEvent};
pub use types::{
    LogSequenceNumber, LogicalUnitOfWork, ObjectStoreId, StoredObjectId, TokenId, TxnId,
    MAX_XID_SIZE,
};
