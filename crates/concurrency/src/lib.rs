//! Transactions for the object manager
//!
//! This crate implements the transaction engine:
//! - TransactionEnv: the log output, registry and counters shared by all transactions
//! - InternalTransaction: the state machine that locks, logs and completes changes
//! - Transaction: the handle applications hold
//! - TransactionCallback: hooks driven around prepare, commit and backout
//! - Replay: rebuilding transactions from log records at warm start
//!
//! Changes to persistent objects are logged before they can reach a store;
//! stores only change when a unit of work commits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callback;
pub mod env;
pub mod internal;
mod replay;
pub mod reservation;
pub mod transaction;

pub use callback::TransactionCallback;
pub use env::{Supervisor, TransactionCounters, TransactionEnv};
pub use internal::InternalTransaction;
pub use reservation::{object_space, token_space, transaction_overhead};
pub use transaction::{OptimisticUpdate, Transaction};
