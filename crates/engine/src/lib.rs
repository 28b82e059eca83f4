//! Object manager engine
//!
//! This crate ties the lower layers together:
//! - ObjectManager: opens the log and stores, cold or warm, and shuts them down
//! - Recovery: replays the log into stand-in transactions and resolves orphans
//! - Checkpoint: restates open transactions, flushes stores, truncates the log
//! - StoreRegistry: the stores log records are resolved against
//!
//! # Quick Start
//!
//! ```ignore
//! use objmgr_core::{ManagedObject, ObjectStore};
//! use objmgr_engine::ObjectManager;
//! use objmgr_storage::{FileObjectStore, StoreConfig};
//!
//! let store = FileObjectStore::new(dir, StoreConfig::new(1, "accounts"))?;
//! let manager = ObjectManager::builder(dir).with_store(store.clone()).open()?;
//!
//! let txn = manager.begin()?;
//! let account = ManagedObject::from_value(&100u64)?;
//! store.allocate(&account)?;
//! txn.add(&account)?;
//! txn.commit(false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod manager;
pub mod recovery;
pub mod registry;

pub use checkpoint::{CheckpointCounters, CheckpointOutcome};
pub use manager::config::{ObjectManagerConfig, CONFIG_FILE_NAME};
pub use manager::{ManagerState, ObjectManager, ObjectManagerBuilder};
pub use recovery::{perform_recovery, RecoveryStats, UserRecordHandler};
pub use registry::StoreRegistry;
