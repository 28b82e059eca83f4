//! objmgr - embedded transactional object store
//!
//! Applications keep serialized objects in object stores and change them
//! under transactions. Every change to a persistent store is written to a
//! circular write-ahead log first; checkpoints flush the stores and let the
//! log wrap, and a warm start replays whatever the stores have not seen.
//!
//! # Quick Start
//!
//! ```ignore
//! use objmgr::{FileObjectStore, ManagedObject, ObjectManager, ObjectStore, StoreConfig};
//!
//! let store = FileObjectStore::new(dir, StoreConfig::new(1, "accounts"))?;
//! let manager = ObjectManager::builder(dir).with_store(store.clone()).open()?;
//!
//! let account = ManagedObject::from_value(&100u64)?;
//! store.allocate(&account)?;
//!
//! let txn = manager.begin()?;
//! txn.add(&account)?;
//! txn.commit(false)?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! objmgr-engine       ObjectManager, recovery, checkpoints
//! objmgr-concurrency  transactions and their state machine
//! objmgr-durability   log records, circular file log
//! objmgr-storage      memory and file object stores
//! objmgr-core         tokens, managed objects, errors
//! ```

pub use objmgr_concurrency::{
    OptimisticUpdate, Transaction, TransactionCallback, TransactionCounters,
};
pub use objmgr_core::{
    Error, FullPolicy, LogicalUnitOfWork, ManagedObject, ObjectState, ObjectStore, ObjectStoreId,
    OpenMode, Result, StoredObjectId, Token, TransactionState,
};
pub use objmgr_durability::{LogCounters, LogRecord};
pub use objmgr_engine::{
    CheckpointCounters, CheckpointOutcome, ManagerState, ObjectManager, ObjectManagerBuilder,
    ObjectManagerConfig, RecoveryStats, UserRecordHandler, CONFIG_FILE_NAME,
};
pub use objmgr_storage::{FileObjectStore, MemoryObjectStore, StoreConfig};
