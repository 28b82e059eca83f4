//! Object stores for the object manager
//!
//! Two implementations of the [`ObjectStore`](objmgr_core::ObjectStore)
//! capability:
//!
//! - [`MemoryObjectStore`]: non-persistent, never logged, empty on every open
//! - [`FileObjectStore`]: persistent, committed objects flushed to one
//!   snapshot file at each checkpoint and reloaded at warm start
//!
//! Both keep committed bytes in a `DashMap`, hand out tokens through an
//! [`IdentityMap`](objmgr_core::IdentityMap) and account for space with a
//! [`SpaceAccount`] that applies the store's full policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod file;
pub mod memory;
pub mod snapshot;
pub mod space;
mod table;

pub use config::{StoreConfig, StoreConfigError};
pub use file::FileObjectStore;
pub use memory::MemoryObjectStore;
pub use snapshot::{SnapshotError, StoreSnapshot};
pub use space::SpaceAccount;
pub use table::StoreCounters;
