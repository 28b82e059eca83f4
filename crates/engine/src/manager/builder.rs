//! Object manager builder
//!
//! Collects the stores and hooks an object manager starts with. Stores
//! must be registered before opening: warm start replays changes into
//! them, and a log record naming a store that is not registered stops the
//! open with [`Error::UnknownStore`](objmgr_core::Error::UnknownStore).

use super::config::{ObjectManagerConfig, CONFIG_FILE_NAME};
use super::ObjectManager;
use crate::recovery::UserRecordHandler;
use crate::registry::StoreRegistry;
use objmgr_concurrency::TransactionCallback;
use objmgr_core::{ObjectStore, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for [`ObjectManager`].
///
/// ```ignore
/// use objmgr_engine::ObjectManager;
/// use objmgr_storage::{FileObjectStore, StoreConfig};
///
/// let store = FileObjectStore::new(dir, StoreConfig::new(1, "accounts"))?;
/// let manager = ObjectManager::builder(dir).with_store(store).open()?;
/// ```
pub struct ObjectManagerBuilder {
    dir: PathBuf,
    config: Option<ObjectManagerConfig>,
    stores: Vec<Arc<dyn ObjectStore>>,
    user_records: Option<Arc<dyn UserRecordHandler>>,
    recovery_callback: Option<Arc<dyn TransactionCallback>>,
}

impl ObjectManagerBuilder {
    /// Builder for an object manager keeping its log in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ObjectManagerBuilder {
            dir: dir.into(),
            config: None,
            stores: Vec::new(),
            user_records: None,
            recovery_callback: None,
        }
    }

    /// Use `config` instead of reading `objmgr.toml`.
    pub fn with_config(mut self, config: ObjectManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register an object store.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Hand user-defined records to `handler` during replay.
    pub fn with_user_record_handler(mut self, handler: Arc<dyn UserRecordHandler>) -> Self {
        self.user_records = Some(handler);
        self
    }

    /// Register `callback` on every unit of work recovery has to resolve.
    pub fn with_recovery_callback(mut self, callback: Arc<dyn TransactionCallback>) -> Self {
        self.recovery_callback = Some(callback);
        self
    }

    /// Open the object manager: cold start if the directory holds no log,
    /// warm start otherwise.
    pub fn open(self) -> Result<ObjectManager> {
        std::fs::create_dir_all(&self.dir)?;
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => {
                let path = self.dir.join(CONFIG_FILE_NAME);
                ObjectManagerConfig::write_default_if_missing(&path)?;
                ObjectManagerConfig::from_file(&path)?
            }
        };

        let mut stores = StoreRegistry::new();
        for store in self.stores {
            stores.register(store)?;
        }

        ObjectManager::start(
            self.dir,
            config,
            stores,
            self.user_records,
            self.recovery_callback,
        )
    }
}

impl std::fmt::Debug for ObjectManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectManagerBuilder")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("stores", &self.stores.len())
            .finish()
    }
}
