//! Object store configuration.
//!
//! # Example
//!
//! ```ignore
//! use objmgr_storage::StoreConfig;
//! use objmgr_core::FullPolicy;
//! use std::time::Duration;
//!
//! let config = StoreConfig::new(1, "messages")
//!     .with_capacity(64 * 1024 * 1024)
//!     .with_full_policy(FullPolicy::Wait(Duration::from_secs(5)));
//! config.validate()?;
//! ```

use objmgr_core::{Error, FullPolicy, ObjectStoreId};
use std::time::Duration;

/// Configuration shared by every store implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Identifier within the object manager, never 0
    pub identifier: u32,
    /// Name; a file store uses it for its file name
    pub name: String,
    /// Bytes the store may hold, `None` for unlimited
    pub capacity: Option<u64>,
    /// What a reservation that does not fit does
    pub full_policy: FullPolicy,
}

impl StoreConfig {
    /// Unlimited store that fails fast when full.
    pub fn new(identifier: u32, name: impl Into<String>) -> Self {
        StoreConfig {
            identifier,
            name: name.into(),
            capacity: None,
            full_policy: FullPolicy::Fail,
        }
    }

    /// Builder: limit the bytes the store may hold.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Builder: set the full policy.
    pub fn with_full_policy(mut self, policy: FullPolicy) -> Self {
        self.full_policy = policy;
        self
    }

    /// Store identifier as the core type.
    pub fn store_id(&self) -> ObjectStoreId {
        ObjectStoreId(self.identifier)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), StoreConfigError> {
        if self.identifier == 0 {
            return Err(StoreConfigError::ReservedIdentifier);
        }
        if self.name.is_empty()
            || self
                .name
                .chars()
                .any(|c| std::path::is_separator(c) || c == '.')
        {
            return Err(StoreConfigError::BadName(self.name.clone()));
        }
        if self.capacity == Some(0) {
            return Err(StoreConfigError::ZeroCapacity);
        }
        Ok(())
    }

    /// Small store for tests: 1 MiB, waits at most 50ms when full.
    pub fn for_testing(identifier: u32) -> Self {
        StoreConfig::new(identifier, format!("store{}", identifier))
            .with_capacity(1024 * 1024)
            .with_full_policy(FullPolicy::Wait(Duration::from_millis(50)))
    }
}

/// Store configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreConfigError {
    /// Identifier 0 is reserved
    #[error("store identifier 0 is reserved")]
    ReservedIdentifier,

    /// The name is empty or not usable as a file name
    #[error("store name {0:?} must be non-empty without separators or dots")]
    BadName(String),

    /// A capacity of zero can never hold an object
    #[error("store capacity must be greater than zero")]
    ZeroCapacity,
}

impl From<StoreConfigError> for Error {
    fn from(e: StoreConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
