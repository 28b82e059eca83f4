//! Error types for the object manager
//!
//! One taxonomy is shared by every crate:
//!
//! - I/O: transient (a retry may succeed) or permanent (the log or store
//!   can no longer be trusted, the owner should shut down)
//! - Log format: bad header, torn page, malformed part or record
//! - Store format: an object store file that fails its checks
//! - Capacity: log full or store full, recoverable by a checkpoint
//! - State: an operation on a transaction or object in the wrong state
//! - Identity: a sequence-number collision in a store's identity map
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{ObjectStoreId, TokenId};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for object manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an I/O failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFailure {
    /// Interrupted or timed out; the same call may succeed later
    Transient,
    /// Anything else; the file is no longer trustworthy
    Permanent,
}

impl IoFailure {
    /// Classify an `io::Error` by its kind.
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                IoFailure::Transient
            }
            _ => IoFailure::Permanent,
        }
    }
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoFailure::Transient => write!(f, "transient"),
            IoFailure::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error types for the object manager
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the log or an object store file
    #[error("I/O error ({kind}): {source}")]
    Io {
        /// Transient or permanent
        kind: IoFailure,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The log file or one of its records could not be decoded
    #[error("Log format error: {0}")]
    LogFormat(String),

    /// An object store file could not be decoded
    #[error("Store format error: {0}")]
    StoreFormat(String),

    /// The log has no room for the requested bytes
    #[error("Log full: requested {requested} bytes, {available} available")]
    LogFull {
        /// Bytes needed by the write or reservation
        requested: u64,
        /// Unreserved bytes left in the log
        available: u64,
    },

    /// An object store has no room for the requested bytes
    #[error("Object store {store} full: requested {requested} bytes, {available} available")]
    StoreFull {
        /// Store that refused the reservation
        store: ObjectStoreId,
        /// Bytes requested
        requested: u64,
        /// Bytes still available
        available: u64,
    },

    /// Operation attempted on a transaction or object in the wrong state
    #[error("Invalid state: cannot {operation} {entity} in state {state}")]
    InvalidState {
        /// What was operated on, e.g. "transaction 4" or "object 1/7"
        entity: String,
        /// Its state at the time of the call
        state: String,
        /// The refused operation
        operation: &'static str,
    },

    /// Invalid argument to an otherwise valid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A store handed out a sequence number that is already registered
    #[error("Duplicate identity: {0} is already registered")]
    DuplicateIdentity(TokenId),

    /// A log record or token names a store that is not registered
    #[error("Unknown object store {0}")]
    UnknownStore(ObjectStoreId),

    /// Payload serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The configured limit of concurrently active transactions was hit
    #[error("Too many active transactions (limit {limit})")]
    TooManyTransactions {
        /// Configured limit
        limit: usize,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid state error.
    pub fn invalid_state(
        entity: impl fmt::Display,
        state: impl fmt::Debug,
        operation: &'static str,
    ) -> Self {
        Error::InvalidState {
            entity: entity.to_string(),
            state: format!("{:?}", state),
            operation,
        }
    }

    /// Create a log format error.
    pub fn log_format(message: impl Into<String>) -> Self {
        Error::LogFormat(message.into())
    }

    /// True for log-full and store-full, which a checkpoint can relieve.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::LogFull { .. } | Error::StoreFull { .. })
    }

    /// True for I/O failures after which the files cannot be trusted.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Io {
                kind: IoFailure::Permanent,
                ..
            }
        )
    }

    /// True for I/O failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io {
                kind: IoFailure::Transient,
                ..
            }
        )
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            kind: IoFailure::classify(&source),
            source,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
