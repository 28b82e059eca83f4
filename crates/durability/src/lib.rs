//! Durability layer for the object manager
//!
//! This crate handles everything that touches the log file:
//!
//! - Record: the [`LogRecord`] family describing redoable actions and its byte codec
//! - Format: double-written header, sector bits, part headers
//! - Log: the [`LogOutput`] trait, the circular [`FileLogWriter`] and the
//!   warm-start [`FileLogReader`]
//!
//! Transactions and recovery build on this crate; it knows nothing about
//! them beyond the identifiers and states recorded in log records.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format; // Header, page and part byte layouts
pub mod log; // Writer, reader and the LogOutput seam
pub mod record; // LogRecord family and codec

// === Re-exports ===
pub use format::{HeaderError, LogHeader, PAGE_SIZE};
pub use log::{
    space_for, FileLogReader, FileLogWriter, LogConfig, LogConfigError, LogCounters, LogOutput,
    MemoryLog, NullLog, ReadStopReason, ResumePoint,
};
pub use record::{
    LogRecord, LoggedObject, OptimisticBatch, RecordError, RecordType, TransactionCheckpoint,
    MAX_TERMINAL_RECORD_LEN,
};
