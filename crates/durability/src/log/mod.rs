//! The write-ahead log
//!
//! Transactions and the checkpoint coordinator write through the
//! [`LogOutput`] trait. [`FileLogWriter`] is the real implementation; a
//! [`NullLog`] stands in while the log is replayed, so that redriving a
//! logged operation never writes it a second time.
//!
//! # Space
//!
//! The log is a fixed-size circular file. Space is only freed when a
//! checkpoint truncates everything before its start. A transaction
//! therefore reserves, ahead of time, the space its terminal record and a
//! checkpoint rewrite of its changes will need, so that it can always
//! finish even when other writers have filled the log.
//!
//! # Module Structure
//!
//! - `config`: file log configuration
//! - `writer`: page-oriented file writer
//! - `reader`: scanner used at warm start
//! - `memory`: in-memory log for tests of higher layers

pub mod config;
pub mod memory;
pub mod reader;
pub mod writer;

pub use config::{LogConfig, LogConfigError};
pub use memory::MemoryLog;
pub use reader::{FileLogReader, ReadStopReason};
pub use writer::{FileLogWriter, LogCounters, ResumePoint};

use crate::format::{PAGE_DATA_CAPACITY, PAGE_SIZE, PART_HEADER_SIZE};
use crate::record::LogRecord;
use objmgr_core::{LogSequenceNumber, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Destination of log records.
pub trait LogOutput: Send + Sync {
    /// Append `record` and return its sequence number.
    ///
    /// `reserved_delta` is added to the log's reserved bytes once the
    /// record is written; a negative delta releases a reservation made
    /// earlier and may pay for this write. With `check_space` the write
    /// fails with [`Error::LogFull`](objmgr_core::Error::LogFull) if the
    /// unreserved space cannot take it. With `force` the record is on disk
    /// when the call returns.
    fn write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber>;

    /// Like [`write_next`](LogOutput::write_next), and remember where the
    /// record starts as the point a later [`truncate`](LogOutput::truncate)
    /// moves the log start to.
    fn mark_and_write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber>;

    /// Reserve (positive) or release (negative) space without writing.
    fn reserve(&self, delta: i64) -> Result<()>;

    /// Force everything written so far to disk.
    fn flush(&self) -> Result<()>;

    /// Discard everything before the last mark.
    fn truncate(&self) -> Result<()>;

    /// Fraction of the log in use or reserved, 0.0 to 1.0.
    fn occupancy(&self) -> f64;

    /// Sequence number of the last record written.
    fn last_sequence(&self) -> LogSequenceNumber;
}

/// Bytes to reserve so that a record of `len` encoded bytes can be written.
///
/// Covers part headers, sector bytes and, for a forced write, padding the
/// rest of the page.
pub fn space_for(len: usize, forced: bool) -> i64 {
    let per_part = PAGE_DATA_CAPACITY - PART_HEADER_SIZE;
    let parts = len / per_part + 2;
    let data = len + parts * PART_HEADER_SIZE + PART_HEADER_SIZE;
    let pages = data / PAGE_DATA_CAPACITY + 1;
    let mut bytes = data + pages;
    if forced {
        bytes += PAGE_SIZE;
    }
    bytes as i64
}

/// Log that discards records and only counts them.
///
/// Installed while the log is being replayed.
#[derive(Debug, Default)]
pub struct NullLog {
    sequence: AtomicU64,
}

impl NullLog {
    /// Log whose first record gets sequence number 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogOutput for NullLog {
    fn write_next(
        &self,
        _record: &LogRecord,
        _reserved_delta: i64,
        _check_space: bool,
        _force: bool,
    ) -> Result<LogSequenceNumber> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn mark_and_write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        self.write_next(record, reserved_delta, check_space, force)
    }

    fn reserve(&self, _delta: i64) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }

    fn occupancy(&self) -> f64 {
        0.0
    }

    fn last_sequence(&self) -> LogSequenceNumber {
        self.sequence.load(Ordering::SeqCst)
    }
}
