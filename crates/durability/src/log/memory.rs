//! In-memory log.
//!
//! Keeps every record it is given, in order, and applies the same space
//! rules as the file log against an optional byte capacity. Higher layers
//! use it in tests to see exactly what was logged and to provoke a full
//! log without filling a file.

use super::{space_for, LogOutput};
use crate::record::LogRecord;
use objmgr_core::{Error, LogSequenceNumber, Result};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<(LogSequenceNumber, LogRecord, bool)>,
    sequence: LogSequenceNumber,
    used: u64,
    reserved: u64,
    mark: Option<usize>,
}

/// Log that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    capacity: Option<u64>,
    inner: Mutex<MemoryInner>,
}

impl MemoryLog {
    /// Unbounded log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that refuses writes beyond `capacity` bytes.
    pub fn with_capacity(capacity: u64) -> Self {
        MemoryLog {
            capacity: Some(capacity),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Every record still in the log, in write order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .map(|(_, record, _)| record.clone())
            .collect()
    }

    /// Number of records written with `force`.
    pub fn forced_count(&self) -> usize {
        self.inner.lock().records.iter().filter(|(_, _, f)| *f).count()
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> u64 {
        self.inner.lock().reserved
    }

    fn available(&self, inner: &MemoryInner) -> u64 {
        match self.capacity {
            Some(capacity) => capacity.saturating_sub(inner.used + inner.reserved),
            None => u64::MAX,
        }
    }

    fn append(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
        mark: bool,
    ) -> Result<LogSequenceNumber> {
        let mut inner = self.inner.lock();
        let needed = space_for(record.encoded_len(), force);
        if let Some(capacity) = self.capacity {
            let available = self.available(&inner);
            let physical = capacity.saturating_sub(inner.used);
            if (check_space && needed + reserved_delta > available as i64)
                || needed as u64 > physical
            {
                return Err(Error::LogFull {
                    requested: needed.max(0) as u64,
                    available,
                });
            }
        }
        inner.used += needed as u64;
        inner.reserved = (inner.reserved as i64 + reserved_delta).max(0) as u64;
        inner.sequence += 1;
        let sequence = inner.sequence;
        if mark {
            inner.mark = Some(inner.records.len());
        }
        inner.records.push((sequence, record.clone(), force));
        Ok(sequence)
    }
}

impl LogOutput for MemoryLog {
    fn write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        self.append(record, reserved_delta, check_space, force, false)
    }

    fn mark_and_write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        self.append(record, reserved_delta, check_space, force, true)
    }

    fn reserve(&self, delta: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if delta > 0 && delta as u64 > self.available(&inner) {
            return Err(Error::LogFull {
                requested: delta as u64,
                available: self.available(&inner),
            });
        }
        inner.reserved = (inner.reserved as i64 + delta).max(0) as u64;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mark) = inner.mark.take() {
            inner.records.drain(..mark);
            inner.used = inner
                .records
                .iter()
                .map(|(_, record, forced)| space_for(record.encoded_len(), *forced) as u64)
                .sum();
        }
        Ok(())
    }

    fn occupancy(&self) -> f64 {
        let inner = self.inner.lock();
        match self.capacity {
            Some(capacity) if capacity > 0 => {
                ((inner.used + inner.reserved) as f64 / capacity as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    fn last_sequence(&self) -> LogSequenceNumber {
        self.inner.lock().sequence
    }
}
