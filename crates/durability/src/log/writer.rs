//! File log writer.
//!
//! Records are copied into a one-page buffer as parts and the buffer is
//! written out when it fills. A forced write pads the rest of the page,
//! writes it and syncs, so a forced record is on disk when the call
//! returns and every page on disk is complete.
//!
//! # Circular Reuse
//!
//! The data pages are reused in a cycle. Each time the writer wraps back
//! to the first data page it flips the sector byte, so pages left over
//! from the previous cycle read as unwritten. The writer never gets
//! closer than one page behind the log start; space before the start is
//! released by [`truncate`](FileLogWriter::truncate) after a checkpoint.
//!
//! # Thread Safety
//!
//! One mutex protects the page buffer, file and header. Records of
//! concurrent writers therefore interleave only at record boundaries.

use super::config::LogConfig;
use super::{space_for, LogOutput};
use crate::format::{
    check_and_restore, set_sector_bits, LogHeader, PartHeader, PartType, SectorCheck,
    FIRST_DATA_PAGE, PAGE_SIZE, PART_HEADER_SIZE, SECTOR_SIZE,
};
use crate::record::{LogRecord, RecordCursor, PADDING_OVERHEAD};
use objmgr_core::{Error, LogSequenceNumber, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// A page-aligned position in the log together with the sector byte of
/// the cycle it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Byte address in the file
    pub address: u64,
    /// Sector byte pages at this position carry
    pub sector_byte: u8,
}

/// Cumulative file log counters.
///
/// These accumulate over the lifetime of the writer and are never reset.
#[derive(Debug, Clone, Default)]
pub struct LogCounters {
    /// Records appended
    pub records_written: u64,
    /// Encoded record bytes appended
    pub bytes_written: u64,
    /// Pages written to the file
    pub pages_written: u64,
    /// Writes that forced the log
    pub forced_writes: u64,
    /// Total nanoseconds spent in `sync_data`
    pub sync_nanos: u64,
    /// Writes refused because the log was full
    pub log_full_refusals: u64,
}

struct WriterState {
    file: File,
    header: LogHeader,
    page: Vec<u8>,
    /// File offset of the page being filled
    page_address: u64,
    /// Next free byte in `page`; byte 0 is kept for the sector bits
    fill: usize,
    sector_byte: u8,
    /// Bytes between the log start and the write position
    used: u64,
    reserved: u64,
    next_multipart_id: u8,
    mark: Option<ResumePoint>,
    sequence: LogSequenceNumber,
    counters: LogCounters,
    closed: bool,
}

/// Circular, page-oriented log file.
pub struct FileLogWriter {
    path: PathBuf,
    sync_on_force: bool,
    state: Mutex<WriterState>,
}

/// Circular distance from `from` to `to` in a file of `file_size` bytes.
fn distance(from: u64, to: u64, file_size: u64) -> u64 {
    if to >= from {
        to - from
    } else {
        (file_size - from) + (to - FIRST_DATA_PAGE)
    }
}

fn page_base(address: u64) -> u64 {
    FIRST_DATA_PAGE + (address - FIRST_DATA_PAGE) / PAGE_SIZE as u64 * PAGE_SIZE as u64
}

/// A page whose sector bits disagree with each other, so it reads as
/// torn whatever cycle the reader expects.
fn invalidated_page() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[SECTOR_SIZE - 1] = 1;
    page
}

impl FileLogWriter {
    /// Create a new, empty log file in `dir`, replacing any existing one.
    pub fn create(dir: &Path, config: &LogConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&config.file_name);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(config.file_size())?;

        let header = LogHeader::new(config.file_size());
        header.write_both(&mut file)?;

        info!(
            target: "objmgr::log",
            path = %path.display(),
            pages = config.log_pages,
            "Created file log"
        );

        Ok(Self::with_state(
            path,
            config,
            file,
            header,
            ResumePoint {
                address: FIRST_DATA_PAGE,
                sector_byte: header.sector_byte,
            },
        ))
    }

    /// Reopen an existing log for appending at `resume`, the point where
    /// a [`FileLogReader`](super::FileLogReader) found the end of the data.
    ///
    /// Any page between `resume` and the log start that still looks
    /// written is invalidated first, so that data left over from before a
    /// crash can never be mistaken for a continuation of new writes.
    pub fn open(dir: &Path, config: &LogConfig, resume: ResumePoint) -> Result<Self> {
        config.validate()?;
        let path = dir.join(&config.file_name);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = LogHeader::read_current(&mut file)?;

        if header.file_size != config.file_size() {
            warn!(
                target: "objmgr::log",
                file_size = header.file_size,
                configured = config.file_size(),
                "Log file size differs from configuration, keeping the file's size"
            );
        }
        if resume.address < FIRST_DATA_PAGE
            || resume.address >= header.file_size
            || (resume.address - FIRST_DATA_PAGE) % PAGE_SIZE as u64 != 0
        {
            return Err(Error::log_format(format!(
                "resume address {} is not a data page",
                resume.address
            )));
        }

        let invalidated = Self::invalidate_stale_pages(&mut file, &header, resume)?;
        if invalidated > 0 {
            info!(
                target: "objmgr::log",
                pages = invalidated,
                "Invalidated stale pages ahead of the write position"
            );
        }

        debug!(
            target: "objmgr::log",
            path = %path.display(),
            start = header.start_address,
            resume = resume.address,
            "Reopened file log"
        );

        Ok(Self::with_state(path, config, file, header, resume))
    }

    fn with_state(
        path: PathBuf,
        config: &LogConfig,
        file: File,
        header: LogHeader,
        resume: ResumePoint,
    ) -> Self {
        let used = distance(header.start_address, resume.address + 1, header.file_size);
        FileLogWriter {
            path,
            sync_on_force: config.sync_on_force,
            state: Mutex::new(WriterState {
                file,
                header,
                page: vec![0u8; PAGE_SIZE],
                page_address: resume.address,
                fill: 1,
                sector_byte: resume.sector_byte,
                used,
                reserved: 0,
                next_multipart_id: 1,
                mark: None,
                sequence: 0,
                counters: LogCounters::default(),
                closed: false,
            }),
        }
    }

    fn invalidate_stale_pages(
        file: &mut File,
        header: &LogHeader,
        resume: ResumePoint,
    ) -> io::Result<u64> {
        let start_page = page_base(header.start_address);
        let total_pages = (header.file_size - FIRST_DATA_PAGE) / PAGE_SIZE as u64;
        let blank = invalidated_page();
        let mut page = vec![0u8; PAGE_SIZE];
        let mut address = resume.address;
        let mut sector_byte = resume.sector_byte;
        let mut invalidated = 0;

        for _ in 0..total_pages {
            if address == start_page {
                break;
            }
            file.seek(SeekFrom::Start(address))?;
            file.read_exact(&mut page)?;
            if page != blank && check_and_restore(&mut page, sector_byte) != SectorCheck::Unwritten
            {
                file.seek(SeekFrom::Start(address))?;
                file.write_all(&blank)?;
                invalidated += 1;
            }
            address += PAGE_SIZE as u64;
            if address >= header.file_size {
                address = FIRST_DATA_PAGE;
                sector_byte ^= 1;
            }
        }
        if invalidated > 0 {
            file.sync_data()?;
        }
        Ok(invalidated)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> LogCounters {
        self.state.lock().counters.clone()
    }

    /// The current header.
    pub fn header(&self) -> LogHeader {
        self.state.lock().header
    }

    /// Page the next record goes to.
    pub fn position(&self) -> ResumePoint {
        let state = self.state.lock();
        ResumePoint {
            address: state.page_address,
            sector_byte: state.sector_byte,
        }
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    /// Continue numbering records after `sequence`.
    pub fn advance_sequence(&self, sequence: LogSequenceNumber) {
        let mut state = self.state.lock();
        state.sequence = state.sequence.max(sequence);
    }

    /// Force outstanding data and refuse further writes.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.force(true)?;
        state.closed = true;
        debug!(target: "objmgr::log", path = %self.path.display(), "Closed file log");
        Ok(())
    }

    fn io_failed(&self, e: io::Error) -> Error {
        let err = Error::from(e);
        error!(target: "objmgr::log", path = %self.path.display(), error = %err, "Log I/O failed");
        err
    }

    fn write(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
        mark: bool,
    ) -> Result<LogSequenceNumber> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::invalid_state("file log", "Closed", "write to"));
        }

        let len = record.encoded_len();
        let needed = space_for(len, force);
        let physical = state.capacity().saturating_sub(state.used);
        let available = physical.saturating_sub(state.reserved);
        if (check_space && needed + reserved_delta > available as i64) || needed as u64 > physical
        {
            state.counters.log_full_refusals += 1;
            debug!(
                target: "objmgr::log",
                needed,
                available,
                record = ?record.record_type(),
                "Log full"
            );
            return Err(Error::LogFull {
                requested: needed as u64,
                available,
            });
        }

        state.append(record, mark).map_err(|e| self.io_failed(e))?;
        if force {
            state
                .force(self.sync_on_force)
                .map_err(|e| self.io_failed(e))?;
            state.counters.forced_writes += 1;
        }

        state.reserved = (state.reserved as i64 + reserved_delta).max(0) as u64;
        state.sequence += 1;
        state.counters.records_written += 1;
        state.counters.bytes_written += len as u64;
        trace!(
            target: "objmgr::log",
            sequence = state.sequence,
            record = ?record.record_type(),
            len,
            force,
            "Appended record"
        );
        Ok(state.sequence)
    }
}

impl WriterState {
    /// Usable bytes: everything after the header pages minus the page
    /// kept free behind the log start.
    fn capacity(&self) -> u64 {
        self.header.file_size - FIRST_DATA_PAGE - PAGE_SIZE as u64
    }

    fn room(&self) -> usize {
        PAGE_SIZE - self.fill
    }

    fn next_multipart_id(&mut self) -> u8 {
        let id = self.next_multipart_id;
        self.next_multipart_id = if id == u8::MAX { 1 } else { id + 1 };
        id
    }

    fn write_page(&mut self) -> io::Result<()> {
        set_sector_bits(&mut self.page, self.sector_byte);
        self.file.seek(SeekFrom::Start(self.page_address))?;
        self.file.write_all(&self.page)?;
        self.counters.pages_written += 1;

        self.page.fill(0);
        self.page_address += PAGE_SIZE as u64;
        if self.page_address >= self.header.file_size {
            self.page_address = FIRST_DATA_PAGE;
            self.sector_byte ^= 1;
            debug!(
                target: "objmgr::log",
                sector_byte = self.sector_byte,
                "Log wrapped"
            );
        }
        self.fill = 1;
        self.used += 1;
        Ok(())
    }

    fn pad_bytes(&mut self) {
        for byte in &mut self.page[self.fill..] {
            *byte = PartType::Padding as u8;
        }
        self.used += self.room() as u64;
        self.fill = PAGE_SIZE;
    }

    fn ensure_part_room(&mut self) -> io::Result<()> {
        if self.room() < PART_HEADER_SIZE + 1 {
            self.pad_bytes();
            self.write_page()?;
        }
        Ok(())
    }

    fn put_part(
        &mut self,
        part_type: PartType,
        multipart_id: u8,
        cursor: &mut RecordCursor<'_>,
        len: usize,
    ) {
        PartHeader {
            part_type,
            multipart_id,
            length: len as u16,
        }
        .write_to(&mut self.page[self.fill..]);
        let data = self.fill + PART_HEADER_SIZE;
        let copied = cursor.fill(&mut self.page[data..data + len]);
        debug_assert_eq!(copied, len);
        self.fill = data + len;
        self.used += (PART_HEADER_SIZE + len) as u64;
    }

    fn append(&mut self, record: &LogRecord, mark: bool) -> io::Result<()> {
        let mut cursor = RecordCursor::new(record);
        self.ensure_part_room()?;
        if mark {
            self.mark = Some(ResumePoint {
                address: self.page_address + self.fill as u64,
                sector_byte: self.sector_byte,
            });
        }

        let total = cursor.total_len();
        if total <= self.room() - PART_HEADER_SIZE {
            self.put_part(PartType::Last, 0, &mut cursor, total);
        } else {
            let id = self.next_multipart_id();
            let mut first = true;
            while !cursor.is_complete() {
                self.ensure_part_room()?;
                let len = (self.room() - PART_HEADER_SIZE).min(cursor.remaining());
                let part_type = if first {
                    PartType::First
                } else if len == cursor.remaining() {
                    PartType::Last
                } else {
                    PartType::Middle
                };
                self.put_part(part_type, id, &mut cursor, len);
                first = false;
                if self.fill == PAGE_SIZE {
                    self.write_page()?;
                }
            }
        }

        if self.fill == PAGE_SIZE {
            self.write_page()?;
        }
        Ok(())
    }

    /// Pad and write the current page if it holds data, then sync.
    fn force(&mut self, sync: bool) -> io::Result<()> {
        if self.fill > 1 {
            let room = self.room();
            if room >= PART_HEADER_SIZE + PADDING_OVERHEAD {
                let padding = LogRecord::padding_of_len(room - PART_HEADER_SIZE);
                let mut cursor = RecordCursor::new(&padding);
                self.put_part(PartType::Last, 0, &mut cursor, room - PART_HEADER_SIZE);
            } else if room > 0 {
                self.pad_bytes();
            }
            self.write_page()?;
        }
        if sync {
            let started = Instant::now();
            self.file.sync_data()?;
            self.counters.sync_nanos += started.elapsed().as_nanos() as u64;
        }
        Ok(())
    }
}

impl LogOutput for FileLogWriter {
    fn write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        self.write(record, reserved_delta, check_space, force, false)
    }

    fn mark_and_write_next(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        self.write(record, reserved_delta, check_space, force, true)
    }

    fn reserve(&self, delta: i64) -> Result<()> {
        let mut state = self.state.lock();
        let available = state
            .capacity()
            .saturating_sub(state.used)
            .saturating_sub(state.reserved);
        if delta > 0 && delta as u64 > available {
            state.counters.log_full_refusals += 1;
            return Err(Error::LogFull {
                requested: delta as u64,
                available,
            });
        }
        state.reserved = (state.reserved as i64 + delta).max(0) as u64;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state
            .force(self.sync_on_force)
            .map_err(|e| self.io_failed(e))
    }

    fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mark) = state.mark.take() else {
            return Ok(());
        };
        state
            .force(self.sync_on_force)
            .map_err(|e| self.io_failed(e))?;

        let mut header = state.header;
        header.start_address = mark.address;
        header.sector_byte = mark.sector_byte;
        header.sequence += 1;
        header.write_time = chrono::Utc::now().timestamp_millis();
        header
            .write_both(&mut state.file)
            .map_err(|e| self.io_failed(e))?;
        state.header = header;

        let position = state.page_address + state.fill as u64;
        let before = state.used;
        state.used = distance(mark.address, position, header.file_size);
        info!(
            target: "objmgr::log",
            start = mark.address,
            released = before.saturating_sub(state.used),
            header_sequence = header.sequence,
            "Truncated log"
        );
        Ok(())
    }

    fn occupancy(&self) -> f64 {
        let state = self.state.lock();
        let capacity = state.capacity();
        if capacity == 0 {
            return 1.0;
        }
        ((state.used + state.reserved) as f64 / capacity as f64).min(1.0)
    }

    fn last_sequence(&self) -> LogSequenceNumber {
        self.state.lock().sequence
    }
}

impl Drop for FileLogWriter {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.closed {
            if let Err(e) = state.force(true) {
                warn!(target: "objmgr::log", error = %e, "Failed to force log on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objmgr_core::{LogicalUnitOfWork, TransactionState};
    use tempfile::tempdir;

    fn commit(id: u64) -> LogRecord {
        LogRecord::Commit {
            unit: LogicalUnitOfWork::new(id),
            state: TransactionState::CommittingPersistent,
        }
    }

    #[test]
    fn test_create_writes_header() {
        let dir = tempdir().unwrap();
        let writer = FileLogWriter::create(dir.path(), &LogConfig::for_testing()).unwrap();
        let header = writer.header();
        assert_eq!(header.start_address, FIRST_DATA_PAGE);
        assert_eq!(header.sector_byte, 1);
        assert_eq!(header.sequence, 1);
        let len = std::fs::metadata(writer.path()).unwrap().len();
        assert_eq!(len, LogConfig::for_testing().file_size());
    }

    #[test]
    fn test_unforced_small_records_stay_in_buffer() {
        let dir = tempdir().unwrap();
        let writer = FileLogWriter::create(dir.path(), &LogConfig::for_testing()).unwrap();
        writer.write_next(&commit(1), 0, true, false).unwrap();
        assert_eq!(writer.counters().pages_written, 0);
        writer.write_next(&commit(2), 0, true, true).unwrap();
        let counters = writer.counters();
        assert_eq!(counters.pages_written, 1);
        assert_eq!(counters.forced_writes, 1);
        assert_eq!(writer.position().address, FIRST_DATA_PAGE + PAGE_SIZE as u64);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let dir = tempdir().unwrap();
        let writer = FileLogWriter::create(dir.path(), &LogConfig::for_testing()).unwrap();
        let a = writer.write_next(&commit(1), 0, true, false).unwrap();
        let b = writer.write_next(&commit(2), 0, true, false).unwrap();
        assert!(b > a);
        writer.advance_sequence(100);
        assert_eq!(writer.write_next(&commit(3), 0, true, false).unwrap(), 101);
    }

    #[test]
    fn test_log_full_without_truncate() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing().with_log_pages(8);
        let writer = FileLogWriter::create(dir.path(), &config).unwrap();
        let mut result = Ok(0);
        for id in 0..16 {
            result = writer.write_next(&commit(id), 0, true, true);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::LogFull { .. })));
        assert!(writer.counters().log_full_refusals > 0);
        assert!(writer.occupancy() > 0.5);
    }

    #[test]
    fn test_reservation_reduces_available_space() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing().with_log_pages(8);
        let writer = FileLogWriter::create(dir.path(), &config).unwrap();
        let capacity = (config.file_size() - FIRST_DATA_PAGE) as i64 - PAGE_SIZE as i64;
        writer.reserve(capacity - 100).unwrap();
        assert!(writer.write_next(&commit(1), 0, true, true).is_err());
        // Unchecked writes only need physical room
        writer.write_next(&commit(1), 0, false, true).unwrap();
        writer.reserve(-(capacity - 100)).unwrap();
        assert_eq!(writer.reserved(), 0);
    }

    #[test]
    fn test_truncate_moves_start_and_frees_space() {
        let dir = tempdir().unwrap();
        let writer = FileLogWriter::create(dir.path(), &LogConfig::for_testing()).unwrap();
        for id in 0..20 {
            writer.write_next(&commit(id), 0, true, true).unwrap();
        }
        let before = writer.occupancy();
        writer
            .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
            .unwrap();
        writer
            .write_next(&LogRecord::CheckpointEnd, 0, true, true)
            .unwrap();
        writer.truncate().unwrap();

        let header = writer.header();
        assert_eq!(header.sequence, 2);
        assert_eq!(header.start_address, FIRST_DATA_PAGE + 20 * PAGE_SIZE as u64 + 1);
        assert!(writer.occupancy() < before);
    }

    #[test]
    fn test_writes_wrap_after_truncation() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing().with_log_pages(8);
        let writer = FileLogWriter::create(dir.path(), &config).unwrap();
        for round in 0..9u64 {
            writer
                .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
                .unwrap();
            writer.write_next(&commit(round), 0, true, true).unwrap();
            writer.truncate().unwrap();
        }
        // Six data pages, two forced pages per round: three wraps
        assert_eq!(writer.counters().pages_written, 18);
        assert_eq!(writer.position().address, FIRST_DATA_PAGE);
        assert_eq!(writer.position().sector_byte, 0);
    }

    #[test]
    fn test_closed_writer_refuses_writes() {
        let dir = tempdir().unwrap();
        let writer = FileLogWriter::create(dir.path(), &LogConfig::for_testing()).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.write_next(&commit(1), 0, true, false),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_open_rejects_unaligned_resume() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing();
        FileLogWriter::create(dir.path(), &config).unwrap();
        let resume = ResumePoint {
            address: FIRST_DATA_PAGE + 3,
            sector_byte: 1,
        };
        assert!(FileLogWriter::open(dir.path(), &config, resume).is_err());
    }
}
