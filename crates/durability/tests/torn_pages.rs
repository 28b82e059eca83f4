//! Torn write tests
//!
//! These tests verify that a crash in the middle of a write never yields
//! corrupted data:
//! - A page with a flipped sector bit ends the log at that page
//! - Pages left over past the end of the log are invalidated on reopen
//! - A header update torn after its first copy is recovered from that copy
//! - A garbage first copy falls back to the second

use objmgr_core::{LogicalUnitOfWork, TransactionState};
use objmgr_durability::format::{FIRST_DATA_PAGE, SECTOR_SIZE};
use objmgr_durability::{
    FileLogReader, FileLogWriter, LogConfig, LogOutput, LogRecord, ReadStopReason, PAGE_SIZE,
};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn commit(id: u64) -> LogRecord {
    LogRecord::Commit {
        unit: LogicalUnitOfWork::new(id),
        state: TransactionState::CommittingPersistent,
    }
}

fn data_page(index: u64) -> u64 {
    FIRST_DATA_PAGE + index * PAGE_SIZE as u64
}

fn flip_low_bit(path: &Path, address: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let mut buf = [0u8; 1];
    file.seek(SeekFrom::Start(address)).unwrap();
    file.read_exact(&mut buf).unwrap();
    buf[0] ^= 1;
    file.seek(SeekFrom::Start(address)).unwrap();
    file.write_all(&buf).unwrap();
    file.sync_all().unwrap();
}

fn without_padding(reader: &mut FileLogReader) -> Vec<LogRecord> {
    std::iter::from_fn(|| reader.read_next())
        .filter(|r| !matches!(r, LogRecord::Padding { .. }))
        .collect()
}

/// Checkpoint on pages 0 and 1, then one forced commit per page.
fn write_log(dir: &Path, config: &LogConfig, commits: u64) {
    let writer = FileLogWriter::create(dir, config).unwrap();
    writer
        .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
        .unwrap();
    writer
        .write_next(&LogRecord::CheckpointEnd, 0, true, true)
        .unwrap();
    writer.truncate().unwrap();
    for id in 0..commits {
        writer.write_next(&commit(id), 0, true, true).unwrap();
    }
    writer.close().unwrap();
}

#[test]
fn test_flipped_sector_bit_ends_log() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    write_log(temp_dir.path(), &config, 4);
    let path = temp_dir.path().join(&config.file_name);

    // Commit 2 lives on data page 4; tear its sixth sector
    flip_low_bit(&path, data_page(4) + 5 * SECTOR_SIZE as u64 + SECTOR_SIZE as u64 - 1);

    let mut reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.stop_reason(), ReadStopReason::TornPage);
    assert_eq!(
        without_padding(&mut reader),
        vec![
            LogRecord::CheckpointStart,
            LogRecord::CheckpointEnd,
            commit(0),
            commit(1)
        ]
    );
    assert_eq!(reader.resume_point().address, data_page(4));
}

#[test]
fn test_first_sector_tear_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    write_log(temp_dir.path(), &config, 1);
    let path = temp_dir.path().join(&config.file_name);

    flip_low_bit(&path, data_page(2) + SECTOR_SIZE as u64 - 1);

    let mut reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.stop_reason(), ReadStopReason::TornPage);
    let records = without_padding(&mut reader);
    assert!(!records.contains(&commit(0)));
}

#[test]
fn test_stale_pages_past_tear_are_invalidated_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    write_log(temp_dir.path(), &config, 3);
    let path = temp_dir.path().join(&config.file_name);

    // Commit 1 is torn; commit 2 after it is intact but must never replay
    flip_low_bit(&path, data_page(3) + SECTOR_SIZE as u64 - 1);

    let reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.resume_point().address, data_page(3));

    let writer = FileLogWriter::open(temp_dir.path(), &config, reader.resume_point()).unwrap();
    writer.write_next(&commit(9), 0, true, true).unwrap();
    writer.close().unwrap();

    let mut reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.stop_reason(), ReadStopReason::TornPage);
    assert_eq!(
        without_padding(&mut reader),
        vec![
            LogRecord::CheckpointStart,
            LogRecord::CheckpointEnd,
            commit(0),
            commit(9)
        ]
    );
}

#[test]
fn test_header_torn_after_first_copy_recovers_from_it() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    let path = temp_dir.path().join(&config.file_name);

    let old_header = {
        let writer = FileLogWriter::create(temp_dir.path(), &config).unwrap();
        writer
            .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
            .unwrap();
        writer
            .write_next(&LogRecord::CheckpointEnd, 0, true, true)
            .unwrap();
        writer.truncate().unwrap();
        writer.write_next(&commit(0), 0, true, true).unwrap();

        // Second checkpoint, but the crash hits between the header copies
        let mark = writer.position().address + 1;
        writer
            .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
            .unwrap();
        writer
            .write_next(&LogRecord::CheckpointEnd, 0, true, true)
            .unwrap();
        let header = writer.header();
        writer.close().unwrap();

        let mut updated = header;
        updated.start_address = mark;
        updated.sequence += 1;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        updated.write_copy(&mut file, 0).unwrap();
        header
    };

    let mut reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.header().sequence, old_header.sequence + 1);
    assert_eq!(reader.header().start_address, data_page(3) + 1);
    assert_eq!(reader.skipped_records(), 0);
    assert_eq!(
        without_padding(&mut reader),
        vec![LogRecord::CheckpointStart, LogRecord::CheckpointEnd]
    );
}

#[test]
fn test_garbage_first_copy_falls_back_to_second() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    write_log(temp_dir.path(), &config, 1);
    let path = temp_dir.path().join(&config.file_name);

    {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&vec![0x5Au8; PAGE_SIZE]).unwrap();
        file.sync_all().unwrap();
    }

    let mut reader = FileLogReader::open(&path).unwrap();
    assert_eq!(reader.header().sequence, 2);
    assert_eq!(
        without_padding(&mut reader),
        vec![
            LogRecord::CheckpointStart,
            LogRecord::CheckpointEnd,
            commit(0)
        ]
    );
}
