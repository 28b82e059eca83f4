//! File log round-trip tests
//!
//! These tests verify that records survive the page layout:
//! - Every record type reads back equal to what was written
//! - Payloads larger than a page are split and reassembled
//! - Records written across a wrap of the circular file are read in order
//! - A reopened writer continues where the reader stopped

use objmgr_core::{LogicalUnitOfWork, TokenId, TransactionState};
use objmgr_durability::{
    FileLogReader, FileLogWriter, LogConfig, LogOutput, LogRecord, LoggedObject, OptimisticBatch,
    ReadStopReason, TransactionCheckpoint, PAGE_SIZE,
};
use tempfile::TempDir;

fn unit(id: u64) -> LogicalUnitOfWork {
    LogicalUnitOfWork::new(id)
}

fn object(store: u32, id: u64, len: usize) -> LoggedObject {
    LoggedObject::new(
        TokenId::new(store, id),
        (0..len).map(|i| (i % 251) as u8).collect(),
    )
}

fn begin_checkpoint(writer: &FileLogWriter) {
    writer
        .mark_and_write_next(&LogRecord::CheckpointStart, 0, true, true)
        .unwrap();
    writer
        .write_next(&LogRecord::CheckpointEnd, 0, true, true)
        .unwrap();
    writer.truncate().unwrap();
}

fn without_padding(reader: &mut FileLogReader) -> Vec<LogRecord> {
    std::iter::from_fn(|| reader.read_next())
        .filter(|r| !matches!(r, LogRecord::Padding { .. }))
        .collect()
}

fn every_record_type() -> Vec<LogRecord> {
    let active = TransactionState::ActivePersistent;
    vec![
        LogRecord::UserDefined {
            payload: b"application marker".to_vec(),
        },
        LogRecord::Add {
            unit: unit(1),
            state: active,
            object: object(1, 10, 40),
        },
        LogRecord::Replace {
            unit: unit(1),
            state: active,
            object: object(1, 10, 3 * PAGE_SIZE + 17),
        },
        LogRecord::OptimisticReplace {
            unit: unit(2),
            state: active,
            batch: OptimisticBatch {
                to_add: vec![object(2, 1, 5), object(2, 2, 0)],
                to_replace: vec![object(2, 3, 100)],
                to_delete: vec![TokenId::new(2, 4)],
                to_notify: vec![TokenId::new(2, 5), TokenId::new(1, 10)],
            },
        },
        LogRecord::Delete {
            unit: unit(1),
            state: active,
            token: TokenId::new(1, 11),
        },
        LogRecord::Prepare {
            unit: LogicalUnitOfWork {
                id: 3,
                xid: Some(b"global-branch-0003".to_vec()),
            },
            state: TransactionState::PreparedPersistent,
        },
        LogRecord::Commit {
            unit: unit(1),
            state: TransactionState::CommittingPersistent,
        },
        LogRecord::Backout {
            unit: unit(2),
            state: TransactionState::BackingOutPersistent,
        },
        LogRecord::CheckpointTransaction {
            unit: unit(4),
            state: TransactionState::PreparedPersistent,
            checkpoint: TransactionCheckpoint {
                added: vec![object(1, 20, 64)],
                replaced: vec![object(1, 21, PAGE_SIZE)],
                deleted: vec![TokenId::new(1, 22)],
                optimistic: OptimisticBatch {
                    to_add: vec![],
                    to_replace: vec![object(2, 9, 12)],
                    to_delete: vec![],
                    to_notify: vec![TokenId::new(2, 9)],
                },
            },
        },
        LogRecord::Padding { size: 33 },
    ]
}

#[test]
fn test_every_record_type_roundtrips_through_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    let writer = FileLogWriter::create(temp_dir.path(), &config).unwrap();
    begin_checkpoint(&writer);

    let records = every_record_type();
    for record in &records {
        writer.write_next(record, 0, true, false).unwrap();
    }
    writer.flush().unwrap();

    let mut reader = FileLogReader::open(writer.path()).unwrap();
    let read: Vec<LogRecord> = std::iter::from_fn(|| reader.read_next()).collect();

    // The checkpoint pair and the padding of its forced pages come first
    let first = read
        .iter()
        .position(|r| matches!(r, LogRecord::UserDefined { .. }))
        .unwrap();
    assert_eq!(&read[first..first + records.len()], &records[..]);
    assert_eq!(reader.stop_reason(), ReadStopReason::EndOfData);
}

#[test]
fn test_payload_larger_than_a_page_is_reassembled() {
    let temp_dir = TempDir::new().unwrap();
    let writer = FileLogWriter::create(temp_dir.path(), &LogConfig::for_testing()).unwrap();
    begin_checkpoint(&writer);

    let big = LogRecord::Add {
        unit: unit(9),
        state: TransactionState::ActivePersistent,
        object: object(3, 1, 5 * PAGE_SIZE + 1),
    };
    let small = LogRecord::Commit {
        unit: unit(9),
        state: TransactionState::CommittingPersistent,
    };
    writer.write_next(&big, 0, true, false).unwrap();
    writer.write_next(&small, 0, true, true).unwrap();

    let pages = writer.counters().pages_written;
    assert!(pages >= 2 + 6, "split record spans pages, wrote {}", pages);

    let mut reader = FileLogReader::open(writer.path()).unwrap();
    let read = without_padding(&mut reader);
    assert_eq!(
        read,
        vec![
            LogRecord::CheckpointStart,
            LogRecord::CheckpointEnd,
            big,
            small
        ]
    );
}

#[test]
fn test_records_across_wrap_are_read_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing().with_log_pages(10);
    let writer = FileLogWriter::create(temp_dir.path(), &config).unwrap();

    // Eight data pages, two per checkpoint: the fourth ends the cycle
    for _ in 0..4 {
        begin_checkpoint(&writer);
    }
    let mut expected = vec![LogRecord::CheckpointStart, LogRecord::CheckpointEnd];
    for id in 0..4 {
        let record = LogRecord::Commit {
            unit: unit(id),
            state: TransactionState::CommittingPersistent,
        };
        writer.write_next(&record, 0, true, true).unwrap();
        expected.push(record);
    }
    assert_eq!(writer.position().sector_byte, 0, "writer has wrapped");

    let mut reader = FileLogReader::open(writer.path()).unwrap();
    assert_eq!(without_padding(&mut reader), expected);
    assert_eq!(reader.resume_point(), writer.position());
}

#[test]
fn test_reopened_writer_continues_after_last_record() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig::for_testing();
    let first = LogRecord::UserDefined {
        payload: b"before restart".to_vec(),
    };
    let second = LogRecord::UserDefined {
        payload: b"after restart".to_vec(),
    };

    {
        let writer = FileLogWriter::create(temp_dir.path(), &config).unwrap();
        begin_checkpoint(&writer);
        writer.write_next(&first, 0, true, true).unwrap();
        writer.close().unwrap();
    }

    let path = temp_dir.path().join(&config.file_name);
    let reader = FileLogReader::open(&path).unwrap();
    let writer = FileLogWriter::open(temp_dir.path(), &config, reader.resume_point()).unwrap();
    writer.write_next(&second, 0, true, true).unwrap();
    drop(writer);

    let mut reader = FileLogReader::open(&path).unwrap();
    let read = without_padding(&mut reader);
    assert_eq!(&read[2..], &[first, second]);
}
