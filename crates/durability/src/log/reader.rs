//! File log reader.
//!
//! Used once, at warm start. The reader scans from the start address in
//! the current header, page by page, until it reaches a page that was not
//! written in the current cycle or whose sector bits show it was torn.
//! Parts are reassembled into records as they are met.
//!
//! Replay begins at the last `CheckpointStart` that is followed by a
//! `CheckpointEnd`; everything before it is described by the checkpoint
//! and skipped. A checkpoint that was started but never finished is
//! ignored in favour of the complete one before it.
//!
//! Padding records are returned like any other; replaying one does
//! nothing. The end of the scan is also where the writer resumes, see
//! [`resume_point`](FileLogReader::resume_point).

use super::writer::ResumePoint;
use crate::format::{
    check_and_restore, LogHeader, PartHeader, PartType, SectorCheck, FIRST_DATA_PAGE, PAGE_SIZE,
    PART_HEADER_SIZE,
};
use crate::record::{decode, LogRecord};
use objmgr_core::Result;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

/// Why the scan of the log ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStopReason {
    /// The next page was not written in the current cycle
    EndOfData,
    /// The next page was only partly written
    TornPage,
    /// A part header or length did not make sense
    MalformedPart,
    /// A reassembled record could not be decoded
    UndecodableRecord,
    /// Every data page was read
    Wrapped,
}

/// Slots for records being reassembled, one per multi-part id.
struct Reassembly {
    slots: Vec<Option<Vec<u8>>>,
}

impl Reassembly {
    fn new() -> Self {
        Reassembly {
            slots: vec![None; 256],
        }
    }

    /// Feed one part; returns the record bytes once a record is complete.
    fn accept(
        &mut self,
        header: PartHeader,
        data: &[u8],
    ) -> std::result::Result<Option<Vec<u8>>, ReadStopReason> {
        let id = header.multipart_id as usize;
        match (header.part_type, id) {
            (PartType::Last, 0) => Ok(Some(data.to_vec())),
            (PartType::First, id) if id != 0 => {
                self.slots[id] = Some(data.to_vec());
                Ok(None)
            }
            (PartType::Middle, id) if id != 0 => {
                let slot = self.slots[id]
                    .as_mut()
                    .ok_or(ReadStopReason::MalformedPart)?;
                slot.extend_from_slice(data);
                Ok(None)
            }
            (PartType::Last, id) => {
                let mut bytes = self.slots[id]
                    .take()
                    .ok_or(ReadStopReason::MalformedPart)?;
                bytes.extend_from_slice(data);
                Ok(Some(bytes))
            }
            _ => Err(ReadStopReason::MalformedPart),
        }
    }
}

/// Reader over the records of a log file.
pub struct FileLogReader {
    header: LogHeader,
    records: VecDeque<LogRecord>,
    stop_reason: ReadStopReason,
    resume: ResumePoint,
    skipped: usize,
    checkpoint_found: bool,
    pages_read: u64,
}

impl FileLogReader {
    /// Scan the log file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let header = LogHeader::read_current(&mut file)?;
        let scan = scan(&mut file, &header)?;

        let mut records = scan.records;
        let checkpoint = last_complete_checkpoint(&records);
        let skipped = checkpoint.unwrap_or(0);
        records.drain(..skipped);

        info!(
            target: "objmgr::log",
            path = %path.display(),
            records = records.len(),
            skipped,
            pages = scan.pages_read,
            stop = ?scan.stop_reason,
            checkpoint_found = checkpoint.is_some(),
            "Scanned log"
        );

        Ok(FileLogReader {
            header,
            records: records.into(),
            stop_reason: scan.stop_reason,
            resume: scan.resume,
            skipped,
            checkpoint_found: checkpoint.is_some(),
            pages_read: scan.pages_read,
        })
    }

    /// Next record to replay.
    pub fn read_next(&mut self) -> Option<LogRecord> {
        self.records.pop_front()
    }

    /// Records not yet returned.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }

    /// The header the scan started from.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Why the scan ended.
    pub fn stop_reason(&self) -> ReadStopReason {
        self.stop_reason
    }

    /// Where a writer continues after this log.
    pub fn resume_point(&self) -> ResumePoint {
        self.resume
    }

    /// Records before the replayed checkpoint.
    pub fn skipped_records(&self) -> usize {
        self.skipped
    }

    /// Whether the log holds a complete checkpoint.
    pub fn checkpoint_found(&self) -> bool {
        self.checkpoint_found
    }

    /// Valid pages scanned.
    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }
}

/// Index of the last `CheckpointStart` followed by a `CheckpointEnd`.
fn last_complete_checkpoint(records: &[LogRecord]) -> Option<usize> {
    let end = records
        .iter()
        .rposition(|r| matches!(r, LogRecord::CheckpointEnd))?;
    records[..end]
        .iter()
        .rposition(|r| matches!(r, LogRecord::CheckpointStart))
}

struct Scan {
    records: Vec<LogRecord>,
    stop_reason: ReadStopReason,
    resume: ResumePoint,
    pages_read: u64,
}

fn scan(file: &mut File, header: &LogHeader) -> io::Result<Scan> {
    let page_size = PAGE_SIZE as u64;
    let total_pages = (header.file_size - FIRST_DATA_PAGE) / page_size;
    let start_page =
        FIRST_DATA_PAGE + (header.start_address - FIRST_DATA_PAGE) / page_size * page_size;

    let mut address = start_page;
    let mut sector_byte = header.sector_byte;
    let mut offset = ((header.start_address - start_page) as usize).max(1);
    let mut reassembly = Reassembly::new();
    let mut records = Vec::new();
    let mut page = vec![0u8; PAGE_SIZE];
    let mut pages_read = 0;
    let mut stop_reason = ReadStopReason::Wrapped;

    while pages_read < total_pages {
        file.seek(SeekFrom::Start(address))?;
        match file.read_exact(&mut page) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                stop_reason = ReadStopReason::EndOfData;
                break;
            }
            Err(e) => return Err(e),
        }

        match check_and_restore(&mut page, sector_byte) {
            SectorCheck::Valid => {}
            SectorCheck::Unwritten => {
                stop_reason = ReadStopReason::EndOfData;
                break;
            }
            SectorCheck::Torn => {
                warn!(target: "objmgr::log", address, "Torn page ends the log");
                stop_reason = ReadStopReason::TornPage;
                break;
            }
        }
        pages_read += 1;

        let parsed = parse_page(&page[offset..], &mut reassembly, &mut records);

        address += page_size;
        if address >= header.file_size {
            address = FIRST_DATA_PAGE;
            sector_byte ^= 1;
        }
        offset = 1;

        if let Err(reason) = parsed {
            warn!(target: "objmgr::log", ?reason, "Unreadable log data ends the log");
            stop_reason = reason;
            break;
        }
    }

    debug!(
        target: "objmgr::log",
        resume = address,
        sector_byte,
        "Log scan finished"
    );

    Ok(Scan {
        records,
        stop_reason,
        resume: ResumePoint {
            address,
            sector_byte,
        },
        pages_read,
    })
}

fn parse_page(
    data: &[u8],
    reassembly: &mut Reassembly,
    records: &mut Vec<LogRecord>,
) -> std::result::Result<(), ReadStopReason> {
    let mut pos = 0;
    while pos < data.len() {
        match PartType::from_byte(data[pos]) {
            Some(PartType::Padding) => {
                pos += 1;
                continue;
            }
            Some(_) => {}
            None => return Err(ReadStopReason::MalformedPart),
        }

        let header = PartHeader::read_from(&data[pos..]).ok_or(ReadStopReason::MalformedPart)?;
        let body_start = pos + PART_HEADER_SIZE;
        let body_end = body_start + header.length as usize;
        if body_end > data.len() {
            return Err(ReadStopReason::MalformedPart);
        }
        pos = body_end;

        if let Some(bytes) = reassembly.accept(header, &data[body_start..body_end])? {
            match decode(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(target: "objmgr::log", error = %e, "Undecodable record");
                    return Err(ReadStopReason::UndecodableRecord);
                }
            }
        }
    }
    Ok(())
}
