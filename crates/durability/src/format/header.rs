//! File log header.
//!
//! The header occupies one page and is written twice, to page 0 and then
//! page 1, each followed by a sync. A crash in the middle of an update
//! leaves at least one intact copy; the valid copy with the higher
//! sequence number is current.
//!
//! ```text
//! ┌────────────┬────────────┬───────────────┬────────────┬───────────┬──────────┬────────────┬───────────┐
//! │ Version (4)│ Sector (1) │ Signature (16)│ Start (8)  │ Size (8)  │ Seq (8)  │ Written (8)│ CRC32 (4) │
//! └────────────┴────────────┴───────────────┴────────────┴───────────┴──────────┴────────────┴───────────┘
//! ```
//!
//! All integers are big-endian. The rest of the page is zero.

use super::{FIRST_DATA_PAGE, PAGE_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Fixed signature identifying a log file.
pub const LOG_SIGNATURE: [u8; 16] = *b"OBJMGR-FILE-LOG!";

/// Current header format version.
pub const LOG_FORMAT_VERSION: i32 = 1;

const HEADER_BODY_SIZE: usize = 4 + 1 + 16 + 8 + 8 + 8 + 8;

/// Decoded log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Format version
    pub version: i32,
    /// Sector byte of the page holding `start_address`
    pub sector_byte: u8,
    /// Byte address where replay starts
    pub start_address: u64,
    /// Size of the whole file, header pages included
    pub file_size: u64,
    /// Incremented on every header update
    pub sequence: u64,
    /// Milliseconds since the epoch when this copy was written
    pub write_time: i64,
}

/// Why a header copy was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The signature bytes are wrong
    #[error("Bad log signature")]
    BadSignature,

    /// Written by an unknown format version
    #[error("Unsupported log format version: {0}")]
    UnsupportedVersion(i32),

    /// The checksum does not cover the fields
    #[error("Header checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Checksum of the fields read
        computed: u32,
    },

    /// Fields are individually readable but inconsistent
    #[error("Inconsistent header: {0}")]
    Inconsistent(String),

    /// Neither copy is usable
    #[error("No valid log header copy")]
    NoValidCopy,
}

impl From<HeaderError> for objmgr_core::Error {
    fn from(e: HeaderError) -> Self {
        objmgr_core::Error::LogFormat(e.to_string())
    }
}

impl LogHeader {
    /// Header for a freshly created log of `file_size` bytes.
    pub fn new(file_size: u64) -> Self {
        LogHeader {
            version: LOG_FORMAT_VERSION,
            sector_byte: 1,
            start_address: FIRST_DATA_PAGE,
            file_size,
            sequence: 1,
            write_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialize to one page.
    pub fn to_page(&self) -> Vec<u8> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        // Writes into a Vec cannot fail
        let _ = self.write_body(&mut page);
        let crc = compute_crc(&page);
        page.extend_from_slice(&crc.to_be_bytes());
        page.resize(PAGE_SIZE, 0);
        page
    }

    fn write_body(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_i32::<BigEndian>(self.version)?;
        out.write_u8(self.sector_byte)?;
        out.write_all(&LOG_SIGNATURE)?;
        out.write_u64::<BigEndian>(self.start_address)?;
        out.write_u64::<BigEndian>(self.file_size)?;
        out.write_u64::<BigEndian>(self.sequence)?;
        out.write_i64::<BigEndian>(self.write_time)?;
        Ok(())
    }

    /// Parse and validate one header copy.
    pub fn from_page(page: &[u8]) -> Result<Self, HeaderError> {
        if page.len() < HEADER_BODY_SIZE + 4 {
            return Err(HeaderError::Inconsistent("short header page".to_string()));
        }
        let body = &page[..HEADER_BODY_SIZE];
        let mut cursor = Cursor::new(body);
        let short = |_| HeaderError::Inconsistent("short header".to_string());

        let version = cursor.read_i32::<BigEndian>().map_err(short)?;
        let sector_byte = cursor.read_u8().map_err(short)?;
        let mut signature = [0u8; 16];
        cursor.read_exact(&mut signature).map_err(short)?;
        if signature != LOG_SIGNATURE {
            return Err(HeaderError::BadSignature);
        }
        let start_address = cursor.read_u64::<BigEndian>().map_err(short)?;
        let file_size = cursor.read_u64::<BigEndian>().map_err(short)?;
        let sequence = cursor.read_u64::<BigEndian>().map_err(short)?;
        let write_time = cursor.read_i64::<BigEndian>().map_err(short)?;

        let expected = u32::from_be_bytes([
            page[HEADER_BODY_SIZE],
            page[HEADER_BODY_SIZE + 1],
            page[HEADER_BODY_SIZE + 2],
            page[HEADER_BODY_SIZE + 3],
        ]);
        let computed = compute_crc(body);
        if expected != computed {
            return Err(HeaderError::ChecksumMismatch { expected, computed });
        }
        if version != LOG_FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let header = LogHeader {
            version,
            sector_byte,
            start_address,
            file_size,
            sequence,
            write_time,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), HeaderError> {
        if self.sector_byte > 1 {
            return Err(HeaderError::Inconsistent(format!(
                "sector byte {}",
                self.sector_byte
            )));
        }
        if self.file_size % PAGE_SIZE as u64 != 0 || self.file_size <= FIRST_DATA_PAGE {
            return Err(HeaderError::Inconsistent(format!(
                "file size {}",
                self.file_size
            )));
        }
        if self.start_address < FIRST_DATA_PAGE || self.start_address >= self.file_size {
            return Err(HeaderError::Inconsistent(format!(
                "start address {} outside the data pages",
                self.start_address
            )));
        }
        Ok(())
    }

    /// Read both copies and return the current one.
    pub fn read_current(file: &mut File) -> Result<Self, HeaderError> {
        let mut best: Option<LogHeader> = None;
        for copy in 0..2u64 {
            let mut page = vec![0u8; PAGE_SIZE];
            let read = file
                .seek(SeekFrom::Start(copy * PAGE_SIZE as u64))
                .and_then(|_| file.read_exact(&mut page));
            if read.is_err() {
                continue;
            }
            match LogHeader::from_page(&page) {
                Ok(header) => {
                    if best.map_or(true, |b| header.sequence > b.sequence) {
                        best = Some(header);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "objmgr::log", copy, error = %e, "Ignoring log header copy");
                }
            }
        }
        best.ok_or(HeaderError::NoValidCopy)
    }

    /// Write one copy and sync it.
    pub fn write_copy(&self, file: &mut File, copy: u64) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(copy * PAGE_SIZE as u64))?;
        file.write_all(&self.to_page())?;
        file.sync_data()
    }

    /// Write copy A, then copy B.
    pub fn write_both(&self, file: &mut File) -> std::io::Result<()> {
        self.write_copy(file, 0)?;
        self.write_copy(file, 1)
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
