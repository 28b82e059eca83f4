//! On-disk byte formats of the file log.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────┐  0
//! │ Header copy A (one page)     │
//! ├──────────────────────────────┤  PAGE_SIZE
//! │ Header copy B (one page)     │
//! ├──────────────────────────────┤  2 * PAGE_SIZE
//! │ Data page                    │  reused circularly
//! │ ...                          │
//! └──────────────────────────────┘  file size
//! ```
//!
//! # Data Page Layout
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ Sector bits  │ Parts (PAGE_SIZE - 1 bytes)                   │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! # Module Structure
//!
//! - `header`: double-written file header
//! - `page`: sector bits for torn page detection
//! - `part`: part headers that carry records across pages

pub mod header;
pub mod page;
pub mod part;

pub use header::{HeaderError, LogHeader, LOG_FORMAT_VERSION, LOG_SIGNATURE};
pub use page::{check_and_restore, set_sector_bits, SectorCheck};
pub use part::{PartHeader, PartType, PART_HEADER_SIZE};

/// Size of a log page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per page; one sector bit per sector fits in the page's first byte.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Bytes of a data page available to parts.
pub const PAGE_DATA_CAPACITY: usize = PAGE_SIZE - 1;

/// File offset of the first data page.
pub const FIRST_DATA_PAGE: u64 = 2 * PAGE_SIZE as u64;
