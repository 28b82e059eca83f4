//! Part headers.
//!
//! Records are written to pages as parts. A part never crosses a page
//! boundary; a record too big for the rest of the current page is split
//! into a `First` part, any number of `Middle` parts and a `Last` part,
//! all carrying the same multi-part id. A record that fits is written as
//! a single `Last` part with id 0.
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────┬─────────────────────┐
//! │ Type (1) │ Multipart (1)│ Length (2 BE)│ Data (Length bytes) │
//! └──────────┴──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! A `Padding` part is a single type byte with nothing after it.

/// Size of a part header in bytes.
pub const PART_HEADER_SIZE: usize = 4;

/// Part type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartType {
    /// First part of a split record
    First = 0,
    /// Continuation of a split record
    Middle = 1,
    /// Final part of a record, or the whole record when unsplit
    Last = 2,
    /// One byte of filler
    Padding = 3,
}

impl PartType {
    /// Decode a part type byte.
    pub fn from_byte(byte: u8) -> Option<PartType> {
        match byte {
            0 => Some(PartType::First),
            1 => Some(PartType::Middle),
            2 => Some(PartType::Last),
            3 => Some(PartType::Padding),
            _ => None,
        }
    }
}

/// Header of a non-padding part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    /// First, Middle or Last
    pub part_type: PartType,
    /// Shared by all parts of one record; 0 for unsplit records
    pub multipart_id: u8,
    /// Number of data bytes following the header
    pub length: u16,
}

impl PartHeader {
    /// Serialize the header into the first four bytes of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0] = self.part_type as u8;
        dst[1] = self.multipart_id;
        dst[2..4].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Parse a header at the start of `src`.
    ///
    /// Returns `None` for padding, unknown types, or a truncated header.
    pub fn read_from(src: &[u8]) -> Option<PartHeader> {
        if src.len() < PART_HEADER_SIZE {
            return None;
        }
        let part_type = PartType::from_byte(src[0])?;
        if part_type == PartType::Padding {
            return None;
        }
        Some(PartHeader {
            part_type,
            multipart_id: src[1],
            length: u16::from_be_bytes([src[2], src[3]]),
        })
    }
}
