//! Sector bits.
//!
//! A page is written as eight sectors. The low bit of each sector's last
//! byte is overwritten with the page's sector byte, which alternates
//! between 0 and 1 every time the log wraps. The displaced bits are kept
//! in byte 0 of the page. On read, a page whose eight bits do not all
//! match the expected sector byte was torn by a crash or never written
//! in the current cycle.

use super::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Outcome of checking a page's sector bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorCheck {
    /// All sectors carry the expected bit; the data has been restored
    Valid,
    /// No sector carries the expected bit: written in an earlier cycle or never
    Unwritten,
    /// Some sectors carry the expected bit and some do not
    Torn,
}

fn sector_end(k: usize) -> usize {
    (k + 1) * SECTOR_SIZE - 1
}

/// Move the low bit of every sector's last byte into byte 0 and replace
/// it with `sector_byte`.
pub fn set_sector_bits(page: &mut [u8], sector_byte: u8) {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut saved = 0u8;
    for k in 0..SECTORS_PER_PAGE {
        let index = sector_end(k);
        saved |= (page[index] & 1) << k;
        page[index] = (page[index] & 0xFE) | (sector_byte & 1);
    }
    page[0] = saved;
}

/// Check the sector bits of a page read from disk and, if they all match
/// `expected`, restore the displaced data bits in place.
pub fn check_and_restore(page: &mut [u8], expected: u8) -> SectorCheck {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let matching = (0..SECTORS_PER_PAGE)
        .filter(|&k| page[sector_end(k)] & 1 == expected & 1)
        .count();

    if matching == 0 {
        return SectorCheck::Unwritten;
    }
    if matching < SECTORS_PER_PAGE {
        return SectorCheck::Torn;
    }

    let saved = page[0];
    for k in 0..SECTORS_PER_PAGE {
        let index = sector_end(k);
        page[index] = (page[index] & 0xFE) | ((saved >> k) & 1);
    }
    SectorCheck::Valid
}
