//! Log space a transaction reserves ahead of time.
//!
//! Every persistent change reserves enough room to be rewritten by a
//! checkpoint, and the first one also reserves the terminal record and
//! the fixed part of a checkpoint record. Commit and backout release the
//! whole reservation as they write the terminal record, so a transaction
//! that has logged anything can always finish.

use objmgr_core::MAX_XID_SIZE;
use objmgr_durability::{space_for, MAX_TERMINAL_RECORD_LEN, PAGE_SIZE};

/// Encoded bytes of one object entry besides its payload: token and length.
pub const OBJECT_ENTRY_LEN: usize = 4 + 8 + 4;

/// Encoded bytes of one token entry.
pub const TOKEN_ENTRY_LEN: usize = 4 + 8;

/// Encoded bytes of a checkpoint-of-transaction record with no entries.
pub const CHECKPOINT_RECORD_OVERHEAD: usize = 4 + 8 + 1 + 1 + MAX_XID_SIZE + 1 + 7 * 4;

fn whole_pages(bytes: i64) -> i64 {
    let page = PAGE_SIZE as i64;
    (bytes + page - 1) / page * page
}

/// Reserved once per unit of work, on its first persistent change.
pub fn transaction_overhead() -> i64 {
    whole_pages(space_for(MAX_TERMINAL_RECORD_LEN, true))
        + whole_pages(space_for(CHECKPOINT_RECORD_OVERHEAD, false))
}

/// Room to rewrite an added or replaced object of `payload_len` bytes.
pub fn object_space(payload_len: usize) -> i64 {
    space_for(OBJECT_ENTRY_LEN + payload_len, false)
}

/// Room to rewrite a deleted or notified token.
pub fn token_space() -> i64 {
    TOKEN_ENTRY_LEN as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overhead_is_whole_pages() {
        let overhead = transaction_overhead();
        assert_eq!(overhead % PAGE_SIZE as i64, 0);
        // Forced terminal record pads a page, checkpoint fixed part fits one
        assert_eq!(overhead, 3 * PAGE_SIZE as i64);
    }

    #[test]
    fn test_object_space_grows_with_payload() {
        assert!(object_space(0) >= OBJECT_ENTRY_LEN as i64);
        assert!(object_space(10_000) > object_space(100) + 9_000);
    }
}
