//! Record byte layout
//!
//! A record is encoded as a header followed by the payloads it names, in
//! the order the header lists them. The header always starts with the
//! 4-byte type tag. All integers are big-endian.
//!
//! ```text
//! unit      := id (8) | has_xid (1) | xid_len (1) | xid (xid_len)
//! token     := store (4) | object (8)
//! objects   := count (4) | (token | payload_len (4))*
//! tokens    := count (4) | token*
//! batch     := objects(to_add) | objects(to_replace) | tokens(to_delete) | tokens(to_notify)
//!
//! UserDefined            tag | len (4)                         ; payload
//! Add, Replace           tag | unit | state (1) | token | len  ; payload
//! OptimisticReplace      tag | unit | state | batch            ; to_add, to_replace payloads
//! Delete                 tag | unit | state | token
//! Prepare/Commit/Backout tag | unit | state
//! CheckpointStart/End    tag
//! CheckpointTransaction  tag | unit | state | objects(added) | objects(replaced)
//!                            | tokens(deleted) | batch           ; all payloads in list order
//! Padding                tag | size (4)                        ; size zero bytes
//! ```
//!
//! Producing buffers borrows the payloads, so encoding a large object
//! copies its bytes only once, straight into the log page.

use super::{
    LogRecord, LoggedObject, OptimisticBatch, RecordType, TransactionCheckpoint,
};
use byteorder::{BigEndian, ReadBytesExt};
use objmgr_core::{LogicalUnitOfWork, TokenId, TransactionState, MAX_XID_SIZE};
use std::borrow::Cow;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Why a record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Fewer bytes than the header promises
    #[error("Record truncated")]
    Truncated,

    /// The type tag is not known
    #[error("Unknown record type {0}")]
    UnknownType(i32),

    /// The transaction state code is not known
    #[error("Unknown transaction state {0}")]
    UnknownState(u8),

    /// An XID longer than allowed
    #[error("XID of {0} bytes exceeds the maximum")]
    XidTooLong(usize),

    /// Bytes left over after the record
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

impl From<RecordError> for objmgr_core::Error {
    fn from(e: RecordError) -> Self {
        objmgr_core::Error::LogFormat(e.to_string())
    }
}

struct Encoder(Vec<u8>);

impl Encoder {
    fn new(tag: RecordType) -> Self {
        let mut encoder = Encoder(Vec::with_capacity(64));
        encoder.put_i32(tag.tag());
        encoder
    }

    fn put_u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn put_unit(&mut self, unit: &LogicalUnitOfWork, state: TransactionState) {
        self.put_u64(unit.id);
        match &unit.xid {
            Some(xid) => {
                let len = xid.len().min(MAX_XID_SIZE);
                self.put_u8(1);
                self.put_u8(len as u8);
                self.0.extend_from_slice(&xid[..len]);
            }
            None => {
                self.put_u8(0);
                self.put_u8(0);
            }
        }
        self.put_u8(state.code());
    }

    fn put_token(&mut self, token: &TokenId) {
        self.put_u32(token.store.0);
        self.put_u64(token.object.0);
    }

    fn put_objects(&mut self, objects: &[LoggedObject]) {
        self.put_u32(objects.len() as u32);
        for object in objects {
            self.put_token(&object.token);
            self.put_u32(object.payload.len() as u32);
        }
    }

    fn put_tokens(&mut self, tokens: &[TokenId]) {
        self.put_u32(tokens.len() as u32);
        for token in tokens {
            self.put_token(token);
        }
    }

    fn put_batch(&mut self, batch: &OptimisticBatch) {
        self.put_objects(&batch.to_add);
        self.put_objects(&batch.to_replace);
        self.put_tokens(&batch.to_delete);
        self.put_tokens(&batch.to_notify);
    }
}

fn payloads<'a>(objects: &'a [LoggedObject], out: &mut Vec<Cow<'a, [u8]>>) {
    for object in objects {
        if !object.payload.is_empty() {
            out.push(Cow::Borrowed(&object.payload));
        }
    }
}

/// Header and payload buffers of a record, in write order.
pub fn buffers(record: &LogRecord) -> Vec<Cow<'_, [u8]>> {
    let mut encoder = Encoder::new(record.record_type());
    let mut tail: Vec<Cow<'_, [u8]>> = Vec::new();

    match record {
        LogRecord::UserDefined { payload } => {
            encoder.put_u32(payload.len() as u32);
            tail.push(Cow::Borrowed(payload));
        }
        LogRecord::Add {
            unit,
            state,
            object,
        }
        | LogRecord::Replace {
            unit,
            state,
            object,
        } => {
            encoder.put_unit(unit, *state);
            encoder.put_token(&object.token);
            encoder.put_u32(object.payload.len() as u32);
            tail.push(Cow::Borrowed(&object.payload));
        }
        LogRecord::OptimisticReplace { unit, state, batch } => {
            encoder.put_unit(unit, *state);
            encoder.put_batch(batch);
            payloads(&batch.to_add, &mut tail);
            payloads(&batch.to_replace, &mut tail);
        }
        LogRecord::Delete { unit, state, token } => {
            encoder.put_unit(unit, *state);
            encoder.put_token(token);
        }
        LogRecord::Prepare { unit, state }
        | LogRecord::Commit { unit, state }
        | LogRecord::Backout { unit, state } => {
            encoder.put_unit(unit, *state);
        }
        LogRecord::CheckpointStart | LogRecord::CheckpointEnd => {}
        LogRecord::CheckpointTransaction {
            unit,
            state,
            checkpoint,
        } => {
            encoder.put_unit(unit, *state);
            encoder.put_objects(&checkpoint.added);
            encoder.put_objects(&checkpoint.replaced);
            encoder.put_tokens(&checkpoint.deleted);
            encoder.put_batch(&checkpoint.optimistic);
            payloads(&checkpoint.added, &mut tail);
            payloads(&checkpoint.replaced, &mut tail);
            payloads(&checkpoint.optimistic.to_add, &mut tail);
            payloads(&checkpoint.optimistic.to_replace, &mut tail);
        }
        LogRecord::Padding { size } => {
            encoder.put_u32(*size);
            if *size > 0 {
                tail.push(Cow::Owned(vec![0u8; *size as usize]));
            }
        }
    }

    let mut out = Vec::with_capacity(1 + tail.len());
    out.push(Cow::Owned(encoder.0));
    out.extend(tail.into_iter().filter(|b| !b.is_empty()));
    out
}

/// Copies a record's buffers into log pages a piece at a time.
///
/// The cursor remembers which buffer and offset it reached, so a record
/// too large for the current page continues on the next one.
pub struct RecordCursor<'a> {
    buffers: Vec<Cow<'a, [u8]>>,
    index: usize,
    offset: usize,
    total: usize,
    copied: usize,
}

impl<'a> RecordCursor<'a> {
    /// Start at the first byte of `record`.
    pub fn new(record: &'a LogRecord) -> Self {
        let buffers = buffers(record);
        let total = buffers.iter().map(|b| b.len()).sum();
        RecordCursor {
            buffers,
            index: 0,
            offset: 0,
            total,
            copied: 0,
        }
    }

    /// Encoded length of the whole record.
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Bytes not yet copied.
    pub fn remaining(&self) -> usize {
        self.total - self.copied
    }

    /// Whether every byte has been copied.
    pub fn is_complete(&self) -> bool {
        self.copied == self.total
    }

    /// Copy as many bytes as fit into `out`; returns the count copied.
    pub fn fill(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() && self.index < self.buffers.len() {
            let buffer = &self.buffers[self.index];
            let n = (buffer.len() - self.offset).min(out.len() - written);
            out[written..written + n].copy_from_slice(&buffer[self.offset..self.offset + n]);
            written += n;
            self.offset += n;
            if self.offset == buffer.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        self.copied += written;
        written
    }
}

struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(_: std::io::Error) -> RecordError {
    RecordError::Truncated
}

impl<'a> Decoder<'a> {
    fn u8(&mut self) -> Result<u8, RecordError> {
        self.cursor.read_u8().map_err(truncated)
    }

    fn u32(&mut self) -> Result<u32, RecordError> {
        self.cursor.read_u32::<BigEndian>().map_err(truncated)
    }

    fn i32(&mut self) -> Result<i32, RecordError> {
        self.cursor.read_i32::<BigEndian>().map_err(truncated)
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        self.cursor.read_u64::<BigEndian>().map_err(truncated)
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, RecordError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(RecordError::Truncated);
        }
        let mut out = vec![0u8; len];
        self.cursor.read_exact(&mut out).map_err(truncated)?;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        (len - self.cursor.position().min(len)) as usize
    }

    fn unit(&mut self) -> Result<(LogicalUnitOfWork, TransactionState), RecordError> {
        let id = self.u64()?;
        let has_xid = self.u8()?;
        let xid_len = self.u8()? as usize;
        if xid_len > MAX_XID_SIZE {
            return Err(RecordError::XidTooLong(xid_len));
        }
        let xid = self.bytes(xid_len)?;
        let code = self.u8()?;
        let state = TransactionState::from_code(code).ok_or(RecordError::UnknownState(code))?;
        let unit = LogicalUnitOfWork {
            id,
            xid: (has_xid != 0).then_some(xid),
        };
        Ok((unit, state))
    }

    fn token(&mut self) -> Result<TokenId, RecordError> {
        let store = self.u32()?;
        let object = self.u64()?;
        Ok(TokenId::new(store, object))
    }

    /// Identities with payload lengths still to be read.
    fn objects(&mut self) -> Result<Vec<(TokenId, usize)>, RecordError> {
        let count = self.u32()?;
        let mut out = Vec::new();
        for _ in 0..count {
            let token = self.token()?;
            let len = self.u32()? as usize;
            out.push((token, len));
        }
        Ok(out)
    }

    fn tokens(&mut self) -> Result<Vec<TokenId>, RecordError> {
        let count = self.u32()?;
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(self.token()?);
        }
        Ok(out)
    }

    fn payloads(
        &mut self,
        headers: Vec<(TokenId, usize)>,
    ) -> Result<Vec<LoggedObject>, RecordError> {
        headers
            .into_iter()
            .map(|(token, len)| Ok(LoggedObject::new(token, self.bytes(len)?)))
            .collect()
    }
}

/// Decode one complete record.
pub fn decode(bytes: &[u8]) -> Result<LogRecord, RecordError> {
    let mut d = Decoder {
        cursor: Cursor::new(bytes),
    };
    let tag = d.i32()?;
    let record_type = RecordType::from_tag(tag).ok_or(RecordError::UnknownType(tag))?;

    let record = match record_type {
        RecordType::UserDefined => {
            let len = d.u32()? as usize;
            LogRecord::UserDefined {
                payload: d.bytes(len)?,
            }
        }
        RecordType::Add | RecordType::Replace => {
            let (unit, state) = d.unit()?;
            let token = d.token()?;
            let len = d.u32()? as usize;
            let object = LoggedObject::new(token, d.bytes(len)?);
            if record_type == RecordType::Add {
                LogRecord::Add {
                    unit,
                    state,
                    object,
                }
            } else {
                LogRecord::Replace {
                    unit,
                    state,
                    object,
                }
            }
        }
        RecordType::OptimisticReplace => {
            let (unit, state) = d.unit()?;
            let to_add = d.objects()?;
            let to_replace = d.objects()?;
            let to_delete = d.tokens()?;
            let to_notify = d.tokens()?;
            let batch = OptimisticBatch {
                to_add: d.payloads(to_add)?,
                to_replace: d.payloads(to_replace)?,
                to_delete,
                to_notify,
            };
            LogRecord::OptimisticReplace { unit, state, batch }
        }
        RecordType::Delete => {
            let (unit, state) = d.unit()?;
            let token = d.token()?;
            LogRecord::Delete { unit, state, token }
        }
        RecordType::Prepare => {
            let (unit, state) = d.unit()?;
            LogRecord::Prepare { unit, state }
        }
        RecordType::Commit => {
            let (unit, state) = d.unit()?;
            LogRecord::Commit { unit, state }
        }
        RecordType::Backout => {
            let (unit, state) = d.unit()?;
            LogRecord::Backout { unit, state }
        }
        RecordType::CheckpointStart => LogRecord::CheckpointStart,
        RecordType::CheckpointEnd => LogRecord::CheckpointEnd,
        RecordType::CheckpointTransaction => {
            let (unit, state) = d.unit()?;
            let added = d.objects()?;
            let replaced = d.objects()?;
            let deleted = d.tokens()?;
            let opt_add = d.objects()?;
            let opt_replace = d.objects()?;
            let opt_delete = d.tokens()?;
            let opt_notify = d.tokens()?;
            let checkpoint = TransactionCheckpoint {
                added: d.payloads(added)?,
                replaced: d.payloads(replaced)?,
                deleted,
                optimistic: OptimisticBatch {
                    to_add: d.payloads(opt_add)?,
                    to_replace: d.payloads(opt_replace)?,
                    to_delete: opt_delete,
                    to_notify: opt_notify,
                },
            };
            LogRecord::CheckpointTransaction {
                unit,
                state,
                checkpoint,
            }
        }
        RecordType::Padding => {
            let size = d.u32()?;
            if d.remaining() < size as usize {
                return Err(RecordError::Truncated);
            }
            d.cursor.set_position(d.cursor.position() + size as u64);
            LogRecord::Padding { size }
        }
    };

    match d.remaining() {
        0 => Ok(record),
        n => Err(RecordError::TrailingBytes(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit(id: u64) -> LogicalUnitOfWork {
        LogicalUnitOfWork::new(id)
    }

    #[test]
    fn test_payload_is_borrowed() {
        let record = LogRecord::Add {
            unit: unit(1),
            state: TransactionState::ActivePersistent,
            object: LoggedObject::new(TokenId::new(1, 2), vec![9; 32]),
        };
        let buffers = buffers(&record);
        assert_eq!(buffers.len(), 2);
        assert!(matches!(buffers[1], Cow::Borrowed(_)));
    }

    #[test]
    fn test_cursor_resumes_across_small_windows() {
        let record = LogRecord::Replace {
            unit: unit(4),
            state: TransactionState::ActivePersistent,
            object: LoggedObject::new(TokenId::new(2, 8), (0..200u8).collect()),
        };
        let whole = record.to_bytes();
        let mut cursor = RecordCursor::new(&record);
        let mut pieces = Vec::new();
        while !cursor.is_complete() {
            let mut window = [0u8; 7];
            let n = cursor.fill(&mut window);
            pieces.extend_from_slice(&window[..n]);
        }
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(pieces, whole);
    }

    #[test]
    fn test_xid_survives_encoding() {
        let record = LogRecord::Prepare {
            unit: LogicalUnitOfWork {
                id: 3,
                xid: Some(b"branch-1".to_vec()),
            },
            state: TransactionState::PreparedPersistent,
        };
        assert_eq!(decode(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = 99i32.to_be_bytes();
        assert_eq!(decode(&bytes), Err(RecordError::UnknownType(99)));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let mut bytes = LogRecord::Commit {
            unit: unit(1),
            state: TransactionState::CommittingPersistent,
        }
        .to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = 200;
        assert_eq!(decode(&bytes), Err(RecordError::UnknownState(200)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = LogRecord::CheckpointEnd.to_bytes();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(RecordError::TrailingBytes(1)));
    }

    #[test]
    fn test_absurd_count_is_truncation_not_allocation() {
        let mut bytes = LogRecord::OptimisticReplace {
            unit: unit(1),
            state: TransactionState::ActivePersistent,
            batch: OptimisticBatch::default(),
        }
        .to_bytes();
        // Overwrite the to_add count
        let at = 4 + 10 + 1;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(decode(&bytes), Err(RecordError::Truncated));
    }

    proptest! {
        #[test]
        fn prop_truncated_records_never_decode(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            cut in 1usize..32,
        ) {
            let record = LogRecord::Add {
                unit: unit(5),
                state: TransactionState::ActivePersistent,
                object: LoggedObject::new(TokenId::new(1, 1), payload),
            };
            let bytes = record.to_bytes();
            let cut = cut.min(bytes.len());
            prop_assert!(decode(&bytes[..bytes.len() - cut]).is_err());
        }
    }
}
