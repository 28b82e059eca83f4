//! Log records
//!
//! Every change the engine can redo is described by one [`LogRecord`].
//! Records carry enough to be replayed on their own: the logical unit of
//! work they belong to, the transaction state when they were written, and
//! the full serialized payload of any object they add or replace.
//!
//! # Record Types
//!
//! | Tag | Record | Written by |
//! |-----|--------|------------|
//! | 0 | UserDefined | applications, through the object manager |
//! | 1 | Add | `Transaction::add` on a persistent store |
//! | 2 | Replace | `Transaction::replace` |
//! | 3 | OptimisticReplace | `Transaction::optimistic_replace` |
//! | 4 | Delete | `Transaction::delete` |
//! | 5 | Prepare | phase one of two-phase commit |
//! | 6 | Commit | commit of a persistent transaction |
//! | 7 | Backout | backout of a persistent transaction |
//! | 8 | CheckpointStart | the checkpoint coordinator |
//! | 9 | CheckpointEnd | the checkpoint coordinator |
//! | 10 | CheckpointTransaction | a transaction alive across a checkpoint |
//! | 11 | Padding | the file log, to fill the rest of a page |
//!
//! The byte layout lives in [`codec`].

pub mod codec;

pub use codec::{decode, RecordCursor, RecordError};

use objmgr_core::{LogicalUnitOfWork, TokenId, TransactionState};

/// Bytes of a padding record before its filler.
pub const PADDING_OVERHEAD: usize = 8;

/// Upper bound on the encoded size of Prepare, Commit and Backout records.
pub const MAX_TERMINAL_RECORD_LEN: usize = 4 + 8 + 1 + 1 + objmgr_core::MAX_XID_SIZE + 1;

/// On-disk type tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RecordType {
    /// Opaque application record
    UserDefined = 0,
    /// Object added
    Add = 1,
    /// Object replaced
    Replace = 2,
    /// Batch replaced without locks
    OptimisticReplace = 3,
    /// Object deleted
    Delete = 4,
    /// Transaction prepared
    Prepare = 5,
    /// Transaction committed
    Commit = 6,
    /// Transaction backed out
    Backout = 7,
    /// Checkpoint begins
    CheckpointStart = 8,
    /// Checkpoint is complete
    CheckpointEnd = 9,
    /// State of one transaction at a checkpoint
    CheckpointTransaction = 10,
    /// Filler
    Padding = 11,
}

impl RecordType {
    /// Decode a tag.
    pub fn from_tag(tag: i32) -> Option<RecordType> {
        Some(match tag {
            0 => RecordType::UserDefined,
            1 => RecordType::Add,
            2 => RecordType::Replace,
            3 => RecordType::OptimisticReplace,
            4 => RecordType::Delete,
            5 => RecordType::Prepare,
            6 => RecordType::Commit,
            7 => RecordType::Backout,
            8 => RecordType::CheckpointStart,
            9 => RecordType::CheckpointEnd,
            10 => RecordType::CheckpointTransaction,
            11 => RecordType::Padding,
            _ => return None,
        })
    }

    /// Tag written to the log.
    pub fn tag(self) -> i32 {
        self as i32
    }
}

/// An object identity together with the bytes to redo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedObject {
    /// Identity of the object
    pub token: TokenId,
    /// Serialized object
    pub payload: Vec<u8>,
}

impl LoggedObject {
    /// Pair an identity with its bytes.
    pub fn new(token: TokenId, payload: Vec<u8>) -> Self {
        LoggedObject { token, payload }
    }
}

/// The objects of one optimistic replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimisticBatch {
    /// Objects that become stored
    pub to_add: Vec<LoggedObject>,
    /// Objects whose stored bytes change
    pub to_replace: Vec<LoggedObject>,
    /// Objects removed from their store
    pub to_delete: Vec<TokenId>,
    /// Objects told about the outcome without being changed
    pub to_notify: Vec<TokenId>,
}

impl OptimisticBatch {
    /// Whether the batch touches nothing.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_replace.is_empty()
            && self.to_delete.is_empty()
            && self.to_notify.is_empty()
    }

    /// Total payload bytes.
    pub fn payload_len(&self) -> usize {
        self.to_add
            .iter()
            .chain(self.to_replace.iter())
            .map(|o| o.payload.len())
            .sum()
    }

    /// Fold `other` into this batch, later entries replacing earlier ones
    /// for the same identity.
    pub fn merge(&mut self, other: OptimisticBatch) {
        fn upsert(list: &mut Vec<LoggedObject>, object: LoggedObject) {
            match list.iter_mut().find(|o| o.token == object.token) {
                Some(existing) => *existing = object,
                None => list.push(object),
            }
        }
        fn insert(list: &mut Vec<TokenId>, token: TokenId) {
            if !list.contains(&token) {
                list.push(token);
            }
        }
        for object in other.to_add {
            upsert(&mut self.to_add, object);
        }
        for object in other.to_replace {
            upsert(&mut self.to_replace, object);
        }
        for token in other.to_delete {
            insert(&mut self.to_delete, token);
        }
        for token in other.to_notify {
            insert(&mut self.to_notify, token);
        }
    }
}

/// Everything a transaction had done when a checkpoint captured it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionCheckpoint {
    /// Locked objects added by the transaction
    pub added: Vec<LoggedObject>,
    /// Locked objects replaced by the transaction
    pub replaced: Vec<LoggedObject>,
    /// Locked objects deleted by the transaction
    pub deleted: Vec<TokenId>,
    /// Optimistic changes not yet committed
    pub optimistic: OptimisticBatch,
}

impl TransactionCheckpoint {
    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.replaced.is_empty()
            && self.deleted.is_empty()
            && self.optimistic.is_empty()
    }
}

/// A redoable action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Opaque bytes for the application
    UserDefined {
        /// Application bytes
        payload: Vec<u8>,
    },
    /// A locked object was added
    Add {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
        /// The added object
        object: LoggedObject,
    },
    /// A locked object was replaced
    Replace {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
        /// The new contents
        object: LoggedObject,
    },
    /// A batch was changed without locks
    OptimisticReplace {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
        /// The batch
        batch: OptimisticBatch,
    },
    /// A locked object was deleted
    Delete {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
        /// The deleted object
        token: TokenId,
    },
    /// Two-phase commit phase one
    Prepare {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
    },
    /// The unit of work committed
    Commit {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
    },
    /// The unit of work backed out
    Backout {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
    },
    /// A checkpoint started; replay may begin here
    CheckpointStart,
    /// The checkpoint that last started is complete
    CheckpointEnd,
    /// A transaction's state captured by a checkpoint
    CheckpointTransaction {
        /// Owning unit of work
        unit: LogicalUnitOfWork,
        /// Transaction state when logged
        state: TransactionState,
        /// The captured changes
        checkpoint: TransactionCheckpoint,
    },
    /// Filler of `size` zero bytes after the padding header
    Padding {
        /// Filler length
        size: u32,
    },
}

impl LogRecord {
    /// Type tag of this record.
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::UserDefined { .. } => RecordType::UserDefined,
            LogRecord::Add { .. } => RecordType::Add,
            LogRecord::Replace { .. } => RecordType::Replace,
            LogRecord::OptimisticReplace { .. } => RecordType::OptimisticReplace,
            LogRecord::Delete { .. } => RecordType::Delete,
            LogRecord::Prepare { .. } => RecordType::Prepare,
            LogRecord::Commit { .. } => RecordType::Commit,
            LogRecord::Backout { .. } => RecordType::Backout,
            LogRecord::CheckpointStart => RecordType::CheckpointStart,
            LogRecord::CheckpointEnd => RecordType::CheckpointEnd,
            LogRecord::CheckpointTransaction { .. } => RecordType::CheckpointTransaction,
            LogRecord::Padding { .. } => RecordType::Padding,
        }
    }

    /// Unit of work the record belongs to, for transactional records.
    pub fn unit(&self) -> Option<&LogicalUnitOfWork> {
        match self {
            LogRecord::Add { unit, .. }
            | LogRecord::Replace { unit, .. }
            | LogRecord::OptimisticReplace { unit, .. }
            | LogRecord::Delete { unit, .. }
            | LogRecord::Prepare { unit, .. }
            | LogRecord::Commit { unit, .. }
            | LogRecord::Backout { unit, .. }
            | LogRecord::CheckpointTransaction { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// Transaction state recorded with a transactional record.
    pub fn transaction_state(&self) -> Option<TransactionState> {
        match self {
            LogRecord::Add { state, .. }
            | LogRecord::Replace { state, .. }
            | LogRecord::OptimisticReplace { state, .. }
            | LogRecord::Delete { state, .. }
            | LogRecord::Prepare { state, .. }
            | LogRecord::Commit { state, .. }
            | LogRecord::Backout { state, .. }
            | LogRecord::CheckpointTransaction { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Padding record whose encoded form is exactly `len` bytes.
    ///
    /// `len` must be at least [`PADDING_OVERHEAD`].
    pub fn padding_of_len(len: usize) -> LogRecord {
        LogRecord::Padding {
            size: len.saturating_sub(PADDING_OVERHEAD) as u32,
        }
    }

    /// Check that every count and payload length fits the 32-bit field
    /// the codec writes it to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`](objmgr_core::Error::InvalidOperation)
    /// naming the first field that would not fit.
    pub fn check_lengths(&self) -> objmgr_core::Result<()> {
        self.check_lengths_within(u32::MAX as usize)
    }

    fn check_lengths_within(&self, limit: usize) -> objmgr_core::Result<()> {
        let fits = |len: usize, what: &str| {
            if len > limit {
                Err(objmgr_core::Error::InvalidOperation(format!(
                    "{} of {} exceeds the log record limit of {}",
                    what, len, limit
                )))
            } else {
                Ok(())
            }
        };
        let objects = |objects: &[LoggedObject]| -> objmgr_core::Result<()> {
            fits(objects.len(), "object count")?;
            objects
                .iter()
                .try_for_each(|object| fits(object.payload.len(), "payload length"))
        };
        let batch = |batch: &OptimisticBatch| -> objmgr_core::Result<()> {
            objects(&batch.to_add)?;
            objects(&batch.to_replace)?;
            fits(batch.to_delete.len(), "delete count")?;
            fits(batch.to_notify.len(), "notify count")
        };

        match self {
            LogRecord::UserDefined { payload } => fits(payload.len(), "payload length"),
            LogRecord::Add { object, .. } | LogRecord::Replace { object, .. } => {
                fits(object.payload.len(), "payload length")
            }
            LogRecord::OptimisticReplace { batch: b, .. } => batch(b),
            LogRecord::CheckpointTransaction { checkpoint, .. } => {
                objects(&checkpoint.added)?;
                objects(&checkpoint.replaced)?;
                fits(checkpoint.deleted.len(), "delete count")?;
                batch(&checkpoint.optimistic)
            }
            _ => Ok(()),
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        RecordCursor::new(self).total_len()
    }

    /// Encode into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = RecordCursor::new(self);
        let mut out = vec![0u8; cursor.total_len()];
        cursor.fill(&mut out);
        out
    }
}
