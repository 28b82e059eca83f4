//! Snapshot file of a file object store.
//!
//! # Format
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ Magic: "OMST" (4 bytes)             │
//! │ Version (4 bytes, BE)               │
//! │ Store identifier (4 bytes, BE)      │
//! │ Sequence high-water mark (8 bytes)  │
//! │ Entry count (8 bytes)               │
//! ├─────────────────────────────────────┤
//! │ Entry: object id (8), length (4),   │
//! │        payload bytes                │
//! │ ...                                 │
//! ├─────────────────────────────────────┤
//! │ CRC32 of everything above (4 bytes) │
//! └─────────────────────────────────────┘
//! ```
//!
//! Written to a temporary file, synced, then renamed over the previous
//! snapshot, so a crash leaves either the old or the new file intact.

use byteorder::{BigEndian, ReadBytesExt};
use objmgr_core::{Error, ObjectStoreId, StoredObjectId};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Snapshot file magic.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"OMST";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const FIXED_SIZE: usize = 4 + 4 + 4 + 8 + 8;

/// Decoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Last sequence number the store handed out
    pub sequence: u64,
    /// Stored objects, ordered by identity
    pub entries: Vec<(StoredObjectId, Vec<u8>)>,
}

/// Why a snapshot file was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// Shorter than the fixed fields and checksum
    #[error("snapshot too short: {0} bytes")]
    TooShort(usize),

    /// Not a snapshot file
    #[error("bad snapshot magic")]
    BadMagic,

    /// Written by a newer format
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// Belongs to another store
    #[error("snapshot of {found} found where {expected} was expected")]
    WrongStore {
        /// Store reading the file
        expected: ObjectStoreId,
        /// Store named in the file
        found: ObjectStoreId,
    },

    /// Checksum does not match the contents
    #[error("snapshot checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum in the file
        stored: u32,
        /// Checksum of the bytes read
        computed: u32,
    },

    /// The entries run past the end of the file
    #[error("snapshot entries truncated")]
    Truncated,
}

impl From<SnapshotError> for Error {
    fn from(e: SnapshotError) -> Self {
        Error::StoreFormat(e.to_string())
    }
}

/// Path of the snapshot of store `name` in `dir`.
pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.store", name))
}

/// Encode a snapshot.
pub fn encode(store: ObjectStoreId, sequence: u64, entries: &[(StoredObjectId, Vec<u8>)]) -> Vec<u8> {
    let payload: usize = entries.iter().map(|(_, bytes)| 12 + bytes.len()).sum();
    let mut buf = Vec::with_capacity(FIXED_SIZE + payload + 4);
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    buf.extend_from_slice(&store.0.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for (id, bytes) in entries {
        buf.extend_from_slice(&id.0.to_be_bytes());
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Decode a snapshot written for `store`.
pub fn decode(data: &[u8], store: ObjectStoreId) -> Result<StoreSnapshot, SnapshotError> {
    if data.len() < FIXED_SIZE + 4 {
        return Err(SnapshotError::TooShort(data.len()));
    }
    if data[..4] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let stored = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(SnapshotError::ChecksumMismatch { stored, computed });
    }

    let truncated = |_: io::Error| SnapshotError::Truncated;
    let mut cursor = Cursor::new(&body[4..]);
    let version = cursor.read_u32::<BigEndian>().map_err(truncated)?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let found = ObjectStoreId(cursor.read_u32::<BigEndian>().map_err(truncated)?);
    if found != store {
        return Err(SnapshotError::WrongStore {
            expected: store,
            found,
        });
    }
    let sequence = cursor.read_u64::<BigEndian>().map_err(truncated)?;
    let count = cursor.read_u64::<BigEndian>().map_err(truncated)?;

    let mut entries = Vec::new();
    for _ in 0..count {
        let id = StoredObjectId(cursor.read_u64::<BigEndian>().map_err(truncated)?);
        let len = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let remaining = body.len() - 4 - cursor.position() as usize;
        if len > remaining {
            return Err(SnapshotError::Truncated);
        }
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(truncated)?;
        entries.push((id, bytes));
    }
    Ok(StoreSnapshot { sequence, entries })
}

/// Replace the file at `path` with `bytes` using write, sync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("store.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    // Sync parent directory
    if let Some(parent) = path.parent() {
        if parent.exists() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Read the snapshot at `path`; `None` if there is none.
pub fn read(path: &Path, store: ObjectStoreId) -> Result<Option<StoreSnapshot>, Error> {
    match fs::read(path) {
        Ok(data) => Ok(Some(decode(&data, store)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
