//! Log record model
//!
//! The record set is closed: every consumer matches exhaustively on
//! [`LogRecord`]. A record body never contains its own log position; the
//! position lives in the chunk frame so a record can be re-homed into the
//! next chunk on roll without re-encoding.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RecordError;
use crate::position::{EventNumber, ExpectedVersion, LogPosition, TOMBSTONE_EVENT_NUMBER, TransactionId};

/// Flags carried by a prepare record
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrepareFlags(u8);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// Prepare carries an event
    pub const DATA: PrepareFlags = PrepareFlags(1 << 0);
    /// First record of its transaction
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(1 << 1);
    /// Last record of its transaction
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(1 << 2);
    /// Prepare is self-committing (no separate commit required)
    pub const IS_COMMITTED: PrepareFlags = PrepareFlags(1 << 3);
    /// Prepare is a stream delete tombstone
    pub const IS_DELETE: PrepareFlags = PrepareFlags(1 << 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Debug for PrepareFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::DATA, "DATA"),
            (Self::TRANSACTION_BEGIN, "TX_BEGIN"),
            (Self::TRANSACTION_END, "TX_END"),
            (Self::IS_COMMITTED, "COMMITTED"),
            (Self::IS_DELETE, "DELETE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PrepareFlags({})", set.join("|"))
    }
}

/// One event (or tombstone) written ahead of its commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub transaction_id: TransactionId,
    /// Index of this event within its transaction
    pub transaction_offset: u32,
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub flags: PrepareFlags,
    pub timestamp_millis: i64,
}

impl PrepareRecord {
    pub fn is_delete(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_DELETE)
    }

    pub fn has_data(&self) -> bool {
        self.flags.contains(PrepareFlags::DATA)
    }

    pub fn is_transaction_begin(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_BEGIN)
    }

    pub fn is_transaction_end(&self) -> bool {
        self.flags.contains(PrepareFlags::TRANSACTION_END)
    }
}

/// Makes the prepares of one transaction visible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub transaction_id: TransactionId,
    /// Position of the transaction's first prepare
    pub transaction_position: LogPosition,
    pub first_event_number: EventNumber,
    pub timestamp_millis: i64,
}

impl CommitRecord {
    pub fn is_tombstone(&self) -> bool {
        self.first_event_number == TOMBSTONE_EVENT_NUMBER
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemRecordKind {
    /// Durability / leadership boundary
    Epoch { epoch_number: u64, epoch_id: Uuid },
    /// Node-written checkpoint marker
    Checkpoint,
}

/// Records written by the node itself, outside any user stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub kind: SystemRecordKind,
    pub timestamp_millis: i64,
    pub data: Bytes,
}

/// The unit of storage in the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    System(SystemRecord),
}

/// Discriminant of a [`LogRecord`], for logging and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Prepare,
    Commit,
    System,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Prepare => write!(f, "prepare"),
            RecordKind::Commit => write!(f, "commit"),
            RecordKind::System => write!(f, "system"),
        }
    }
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Prepare(_) => RecordKind::Prepare,
            LogRecord::Commit(_) => RecordKind::Commit,
            LogRecord::System(_) => RecordKind::System,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        match self {
            LogRecord::Prepare(p) => p.timestamp_millis,
            LogRecord::Commit(c) => c.timestamp_millis,
            LogRecord::System(s) => s.timestamp_millis,
        }
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Prepare(p) => Some(p.transaction_id),
            LogRecord::Commit(c) => Some(c.transaction_id),
            LogRecord::System(_) => None,
        }
    }

    /// Serialize the record body
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        postcard::to_allocvec(self).map_err(|e| RecordError::Encode(e.to_string()))
    }

    /// Deserialize a record body
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        postcard::from_bytes(bytes).map_err(RecordError::from)
    }
}

/// A record together with the position it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLog {
    pub position: LogPosition,
    pub record: LogRecord,
}

impl RecordedLog {
    pub fn new(position: LogPosition, record: LogRecord) -> Self {
        Self { position, record }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(flags: PrepareFlags) -> PrepareRecord {
        PrepareRecord {
            transaction_id: TransactionId(3),
            transaction_offset: 0,
            stream: "bla".into(),
            expected_version: ExpectedVersion::Any,
            event_id: Uuid::new_v4(),
            event_type: "created".into(),
            data: Bytes::from_static(b"{\"a\":1}"),
            metadata: Bytes::new(),
            flags,
            timestamp_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_flags() {
        let flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        assert!(flags.contains(PrepareFlags::DATA));
        assert!(flags.contains(PrepareFlags::TRANSACTION_BEGIN));
        assert!(!flags.contains(PrepareFlags::IS_DELETE));
        assert_eq!(format!("{:?}", flags), "PrepareFlags(DATA|TX_BEGIN)");
    }

    #[test]
    fn test_encode_decode_prepare() {
        let record = LogRecord::Prepare(prepare(PrepareFlags::DATA));
        let bytes = record.encode().unwrap();
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(LogRecord::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_tombstone_commit() {
        let commit = CommitRecord {
            transaction_id: TransactionId(1),
            transaction_position: LogPosition(0),
            first_event_number: TOMBSTONE_EVENT_NUMBER,
            timestamp_millis: 0,
        };
        assert!(commit.is_tombstone());
        assert_eq!(LogRecord::Commit(commit).kind(), RecordKind::Commit);
    }

    #[test]
    fn test_delete_prepare_accessors() {
        let p = prepare(PrepareFlags::IS_DELETE | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END);
        assert!(p.is_delete());
        assert!(!p.has_data());
        assert!(p.is_transaction_begin() && p.is_transaction_end());
    }
}
