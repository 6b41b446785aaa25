//! Error types for strata-storage
//!
//! [`StorageError`] covers the log itself. [`WriteError`] is the failure
//! surface of the stream-level operations exposed by
//! [`Database`](crate::Database); it is what the operation layer maps onto
//! outcome codes.

use strata_core::{
    EventNumber, ExpectedVersion, LogPosition, OperationErrorCode, RecordError, TransactionId,
};
use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Checksum or length framing failure inside a chunk
    #[error("Corrupt record in chunk {chunk} at offset {offset}: {reason}")]
    CorruptRecord {
        chunk: u32,
        offset: u32,
        reason: String,
    },

    /// Chunk-level header, footer or hash failure
    #[error("Corrupt chunk {chunk}: {reason}")]
    CorruptChunk { chunk: u32, reason: String },

    /// Position is not a record boundary, is a scavenged hole, or lies
    /// past the last flushed record
    #[error("Position out of range: {0}")]
    PositionOutOfRange(LogPosition),

    /// Record does not fit in the remaining space of the active chunk
    #[error("Chunk {chunk} full")]
    ChunkFull { chunk: u32 },

    /// Record can never fit in a chunk
    #[error("Record too large: {size} bytes (limit {limit})")]
    RecordTooLarge { size: usize, limit: usize },

    /// Write attempted against a sealed chunk
    #[error("Chunk {0} is sealed")]
    ChunkSealed(u32),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid configuration or on-disk layout mismatch
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another scavenge pass holds the lease for this chunk
    #[error("Scavenge already in progress for chunk {0}")]
    ScavengeInProgress(u32),

    /// Scavenge pass was cancelled between chunks
    #[error("Scavenge cancelled")]
    Cancelled,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<RecordError> for StorageError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Encode(msg) => StorageError::Serialization(msg),
            RecordError::Decode(msg) => StorageError::Deserialization(msg),
        }
    }
}

/// Convert from postcard Error to StorageError
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl StorageError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new CorruptRecord error
    pub fn corrupt(chunk: u32, offset: u32, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            chunk,
            offset,
            reason: reason.into(),
        }
    }

    /// Create a new CorruptChunk error
    pub fn corrupt_chunk(chunk: u32, reason: impl Into<String>) -> Self {
        Self::CorruptChunk {
            chunk,
            reason: reason.into(),
        }
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error means data on disk can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptRecord { .. } | StorageError::CorruptChunk { .. }
        )
    }
}

/// Failures of stream-level writes and reads
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Wrong expected version for stream {stream}: expected {expected}, actual {actual:?}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        actual: Option<EventNumber>,
    },

    #[error("Stream deleted: {0}")]
    StreamDeleted(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(TransactionId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RecordError> for WriteError {
    fn from(err: RecordError) -> Self {
        WriteError::Storage(err.into())
    }
}

/// Result type alias for stream-level operations
pub type WriteResult<T> = Result<T, WriteError>;

impl From<&WriteError> for OperationErrorCode {
    fn from(err: &WriteError) -> Self {
        match err {
            WriteError::WrongExpectedVersion { .. } => OperationErrorCode::WrongExpectedVersion,
            WriteError::StreamDeleted(_) => OperationErrorCode::StreamDeleted,
            WriteError::InvalidTransaction(_) => OperationErrorCode::InvalidTransaction,
            // A write the engine could not make durable has to be treated as
            // "did not complete in time" by the caller.
            WriteError::StreamNotFound(_) | WriteError::Storage(_) => {
                OperationErrorCode::CommitTimeout
            }
        }
    }
}
