//! Error types for strata-core

use thiserror::Error;

use crate::position::TransactionId;

/// Errors raised while encoding or decoding a log record body
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record could not be serialized
    #[error("Record encode error: {0}")]
    Encode(String),

    /// The record bytes did not decode into a known variant
    #[error("Record decode error: {0}")]
    Decode(String),
}

impl From<postcard::Error> for RecordError {
    fn from(err: postcard::Error) -> Self {
        RecordError::Decode(err.to_string())
    }
}

/// Terminal outcomes surfaced to the caller of a client operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Optimistic concurrency conflict
    #[error("Wrong expected version. Stream: {stream}, Transaction: {transaction:?}")]
    WrongExpectedVersion {
        stream: String,
        transaction: Option<TransactionId>,
    },

    /// Target stream has been deleted
    #[error("Stream deleted: {0}")]
    StreamDeleted(String),

    /// Transaction unknown, already committed or abandoned
    #[error("Invalid transaction")]
    InvalidTransaction,

    /// Response did not carry the command the operation expected
    #[error("Command not expected. Expected: {expected}, actual: {actual}")]
    CommandNotExpected { expected: String, actual: String },

    /// Outcome code outside the known set
    #[error("Unknown outcome code: {0}")]
    UnknownOutcomeCode(u8),
}
