//! # Strata Core
//!
//! Core types shared by every layer of the Strata event store.
//!
//! This crate has no I/O. It defines the unit of storage and the vocabulary
//! the storage engine and its callers use to talk about it.
//!
//! ## Key Types
//!
//! - [`LogRecord`]: closed set of record variants (Prepare, Commit, System)
//! - [`LogPosition`]: offset into the logical, append-only log
//! - [`ExpectedVersion`]: optimistic-concurrency guard for stream writes
//! - [`StreamMetadata`]: per-stream retention policy (max count, max age, truncate-before)
//! - [`Clock`]: time abstraction so retention can be evaluated deterministically in tests
//!
//! ## Operation outcomes
//!
//! [`operation`] classifies the outcome code of a mutating request into
//! succeed / retry / notify-error, and models client operations as immutable
//! values that receive a fresh correlation id on retry.

pub mod clock;
pub mod error;
pub mod metadata;
pub mod operation;
pub mod position;
pub mod record;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OperationError, RecordError};
pub use metadata::{StreamMetadata, is_metadata_stream, metadata_stream_of, original_stream_of};
pub use operation::{
    AppendOperation, ClientOperation, CommitTransactionOperation, CorrelationId,
    DeleteStreamOperation, InspectionDecision, OperationErrorCode, OperationResponse, ResponseKind,
};
pub use position::{
    EventNumber, ExpectedVersion, LogPosition, TOMBSTONE_EVENT_NUMBER, TransactionId,
};
pub use record::{
    CommitRecord, LogRecord, PrepareFlags, PrepareRecord, RecordKind, RecordedLog, SystemRecord,
    SystemRecordKind,
};
