//! Client operation outcomes
//!
//! Every mutating request completes with an outcome code. The operation
//! layer that issued the request classifies the code into one of three
//! decisions:
//!
//! - **Succeed**: complete the caller's future
//! - **Retry**: re-send with a fresh correlation id (timeouts)
//! - **NotifyError**: surface a terminal error (version conflict, deleted
//!   stream, malformed transaction)
//!
//! Operations are immutable values. A retry does not mutate the operation
//! in place; [`ClientOperation::retry`] returns a new instance carrying a
//! new [`CorrelationId`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OperationError;
use crate::position::{ExpectedVersion, TransactionId};

/// Identity of one request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome code carried by a completed mutating request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationErrorCode {
    Success = 0,
    PrepareTimeout = 1,
    CommitTimeout = 2,
    ForwardTimeout = 3,
    WrongExpectedVersion = 4,
    StreamDeleted = 5,
    InvalidTransaction = 6,
}

impl TryFrom<u8> for OperationErrorCode {
    type Error = OperationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Success),
            1 => Ok(Self::PrepareTimeout),
            2 => Ok(Self::CommitTimeout),
            3 => Ok(Self::ForwardTimeout),
            4 => Ok(Self::WrongExpectedVersion),
            5 => Ok(Self::StreamDeleted),
            6 => Ok(Self::InvalidTransaction),
            other => Err(OperationError::UnknownOutcomeCode(other)),
        }
    }
}

impl OperationErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PrepareTimeout | Self::CommitTimeout | Self::ForwardTimeout
        )
    }
}

/// Kind of completion message a request is answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    WriteEventsCompleted,
    TransactionCommitCompleted,
    DeleteStreamCompleted,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Completion message as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub kind: ResponseKind,
    pub correlation_id: CorrelationId,
    pub code: u8,
}

/// Decision taken after inspecting a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectionDecision {
    Succeed,
    Retry,
    NotifyError(OperationError),
}

/// A request the operation layer can send, inspect and retry
pub trait ClientOperation: Sized {
    fn correlation_id(&self) -> CorrelationId;

    fn stream(&self) -> &str;

    fn expected_response(&self) -> ResponseKind;

    /// Transaction the operation belongs to, for error context
    fn transaction_id(&self) -> Option<TransactionId> {
        None
    }

    /// Same request under a fresh correlation id
    fn retry(&self) -> Self;

    /// Classify a response.
    ///
    /// `Err` is returned only for an outcome code outside the known set,
    /// which is a programming error on one side of the connection and must
    /// not be turned into a retry or a user-facing error.
    fn inspect(&self, response: &OperationResponse) -> Result<InspectionDecision, OperationError> {
        if response.kind != self.expected_response() {
            return Ok(InspectionDecision::NotifyError(
                OperationError::CommandNotExpected {
                    expected: self.expected_response().to_string(),
                    actual: response.kind.to_string(),
                },
            ));
        }

        let code = OperationErrorCode::try_from(response.code)?;
        let decision = match code {
            OperationErrorCode::Success => InspectionDecision::Succeed,
            OperationErrorCode::PrepareTimeout
            | OperationErrorCode::CommitTimeout
            | OperationErrorCode::ForwardTimeout => InspectionDecision::Retry,
            OperationErrorCode::WrongExpectedVersion => {
                InspectionDecision::NotifyError(OperationError::WrongExpectedVersion {
                    stream: self.stream().to_string(),
                    transaction: self.transaction_id(),
                })
            }
            OperationErrorCode::StreamDeleted => InspectionDecision::NotifyError(
                OperationError::StreamDeleted(self.stream().to_string()),
            ),
            OperationErrorCode::InvalidTransaction => {
                InspectionDecision::NotifyError(OperationError::InvalidTransaction)
            }
        };
        Ok(decision)
    }
}

/// Append events to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOperation {
    correlation_id: CorrelationId,
    stream: String,
    expected_version: ExpectedVersion,
}

impl AppendOperation {
    pub fn new(stream: impl Into<String>, expected_version: ExpectedVersion) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            stream: stream.into(),
            expected_version,
        }
    }

    pub fn expected_version(&self) -> ExpectedVersion {
        self.expected_version
    }
}

impl ClientOperation for AppendOperation {
    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn stream(&self) -> &str {
        &self.stream
    }

    fn expected_response(&self) -> ResponseKind {
        ResponseKind::WriteEventsCompleted
    }

    fn retry(&self) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            ..self.clone()
        }
    }
}

/// Commit a previously started transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTransactionOperation {
    correlation_id: CorrelationId,
    transaction_id: TransactionId,
    stream: String,
}

impl CommitTransactionOperation {
    pub fn new(transaction_id: TransactionId, stream: impl Into<String>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            transaction_id,
            stream: stream.into(),
        }
    }
}

impl ClientOperation for CommitTransactionOperation {
    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn stream(&self) -> &str {
        &self.stream
    }

    fn expected_response(&self) -> ResponseKind {
        ResponseKind::TransactionCommitCompleted
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        Some(self.transaction_id)
    }

    fn retry(&self) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for CommitTransactionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransactionId: {}, Stream: {}, CorrelationId: {}",
            self.transaction_id, self.stream, self.correlation_id
        )
    }
}

/// Delete a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStreamOperation {
    correlation_id: CorrelationId,
    stream: String,
    expected_version: ExpectedVersion,
}

impl DeleteStreamOperation {
    pub fn new(stream: impl Into<String>, expected_version: ExpectedVersion) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            stream: stream.into(),
            expected_version,
        }
    }

    pub fn expected_version(&self) -> ExpectedVersion {
        self.expected_version
    }
}

impl ClientOperation for DeleteStreamOperation {
    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn stream(&self) -> &str {
        &self.stream
    }

    fn expected_response(&self) -> ResponseKind {
        ResponseKind::DeleteStreamCompleted
    }

    fn retry(&self) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            ..self.clone()
        }
    }
}
