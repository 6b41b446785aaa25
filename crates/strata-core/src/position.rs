//! Positions, event numbers and expected versions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Event number within a single stream, starting at 0
pub type EventNumber = u64;

/// Event number carried by the commit of a delete tombstone
pub const TOMBSTONE_EVENT_NUMBER: EventNumber = u64::MAX;

/// Offset into the logical (unbounded) log.
///
/// Positions are assigned in strictly increasing order and never reused.
/// A position maps to a chunk number and an offset within that chunk's
/// logical range; scavenging can remove the record at a position but never
/// moves a surviving record to a different position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Chunk number this position falls into for a given logical chunk size
    pub fn chunk_number(self, chunk_size: u32) -> u32 {
        (self.0 / chunk_size as u64) as u32
    }

    /// Offset within the chunk's logical range
    pub fn chunk_offset(self, chunk_size: u32) -> u32 {
        (self.0 % chunk_size as u64) as u32
    }

    pub fn advance(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of a (single-stream) transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Optimistic-concurrency expectation for a stream write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Write regardless of the stream's current version
    Any,
    /// The stream must not exist yet
    NoStream,
    /// The stream's last event number must equal this value
    Exact(EventNumber),
}

impl ExpectedVersion {
    /// Check the expectation against the stream's current last event number
    pub fn matches(self, last_event_number: Option<EventNumber>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => last_event_number.is_none(),
            ExpectedVersion::Exact(n) => last_event_number == Some(n),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no-stream"),
            ExpectedVersion::Exact(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for ExpectedVersion {
    type Err = String;

    /// Parses the `Display` form: `any`, `no-stream` or an event number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(ExpectedVersion::Any),
            "no-stream" => Ok(ExpectedVersion::NoStream),
            n => n
                .parse()
                .map(ExpectedVersion::Exact)
                .map_err(|_| format!("expected `any`, `no-stream` or an event number, got `{}`", s)),
        }
    }
}
