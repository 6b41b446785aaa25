//! Stream-level interface over the log
//!
//! [`Database`] is what the operation layer talks to. Every mutating
//! operation runs under one write lock, writes its prepares and commit,
//! flushes once and only then updates the [`StreamIndex`]. A commit is
//! therefore never visible before all of its prepares are durable.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_core::{
    Clock, CommitRecord, EventNumber, ExpectedVersion, LogPosition, LogRecord, PrepareFlags,
    PrepareRecord, RecordedLog, StreamMetadata, SystemClock, SystemRecord, SystemRecordKind,
    TOMBSTONE_EVENT_NUMBER, TransactionId, metadata_stream_of,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chunk_manager::ChunkManager;
use crate::config::DbConfig;
use crate::error::{StorageError, WriteError, WriteResult};
use crate::scavenge::{ScavengeResult, ScavengeTask, Scavenger};
use crate::stream_index::{EventEntry, StreamIndex};

pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";
pub const METADATA_EVENT_TYPE: &str = "$metadata";
const TRANSACTION_BEGIN_EVENT_TYPE: &str = "$transactionBegin";
const TRANSACTION_END_EVENT_TYPE: &str = "$transactionEnd";

/// An event to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

/// A committed event as returned by reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream: String,
    pub event_number: EventNumber,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub position: LogPosition,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// One page of a stream read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub events: Vec<RecordedEvent>,
    /// Where the next page starts; `None` once a backward read reached the
    /// start of the stream
    pub next_event_number: Option<EventNumber>,
    pub last_event_number: EventNumber,
    pub is_end_of_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Position of the commit
    pub position: LogPosition,
    pub first_event_number: EventNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub position: LogPosition,
    pub first_event_number: EventNumber,
    /// `None` for a transaction without events
    pub last_event_number: Option<EventNumber>,
}

/// The storage engine
pub struct Database {
    config: DbConfig,
    log: Arc<ChunkManager>,
    index: Arc<StreamIndex>,
    scavenger: Arc<Scavenger>,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("log", &self.log)
            .field("streams", &self.index.stream_count())
            .finish()
    }
}

impl Database {
    /// Open the database with the system clock
    pub fn open(config: DbConfig) -> Result<Self, StorageError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open the database, recovering the log and rebuilding the index
    #[instrument(skip_all, fields(dir = %config.data_dir.display()))]
    pub fn open_with_clock(config: DbConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let log = Arc::new(ChunkManager::open(config.clone())?);
        let index = Arc::new(StreamIndex::new());
        index.rebuild(&log)?;

        let write_lock = Arc::new(Mutex::new(()));
        let scavenger = Arc::new(Scavenger::new(
            log.clone(),
            index.clone(),
            clock.clone(),
            config.scavenge.clone(),
            write_lock.clone(),
        ));

        info!(
            streams = index.stream_count(),
            writer_checkpoint = %log.writer_checkpoint(),
            "Database opened"
        );

        Ok(Self {
            config,
            log,
            index,
            scavenger,
            clock,
            write_lock,
        })
    }

    pub fn log(&self) -> &Arc<ChunkManager> {
        &self.log
    }

    pub fn index(&self) -> &Arc<StreamIndex> {
        &self.index
    }

    pub fn last_event_number(&self, stream: &str) -> Option<EventNumber> {
        self.index.last_event_number(stream)
    }

    pub fn stream_metadata(&self, stream: &str) -> StreamMetadata {
        self.index.metadata(stream)
    }

    /// Append events to a stream as one transaction
    #[instrument(skip(self, events), fields(stream = %stream, count = events.len()))]
    pub fn append(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> WriteResult<AppendResult> {
        let _writer = self.write_lock.lock();
        let last = self.check_writable(stream, expected_version)?;
        let first_event_number = last.map_or(0, |n| n + 1);

        if events.is_empty() {
            return Ok(AppendResult {
                position: self.log.writer_checkpoint(),
                first_event_number,
            });
        }

        let transaction_id = self.index.next_transaction_id();
        let now = self.clock.now_millis();
        let count = events.len();
        let mut prepares = Vec::with_capacity(count);

        for (offset, event) in events.into_iter().enumerate() {
            let mut flags = PrepareFlags::DATA;
            if offset == 0 {
                flags = flags | PrepareFlags::TRANSACTION_BEGIN;
            }
            if offset + 1 == count {
                flags = flags | PrepareFlags::TRANSACTION_END;
            }
            prepares.push(LogRecord::Prepare(PrepareRecord {
                transaction_id,
                transaction_offset: offset as u32,
                stream: stream.to_string(),
                expected_version,
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                flags,
                timestamp_millis: now,
            }));
        }

        let position = self.write_atomically(prepares, |first| {
            Some(LogRecord::Commit(CommitRecord {
                transaction_id,
                transaction_position: first,
                first_event_number,
                timestamp_millis: now,
            }))
        })?;

        debug!(%position, first_event_number, "Appended events");
        Ok(AppendResult {
            position,
            first_event_number,
        })
    }

    /// Read a page of committed events.
    ///
    /// Events the stream's metadata no longer retains are hidden whether
    /// or not they were scavenged yet.
    pub fn read_stream(
        &self,
        stream: &str,
        from: EventNumber,
        count: usize,
        direction: ReadDirection,
    ) -> WriteResult<StreamSlice> {
        if self.index.is_deleted(stream) {
            return Err(WriteError::StreamDeleted(stream.to_string()));
        }
        let Some(last) = self.index.last_event_number(stream) else {
            return Err(WriteError::StreamNotFound(stream.to_string()));
        };

        let metadata = self.index.metadata(stream);
        let now = self.clock.now_millis();
        let visible = |(n, entry): &(EventNumber, EventEntry)| {
            metadata.retains(*n, last, entry.timestamp_millis, now)
        };

        let candidates: Vec<(EventNumber, EventEntry)> = match direction {
            ReadDirection::Forward if from > last => Vec::new(),
            ReadDirection::Forward => self
                .index
                .events_in(stream, from..=last)
                .into_iter()
                .filter(visible)
                .collect(),
            ReadDirection::Backward => {
                let mut events = self.index.events_in(stream, 0..=from.min(last));
                events.reverse();
                events.into_iter().filter(visible).collect()
            }
        };

        let mut events = Vec::with_capacity(count.min(candidates.len()));
        let mut consumed = 0;
        for (event_number, entry) in &candidates {
            if events.len() == count {
                break;
            }
            consumed += 1;
            if let Some(event) = self.read_event(stream, *event_number, entry)? {
                events.push(event);
            }
        }
        let is_end_of_stream = consumed == candidates.len();

        let next_event_number = match direction {
            ReadDirection::Forward => Some(match events.last() {
                Some(event) if !is_end_of_stream => event.event_number + 1,
                _ => from.max(last + 1),
            }),
            ReadDirection::Backward if is_end_of_stream => None,
            ReadDirection::Backward => events.last().and_then(|e| e.event_number.checked_sub(1)),
        };

        Ok(StreamSlice {
            events,
            next_event_number,
            last_event_number: last,
            is_end_of_stream,
        })
    }

    fn read_event(
        &self,
        stream: &str,
        event_number: EventNumber,
        entry: &EventEntry,
    ) -> WriteResult<Option<RecordedEvent>> {
        let recorded = match self.log.read(entry.position) {
            Ok(recorded) => recorded,
            // Scavenged after the index lookup.
            Err(StorageError::PositionOutOfRange(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match recorded.record {
            LogRecord::Prepare(prepare) if prepare.stream == stream && prepare.has_data() => {
                Ok(Some(RecordedEvent {
                    stream: prepare.stream,
                    event_number,
                    event_id: prepare.event_id,
                    event_type: prepare.event_type,
                    data: prepare.data,
                    metadata: prepare.metadata,
                    position: recorded.position,
                    timestamp_millis: prepare.timestamp_millis,
                }))
            }
            other => Err(StorageError::not_found(format!(
                "event {}@{} at {} is a {}",
                event_number,
                stream,
                recorded.position,
                other.kind()
            ))
            .into()),
        }
    }

    /// Begin an explicit transaction on a stream
    pub fn start_transaction(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> WriteResult<TransactionId> {
        let _writer = self.write_lock.lock();
        if self.index.is_deleted(stream) {
            return Err(WriteError::StreamDeleted(stream.to_string()));
        }

        let transaction_id = self.index.next_transaction_id();
        let record = LogRecord::Prepare(PrepareRecord {
            transaction_id,
            transaction_offset: 0,
            stream: stream.to_string(),
            expected_version,
            event_id: Uuid::new_v4(),
            event_type: TRANSACTION_BEGIN_EVENT_TYPE.to_string(),
            data: Bytes::new(),
            metadata: Bytes::new(),
            flags: PrepareFlags::TRANSACTION_BEGIN,
            timestamp_millis: self.clock.now_millis(),
        });
        self.write_atomically(vec![record], |_| None)?;

        debug!(transaction = %transaction_id, stream = %stream, "Started transaction");
        Ok(transaction_id)
    }

    /// Add events to an open transaction
    pub fn transaction_write(
        &self,
        transaction_id: TransactionId,
        events: Vec<NewEvent>,
    ) -> WriteResult<()> {
        let _writer = self.write_lock.lock();
        let pending = self
            .index
            .pending_transaction(transaction_id)
            .filter(|p| p.has_begin && !p.is_delete)
            .ok_or(WriteError::InvalidTransaction(transaction_id))?;

        let now = self.clock.now_millis();
        let first_offset = pending.next_offset();
        let mut prepares = Vec::with_capacity(events.len());
        for (i, event) in events.into_iter().enumerate() {
            prepares.push(LogRecord::Prepare(PrepareRecord {
                transaction_id,
                transaction_offset: first_offset + i as u32,
                stream: pending.stream.clone(),
                expected_version: pending.expected_version,
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                flags: PrepareFlags::DATA,
                timestamp_millis: now,
            }));
        }
        self.write_atomically(prepares, |_| None)?;
        Ok(())
    }

    /// Commit an open transaction
    pub fn commit_transaction(&self, transaction_id: TransactionId) -> WriteResult<CommitResult> {
        let _writer = self.write_lock.lock();
        let pending = self
            .index
            .pending_transaction(transaction_id)
            .filter(|p| p.has_begin && !p.is_delete)
            .ok_or(WriteError::InvalidTransaction(transaction_id))?;

        let last = self.check_writable(&pending.stream, pending.expected_version)?;
        let first_event_number = last.map_or(0, |n| n + 1);
        let now = self.clock.now_millis();

        let end = LogRecord::Prepare(PrepareRecord {
            transaction_id,
            transaction_offset: pending.next_offset(),
            stream: pending.stream.clone(),
            expected_version: pending.expected_version,
            event_id: Uuid::new_v4(),
            event_type: TRANSACTION_END_EVENT_TYPE.to_string(),
            data: Bytes::new(),
            metadata: Bytes::new(),
            flags: PrepareFlags::TRANSACTION_END,
            timestamp_millis: now,
        });
        let commit = LogRecord::Commit(CommitRecord {
            transaction_id,
            transaction_position: pending.first_position,
            first_event_number,
            timestamp_millis: now,
        });
        let position = self.write_atomically(vec![end], |_| Some(commit))?;

        let last_event_number = self
            .index
            .commit_info(transaction_id)
            .and_then(|info| info.last_event_number());
        debug!(transaction = %transaction_id, %position, "Committed transaction");
        Ok(CommitResult {
            position,
            first_event_number,
            last_event_number,
        })
    }

    /// Write a delete tombstone for a stream
    #[instrument(skip(self), fields(stream = %stream))]
    pub fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> WriteResult<LogPosition> {
        let _writer = self.write_lock.lock();
        self.check_writable(stream, expected_version)?;

        let transaction_id = self.index.next_transaction_id();
        let now = self.clock.now_millis();
        let tombstone = LogRecord::Prepare(PrepareRecord {
            transaction_id,
            transaction_offset: 0,
            stream: stream.to_string(),
            expected_version,
            event_id: Uuid::new_v4(),
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            data: Bytes::new(),
            metadata: Bytes::new(),
            flags: PrepareFlags::IS_DELETE
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
            timestamp_millis: now,
        });
        let position = self.write_atomically(vec![tombstone], |first| {
            Some(LogRecord::Commit(CommitRecord {
                transaction_id,
                transaction_position: first,
                first_event_number: TOMBSTONE_EVENT_NUMBER,
                timestamp_millis: now,
            }))
        })?;

        info!(%position, "Deleted stream");
        Ok(position)
    }

    /// Replace a stream's retention metadata.
    ///
    /// `expected_version` applies to the metadata stream.
    pub fn set_stream_metadata(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> WriteResult<AppendResult> {
        let payload = metadata
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.append(
            &metadata_stream_of(stream),
            expected_version,
            vec![NewEvent::new(METADATA_EVENT_TYPE, payload)],
        )
    }

    /// Write an epoch record
    pub fn write_epoch(&self, epoch_number: u64) -> WriteResult<LogPosition> {
        let _writer = self.write_lock.lock();
        let record = LogRecord::System(SystemRecord {
            kind: SystemRecordKind::Epoch {
                epoch_number,
                epoch_id: Uuid::new_v4(),
            },
            timestamp_millis: self.clock.now_millis(),
            data: Bytes::new(),
        });
        let position = self.write_atomically(vec![record], |_| None)?;
        info!(epoch_number, %position, "Wrote epoch");
        Ok(position)
    }

    /// Run one scavenge pass in the calling thread
    pub fn scavenge(&self, cancel: &AtomicBool) -> Result<ScavengeResult, StorageError> {
        self.scavenger.scavenge(cancel)
    }

    /// Start periodic scavenging on the current tokio runtime
    pub fn spawn_scavenger(&self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        ScavengeTask::spawn(
            self.scavenger.clone(),
            self.config.scavenge.interval(),
            shutdown_rx,
        )
    }

    /// Up to `max` records of the global log starting at `from`
    pub fn read_all_forward(
        &self,
        from: LogPosition,
        max: usize,
    ) -> Result<Vec<RecordedLog>, StorageError> {
        self.log.read_forward(from).take(max).collect()
    }

    /// Discard the index and rebuild it from the log
    pub fn rebuild_index(&self) -> Result<(), StorageError> {
        let _writer = self.write_lock.lock();
        self.index.rebuild(&self.log)
    }

    pub fn close(&self) -> Result<(), StorageError> {
        let _writer = self.write_lock.lock();
        self.log.close()
    }

    fn check_writable(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> WriteResult<Option<EventNumber>> {
        if self.index.is_deleted(stream) {
            return Err(WriteError::StreamDeleted(stream.to_string()));
        }
        let last = self.index.last_event_number(stream);
        if !expected_version.matches(last) {
            return Err(WriteError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected: expected_version,
                actual: last,
            });
        }
        Ok(last)
    }

    /// Write `records`, then the commit `close` builds from the first
    /// record's position, and flush. Nothing reaches the index unless all
    /// of it is durable; on failure the log is cut back to where it stood.
    ///
    /// Returns the position of the last record written.
    fn write_atomically(
        &self,
        records: Vec<LogRecord>,
        close: impl FnOnce(LogPosition) -> Option<LogRecord>,
    ) -> Result<LogPosition, StorageError> {
        let bodies = records
            .iter()
            .map(|record| self.log.encode(record))
            .collect::<Result<Vec<_>, _>>()?;

        let mark = self.log.write_mark();
        let mut written = Vec::with_capacity(records.len() + 1);
        if let Err(e) = self.append_all(records, &bodies, close, &mut written) {
            warn!(error = %e, written = written.len(), "Write failed, rolling back");
            if let Err(rollback) = self.log.rollback(mark) {
                error!(error = %rollback, "Failed to roll back partial write");
            }
            return Err(e);
        }

        for recorded in &written {
            self.index.apply(recorded);
        }
        Ok(written.last().map_or(mark.position(), |r| r.position))
    }

    fn append_all(
        &self,
        records: Vec<LogRecord>,
        bodies: &[Vec<u8>],
        close: impl FnOnce(LogPosition) -> Option<LogRecord>,
        written: &mut Vec<RecordedLog>,
    ) -> Result<(), StorageError> {
        for (record, body) in records.into_iter().zip(bodies) {
            let position = self.log.append_encoded(body)?;
            written.push(RecordedLog::new(position, record));
        }
        if let Some(commit) = written.first().and_then(|first| close(first.position)) {
            let position = self.log.append(&commit)?;
            written.push(RecordedLog::new(position, commit));
        }
        self.log.flush()?;
        Ok(())
    }
}
