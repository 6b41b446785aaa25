//! In-memory stream index
//!
//! A projection of the log: per stream, its last event number, deletion
//! state, retention metadata and the position of every committed event;
//! per transaction, whether it is still pending or which event numbers its
//! commit assigned. It is rebuilt from a full forward scan on open and kept
//! current by the write path, which applies every record it appends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use strata_core::{
    CommitRecord, EventNumber, ExpectedVersion, LogPosition, LogRecord, PrepareRecord,
    RecordedLog, StreamMetadata, TransactionId, is_metadata_stream, original_stream_of,
};
use tracing::{debug, info, instrument, warn};

use crate::chunk_manager::ChunkManager;
use crate::error::StorageError;

/// Location of one committed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEntry {
    pub position: LogPosition,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Default)]
struct StreamInfo {
    last_event_number: Option<EventNumber>,
    deleted: bool,
    metadata: StreamMetadata,
    events: BTreeMap<EventNumber, EventEntry>,
}

impl StreamInfo {
    fn new(stream: &str) -> Self {
        let metadata = if is_metadata_stream(stream) {
            StreamMetadata::for_metadata_stream()
        } else {
            StreamMetadata::default()
        };
        Self {
            metadata,
            ..Default::default()
        }
    }
}

/// A data prepare waiting for its commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedEvent {
    pub transaction_offset: u32,
    pub position: LogPosition,
    pub timestamp_millis: i64,
}

/// A transaction with prepares but no commit yet
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub first_position: LogPosition,
    pub began_millis: i64,
    /// First prepare seen carried the begin flag
    pub has_begin: bool,
    pub is_delete: bool,
    pub prepares: Vec<PreparedEvent>,
    /// Every prepare of the transaction, markers included
    pub prepare_positions: Vec<LogPosition>,
    /// Payload of the latest data prepare of a metadata stream
    metadata_payload: Option<Bytes>,
}

impl PendingTransaction {
    /// Offset the next data prepare of this transaction takes
    pub fn next_offset(&self) -> u32 {
        self.prepares
            .last()
            .map(|p| p.transaction_offset + 1)
            .unwrap_or(0)
    }
}

/// What a commit made visible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub stream: String,
    pub commit_position: LogPosition,
    pub transaction_position: LogPosition,
    pub first_event_number: EventNumber,
    pub event_count: u32,
    pub is_tombstone: bool,
    pub prepare_positions: Vec<LogPosition>,
}

impl CommitInfo {
    /// Event number of the transaction's last event, if it has any
    pub fn last_event_number(&self) -> Option<EventNumber> {
        if self.is_tombstone || self.event_count == 0 {
            None
        } else {
            Some(self.first_event_number + self.event_count as u64 - 1)
        }
    }

    pub fn event_number_of(&self, transaction_offset: u32) -> EventNumber {
        self.first_event_number + transaction_offset as u64
    }
}

#[derive(Debug, Default)]
struct TransactionTable {
    pending: HashMap<TransactionId, PendingTransaction>,
    committed: HashMap<TransactionId, CommitInfo>,
    abandoned: HashSet<TransactionId>,
}

/// Stream and transaction state derived from the log
#[derive(Debug)]
pub struct StreamIndex {
    streams: DashMap<String, StreamInfo>,
    transactions: Mutex<TransactionTable>,
    next_transaction_id: AtomicU64,
}

impl Default for StreamIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIndex {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            transactions: Mutex::new(TransactionTable::default()),
            next_transaction_id: AtomicU64::new(1),
        }
    }

    /// Discard everything and replay the whole log
    #[instrument(skip_all)]
    pub fn rebuild(&self, log: &ChunkManager) -> Result<(), StorageError> {
        self.streams.clear();
        *self.transactions.lock() = TransactionTable::default();
        self.next_transaction_id.store(1, Ordering::Release);

        let mut records = 0u64;
        for recorded in log.read_forward(LogPosition::ZERO) {
            self.apply(&recorded?);
            records += 1;
        }

        let pending = self.transactions.lock().pending.len();
        info!(
            records,
            streams = self.streams.len(),
            pending_transactions = pending,
            "Rebuilt stream index"
        );
        Ok(())
    }

    /// Apply one record in log order
    pub fn apply(&self, recorded: &RecordedLog) {
        match &recorded.record {
            LogRecord::Prepare(prepare) => self.on_prepare(recorded.position, prepare),
            LogRecord::Commit(commit) => {
                self.on_commit(recorded.position, commit);
            }
            LogRecord::System(_) => {}
        }
    }

    /// Allocate a fresh transaction id
    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.next_transaction_id.fetch_add(1, Ordering::AcqRel))
    }

    pub fn on_prepare(&self, position: LogPosition, prepare: &PrepareRecord) {
        let id = prepare.transaction_id;
        self.next_transaction_id
            .fetch_max(id.0 + 1, Ordering::AcqRel);

        let mut txs = self.transactions.lock();
        if txs.abandoned.contains(&id) || txs.committed.contains_key(&id) {
            debug!(transaction = %id, %position, "Ignoring prepare of closed transaction");
            return;
        }

        let pending = txs
            .pending
            .entry(id)
            .or_insert_with(|| PendingTransaction {
                stream: prepare.stream.clone(),
                expected_version: prepare.expected_version,
                first_position: position,
                began_millis: prepare.timestamp_millis,
                has_begin: prepare.is_transaction_begin(),
                is_delete: false,
                prepares: Vec::new(),
                prepare_positions: Vec::new(),
                metadata_payload: None,
            });
        pending.prepare_positions.push(position);

        if prepare.is_delete() {
            pending.is_delete = true;
        }
        if prepare.has_data() {
            pending.prepares.push(PreparedEvent {
                transaction_offset: prepare.transaction_offset,
                position,
                timestamp_millis: prepare.timestamp_millis,
            });
            if is_metadata_stream(&prepare.stream) {
                pending.metadata_payload = Some(prepare.data.clone());
            }
        }
    }

    /// Make a pending transaction's events visible.
    ///
    /// Returns `None` for a commit with no pending transaction, which a
    /// scavenged log can contain when its prepares were already removed.
    pub fn on_commit(&self, position: LogPosition, commit: &CommitRecord) -> Option<CommitInfo> {
        let id = commit.transaction_id;
        let (pending, info) = {
            let mut txs = self.transactions.lock();
            let Some(pending) = txs.pending.remove(&id) else {
                debug!(transaction = %id, %position, "Commit without pending transaction");
                return None;
            };
            let info = CommitInfo {
                stream: pending.stream.clone(),
                commit_position: position,
                transaction_position: commit.transaction_position,
                first_event_number: commit.first_event_number,
                event_count: pending.next_offset(),
                is_tombstone: commit.is_tombstone(),
                prepare_positions: pending.prepare_positions.clone(),
            };
            txs.committed.insert(id, info.clone());
            (pending, info)
        };

        {
            let mut stream = self
                .streams
                .entry(pending.stream.clone())
                .or_insert_with(|| StreamInfo::new(&pending.stream));
            if info.is_tombstone {
                stream.deleted = true;
            } else {
                for prepared in &pending.prepares {
                    let number = info.event_number_of(prepared.transaction_offset);
                    stream.events.insert(
                        number,
                        EventEntry {
                            position: prepared.position,
                            timestamp_millis: prepared.timestamp_millis,
                        },
                    );
                    if stream.last_event_number.is_none_or(|last| number > last) {
                        stream.last_event_number = Some(number);
                    }
                }
            }
        }

        if let (Some(original), Some(payload)) = (
            original_stream_of(&pending.stream),
            pending.metadata_payload.as_ref(),
        ) {
            // The newest metadata event is the policy, readable or not.
            let metadata = StreamMetadata::from_json(payload).unwrap_or_else(|e| {
                warn!(stream = %original, error = %e, "Invalid stream metadata, clearing policy");
                StreamMetadata::default()
            });
            self.streams
                .entry(original.to_string())
                .or_insert_with(|| StreamInfo::new(original))
                .metadata = metadata;
            debug!(stream = %original, ?metadata, "Updated stream metadata");
        }

        Some(info)
    }

    pub fn last_event_number(&self, stream: &str) -> Option<EventNumber> {
        self.streams.get(stream).and_then(|s| s.last_event_number)
    }

    pub fn is_deleted(&self, stream: &str) -> bool {
        self.streams.get(stream).is_some_and(|s| s.deleted)
    }

    /// Whether the stream has ever had an event or a tombstone
    pub fn stream_exists(&self, stream: &str) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|s| s.deleted || s.last_event_number.is_some())
    }

    pub fn metadata(&self, stream: &str) -> StreamMetadata {
        match self.streams.get(stream) {
            Some(info) => info.metadata,
            None => StreamInfo::new(stream).metadata,
        }
    }

    pub fn event_position(&self, stream: &str, event_number: EventNumber) -> Option<EventEntry> {
        self.streams
            .get(stream)
            .and_then(|s| s.events.get(&event_number).copied())
    }

    /// Indexed events of a stream within a range of event numbers
    pub fn events_in(
        &self,
        stream: &str,
        range: RangeInclusive<EventNumber>,
    ) -> Vec<(EventNumber, EventEntry)> {
        self.streams
            .get(stream)
            .map(|s| s.events.range(range).map(|(n, e)| (*n, *e)).collect())
            .unwrap_or_default()
    }

    pub fn pending_transaction(&self, id: TransactionId) -> Option<PendingTransaction> {
        self.transactions.lock().pending.get(&id).cloned()
    }

    /// Ids and begin times of all pending transactions
    pub fn pending_transactions(&self) -> Vec<(TransactionId, i64)> {
        self.transactions
            .lock()
            .pending
            .iter()
            .map(|(id, p)| (*id, p.began_millis))
            .collect()
    }

    pub fn commit_info(&self, id: TransactionId) -> Option<CommitInfo> {
        self.transactions.lock().committed.get(&id).cloned()
    }

    pub fn is_abandoned(&self, id: TransactionId) -> bool {
        self.transactions.lock().abandoned.contains(&id)
    }

    /// Close a pending transaction for good; a later commit is invalid
    pub fn mark_abandoned(&self, id: TransactionId) -> Option<PendingTransaction> {
        let mut txs = self.transactions.lock();
        let pending = txs.pending.remove(&id);
        txs.abandoned.insert(id);
        if let Some(pending) = &pending {
            info!(transaction = %id, stream = %pending.stream, "Abandoned transaction");
        }
        pending
    }

    /// Drop the position of a scavenged event
    pub fn forget_event(&self, stream: &str, event_number: EventNumber) {
        if let Some(mut info) = self.streams.get_mut(stream) {
            info.events.remove(&event_number);
        }
    }

    /// Drop a transaction whose commit was scavenged
    pub fn forget_transaction(&self, id: TransactionId) {
        self.transactions.lock().committed.remove(&id);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
