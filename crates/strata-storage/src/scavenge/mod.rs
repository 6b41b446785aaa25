//! Scavenging
//!
//! Rewrites sealed chunks without the records retention no longer needs.
//! Each chunk is one unit of work: its survivors go into a replacement file
//! that is swapped in atomically, so a pass can fail or be cancelled
//! between chunks without any partial effect.
//!
//! Retention rules, in order:
//! - system records are kept
//! - delete tombstones (prepare and commit) are kept
//! - prepares of uncommitted transactions are kept, unless the transaction
//!   is older than the configured abandonment age
//! - events of deleted streams are discarded
//! - the last event of a live stream is kept
//! - other events are kept iff the stream's metadata retains them
//! - a commit, and the non-data markers of its transaction, are kept iff
//!   the transaction's last event is kept
//! - a commit is kept while any prepare of its transaction is still in the
//!   log; a commit whose prepares are all gone is discarded

mod lease;
mod task;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_core::{Clock, EventNumber, LogPosition, LogRecord, RecordedLog};
use tracing::{debug, error, info, instrument};

use crate::chunk::{Chunk, ScavengedChunkBuilder};
use crate::chunk_manager::ChunkManager;
use crate::config::ScavengeConfig;
use crate::error::StorageError;
use crate::stream_index::{CommitInfo, StreamIndex};

pub use lease::{LeaseGuard, LeaseTable};
pub use task::ScavengeTask;

/// Summary of one scavenge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeResult {
    /// Sealed chunks looked at
    pub chunks_scanned: usize,
    /// Chunks replaced by a smaller version
    pub chunks_rewritten: usize,
    /// Chunks left alone: nothing to discard, or leased by another pass
    pub chunks_skipped: usize,
    pub records_kept: u64,
    pub records_discarded: u64,
    pub bytes_freed: u64,
    /// Chunks whose rewrite failed; retried on the next pass
    pub failed_chunks: Vec<u32>,
}

enum ChunkOutcome {
    Unchanged {
        kept: u64,
    },
    Rewritten {
        kept: u64,
        discarded: u64,
        bytes_freed: u64,
    },
}

/// Runs scavenge passes over the sealed part of the log
pub struct Scavenger {
    log: Arc<ChunkManager>,
    index: Arc<StreamIndex>,
    clock: Arc<dyn Clock>,
    config: ScavengeConfig,
    leases: Arc<LeaseTable>,
    /// Shared with the write path; held only while abandoning transactions
    write_lock: Arc<Mutex<()>>,
}

impl Scavenger {
    pub fn new(
        log: Arc<ChunkManager>,
        index: Arc<StreamIndex>,
        clock: Arc<dyn Clock>,
        config: ScavengeConfig,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            log,
            index,
            clock,
            config,
            leases: LeaseTable::new(),
            write_lock,
        }
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Run one pass over every sealed chunk behind the writer checkpoint.
    ///
    /// `cancel` is checked between chunks; a cancelled pass returns
    /// [`StorageError::Cancelled`] with every completed swap retained.
    #[instrument(skip_all)]
    pub fn scavenge(&self, cancel: &AtomicBool) -> Result<ScavengeResult, StorageError> {
        let started = Instant::now();
        let now = self.clock.now_millis();
        self.abandon_stale_transactions(now);

        let mut result = ScavengeResult::default();
        for chunk in self.log.sealed_chunks_behind_checkpoint() {
            if cancel.load(Ordering::Acquire) {
                info!(
                    chunks_scanned = result.chunks_scanned,
                    chunks_rewritten = result.chunks_rewritten,
                    "Scavenge cancelled"
                );
                return Err(StorageError::Cancelled);
            }

            result.chunks_scanned += 1;
            match self.scavenge_chunk(&chunk, now) {
                Ok(ChunkOutcome::Unchanged { kept }) => {
                    result.chunks_skipped += 1;
                    result.records_kept += kept;
                }
                Ok(ChunkOutcome::Rewritten {
                    kept,
                    discarded,
                    bytes_freed,
                }) => {
                    result.chunks_rewritten += 1;
                    result.records_kept += kept;
                    result.records_discarded += discarded;
                    result.bytes_freed += bytes_freed;
                }
                Err(StorageError::ScavengeInProgress(number)) => {
                    debug!(chunk = number, "Chunk leased by another pass");
                    result.chunks_skipped += 1;
                }
                Err(e) => {
                    error!(chunk = chunk.number(), error = %e, "Scavenge of chunk failed");
                    result.failed_chunks.push(chunk.number());
                }
            }
        }

        info!(
            chunks_scanned = result.chunks_scanned,
            chunks_rewritten = result.chunks_rewritten,
            chunks_skipped = result.chunks_skipped,
            records_kept = result.records_kept,
            records_discarded = result.records_discarded,
            bytes_freed = result.bytes_freed,
            failed = result.failed_chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scavenge pass complete"
        );
        Ok(result)
    }

    fn abandon_stale_transactions(&self, now: i64) {
        let Some(age) = self.config.abandoned_transaction_age() else {
            return;
        };
        let cutoff = now.saturating_sub(age.as_millis() as i64);

        // Serialise with commit_transaction so a commit never races the
        // removal of its pending entry.
        let _writer = self.write_lock.lock();
        for (id, began) in self.index.pending_transactions() {
            if began < cutoff {
                self.index.mark_abandoned(id);
            }
        }
    }

    fn scavenge_chunk(&self, chunk: &Arc<Chunk>, now: i64) -> Result<ChunkOutcome, StorageError> {
        let _lease = self.leases.try_acquire(chunk.number())?;

        // The chunk may have been replaced since the list was taken.
        let chunk = match self.log.chunk(chunk.number()) {
            Some(current) if current.file_version() == chunk.file_version() => current,
            _ => {
                return Ok(ChunkOutcome::Unchanged { kept: 0 });
            }
        };

        let mut decisions = Vec::new();
        for recorded in chunk.records() {
            let recorded = recorded?;
            let keep = self.retains(&recorded, now);
            decisions.push((recorded, keep));
        }
        self.hold_open_commits(&chunk, &mut decisions);
        let discarded = decisions.iter().filter(|(_, keep)| !keep).count() as u64;
        let kept = decisions.len() as u64 - discarded;

        if discarded == 0 {
            debug!(chunk = chunk.number(), records = kept, "Nothing to scavenge");
            return Ok(ChunkOutcome::Unchanged { kept });
        }

        let dir = &self.log.config().data_dir;
        let mut builder = ScavengedChunkBuilder::new(dir, &chunk, chunk.file_version() + 1)?;
        for (recorded, keep) in &decisions {
            if *keep {
                builder.write(recorded)?;
            }
        }
        let replacement = builder.complete()?;

        if self.config.verify_replacement {
            if let Err(e) = replacement.verify_hash() {
                replacement.mark_for_deletion();
                return Err(e);
            }
        }

        let old_len = chunk.footer().map(|f| f.expected_file_len()).unwrap_or(0);
        let new_len = replacement
            .footer()
            .map(|f| f.expected_file_len())
            .unwrap_or(0);

        self.log.replace_chunk(replacement)?;
        self.forget_discarded(&decisions);

        debug!(
            chunk = chunk.number(),
            kept,
            discarded,
            bytes_freed = old_len.saturating_sub(new_len),
            "Rewrote chunk"
        );
        Ok(ChunkOutcome::Rewritten {
            kept,
            discarded,
            bytes_freed: old_len.saturating_sub(new_len),
        })
    }

    /// Retention decision for one record
    fn retains(&self, recorded: &RecordedLog, now: i64) -> bool {
        match &recorded.record {
            LogRecord::System(_) => true,
            LogRecord::Prepare(prepare) => {
                if prepare.is_delete() {
                    return true;
                }
                if self.index.is_abandoned(prepare.transaction_id) {
                    return false;
                }
                match self.index.commit_info(prepare.transaction_id) {
                    // Uncommitted: a later commit still needs it.
                    None => true,
                    Some(info) if info.is_tombstone => true,
                    Some(info) if prepare.has_data() => self.event_retained(
                        &info.stream,
                        info.event_number_of(prepare.transaction_offset),
                        prepare.timestamp_millis,
                        now,
                    ),
                    Some(info) => self.transaction_retained(&info, now),
                }
            }
            LogRecord::Commit(commit) => {
                if commit.is_tombstone() {
                    return true;
                }
                match self.index.commit_info(commit.transaction_id) {
                    Some(info) => self.transaction_retained(&info, now),
                    // No prepare of it is left in the log.
                    None => {
                        debug!(
                            transaction = %commit.transaction_id,
                            position = %recorded.position,
                            "Discarding commit without prepares"
                        );
                        false
                    }
                }
            }
        }
    }

    /// Keep discardable commits whose transaction still has a prepare in
    /// the log, such as one in a chunk another pass holds. Without its
    /// commit that prepare would read back as an open transaction.
    fn hold_open_commits(&self, chunk: &Chunk, decisions: &mut [(RecordedLog, bool)]) {
        let discarded: HashSet<LogPosition> = decisions
            .iter()
            .filter(|(_, keep)| !keep)
            .map(|(recorded, _)| recorded.position)
            .collect();

        for (recorded, keep) in decisions.iter_mut() {
            let LogRecord::Commit(commit) = &recorded.record else {
                continue;
            };
            if *keep {
                continue;
            }
            let Some(info) = self.index.commit_info(commit.transaction_id) else {
                continue;
            };
            let live = info
                .prepare_positions
                .iter()
                .find(|p| !discarded.contains(*p) && self.still_in_log(chunk, **p));
            if let Some(prepare) = live {
                debug!(
                    transaction = %commit.transaction_id,
                    %prepare,
                    "Keeping commit of a prepare still in the log"
                );
                *keep = true;
            }
        }
    }

    fn still_in_log(&self, chunk: &Chunk, position: LogPosition) -> bool {
        if chunk.header().contains(position) {
            return true;
        }
        !matches!(
            self.log.read(position),
            Err(StorageError::PositionOutOfRange(_))
        )
    }

    fn transaction_retained(&self, info: &CommitInfo, now: i64) -> bool {
        // Tombstones and empty transactions carry no event to judge by.
        let Some(last) = info.last_event_number() else {
            return true;
        };
        match self.index.event_position(&info.stream, last) {
            Some(entry) => self.event_retained(&info.stream, last, entry.timestamp_millis, now),
            // Already scavenged.
            None => false,
        }
    }

    fn event_retained(
        &self,
        stream: &str,
        event_number: EventNumber,
        timestamp_millis: i64,
        now: i64,
    ) -> bool {
        if self.index.is_deleted(stream) {
            return false;
        }
        let Some(last) = self.index.last_event_number(stream) else {
            return true;
        };
        if event_number >= last {
            return true;
        }
        self.index
            .metadata(stream)
            .retains(event_number, last, timestamp_millis, now)
    }

    fn forget_discarded(&self, decisions: &[(RecordedLog, bool)]) {
        for (recorded, _) in decisions.iter().filter(|(_, keep)| !keep) {
            match &recorded.record {
                LogRecord::Prepare(prepare) if prepare.has_data() => {
                    if let Some(info) = self.index.commit_info(prepare.transaction_id) {
                        self.index.forget_event(
                            &info.stream,
                            info.event_number_of(prepare.transaction_offset),
                        );
                    }
                }
                LogRecord::Commit(commit) => self.index.forget_transaction(commit.transaction_id),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use bytes::Bytes;
    use strata_core::{
        CommitRecord, ExpectedVersion, PrepareFlags, PrepareRecord, SystemClock,
        TOMBSTONE_EVENT_NUMBER, TransactionId,
    };
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        _dir: TempDir,
        log: Arc<ChunkManager>,
        index: Arc<StreamIndex>,
        scavenger: Scavenger,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(
            ChunkManager::open(DbConfig::with_data_dir(dir.path()).with_chunk_size(4096)).unwrap(),
        );
        let index = Arc::new(StreamIndex::new());
        let scavenger = Scavenger::new(
            log.clone(),
            index.clone(),
            Arc::new(SystemClock),
            ScavengeConfig::default(),
            Arc::new(Mutex::new(())),
        );
        Fixture {
            _dir: dir,
            log,
            index,
            scavenger,
        }
    }

    fn write(f: &Fixture, record: LogRecord) -> LogPosition {
        let position = f.log.append(&record).unwrap();
        f.log.flush().unwrap();
        f.index.apply(&RecordedLog::new(position, record));
        position
    }

    fn prepare(tx: u64, offset: u32, flags: PrepareFlags) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            transaction_id: TransactionId(tx),
            transaction_offset: offset,
            stream: "bla".into(),
            expected_version: ExpectedVersion::Any,
            event_id: Uuid::new_v4(),
            event_type: "test".into(),
            data: Bytes::from_static(b"payload"),
            metadata: Bytes::new(),
            flags,
            timestamp_millis: 0,
        })
    }

    fn commit(tx: u64, position: LogPosition, first: EventNumber) -> LogRecord {
        LogRecord::Commit(CommitRecord {
            transaction_id: TransactionId(tx),
            transaction_position: position,
            first_event_number: first,
            timestamp_millis: 0,
        })
    }

    #[test]
    fn test_uncommitted_prepares_survive() {
        let f = fixture();
        write(&f, prepare(1, 0, PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN));
        f.log.complete_chunk().unwrap();

        let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
        assert_eq!(result.chunks_rewritten, 0);
        assert_eq!(result.records_kept, 1);
        assert!(f.index.pending_transaction(TransactionId(1)).is_some());
    }

    #[test]
    fn test_last_event_survives_without_metadata() {
        let f = fixture();
        let both = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END;
        let p = write(&f, prepare(1, 0, both));
        write(&f, commit(1, p, 0));
        f.log.complete_chunk().unwrap();

        let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
        assert_eq!(result.records_discarded, 0);
        assert_eq!(result.records_kept, 2);
    }

    #[test]
    fn test_cancelled_pass_changes_nothing() {
        let f = fixture();
        write(&f, prepare(1, 0, PrepareFlags::DATA));
        f.log.complete_chunk().unwrap();

        let result = f.scavenger.scavenge(&AtomicBool::new(true));
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(f.log.chunk(0).unwrap().file_version(), 0);
    }

    #[test]
    fn test_leased_chunk_is_skipped() {
        let f = fixture();
        write(&f, prepare(1, 0, PrepareFlags::DATA));
        f.log.complete_chunk().unwrap();

        let _held = f.scavenger.leases().try_acquire(0).unwrap();
        let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
        assert_eq!(result.chunks_scanned, 1);
        assert_eq!(result.chunks_skipped, 1);
        assert!(result.failed_chunks.is_empty());
    }

    /// Chunk 0 holds a prepare of "bla"; chunk 1 holds its commit and the
    /// stream's tombstone. The commit must outlive the prepare.
    #[test]
    fn test_commit_waits_for_prepare_in_leased_chunk() {
        let f = fixture();
        let both = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END;
        let p = write(&f, prepare(1, 0, both));
        f.log.complete_chunk().unwrap();

        write(&f, commit(1, p, 0));
        let delete = PrepareFlags::IS_DELETE | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END;
        let t = write(&f, prepare(2, 0, delete));
        write(&f, commit(2, t, TOMBSTONE_EVENT_NUMBER));
        f.log.complete_chunk().unwrap();
        assert!(f.index.is_deleted("bla"));

        {
            let _held = f.scavenger.leases().try_acquire(0).unwrap();
            let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
            assert_eq!(result.chunks_rewritten, 0);
            assert_eq!(result.records_discarded, 0);
            assert!(f.index.commit_info(TransactionId(1)).is_some());
        }

        let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
        assert_eq!(result.chunks_rewritten, 2);
        assert_eq!(result.records_discarded, 2);
        assert!(f.index.commit_info(TransactionId(1)).is_none());

        let rebuilt = StreamIndex::new();
        rebuilt.rebuild(&f.log).unwrap();
        assert!(rebuilt.pending_transactions().is_empty());
        assert!(rebuilt.is_deleted("bla"));

        let remaining: Vec<_> = f
            .log
            .read_forward(LogPosition::ZERO)
            .map(|r| r.unwrap().position)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0], t);
    }

    #[test]
    fn test_active_chunk_never_touched() {
        let f = fixture();
        let both = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END;
        let p = write(&f, prepare(1, 0, both));
        write(&f, commit(1, p, 0));

        let result = f.scavenger.scavenge(&AtomicBool::new(false)).unwrap();
        assert_eq!(result.chunks_scanned, 0);
    }
}
