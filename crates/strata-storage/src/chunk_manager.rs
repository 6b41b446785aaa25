//! The transaction log: an ordered set of chunks plus checkpoints
//!
//! The [`ChunkManager`] owns the chunk-number → chunk mapping, the single
//! writer and the two checkpoints. Positions are global: chunk `n` covers
//! `[n * chunk_size, (n + 1) * chunk_size)` whatever the size of its file.
//!
//! Ordering discipline:
//! - append writes to the active chunk; nothing is visible yet
//! - flush fsyncs the chunk, persists the writer checkpoint, then publishes it
//! - roll seals the active chunk, creates the next one and moves the
//!   checkpoint to its start
//! - a scavenge swap replaces one sealed chunk under the mapping lock

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_core::{LogPosition, LogRecord, RecordedLog};
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{CHASER_CHECKPOINT_FILE, Checkpoint, WRITER_CHECKPOINT_FILE};
use crate::chunk::format::{ChunkHeader, FRAME_OVERHEAD, HEADER_SIZE};
use crate::chunk::{Chunk, SCAVENGE_TMP_SUFFIX, parse_chunk_file_name};
use crate::config::DbConfig;
use crate::error::StorageError;

/// Writer position saved before a multi-record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMark {
    chunk: u32,
    offset: u32,
    position: LogPosition,
}

impl WriteMark {
    pub fn position(&self) -> LogPosition {
        self.position
    }
}

struct WriterState {
    active: Arc<Chunk>,
}

/// Owner of all chunk files of one database directory
pub struct ChunkManager {
    config: DbConfig,
    chunks: RwLock<BTreeMap<u32, Arc<Chunk>>>,
    writer: Mutex<WriterState>,
    writer_checkpoint: Checkpoint,
    chaser_checkpoint: Checkpoint,
}

impl std::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkManager")
            .field("data_dir", &self.config.data_dir)
            .field("chunks", &self.chunks.read().len())
            .field("writer_checkpoint", &self.writer_checkpoint.read())
            .finish()
    }
}

impl ChunkManager {
    /// Open (or create) the log in `config.data_dir`, running recovery
    #[instrument(skip_all, fields(dir = %config.data_dir.display()))]
    pub fn open(config: DbConfig) -> Result<Self, StorageError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let writer_checkpoint = Checkpoint::open(config.data_dir.join(WRITER_CHECKPOINT_FILE))?;
        let chaser_checkpoint = Checkpoint::open(config.data_dir.join(CHASER_CHECKPOINT_FILE))?;

        let files = discover_chunk_files(&config)?;
        let mut chunks = BTreeMap::new();
        let last_number = files.keys().next_back().copied();

        for (number, (version, path)) in files {
            let chunk = Chunk::open(
                &path,
                version,
                config.verify_chunks_on_open,
                config.sync_on_flush,
            )?;
            if chunk.number() != number {
                return Err(StorageError::corrupt_chunk(
                    number,
                    format!("file {} holds chunk {}", path.display(), chunk.number()),
                ));
            }
            if chunk.header().chunk_size != config.chunk_size {
                return Err(StorageError::config(format!(
                    "chunk {} was written with chunk_size {}, configured {}",
                    number,
                    chunk.header().chunk_size,
                    config.chunk_size
                )));
            }
            if !chunk.is_sealed() && Some(number) != last_number {
                return Err(StorageError::corrupt_chunk(
                    number,
                    "unsealed chunk before the last chunk",
                ));
            }
            chunks.insert(number, Arc::new(chunk));
        }

        let active = match chunks.values().next_back().cloned() {
            None => {
                if writer_checkpoint.read() != LogPosition::ZERO {
                    return Err(StorageError::corrupt_chunk(
                        0,
                        format!(
                            "writer checkpoint at {} but no chunk files",
                            writer_checkpoint.read()
                        ),
                    ));
                }
                let chunk = Arc::new(Chunk::create_active(
                    &config.data_dir,
                    ChunkHeader::new(0, config.chunk_size),
                    config.sync_on_flush,
                )?);
                chunks.insert(0, chunk.clone());
                chunk
            }
            Some(last) if last.is_sealed() => {
                let next = Arc::new(Chunk::create_active(
                    &config.data_dir,
                    ChunkHeader::new(last.number() + 1, config.chunk_size),
                    config.sync_on_flush,
                )?);
                chunks.insert(next.number(), next.clone());
                writer_checkpoint.write(next.header().start())?;
                info!(chunk = next.number(), "Last chunk was sealed, started next chunk");
                next
            }
            Some(last) => {
                recover_active_chunk(&last, &writer_checkpoint)?;
                last
            }
        };

        if chaser_checkpoint.read() > writer_checkpoint.read() {
            warn!(
                chaser = %chaser_checkpoint.read(),
                writer = %writer_checkpoint.read(),
                "Chaser checkpoint ahead of writer, clamping"
            );
            chaser_checkpoint.write(writer_checkpoint.read())?;
        }

        info!(
            chunks = chunks.len(),
            active = active.number(),
            writer_checkpoint = %writer_checkpoint.read(),
            "Opened transaction log"
        );

        Ok(Self {
            config,
            chunks: RwLock::new(chunks),
            writer: Mutex::new(WriterState { active }),
            writer_checkpoint,
            chaser_checkpoint,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Append a record, rolling to a new chunk when the active one is full.
    ///
    /// The record is not visible to readers until [`ChunkManager::flush`].
    pub fn append(&self, record: &LogRecord) -> Result<LogPosition, StorageError> {
        let body = self.encode(record)?;
        self.append_encoded(&body)
    }

    /// Encode a record body, rejecting records over `max_record_size`
    pub fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, StorageError> {
        let body = record.encode()?;
        let frame_len = body.len() + FRAME_OVERHEAD;
        if frame_len > self.config.max_record_size as usize {
            return Err(StorageError::RecordTooLarge {
                size: frame_len,
                limit: self.config.max_record_size as usize,
            });
        }
        Ok(body)
    }

    /// Append a body produced by [`ChunkManager::encode`]
    pub fn append_encoded(&self, body: &[u8]) -> Result<LogPosition, StorageError> {
        let mut writer = self.writer.lock();
        match writer.active.append_body(body) {
            Err(StorageError::ChunkFull { chunk }) => {
                debug!(chunk, "Chunk full, rolling");
                self.roll(&mut writer)?;
                writer.active.append_body(body)
            }
            other => other,
        }
    }

    /// Current end of written data, unflushed records included
    pub fn write_mark(&self) -> WriteMark {
        let writer = self.writer.lock();
        let offset = writer.active.write_size();
        WriteMark {
            chunk: writer.active.number(),
            offset,
            position: writer.active.header().start().advance(offset as u64),
        }
    }

    /// Cut the active chunk back to `mark`, dropping writes of a failed
    /// operation.
    ///
    /// Records a roll has already sealed into an earlier chunk stay there
    /// as prepares without a commit; only the active chunk is cut.
    pub fn rollback(&self, mark: WriteMark) -> Result<(), StorageError> {
        let writer = self.writer.lock();
        let active = &writer.active;
        let offset = if active.number() == mark.chunk {
            mark.offset
        } else {
            warn!(
                from = mark.chunk,
                active = active.number(),
                "Rollback crosses a sealed chunk"
            );
            0
        };
        if active.write_size() > offset {
            active.truncate(offset)?;
        }
        Ok(())
    }

    /// Make everything appended so far durable and visible
    pub fn flush(&self) -> Result<LogPosition, StorageError> {
        let writer = self.writer.lock();
        let size = writer.active.flush()?;
        let position = writer.active.header().start().advance(size as u64);
        if position > self.writer_checkpoint.read() {
            self.writer_checkpoint.write(position)?;
        }
        Ok(position)
    }

    /// Seal the active chunk and start the next one, even if not full
    pub fn complete_chunk(&self) -> Result<u32, StorageError> {
        let mut writer = self.writer.lock();
        self.roll(&mut writer)?;
        Ok(writer.active.number())
    }

    fn roll(&self, writer: &mut WriterState) -> Result<(), StorageError> {
        let current = writer.active.clone();
        current.seal()?;

        let next = Arc::new(Chunk::create_active(
            &self.config.data_dir,
            ChunkHeader::new(current.number() + 1, self.config.chunk_size),
            self.config.sync_on_flush,
        )?);
        self.chunks.write().insert(next.number(), next.clone());
        self.writer_checkpoint.write(next.header().start())?;

        info!(
            sealed = current.number(),
            active = next.number(),
            position = %next.header().start(),
            "Rolled to new chunk"
        );
        writer.active = next;
        Ok(())
    }

    /// Read the record at a position previously returned by `append`
    pub fn read(&self, position: LogPosition) -> Result<RecordedLog, StorageError> {
        if position >= self.writer_checkpoint.read() {
            return Err(StorageError::PositionOutOfRange(position));
        }
        let chunk = self.chunk_for(position)?;
        chunk.read(chunk.header().logical_offset(position))
    }

    /// Records at or after `from`, in position order
    pub fn read_forward(&self, from: LogPosition) -> ForwardCursor<'_> {
        ForwardCursor {
            log: self,
            position: from,
            chunk: None,
            failed: false,
        }
    }

    /// Records strictly before `from`, newest first
    pub fn read_backward(&self, from: LogPosition) -> BackwardCursor<'_> {
        BackwardCursor {
            log: self,
            position: from,
            failed: false,
        }
    }

    /// Last durably flushed position
    pub fn writer_checkpoint(&self) -> LogPosition {
        self.writer_checkpoint.read()
    }

    /// Position consumed by downstream readers (replication, projections)
    pub fn chaser_checkpoint(&self) -> LogPosition {
        self.chaser_checkpoint.read()
    }

    pub fn set_chaser_checkpoint(&self, position: LogPosition) -> Result<(), StorageError> {
        if position > self.writer_checkpoint.read() {
            return Err(StorageError::PositionOutOfRange(position));
        }
        self.chaser_checkpoint.write(position)
    }

    /// Snapshot of the chunk mapping in chunk order
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().values().cloned().collect()
    }

    pub fn chunk(&self, number: u32) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&number).cloned()
    }

    pub fn active_chunk_number(&self) -> u32 {
        self.writer.lock().active.number()
    }

    /// Sealed chunks wholly behind the writer checkpoint: the only chunks
    /// the scavenger may touch
    pub fn sealed_chunks_behind_checkpoint(&self) -> Vec<Arc<Chunk>> {
        let checkpoint = self.writer_checkpoint.read();
        self.chunks
            .read()
            .values()
            .filter(|c| c.is_sealed() && c.header().end() <= checkpoint)
            .cloned()
            .collect()
    }

    /// Swap a scavenged replacement into the mapping.
    ///
    /// The superseded file is removed once the last reader holding it
    /// drops its handle.
    pub fn replace_chunk(&self, replacement: Chunk) -> Result<(), StorageError> {
        let number = replacement.number();
        let mut chunks = self.chunks.write();
        let rejection = match chunks.get(&number) {
            None => Some(StorageError::not_found(format!("chunk {}", number))),
            Some(current) if !current.is_sealed() => Some(StorageError::config(format!(
                "cannot replace active chunk {}",
                number
            ))),
            Some(current) if replacement.file_version() <= current.file_version() => {
                Some(StorageError::config(format!(
                    "replacement version {} of chunk {} is not newer than {}",
                    replacement.file_version(),
                    number,
                    current.file_version()
                )))
            }
            Some(_) => None,
        };
        if let Some(err) = rejection {
            // Never leave a rejected newer version where recovery would pick it up.
            replacement.mark_for_deletion();
            return Err(err);
        }

        let version = replacement.file_version();
        let old = chunks.insert(number, Arc::new(replacement));
        drop(chunks);

        if let Some(old) = old {
            old.mark_for_deletion();
        }
        info!(chunk = number, version, "Swapped in scavenged chunk");
        Ok(())
    }

    /// Re-hash every sealed chunk
    pub fn verify(&self) -> Result<usize, StorageError> {
        let mut verified = 0;
        for chunk in self.chunks() {
            if chunk.is_sealed() {
                chunk.verify_hash()?;
                verified += 1;
            }
        }
        debug!(verified, "Verified sealed chunks");
        Ok(verified)
    }

    /// Flush outstanding writes
    pub fn close(&self) -> Result<(), StorageError> {
        let position = self.flush()?;
        info!(writer_checkpoint = %position, "Closed transaction log");
        Ok(())
    }

    fn chunk_for(&self, position: LogPosition) -> Result<Arc<Chunk>, StorageError> {
        let number = position.chunk_number(self.config.chunk_size);
        self.chunk(number)
            .ok_or(StorageError::PositionOutOfRange(position))
    }
}

/// Scan the data directory: drop temp files and superseded versions, and
/// return the newest file of each chunk number.
fn discover_chunk_files(config: &DbConfig) -> Result<BTreeMap<u32, (u32, PathBuf)>, StorageError> {
    let mut newest: BTreeMap<u32, (u32, PathBuf)> = BTreeMap::new();
    let mut stale = Vec::new();

    for entry in fs::read_dir(&config.data_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(SCAVENGE_TMP_SUFFIX) {
            warn!(path = %path.display(), "Removing incomplete scavenge output");
            fs::remove_file(&path)?;
            continue;
        }
        let Some((number, version)) = parse_chunk_file_name(name) else {
            continue;
        };
        match newest.get(&number) {
            Some((existing, _)) if *existing >= version => stale.push(path),
            _ => {
                if let Some((_, replaced)) = newest.insert(number, (version, path)) {
                    stale.push(replaced);
                }
            }
        }
    }

    for path in stale {
        warn!(path = %path.display(), "Removing superseded chunk version");
        fs::remove_file(&path)?;
    }

    // A crash while creating the next chunk can leave a file without a
    // complete header behind it.
    if let Some((&number, (version, path))) = newest.iter().next_back() {
        if *version == 0 && fs::metadata(path)?.len() < HEADER_SIZE as u64 {
            warn!(chunk = number, "Removing chunk file without header");
            fs::remove_file(path)?;
            newest.remove(&number);
        }
    }

    for (expected, number) in newest.keys().enumerate() {
        if *number != expected as u32 {
            return Err(StorageError::corrupt_chunk(
                expected as u32,
                format!("chunk {} missing, next file is chunk {}", expected, number),
            ));
        }
    }

    Ok(newest)
}

/// Bring the active chunk back to the writer checkpoint
fn recover_active_chunk(chunk: &Chunk, checkpoint: &Checkpoint) -> Result<(), StorageError> {
    let start = chunk.header().start();
    let saved = checkpoint.read();
    if saved > chunk.header().end() {
        return Err(StorageError::corrupt_chunk(
            chunk.number(),
            format!("writer checkpoint {} beyond the last chunk", saved),
        ));
    }
    // Everything before the active chunk is sealed and therefore durable.
    let acknowledged = if saved < start {
        0
    } else {
        chunk.header().logical_offset(saved)
    };

    let valid = chunk.scan_valid_size()?;
    if valid < acknowledged {
        return Err(StorageError::corrupt(
            chunk.number(),
            valid,
            format!("acknowledged data up to offset {} is unreadable", acknowledged),
        ));
    }

    let on_disk = chunk.physical_data_size();
    if on_disk > acknowledged {
        warn!(
            chunk = chunk.number(),
            valid,
            acknowledged,
            dropped_bytes = on_disk - acknowledged,
            "Truncating unacknowledged tail"
        );
        chunk.truncate(acknowledged)?;
    }

    let recovered = start.advance(acknowledged as u64);
    if recovered != saved {
        checkpoint.write(recovered)?;
    }
    info!(chunk = chunk.number(), position = %recovered, "Recovered active chunk");
    Ok(())
}

/// Forward cursor over the log
///
/// Stops at the writer checkpoint; a new cursor created later from
/// [`ForwardCursor::position`] picks up records flushed since.
pub struct ForwardCursor<'a> {
    log: &'a ChunkManager,
    position: LogPosition,
    chunk: Option<Arc<Chunk>>,
    failed: bool,
}

impl ForwardCursor<'_> {
    /// Position to restart from
    pub fn position(&self) -> LogPosition {
        self.position
    }
}

impl Iterator for ForwardCursor<'_> {
    type Item = Result<RecordedLog, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.position >= self.log.writer_checkpoint() {
                return None;
            }
            let chunk = match self.chunk.take() {
                Some(chunk) if chunk.header().contains(self.position) => chunk,
                _ => match self.log.chunk_for(self.position) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
            };

            let physical = chunk.physical_boundary(chunk.header().logical_offset(self.position));
            match chunk.record_after(physical) {
                Ok(Some((recorded, next_physical))) => {
                    self.position = recorded
                        .position
                        .advance((next_physical - physical) as u64);
                    self.chunk = Some(chunk);
                    return Some(Ok(recorded));
                }
                Ok(None) if chunk.is_sealed() => {
                    self.position = chunk.header().end();
                }
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Backward cursor over the log
pub struct BackwardCursor<'a> {
    log: &'a ChunkManager,
    position: LogPosition,
    failed: bool,
}

impl BackwardCursor<'_> {
    /// Position of the last record returned (exclusive end of the rest)
    pub fn position(&self) -> LogPosition {
        self.position
    }
}

impl Iterator for BackwardCursor<'_> {
    type Item = Result<RecordedLog, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            self.position = self.position.min(self.log.writer_checkpoint());
            if self.position == LogPosition::ZERO {
                return None;
            }
            let chunk = match self.log.chunk_for(LogPosition(self.position.0 - 1)) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            let end_offset = (self.position.0 - chunk.header().chunk_start_position) as u32;
            let physical_end = chunk.physical_boundary(end_offset);
            match chunk.record_before(physical_end) {
                Ok(Some((recorded, _))) => {
                    self.position = recorded.position;
                    return Some(Ok(recorded));
                }
                Ok(None) => self.position = chunk.header().start(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
