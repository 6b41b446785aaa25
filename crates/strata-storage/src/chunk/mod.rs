//! Chunk storage
//!
//! A chunk is a bounded, ordered container of framed log records backed by
//! a single file. It is created empty, appended to by the single writer
//! while active, sealed exactly once, and eventually superseded by a
//! scavenged replacement.
//!
//! Sealed chunks are immutable: reads use positional I/O on a shared handle
//! and need no synchronisation. Reads against the active chunk never go
//! past the last flushed offset, which the writer publishes after `fsync`.

pub mod format;
mod scavenged;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use strata_core::{LogPosition, LogRecord, RecordedLog};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use format::{
    ChunkFooter, ChunkHeader, FOOTER_SIZE, FRAME_OVERHEAD, FRAME_PREFIX_SIZE, FramePrefix,
    HEADER_SIZE, MAP_ENTRY_SIZE, PositionMapEntry, check_frame, encode_frame,
};

pub use scavenged::ScavengedChunkBuilder;

/// Suffix of a replacement chunk that has not been swapped in yet
pub const SCAVENGE_TMP_SUFFIX: &str = ".scavenge.tmp";

/// File name of a chunk: `chunk-NNNNNN.VVVVVV`
pub fn chunk_file_name(chunk_number: u32, version: u32) -> String {
    format!("chunk-{:06}.{:06}", chunk_number, version)
}

/// Parse `chunk-NNNNNN.VVVVVV` into (number, version)
pub fn parse_chunk_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("chunk-")?;
    let (number, version) = rest.split_once('.')?;
    if number.len() != 6 || version.len() != 6 {
        return None;
    }
    Some((number.parse().ok()?, version.parse().ok()?))
}

/// Writer-side state of the active chunk
struct ChunkWriter {
    file: File,
    /// Bytes of frame data written (flushed or not)
    write_size: u32,
    /// Running hash over header and data
    hasher: blake3::Hasher,
}

/// A single chunk file
pub struct Chunk {
    header: ChunkHeader,
    path: PathBuf,
    file_version: u32,
    reader: File,
    writer: Mutex<Option<ChunkWriter>>,
    footer: OnceLock<ChunkFooter>,
    /// Data bytes readers may observe
    flushed_size: AtomicU32,
    position_map: Vec<PositionMapEntry>,
    sync_on_flush: bool,
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("number", &self.header.chunk_number)
            .field("version", &self.file_version)
            .field("sealed", &self.is_sealed())
            .field("scavenged", &self.header.is_scavenged)
            .field("data_size", &self.physical_data_size())
            .finish()
    }
}

impl Chunk {
    /// Create a new, empty active chunk
    pub fn create_active(
        dir: &Path,
        header: ChunkHeader,
        sync_on_flush: bool,
    ) -> Result<Self, StorageError> {
        let path = dir.join(chunk_file_name(header.chunk_number, 0));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header_bytes = header.to_bytes();
        file.write_all(&header_bytes)?;
        file.sync_all()?;
        sync_dir(dir)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&header_bytes);

        let reader = File::open(&path)?;

        info!(chunk = header.chunk_number, path = %path.display(), "Created chunk");

        Ok(Self {
            header,
            path,
            file_version: 0,
            reader,
            writer: Mutex::new(Some(ChunkWriter {
                file,
                write_size: 0,
                hasher,
            })),
            footer: OnceLock::new(),
            flushed_size: AtomicU32::new(0),
            position_map: Vec::new(),
            sync_on_flush,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Open an existing chunk file.
    ///
    /// A file ending in a completed footer whose sizes match the file length
    /// is sealed; anything else is an active chunk whose tail still has to
    /// be validated by [`Chunk::scan_valid_size`].
    pub fn open(
        path: &Path,
        file_version: u32,
        verify_hash: bool,
        sync_on_flush: bool,
    ) -> Result<Self, StorageError> {
        let reader = File::open(path)?;
        let len = reader.metadata()?.len();

        let mut header_buf = [0u8; HEADER_SIZE];
        if len < HEADER_SIZE as u64 {
            return Err(StorageError::corrupt_chunk(
                u32::MAX,
                format!("{} is shorter than a chunk header", path.display()),
            ));
        }
        read_exact_at(&reader, &mut header_buf, 0)?;
        let header = ChunkHeader::from_bytes(&header_buf)?;

        let footer = if len >= (HEADER_SIZE + FOOTER_SIZE) as u64 {
            let mut footer_buf = [0u8; FOOTER_SIZE];
            read_exact_at(&reader, &mut footer_buf, len - FOOTER_SIZE as u64)?;
            ChunkFooter::from_bytes(&footer_buf).filter(|f| f.expected_file_len() == len)
        } else {
            None
        };

        match footer {
            Some(footer) => {
                let position_map = if footer.has_map {
                    read_position_map(&reader, &footer)?
                } else {
                    Vec::new()
                };
                let chunk = Self {
                    header,
                    path: path.to_path_buf(),
                    file_version,
                    reader,
                    writer: Mutex::new(None),
                    footer: OnceLock::new(),
                    flushed_size: AtomicU32::new(footer.physical_data_size),
                    position_map,
                    sync_on_flush,
                    delete_on_drop: AtomicBool::new(false),
                };
                let _ = chunk.footer.set(footer);
                if verify_hash {
                    chunk.verify_hash()?;
                }
                debug!(
                    chunk = header.chunk_number,
                    version = file_version,
                    scavenged = header.is_scavenged,
                    "Opened sealed chunk"
                );
                Ok(chunk)
            }
            None => {
                if header.is_scavenged {
                    return Err(StorageError::corrupt_chunk(
                        header.chunk_number,
                        "scavenged chunk without a completed footer",
                    ));
                }
                let data_len = len - HEADER_SIZE as u64;
                if data_len > header.chunk_size as u64 {
                    return Err(StorageError::corrupt_chunk(
                        header.chunk_number,
                        format!("active data {} exceeds chunk size", data_len),
                    ));
                }
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                let write_size = data_len as u32;
                let hasher = hash_prefix(&reader, HEADER_SIZE as u64 + write_size as u64)?;
                debug!(
                    chunk = header.chunk_number,
                    data_size = write_size,
                    "Opened active chunk"
                );
                Ok(Self {
                    header,
                    path: path.to_path_buf(),
                    file_version,
                    reader,
                    writer: Mutex::new(Some(ChunkWriter {
                        file,
                        write_size,
                        hasher,
                    })),
                    footer: OnceLock::new(),
                    flushed_size: AtomicU32::new(write_size),
                    position_map: Vec::new(),
                    sync_on_flush,
                    delete_on_drop: AtomicBool::new(false),
                })
            }
        }
    }

    pub fn number(&self) -> u32 {
        self.header.chunk_number
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn file_version(&self) -> u32 {
        self.file_version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_sealed(&self) -> bool {
        self.footer.get().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn footer(&self) -> Option<&ChunkFooter> {
        self.footer.get()
    }

    /// Bytes of record data in the file visible to readers
    pub fn physical_data_size(&self) -> u32 {
        match self.footer.get() {
            Some(footer) => footer.physical_data_size,
            None => self.flushed_size.load(Ordering::Acquire),
        }
    }

    /// Logical extent of the data written into this chunk
    pub fn logical_data_size(&self) -> u32 {
        match self.footer.get() {
            Some(footer) => footer.logical_data_size,
            None => self.flushed_size.load(Ordering::Acquire),
        }
    }

    /// Logical position right after the chunk's data
    pub fn logical_data_end(&self) -> LogPosition {
        self.header.start().advance(self.logical_data_size() as u64)
    }

    /// Append a record to the active chunk
    pub fn append(&self, record: &LogRecord) -> Result<LogPosition, StorageError> {
        let body = record.encode()?;
        self.append_body(&body)
    }

    /// Append an already-encoded record body.
    ///
    /// Fails with [`StorageError::ChunkFull`] if the frame would cross the
    /// chunk's logical end; nothing is written in that case.
    pub(crate) fn append_body(&self, body: &[u8]) -> Result<LogPosition, StorageError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or(StorageError::ChunkSealed(self.header.chunk_number))?;

        let frame_len = body.len() + FRAME_OVERHEAD;
        if writer.write_size as usize + frame_len > self.header.chunk_size as usize {
            return Err(StorageError::ChunkFull {
                chunk: self.header.chunk_number,
            });
        }

        let position = self.header.start().advance(writer.write_size as u64);
        let frame = encode_frame(position, body);

        writer
            .file
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + writer.write_size as u64))?;
        writer.file.write_all(&frame)?;
        writer.hasher.update(&frame);
        writer.write_size += frame.len() as u32;

        Ok(position)
    }

    /// Bytes written by the writer, including unflushed ones
    pub fn write_size(&self) -> u32 {
        match self.writer.lock().as_ref() {
            Some(writer) => writer.write_size,
            None => self.physical_data_size(),
        }
    }

    /// Make written data durable and visible to readers.
    ///
    /// Returns the flushed data size.
    pub fn flush(&self) -> Result<u32, StorageError> {
        let guard = self.writer.lock();
        match guard.as_ref() {
            Some(writer) => {
                if self.sync_on_flush {
                    writer.file.sync_data()?;
                }
                self.flushed_size.store(writer.write_size, Ordering::Release);
                Ok(writer.write_size)
            }
            None => Ok(self.physical_data_size()),
        }
    }

    /// Seal the chunk: flush, write the footer and drop the writer.
    /// Irreversible.
    pub fn seal(&self) -> Result<ChunkFooter, StorageError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or(StorageError::ChunkSealed(self.header.chunk_number))?;

        writer.file.sync_data()?;
        self.flushed_size.store(writer.write_size, Ordering::Release);

        let footer = ChunkFooter {
            is_completed: true,
            has_map: false,
            physical_data_size: writer.write_size,
            logical_data_size: writer.write_size,
            map_count: 0,
            hash: *writer.hasher.finalize().as_bytes(),
        };

        writer
            .file
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + writer.write_size as u64))?;
        writer.file.write_all(&footer.to_bytes())?;
        writer.file.sync_all()?;

        let _ = self.footer.set(footer);
        *guard = None;

        info!(
            chunk = self.header.chunk_number,
            data_size = footer.physical_data_size,
            hash = %hex::encode(&footer.hash[..8]),
            "Sealed chunk"
        );
        Ok(footer)
    }

    /// Read the record starting at a logical offset within this chunk
    pub fn read(&self, logical_offset: u32) -> Result<RecordedLog, StorageError> {
        let position = self.header.start().advance(logical_offset as u64);
        let physical = self
            .resolve(logical_offset)
            .ok_or(StorageError::PositionOutOfRange(position))?;
        if physical >= self.physical_data_size() {
            return Err(StorageError::PositionOutOfRange(position));
        }
        let (recorded, _) = self.read_frame_at(physical, Some(position))?;
        Ok(recorded)
    }

    /// Record starting at physical offset `physical`, with the offset of
    /// the next frame. `None` at the end of the visible data.
    pub fn record_after(&self, physical: u32) -> Result<Option<(RecordedLog, u32)>, StorageError> {
        if physical >= self.physical_data_size() {
            return Ok(None);
        }
        let (recorded, frame_len) = self.read_frame_at(physical, None)?;
        Ok(Some((recorded, physical + frame_len)))
    }

    /// Record ending at physical offset `physical_end`, with its start
    /// offset. `None` at the beginning of the chunk.
    pub fn record_before(
        &self,
        physical_end: u32,
    ) -> Result<Option<(RecordedLog, u32)>, StorageError> {
        if physical_end == 0 {
            return Ok(None);
        }
        let chunk = self.header.chunk_number;
        if physical_end > self.physical_data_size() || (physical_end as usize) < FRAME_OVERHEAD {
            return Err(StorageError::corrupt(chunk, physical_end, "no frame ends here"));
        }

        let mut suffix = [0u8; 4];
        read_exact_at(
            &self.reader,
            &mut suffix,
            HEADER_SIZE as u64 + physical_end as u64 - 4,
        )?;
        let body_len = u32::from_le_bytes(suffix);
        let start = physical_end
            .checked_sub(body_len.saturating_add(FRAME_OVERHEAD as u32))
            .ok_or_else(|| StorageError::corrupt(chunk, physical_end, "suffix length overruns chunk start"))?;

        let (recorded, frame_len) = self.read_frame_at(start, None)?;
        if start + frame_len != physical_end {
            return Err(StorageError::corrupt(chunk, start, "frame length mismatch"));
        }
        Ok(Some((recorded, start)))
    }

    /// Physical offset of the first surviving record at or after a logical
    /// offset; the visible data size if there is none.
    pub fn physical_boundary(&self, logical_offset: u32) -> u32 {
        let visible = self.physical_data_size();
        if self.header.is_scavenged {
            let idx = self
                .position_map
                .partition_point(|e| e.logical_offset < logical_offset);
            self.position_map
                .get(idx)
                .map(|e| e.physical_offset)
                .unwrap_or(visible)
        } else {
            logical_offset.min(visible)
        }
    }

    /// Iterate the chunk's visible records in position order
    pub fn records(&self) -> ChunkRecords<'_> {
        ChunkRecords {
            chunk: self,
            physical: 0,
            done: false,
        }
    }

    /// Physical offset for a logical offset that must be a record boundary
    fn resolve(&self, logical_offset: u32) -> Option<u32> {
        if self.header.is_scavenged {
            self.position_map
                .binary_search_by_key(&logical_offset, |e| e.logical_offset)
                .ok()
                .map(|idx| self.position_map[idx].physical_offset)
        } else {
            Some(logical_offset)
        }
    }

    fn read_frame_at(
        &self,
        physical: u32,
        expected: Option<LogPosition>,
    ) -> Result<(RecordedLog, u32), StorageError> {
        let chunk = self.header.chunk_number;
        let limit = self.physical_data_size() as u64;
        let file_offset = HEADER_SIZE as u64 + physical as u64;

        if physical as u64 + FRAME_PREFIX_SIZE as u64 > limit {
            return Err(StorageError::corrupt(chunk, physical, "truncated frame prefix"));
        }
        let mut prefix_buf = [0u8; FRAME_PREFIX_SIZE];
        read_exact_at(&self.reader, &mut prefix_buf, file_offset)?;
        let prefix = FramePrefix::parse(&prefix_buf);

        if let Some(expected) = expected {
            if prefix.position != expected {
                return Err(StorageError::PositionOutOfRange(expected));
            }
        }
        if physical as u64 + prefix.frame_len() as u64 > limit {
            return Err(StorageError::corrupt(
                chunk,
                physical,
                format!("frame of {} bytes overruns data", prefix.frame_len()),
            ));
        }

        let mut rest = vec![0u8; prefix.body_len as usize + 4];
        read_exact_at(
            &self.reader,
            &mut rest,
            file_offset + FRAME_PREFIX_SIZE as u64,
        )?;
        let (body, suffix) = rest.split_at(prefix.body_len as usize);
        check_frame(&prefix, body, suffix).map_err(|reason| StorageError::corrupt(chunk, physical, reason))?;

        let record = LogRecord::decode(body)
            .map_err(|e| StorageError::corrupt(chunk, physical, e.to_string()))?;
        Ok((RecordedLog::new(prefix.position, record), prefix.frame_len()))
    }

    /// Length of the longest prefix of whole, valid frames in the file.
    ///
    /// Used on recovery of the active chunk; stops at the first partial or
    /// corrupt frame instead of failing.
    pub fn scan_valid_size(&self) -> Result<u32, StorageError> {
        let mut physical = 0u32;
        let limit = self.physical_data_size();
        while physical < limit {
            let expected = self.header.start().advance(physical as u64);
            match self.read_frame_at(physical, Some(expected)) {
                Ok((_, frame_len)) => physical += frame_len,
                Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
                Err(e) => {
                    debug!(chunk = self.header.chunk_number, offset = physical, error = %e, "Valid data ends");
                    break;
                }
            }
        }
        Ok(physical)
    }

    /// Cut the active chunk's data back to `size` bytes
    pub fn truncate(&self, size: u32) -> Result<(), StorageError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or(StorageError::ChunkSealed(self.header.chunk_number))?;
        if size > writer.write_size {
            return Err(StorageError::config(format!(
                "cannot truncate chunk {} forward to {}",
                self.header.chunk_number, size
            )));
        }

        let file_len = HEADER_SIZE as u64 + size as u64;
        writer.file.set_len(file_len)?;
        writer.file.sync_all()?;
        writer.hasher = hash_prefix(&self.reader, file_len)?;
        writer.write_size = size;
        self.flushed_size.store(size, Ordering::Release);

        warn!(chunk = self.header.chunk_number, size, "Truncated chunk");
        Ok(())
    }

    /// Recompute the hash of a sealed chunk and compare it with the footer
    pub fn verify_hash(&self) -> Result<(), StorageError> {
        let footer = self
            .footer
            .get()
            .ok_or_else(|| StorageError::corrupt_chunk(self.header.chunk_number, "chunk is not sealed"))?;
        let hashed_len = footer.expected_file_len() - FOOTER_SIZE as u64;
        let hasher = hash_prefix(&self.reader, hashed_len)?;
        if hasher.finalize().as_bytes() != &footer.hash {
            return Err(StorageError::corrupt_chunk(
                self.header.chunk_number,
                "hash mismatch",
            ));
        }
        Ok(())
    }

    /// Remove the backing file once the last reader lets go of the chunk
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Removed superseded chunk"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove superseded chunk"),
            }
        }
    }
}

/// Forward iterator over a chunk's records
pub struct ChunkRecords<'a> {
    chunk: &'a Chunk,
    physical: u32,
    done: bool,
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<RecordedLog, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.chunk.record_after(self.physical) {
            Ok(Some((recorded, next))) => {
                self.physical = next;
                Some(Ok(recorded))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn read_position_map(file: &File, footer: &ChunkFooter) -> Result<Vec<PositionMapEntry>, StorageError> {
    let mut buf = vec![0u8; footer.map_count as usize * MAP_ENTRY_SIZE];
    read_exact_at(
        file,
        &mut buf,
        HEADER_SIZE as u64 + footer.physical_data_size as u64,
    )?;
    Ok(buf
        .chunks_exact(MAP_ENTRY_SIZE)
        .map(PositionMapEntry::from_bytes)
        .collect())
}

/// Hash the first `len` bytes of a file
fn hash_prefix(file: &File, len: u64) -> Result<blake3::Hasher, StorageError> {
    let mut hasher = blake3::Hasher::new();
    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(0))?;
    let mut limited = handle.take(len);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = limited.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher)
}

/// Make a directory entry change (create, rename, remove) durable
pub(crate) fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
