//! Replacement chunks written by the scavenger

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use strata_core::RecordedLog;
use tracing::{debug, warn};

use super::format::{ChunkFooter, ChunkHeader, PositionMapEntry, encode_frame};
use super::{Chunk, SCAVENGE_TMP_SUFFIX, chunk_file_name, sync_dir};
use crate::error::StorageError;

/// Writes the surviving records of a sealed chunk into a new file version.
///
/// The file is built under a temporary name and only renamed into place by
/// [`ScavengedChunkBuilder::complete`]. Dropping an incomplete builder
/// removes the temporary file, so a failed or cancelled rewrite leaves the
/// original chunk untouched.
pub struct ScavengedChunkBuilder {
    header: ChunkHeader,
    version: u32,
    dir: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    hasher: blake3::Hasher,
    physical_size: u32,
    logical_data_size: u32,
    map: Vec<PositionMapEntry>,
    completed: bool,
}

impl ScavengedChunkBuilder {
    /// Start a replacement for `original` at file version `version`
    pub fn new(dir: &Path, original: &Chunk, version: u32) -> Result<Self, StorageError> {
        let header = original.header().scavenged();
        let tmp_path = dir.join(format!(
            "{}{}",
            chunk_file_name(header.chunk_number, version),
            SCAVENGE_TMP_SUFFIX
        ));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(file);

        let header_bytes = header.to_bytes();
        file.write_all(&header_bytes)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&header_bytes);

        debug!(
            chunk = header.chunk_number,
            version,
            path = %tmp_path.display(),
            "Started scavenged chunk"
        );

        Ok(Self {
            header,
            version,
            dir: dir.to_path_buf(),
            tmp_path,
            file,
            hasher,
            physical_size: 0,
            logical_data_size: original.logical_data_size(),
            map: Vec::new(),
            completed: false,
        })
    }

    /// Copy one surviving record, keeping its logical position
    pub fn write(&mut self, recorded: &RecordedLog) -> Result<(), StorageError> {
        if !self.header.contains(recorded.position) {
            return Err(StorageError::PositionOutOfRange(recorded.position));
        }
        let logical_offset = self.header.logical_offset(recorded.position);
        if let Some(last) = self.map.last() {
            if logical_offset <= last.logical_offset {
                return Err(StorageError::corrupt(
                    self.header.chunk_number,
                    logical_offset,
                    "survivors written out of order",
                ));
            }
        }

        let body = recorded.record.encode()?;
        let frame = encode_frame(recorded.position, &body);
        self.file.write_all(&frame)?;
        self.hasher.update(&frame);
        self.map.push(PositionMapEntry {
            logical_offset,
            physical_offset: self.physical_size,
        });
        self.physical_size += frame.len() as u32;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.map.len()
    }

    pub fn physical_size(&self) -> u32 {
        self.physical_size
    }

    /// Write map and footer, make the file durable and move it into place
    pub fn complete(mut self) -> Result<Chunk, StorageError> {
        for entry in &self.map {
            let bytes = entry.to_bytes();
            self.file.write_all(&bytes)?;
            self.hasher.update(&bytes);
        }

        let footer = ChunkFooter {
            is_completed: true,
            has_map: true,
            physical_data_size: self.physical_size,
            logical_data_size: self.logical_data_size,
            map_count: self.map.len() as u32,
            hash: *self.hasher.finalize().as_bytes(),
        };
        self.file.write_all(&footer.to_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        let final_path = self
            .dir
            .join(chunk_file_name(self.header.chunk_number, self.version));
        fs::rename(&self.tmp_path, &final_path)?;
        self.completed = true;
        sync_dir(&self.dir)?;

        debug!(
            chunk = self.header.chunk_number,
            version = self.version,
            records = self.map.len(),
            data_size = self.physical_size,
            "Completed scavenged chunk"
        );

        // Sealed chunks are never written again.
        Chunk::open(&final_path, self.version, false, false)
    }
}

impl Drop for ScavengedChunkBuilder {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove scavenge temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::HEADER_SIZE;
    use bytes::Bytes;
    use strata_core::{LogPosition, LogRecord, SystemRecord, SystemRecordKind};
    use tempfile::TempDir;

    fn checkpoint_record(data: &'static [u8]) -> LogRecord {
        LogRecord::System(SystemRecord {
            kind: SystemRecordKind::Checkpoint,
            timestamp_millis: 1,
            data: Bytes::from_static(data),
        })
    }

    fn sealed_chunk(dir: &TempDir, records: &[LogRecord]) -> (Chunk, Vec<LogPosition>) {
        let chunk = Chunk::create_active(dir.path(), ChunkHeader::new(0, 4096), true).unwrap();
        let positions = records.iter().map(|r| chunk.append(r).unwrap()).collect();
        chunk.seal().unwrap();
        (chunk, positions)
    }

    #[test]
    fn test_survivors_keep_positions() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            checkpoint_record(b"dropped"),
            checkpoint_record(b"kept"),
            checkpoint_record(b"dropped too"),
        ];
        let (original, positions) = sealed_chunk(&dir, &records);

        let mut builder = ScavengedChunkBuilder::new(dir.path(), &original, 1).unwrap();
        builder
            .write(&RecordedLog::new(positions[1], records[1].clone()))
            .unwrap();
        let replacement = builder.complete().unwrap();

        assert!(replacement.is_scavenged());
        assert_eq!(replacement.file_version(), 1);
        assert_eq!(replacement.logical_data_size(), original.logical_data_size());
        replacement.verify_hash().unwrap();

        let survivor = replacement.read(positions[1].0 as u32).unwrap();
        assert_eq!(survivor.record, records[1]);
        assert!(matches!(
            replacement.read(positions[0].0 as u32),
            Err(StorageError::PositionOutOfRange(_))
        ));
        assert!(matches!(
            replacement.read(positions[2].0 as u32),
            Err(StorageError::PositionOutOfRange(_))
        ));

        // Boundaries resolve to the next survivor.
        assert_eq!(replacement.physical_boundary(0), 0);
        assert_eq!(
            replacement.physical_boundary(positions[2].0 as u32),
            replacement.physical_data_size()
        );
    }

    #[test]
    fn test_empty_replacement() {
        let dir = TempDir::new().unwrap();
        let (original, _) = sealed_chunk(&dir, &[checkpoint_record(b"gone")]);

        let builder = ScavengedChunkBuilder::new(dir.path(), &original, 1).unwrap();
        let replacement = builder.complete().unwrap();
        assert_eq!(replacement.records().count(), 0);
        assert_eq!(replacement.physical_data_size(), 0);
        assert_eq!(
            fs::metadata(replacement.path()).unwrap().len(),
            (HEADER_SIZE + super::super::format::FOOTER_SIZE) as u64
        );
    }

    #[test]
    fn test_dropped_builder_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let (original, positions) = sealed_chunk(&dir, &[checkpoint_record(b"x")]);

        let mut builder = ScavengedChunkBuilder::new(dir.path(), &original, 1).unwrap();
        builder
            .write(&RecordedLog::new(positions[0], checkpoint_record(b"x")))
            .unwrap();
        let tmp = builder.tmp_path.clone();
        assert!(tmp.exists());
        drop(builder);
        assert!(!tmp.exists());
        assert!(!dir.path().join(chunk_file_name(0, 1)).exists());
    }
}
