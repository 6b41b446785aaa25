//! Durable position checkpoints
//!
//! A checkpoint is a single little-endian `u64` in its own file. The writer
//! checkpoint marks the end of durable, reader-visible data; everything
//! past it is discarded on recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use strata_core::LogPosition;
use tracing::debug;

use crate::error::StorageError;

pub const WRITER_CHECKPOINT_FILE: &str = "writer.chk";
pub const CHASER_CHECKPOINT_FILE: &str = "chaser.chk";

/// A persisted log position
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    file: Mutex<File>,
    value: AtomicU64,
}

impl Checkpoint {
    /// Open a checkpoint file, creating it at zero if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let value = match len {
            0 => {
                file.write_all(&0u64.to_le_bytes())?;
                file.sync_all()?;
                0
            }
            8 => {
                let mut buf = [0u8; 8];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut buf)?;
                u64::from_le_bytes(buf)
            }
            other => {
                return Err(StorageError::corrupt_chunk(
                    u32::MAX,
                    format!("checkpoint {} has length {}", path.display(), other),
                ));
            }
        };

        debug!(path = %path.display(), value, "Opened checkpoint");

        Ok(Self {
            path,
            file: Mutex::new(file),
            value: AtomicU64::new(value),
        })
    }

    /// Persist a new value, then publish it
    pub fn write(&self, position: LogPosition) -> Result<(), StorageError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&position.0.to_le_bytes())?;
        file.sync_data()?;
        self.value.store(position.0, Ordering::Release);
        Ok(())
    }

    pub fn read(&self) -> LogPosition {
        LogPosition(self.value.load(Ordering::Acquire))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
