//! Configuration for the database and its scavenger

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::format::{FOOTER_SIZE, FRAME_OVERHEAD, HEADER_SIZE};
use crate::error::StorageError;

/// Configuration for a [`Database`](crate::Database)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Directory holding chunk and checkpoint files
    pub data_dir: PathBuf,
    /// Logical size of a chunk in bytes
    pub chunk_size: u32,
    /// Largest encoded record (frame included) accepted by `append`
    pub max_record_size: u32,
    /// Re-hash every sealed chunk when the database is opened
    pub verify_chunks_on_open: bool,
    /// fsync chunk data on every flush
    pub sync_on_flush: bool,
    /// Scavenger settings
    pub scavenge: ScavengeConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/strata"),
            chunk_size: 256 * 1024 * 1024, // 256MB
            max_record_size: 16 * 1024 * 1024, // 16MB
            verify_chunks_on_open: false,
            sync_on_flush: true,
            scavenge: ScavengeConfig::default(),
        }
    }
}

impl DbConfig {
    /// Create a configuration with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the logical chunk size
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self.max_record_size = self.max_record_size.min(chunk_size);
        self
    }

    /// Set the record size bound
    pub fn with_max_record_size(mut self, max_record_size: u32) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    /// Enable or disable hash verification of sealed chunks on open
    pub fn with_verify_on_open(mut self, verify: bool) -> Self {
        self.verify_chunks_on_open = verify;
        self
    }

    /// Enable or disable fsync on flush
    pub fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// Set the scavenger configuration
    pub fn with_scavenge(mut self, scavenge: ScavengeConfig) -> Self {
        self.scavenge = scavenge;
        self
    }

    /// Reject layouts the chunk format cannot hold
    pub fn validate(&self) -> Result<(), StorageError> {
        let minimum = (HEADER_SIZE + FOOTER_SIZE + FRAME_OVERHEAD + 1) as u32;
        if self.chunk_size < minimum {
            return Err(StorageError::config(format!(
                "chunk_size {} below minimum {}",
                self.chunk_size, minimum
            )));
        }
        if self.max_record_size as usize <= FRAME_OVERHEAD {
            return Err(StorageError::config(format!(
                "max_record_size {} cannot hold a frame",
                self.max_record_size
            )));
        }
        if self.max_record_size > self.chunk_size {
            return Err(StorageError::config(format!(
                "max_record_size {} exceeds chunk_size {}",
                self.max_record_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Configuration for the scavenger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengeConfig {
    /// Age after which a transaction with no commit is considered abandoned.
    /// `None` keeps uncommitted prepares forever.
    pub abandoned_transaction_age_secs: Option<u64>,
    /// Interval between background passes
    pub interval_secs: u64,
    /// Re-read and hash every replacement chunk before swapping it in
    pub verify_replacement: bool,
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            abandoned_transaction_age_secs: None,
            interval_secs: 60 * 60, // hourly
            verify_replacement: true,
        }
    }
}

impl ScavengeConfig {
    pub fn abandoned_transaction_age(&self) -> Option<Duration> {
        self.abandoned_transaction_age_secs.map(Duration::from_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn with_abandoned_transaction_age(mut self, age: Duration) -> Self {
        self.abandoned_transaction_age_secs = Some(age.as_secs());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        DbConfig::default().validate().unwrap();
    }

    #[test]
    fn test_tiny_chunk_rejected() {
        let config = DbConfig::default().with_chunk_size(64);
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_chunk_size_clamps_record_bound() {
        let config = DbConfig::default().with_chunk_size(4096);
        assert_eq!(config.max_record_size, 4096);
        config.validate().unwrap();
    }

    #[test]
    fn test_scavenge_durations() {
        let config = ScavengeConfig::default()
            .with_abandoned_transaction_age(Duration::from_secs(30))
            .with_interval(Duration::from_secs(0));
        assert_eq!(
            config.abandoned_transaction_age(),
            Some(Duration::from_secs(30))
        );
        // Zero would make tokio's interval panic.
        assert_eq!(config.interval(), Duration::from_secs(1));
    }
}
