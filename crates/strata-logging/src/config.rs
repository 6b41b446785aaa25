//! Logging configuration, read from the `[log]` table of the CLI config file

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for targets without an override; `RUST_LOG` replaces the
    /// whole filter when set
    pub level: String,
    /// Format of stderr output
    pub format: LogFormat,
    /// ANSI colors in pretty output
    pub ansi: bool,
    /// Write to stderr at all
    pub console: bool,
    pub targets: TargetLevels,
    /// JSON lines mirrored into rolling files
    pub file: Option<FileConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        // Operator commands print results on stdout; keep stderr quiet.
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            ansi: false,
            console: true,
            targets: TargetLevels::default(),
            file: None,
        }
    }
}

/// Stderr output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Per-component level overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetLevels {
    /// Chunk log, index and database
    pub storage: Option<String>,
    /// Scavenge passes; narrower than `storage`
    pub scavenge: Option<String>,
    /// The `strata` binary itself
    pub cli: Option<String>,
}

impl TargetLevels {
    /// `target=level` filter directives for the overridden components
    pub fn directives(&self) -> Vec<String> {
        [
            ("strata_storage", &self.storage),
            ("strata_storage::scavenge", &self.scavenge),
            ("strata", &self.cli),
        ]
        .into_iter()
        .filter_map(|(target, level)| level.as_ref().map(|level| format!("{target}={level}")))
        .collect()
    }
}

/// File output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Maximum rotated files to retain
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "strata".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        }
    }
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// Single file, truncated on start
    Never,
}
