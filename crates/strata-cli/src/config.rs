//! CLI configuration file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use strata_logging::LogConfig;
use strata_storage::DbConfig;

/// Contents of the `--config` TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub db: DbConfig,
    pub log: LogConfig,
}

impl CliConfig {
    /// Load the file if given, then apply command-line overrides
    pub fn load(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        if let Some(data_dir) = data_dir {
            config.db.data_dir = data_dir;
        }
        Ok(config)
    }
}
