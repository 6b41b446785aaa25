//! Logging setup for the Strata event store
//!
//! The storage engine only emits `tracing` events. This crate turns them into
//! output: pretty text or JSON lines on stderr, optionally mirrored as JSON
//! lines into a rolling file.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_logging::{LogConfig, LogFormat, StrataSubscriberBuilder};
//!
//! // Pretty output to stderr at warn
//! let _guard = StrataSubscriberBuilder::new().init();
//!
//! // JSON lines, with scavenge passes at debug
//! let mut config = LogConfig::default();
//! config.format = LogFormat::Json;
//! config.targets.scavenge = Some("debug".to_string());
//! let _guard = StrataSubscriberBuilder::new().with_config(config).init();
//! ```
//!
//! `RUST_LOG` takes precedence over the configured levels. Keep the returned
//! guard alive for as long as file output should be written.

pub mod config;

pub use config::{FileConfig, LogConfig, LogFormat, RotationStrategy, TargetLevels};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::{Format, Json, JsonFields};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log appender error: {0}")]
    Appender(String),

    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Builder for configuring and initializing the Strata logging subscriber
pub struct StrataSubscriberBuilder {
    config: LogConfig,
}

impl StrataSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the level for targets without an override
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally.
    ///
    /// Failures are reported on stderr and leave logging disabled.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: failed to initialize logging: {}", e);
                None
            }
        }
    }

    /// Install the subscriber globally, returning the file writer guard
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = env_filter(&self.config)?;

        let config = &self.config;
        let pretty_console = (config.console && config.format == LogFormat::Pretty).then(|| {
            fmt::layer()
                .with_ansi(config.ansi)
                .with_target(true)
                .with_writer(std::io::stderr)
        });
        let json_console = (config.console && config.format == LogFormat::Json)
            .then(|| json_layer(std::io::stderr));

        let (file_layer, guard) = match &config.file {
            Some(file) => {
                let (writer, guard) = file_writer(file)?;
                (Some(json_layer(writer)), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(pretty_console)
            .with(json_console)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

        Ok(guard)
    }
}

impl Default for StrataSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `RUST_LOG` if set, else the configured level plus target overrides.
/// Overrides are parsed either way so a bad config file is always reported.
fn env_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    let overrides = config
        .targets
        .directives()
        .into_iter()
        .map(|directive| {
            directive
                .parse::<Directive>()
                .map_err(|e| LoggingError::Filter(format!("{directive}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| LoggingError::Filter(format!("{}: {e}", config.level)))?;
    Ok(overrides
        .into_iter()
        .fold(filter, |filter, directive| filter.add_directive(directive)))
}

fn json_layer<S, W>(writer: W) -> fmt::Layer<S, JsonFields, Format<Json>, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .flatten_event(true)
        .with_writer(writer)
}

/// Non-blocking writer for the configured file; `Never` truncates a single
/// file, the other strategies append to rotated files
fn file_writer(file: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&file.directory)?;
    let rotation = match file.rotation {
        RotationStrategy::Never => {
            let path = file.directory.join(format!("{}.log", file.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file.prefix.clone())
        .filename_suffix("log");
    if let Some(max_files) = file.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder
        .build(&file.directory)
        .map_err(|e| LoggingError::Appender(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}
