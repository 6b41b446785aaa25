//! # Strata Storage
//!
//! Storage engine of the Strata event store.
//!
//! The log is a single append-only sequence of records, addressed by
//! [`LogPosition`](strata_core::LogPosition) and split into fixed-size chunk
//! files. Writers append prepares and commits; readers see only what the
//! writer checkpoint covers. A stream index built from the log answers
//! stream-level questions, and a scavenger rewrites sealed chunks without
//! the records retention no longer needs.
//!
//! ## Layers
//!
//! - [`chunk`]: one chunk file, its on-disk format and scavenged rewrites
//! - [`ChunkManager`]: the chunk sequence, writer and chaser checkpoints,
//!   crash recovery and chunk replacement
//! - [`StreamIndex`]: stream versions, deletions, metadata and transactions
//! - [`Scavenger`]: per-chunk rewrite passes, run on demand or by
//!   [`ScavengeTask`]
//! - [`Database`]: the stream-level operations (append, read, transactions,
//!   delete, metadata)
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_core::ExpectedVersion;
//! use strata_storage::{Database, DbConfig, NewEvent, ReadDirection};
//!
//! let db = Database::open(DbConfig::with_data_dir("/var/lib/strata"))?;
//! db.append(
//!     "orders-42",
//!     ExpectedVersion::NoStream,
//!     vec![NewEvent::new("OrderPlaced", r#"{"total":12}"#)],
//! )?;
//!
//! let slice = db.read_stream("orders-42", 0, 100, ReadDirection::Forward)?;
//! assert_eq!(slice.events.len(), 1);
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod chunk_manager;
pub mod config;
pub mod database;
pub mod error;
pub mod scavenge;
pub mod stream_index;

// Re-exports
pub use checkpoint::Checkpoint;
pub use chunk::{Chunk, ScavengedChunkBuilder};
pub use chunk_manager::{BackwardCursor, ChunkManager, ForwardCursor, WriteMark};
pub use config::{DbConfig, ScavengeConfig};
pub use database::{
    AppendResult, CommitResult, Database, METADATA_EVENT_TYPE, NewEvent, ReadDirection,
    RecordedEvent, StreamSlice,
};
pub use error::{StorageError, WriteError, WriteResult};
pub use scavenge::{ScavengeResult, ScavengeTask, Scavenger};
pub use stream_index::{CommitInfo, EventEntry, PendingTransaction, StreamIndex};
