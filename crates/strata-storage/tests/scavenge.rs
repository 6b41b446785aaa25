//! Scavenging tests for strata-storage
//!
//! These tests drive whole scavenge passes through the `Database` and check
//! what survives on disk and what stays visible to readers.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use strata_core::{ExpectedVersion, LogRecord, ManualClock, StreamMetadata, metadata_stream_of};
use strata_storage::{
    Database, DbConfig, METADATA_EVENT_TYPE, NewEvent, ReadDirection, ScavengeConfig, WriteError,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> DbConfig {
    DbConfig::with_data_dir(dir.path()).with_chunk_size(64 * 1024)
}

fn events(n: usize) -> Vec<NewEvent> {
    (0..n)
        .map(|i| NewEvent::new("test", format!("payload-{i}")))
        .collect()
}

fn record_count(db: &Database, chunk: u32) -> usize {
    db.log()
        .chunk(chunk)
        .expect("chunk exists")
        .records()
        .map(|r| r.expect("readable record"))
        .count()
}

fn visible(db: &Database, stream: &str) -> Vec<(u64, bytes::Bytes)> {
    db.read_stream(stream, 0, 1000, ReadDirection::Forward)
        .unwrap()
        .events
        .into_iter()
        .map(|e| (e.event_number, e.data))
        .collect()
}

fn no_cancel() -> AtomicBool {
    AtomicBool::new(false)
}

// ============================================================================
// Tombstones
// ============================================================================

/// Chunk 0 holds two prepares and a commit for "bla"; chunk 1 holds its
/// delete prepare and tombstone commit.
#[test]
fn test_deleted_stream_chunk_scavenged_away() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir)).unwrap();

    db.append("bla", ExpectedVersion::NoStream, events(2)).unwrap();
    assert_eq!(db.log().complete_chunk().unwrap(), 0);
    db.delete_stream("bla", ExpectedVersion::Exact(1)).unwrap();
    assert_eq!(db.log().complete_chunk().unwrap(), 1);

    assert_eq!(record_count(&db, 0), 3);
    assert_eq!(record_count(&db, 1), 2);

    let result = db.scavenge(&no_cancel()).unwrap();
    assert_eq!(result.chunks_scanned, 2);
    assert_eq!(result.chunks_rewritten, 1);
    assert_eq!(result.records_discarded, 3);
    assert_eq!(result.records_kept, 2);
    assert!(result.failed_chunks.is_empty());

    assert_eq!(record_count(&db, 0), 0);
    assert!(db.log().chunk(0).unwrap().is_scavenged());
    assert_eq!(record_count(&db, 1), 2);

    let kinds: Vec<_> = db
        .log()
        .chunk(1)
        .unwrap()
        .records()
        .map(|r| r.unwrap().record)
        .collect();
    assert!(matches!(&kinds[0], LogRecord::Prepare(p) if p.is_delete()));
    assert!(matches!(&kinds[1], LogRecord::Commit(c) if c.is_tombstone()));
}

#[test]
fn test_tombstone_survives_repeated_passes_and_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(config(&dir)).unwrap();
        db.append("bla", ExpectedVersion::Any, events(2)).unwrap();
        db.log().complete_chunk().unwrap();
        db.delete_stream("bla", ExpectedVersion::Any).unwrap();
        db.log().complete_chunk().unwrap();

        for _ in 0..3 {
            db.scavenge(&no_cancel()).unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(config(&dir)).unwrap();
    assert!(db.index().is_deleted("bla"));
    assert!(matches!(
        db.read_stream("bla", 0, 10, ReadDirection::Forward),
        Err(WriteError::StreamDeleted(_))
    ));
    assert!(matches!(
        db.append("bla", ExpectedVersion::Any, events(1)),
        Err(WriteError::StreamDeleted(_))
    ));
}

// ============================================================================
// Retention Policies
// ============================================================================

#[test]
fn test_max_count_scavenge_preserves_reads() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir)).unwrap();

    db.append("orders", ExpectedVersion::NoStream, events(10)).unwrap();
    db.set_stream_metadata(
        "orders",
        ExpectedVersion::Any,
        StreamMetadata::default().with_max_count(3),
    )
    .unwrap();
    db.log().complete_chunk().unwrap();

    let before = visible(&db, "orders");
    assert_eq!(
        before.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![7, 8, 9]
    );

    let result = db.scavenge(&no_cancel()).unwrap();
    assert_eq!(result.chunks_rewritten, 1);
    assert_eq!(result.records_discarded, 7);
    assert!(result.bytes_freed > 0);

    assert_eq!(visible(&db, "orders"), before);
    assert_eq!(db.last_event_number("orders"), Some(9));
}

#[test]
fn test_max_count_survives_reopen_after_scavenge() {
    let dir = TempDir::new().unwrap();
    let before = {
        let db = Database::open(config(&dir)).unwrap();
        db.append("orders", ExpectedVersion::NoStream, events(10)).unwrap();
        db.set_stream_metadata(
            "orders",
            ExpectedVersion::Any,
            StreamMetadata::default().with_max_count(3),
        )
        .unwrap();
        db.log().complete_chunk().unwrap();
        db.scavenge(&no_cancel()).unwrap();
        let before = visible(&db, "orders");
        db.close().unwrap();
        before
    };

    let db = Database::open(config(&dir)).unwrap();
    assert_eq!(visible(&db, "orders"), before);
    assert_eq!(db.last_event_number("orders"), Some(9));

    // The stream keeps its version after the rebuild.
    let next = db
        .append("orders", ExpectedVersion::Exact(9), events(1))
        .unwrap();
    assert_eq!(next.first_event_number, 10);
}

/// An unreadable metadata event replaces a valid one; the stream must read
/// the same before the pass and after a rebuild.
#[test]
fn test_invalid_metadata_consistent_across_scavenge_and_reopen() {
    let dir = TempDir::new().unwrap();
    let before = {
        let db = Database::open(config(&dir)).unwrap();
        db.set_stream_metadata(
            "s",
            ExpectedVersion::Any,
            StreamMetadata::default().with_max_count(1),
        )
        .unwrap();
        db.append("s", ExpectedVersion::Any, events(3)).unwrap();
        db.log().complete_chunk().unwrap();
        db.append(
            &metadata_stream_of("s"),
            ExpectedVersion::Any,
            vec![NewEvent::new(METADATA_EVENT_TYPE, "not json")],
        )
        .unwrap();
        db.log().complete_chunk().unwrap();

        let before = visible(&db, "s");
        assert_eq!(before.len(), 3);
        assert_eq!(db.stream_metadata("s").max_count, None);

        db.scavenge(&no_cancel()).unwrap();
        assert_eq!(visible(&db, "s"), before);
        db.close().unwrap();
        before
    };

    let db = Database::open(config(&dir)).unwrap();
    assert_eq!(visible(&db, "s"), before);
    assert_eq!(db.stream_metadata("s"), StreamMetadata::default());
    assert_eq!(db.last_event_number(&metadata_stream_of("s")), Some(1));
}

#[test]
fn test_max_age_uses_scavenge_time() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::default();
    let db = Database::open_with_clock(config(&dir), Arc::new(clock.clone())).unwrap();

    db.append("sensor", ExpectedVersion::Any, events(3)).unwrap();
    clock.advance(Duration::from_secs(2 * 3600));
    db.append("sensor", ExpectedVersion::Any, events(1)).unwrap();
    db.set_stream_metadata(
        "sensor",
        ExpectedVersion::Any,
        StreamMetadata::default().with_max_age(Duration::from_secs(3600)),
    )
    .unwrap();
    db.log().complete_chunk().unwrap();

    let before = visible(&db, "sensor");
    assert_eq!(before.len(), 1);

    let result = db.scavenge(&no_cancel()).unwrap();
    // Three aged prepares and the commit of their transaction.
    assert_eq!(result.records_discarded, 4);
    assert_eq!(visible(&db, "sensor"), before);
}

#[test]
fn test_last_event_kept_even_when_expired() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::default();
    let db = Database::open_with_clock(config(&dir), Arc::new(clock.clone())).unwrap();

    db.append("sensor", ExpectedVersion::Any, events(2)).unwrap();
    db.set_stream_metadata(
        "sensor",
        ExpectedVersion::Any,
        StreamMetadata::default().with_max_age(Duration::from_secs(60)),
    )
    .unwrap();
    db.log().complete_chunk().unwrap();
    clock.advance(Duration::from_secs(3600));

    db.scavenge(&no_cancel()).unwrap();
    assert_eq!(db.last_event_number("sensor"), Some(1));
    assert!(db.index().event_position("sensor", 1).is_some());
    assert!(db.index().event_position("sensor", 0).is_none());
}

// ============================================================================
// Pass Behavior
// ============================================================================

#[test]
fn test_scavenge_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir)).unwrap();

    db.append("orders", ExpectedVersion::Any, events(5)).unwrap();
    db.set_stream_metadata(
        "orders",
        ExpectedVersion::Any,
        StreamMetadata::default().with_max_count(1),
    )
    .unwrap();
    db.log().complete_chunk().unwrap();

    let first = db.scavenge(&no_cancel()).unwrap();
    assert_eq!(first.chunks_rewritten, 1);
    let after_first = visible(&db, "orders");

    let second = db.scavenge(&no_cancel()).unwrap();
    assert_eq!(second.chunks_rewritten, 0);
    assert_eq!(second.records_discarded, 0);
    assert_eq!(second.records_kept, first.records_kept);
    assert_eq!(visible(&db, "orders"), after_first);
}

#[test]
fn test_active_chunk_is_never_scavenged() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir)).unwrap();

    db.append("bla", ExpectedVersion::Any, events(3)).unwrap();
    db.delete_stream("bla", ExpectedVersion::Any).unwrap();

    let result = db.scavenge(&no_cancel()).unwrap();
    assert_eq!(result.chunks_scanned, 0);
    assert_eq!(record_count(&db, 0), 6);
}

#[test]
fn test_cancelled_pass_leaves_log_untouched() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir)).unwrap();

    db.append("bla", ExpectedVersion::Any, events(2)).unwrap();
    db.delete_stream("bla", ExpectedVersion::Any).unwrap();
    db.log().complete_chunk().unwrap();

    let cancel = AtomicBool::new(true);
    assert!(db.scavenge(&cancel).is_err());
    assert_eq!(record_count(&db, 0), 5);
    assert!(!db.log().chunk(0).unwrap().is_scavenged());
}

#[test]
fn test_abandoned_transactions_are_scavenged() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::default();
    let db = Database::open_with_clock(
        config(&dir).with_scavenge(
            ScavengeConfig::default().with_abandoned_transaction_age(Duration::from_secs(60)),
        ),
        Arc::new(clock.clone()),
    )
    .unwrap();

    let tx = db.start_transaction("orders", ExpectedVersion::Any).unwrap();
    db.transaction_write(tx, events(2)).unwrap();
    db.append("other", ExpectedVersion::Any, events(1)).unwrap();
    db.log().complete_chunk().unwrap();

    clock.advance(Duration::from_secs(120));
    let result = db.scavenge(&no_cancel()).unwrap();
    // The begin marker and both data prepares.
    assert_eq!(result.records_discarded, 3);
    assert!(matches!(
        db.commit_transaction(tx),
        Err(WriteError::InvalidTransaction(_))
    ));
    assert_eq!(db.last_event_number("other"), Some(0));
}

// ============================================================================
// Background Task
// ============================================================================

#[tokio::test]
async fn test_background_scavenger_rewrites_sealed_chunks() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(config(&dir).with_scavenge(
        ScavengeConfig::default().with_interval(Duration::from_millis(20)),
    ))
    .unwrap();

    db.append("bla", ExpectedVersion::Any, events(2)).unwrap();
    db.delete_stream("bla", ExpectedVersion::Any).unwrap();
    db.log().complete_chunk().unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = db.spawn_scavenger(shutdown_rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !db.log().chunk(0).unwrap().is_scavenged() {
        assert!(tokio::time::Instant::now() < deadline, "chunk never scavenged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record_count(&db, 0), 2);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
