//! Stress tests for strata-storage
//!
//! These tests verify log behavior under sustained appends, chunk rolls,
//! concurrent writers and readers, and optimistic-concurrency conflicts.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use rand::Rng;
use strata_core::{ExpectedVersion, LogPosition, LogRecord};
use strata_storage::{Database, DbConfig, NewEvent, ReadDirection, WriteError};
use tempfile::TempDir;

fn small_chunks(dir: &TempDir) -> DbConfig {
    DbConfig::with_data_dir(dir.path())
        .with_chunk_size(16 * 1024)
        .with_max_record_size(4 * 1024)
        .with_sync_on_flush(false)
}

fn event(i: usize) -> NewEvent {
    NewEvent::new("stress", format!("{{\"seq\":{i}}}"))
}

// ============================================================================
// Throughput Tests
// ============================================================================

/// Append 3,000 events one at a time across many chunk rolls
#[test]
fn test_append_throughput_across_chunks() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(small_chunks(&dir)).unwrap();
    let event_count: usize = 3_000;

    let start = Instant::now();
    let mut last_position = LogPosition::ZERO;
    for i in 0..event_count {
        let result = db
            .append("load", ExpectedVersion::Any, vec![event(i)])
            .expect("Failed to append event");
        assert!(result.position > last_position, "positions must grow");
        last_position = result.position;
    }
    let duration = start.elapsed();
    println!(
        "Appended {} events in {:?} ({:.2} events/sec)",
        event_count,
        duration,
        event_count as f64 / duration.as_secs_f64()
    );

    assert!(db.log().active_chunk_number() > 1, "expected chunk rolls");
    assert_eq!(db.last_event_number("load"), Some(event_count as u64 - 1));

    let slice = db
        .read_stream("load", 0, event_count, ReadDirection::Forward)
        .unwrap();
    assert_eq!(slice.events.len(), event_count);
    for (i, e) in slice.events.iter().enumerate() {
        assert_eq!(e.event_number, i as u64);
    }
}

/// The global log reads back in strictly increasing position order,
/// forward and backward, across sealed and active chunks
#[test]
fn test_log_positions_monotonic() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(small_chunks(&dir)).unwrap();
    for i in 0..500 {
        db.append(&format!("s-{}", i % 7), ExpectedVersion::Any, vec![event(i)])
            .unwrap();
    }

    let forward: Vec<_> = db
        .log()
        .read_forward(LogPosition::ZERO)
        .map(|r| r.unwrap().position)
        .collect();
    assert_eq!(forward.len(), 1000);
    assert!(forward.windows(2).all(|w| w[0] < w[1]));

    let backward: Vec<_> = db
        .log()
        .read_backward(db.log().writer_checkpoint())
        .map(|r| r.unwrap().position)
        .collect();
    let mut reversed = forward.clone();
    reversed.reverse();
    assert_eq!(backward, reversed);
}

/// Random payload sizes land frames at arbitrary offsets near chunk ends
#[test]
fn test_random_payload_sizes_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut rng = rand::rng();
    let payloads: Vec<Vec<u8>> = (0..400)
        .map(|_| {
            let len = rng.random_range(0..3_000);
            (0..len).map(|_| rng.random::<u8>()).collect()
        })
        .collect();

    {
        let db = Database::open(small_chunks(&dir)).unwrap();
        for payload in &payloads {
            db.append(
                "blobs",
                ExpectedVersion::Any,
                vec![NewEvent::new("blob", payload.clone())],
            )
            .unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(small_chunks(&dir).with_verify_on_open(true)).unwrap();
    let slice = db
        .read_stream("blobs", 0, payloads.len(), ReadDirection::Forward)
        .unwrap();
    assert_eq!(slice.events.len(), payloads.len());
    for (event, payload) in slice.events.iter().zip(&payloads) {
        assert_eq!(event.data.as_ref(), payload.as_slice());
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

/// Many writers on distinct streams; every append lands exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(small_chunks(&dir)).unwrap());
    let writers = 8;
    let per_writer = 200;

    let mut handles = Vec::new();
    for w in 0..writers {
        let db = Arc::clone(&db);
        handles.push(tokio::task::spawn_blocking(move || {
            let stream = format!("writer-{w}");
            let mut positions = Vec::with_capacity(per_writer);
            for i in 0..per_writer {
                let expected = if i == 0 {
                    ExpectedVersion::NoStream
                } else {
                    ExpectedVersion::Exact(i as u64 - 1)
                };
                positions.push(db.append(&stream, expected, vec![event(i)]).unwrap().position);
            }
            positions
        }));
    }

    let mut all_positions = HashSet::new();
    for handle in handles {
        let positions = handle.await.unwrap();
        assert!(positions.windows(2).all(|p| p[0] < p[1]));
        for p in positions {
            assert!(all_positions.insert(p), "duplicate commit position {p}");
        }
    }
    assert_eq!(all_positions.len(), writers * per_writer);

    for w in 0..writers {
        assert_eq!(
            db.last_event_number(&format!("writer-{w}")),
            Some(per_writer as u64 - 1)
        );
    }
}

/// Writers racing on one stream with exact expected versions: each
/// version is won by exactly one writer
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_expected_version_conflicts() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(small_chunks(&dir)).unwrap());
    let rounds = 50u64;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(tokio::task::spawn_blocking(move || {
            let mut wins = 0u64;
            let mut conflicts = 0u64;
            loop {
                let expected = match db.last_event_number("contended") {
                    Some(last) if last + 1 >= rounds => break,
                    Some(last) => ExpectedVersion::Exact(last),
                    None => ExpectedVersion::NoStream,
                };
                match db.append("contended", expected, vec![event(0)]) {
                    Ok(_) => wins += 1,
                    Err(WriteError::WrongExpectedVersion { .. }) => conflicts += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            (wins, conflicts)
        }));
    }

    let mut total_wins = 0;
    for handle in handles {
        let (wins, _) = handle.await.unwrap();
        total_wins += wins;
    }
    assert_eq!(total_wins, rounds);
    assert_eq!(db.last_event_number("contended"), Some(rounds - 1));
}

/// The 5-vs-7 conflict reports the actual version and writes nothing
#[test]
fn test_wrong_expected_version_reports_actual() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(small_chunks(&dir)).unwrap();
    db.append("orders", ExpectedVersion::Any, (0..8).map(event).collect())
        .unwrap();
    let records_before = db.read_all_forward(LogPosition::ZERO, 1000).unwrap().len();

    match db.append("orders", ExpectedVersion::Exact(5), vec![event(8)]) {
        Err(WriteError::WrongExpectedVersion {
            expected, actual, ..
        }) => {
            assert_eq!(expected, ExpectedVersion::Exact(5));
            assert_eq!(actual, Some(7));
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    assert_eq!(
        db.read_all_forward(LogPosition::ZERO, 1000).unwrap().len(),
        records_before
    );
}

/// Readers never observe a commit without its prepares, or a torn page
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(small_chunks(&dir)).unwrap());
    db.append("feed", ExpectedVersion::NoStream, vec![event(0)])
        .unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        tokio::task::spawn_blocking(move || {
            for i in 1..1_000 {
                db.append("feed", ExpectedVersion::Any, vec![event(i), event(i)])
                    .unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::Release);
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        readers.push(tokio::task::spawn_blocking(move || {
            let mut reads = 0u64;
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                let slice = db
                    .read_stream("feed", 0, usize::MAX, ReadDirection::Forward)
                    .unwrap();
                // Events come in committed pairs after the first.
                assert_eq!(slice.events.len() % 2, 1);
                assert_eq!(slice.events.len() as u64, slice.last_event_number + 1);
                for (i, e) in slice.events.iter().enumerate() {
                    assert_eq!(e.event_number, i as u64);
                }

                for recorded in db.log().read_forward(LogPosition::ZERO) {
                    let recorded = recorded.unwrap();
                    if let LogRecord::Commit(commit) = &recorded.record {
                        db.log().read(commit.transaction_position).unwrap();
                    }
                }
                reads += 1;
            }
            reads
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(db.last_event_number("feed"), Some(1_998));
}

// ============================================================================
// Limits
// ============================================================================

#[test]
fn test_oversized_record_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(small_chunks(&dir)).unwrap();
    let before = db.log().writer_checkpoint();

    let huge = NewEvent::new("big", vec![0u8; 8 * 1024]);
    let err = db
        .append("orders", ExpectedVersion::Any, vec![huge])
        .unwrap_err();
    assert!(matches!(
        err,
        WriteError::Storage(strata_storage::StorageError::RecordTooLarge { .. })
    ));
    assert_eq!(db.log().writer_checkpoint(), before);
    assert_eq!(db.last_event_number("orders"), None);
}

#[test]
fn test_verify_after_many_rolls() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(small_chunks(&dir)).unwrap();
    for i in 0..2_000 {
        db.append("load", ExpectedVersion::Any, vec![event(i)])
            .unwrap();
    }
    let sealed = db.log().verify().unwrap();
    assert_eq!(sealed as u32, db.log().active_chunk_number());
}
