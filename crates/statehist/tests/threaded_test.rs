//! Integration tests for the threaded history tree backend.
//!
//! These tests verify:
//! - Failures on the builder thread surface once on a later call
//! - Building is aborted after a reported failure, queries keep working
//! - Back-pressure with small queues
//! - Queries issued from other threads while building

use alopex_statehist::{
    HistoryTreeConfig, StateError, StateValue, ThreadedConfig, ThreadedHistoryTreeBackend,
};
use std::thread;
use tempfile::TempDir;

fn new_backend(dir: &TempDir, start: i64, queue_size: usize) -> ThreadedHistoryTreeBackend {
    let config = HistoryTreeConfig::new(dir.path().join("threaded.ht"), 1, start)
        .with_block_size(512)
        .with_max_children(8);
    ThreadedHistoryTreeBackend::new_for_building(
        config,
        ThreadedConfig::default().with_queue_size(queue_size),
    )
    .unwrap()
}

// ============================================================================
// Deferred errors
// ============================================================================

#[test]
fn test_worker_failure_is_reported_once() {
    let temp_dir = TempDir::new().unwrap();
    let backend = new_backend(&temp_dir, 100, 16);

    // Starts before the tree: accepted by the queue, rejected by the worker.
    backend
        .insert_past_state(50, 60, 0, StateValue::Null)
        .unwrap();

    match backend.finished_building(200) {
        Err(StateError::PriorBuildFailure(cause)) => {
            assert!(matches!(*cause, StateError::TimeRange { time: 50, .. }));
        }
        other => panic!("expected a prior build failure, got {other:?}"),
    }

    assert!(matches!(
        backend.insert_past_state(100, 110, 0, StateValue::Int(1)),
        Err(StateError::BuildAborted)
    ));
    assert!(matches!(
        backend.finished_building(200),
        Err(StateError::BuildAborted)
    ));

    // Queries still reach the tree.
    assert!(backend.do_query(100).unwrap().is_empty());
}

#[test]
fn test_failure_surfaces_on_query() {
    let temp_dir = TempDir::new().unwrap();
    let backend = new_backend(&temp_dir, 0, 16);

    backend.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
    backend.insert_past_state(20, 10, 0, StateValue::Int(2)).unwrap();

    // The worker may not have applied the bad insert when the first query
    // is sent, but it has by the second one.
    let mut reported = 0;
    for _ in 0..2 {
        match backend.do_singular_query(5, 0) {
            Err(StateError::PriorBuildFailure(cause)) => {
                assert!(matches!(*cause, StateError::InvalidInterval { .. }));
                reported += 1;
            }
            Ok(interval) => assert_eq!(interval.value(), &StateValue::Int(1)),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(reported, 1);
    assert!(matches!(
        backend.insert_past_state(30, 40, 0, StateValue::Int(3)),
        Err(StateError::BuildAborted)
    ));
}

// ============================================================================
// Back-pressure and concurrency
// ============================================================================

#[test]
fn test_small_queues_block_without_losing_data() {
    for queue_size in [0, 1, 4] {
        let temp_dir = TempDir::new().unwrap();
        let backend = new_backend(&temp_dir, 0, queue_size);

        for i in 0..500 {
            backend
                .insert_past_state(i * 10, i * 10 + 9, (i % 3) as u32, StateValue::Long(i))
                .unwrap();
        }
        backend.finished_building(4999).unwrap();
        assert_eq!(backend.end_time(), 4999);

        for i in (0..500).step_by(13) {
            let interval = backend
                .do_singular_query(i * 10 + 3, (i % 3) as u32)
                .unwrap();
            assert_eq!(interval.value(), &StateValue::Long(i), "queue size {queue_size}");
        }
    }
}

#[test]
fn test_queries_from_other_threads_while_building() {
    let temp_dir = TempDir::new().unwrap();
    let backend = new_backend(&temp_dir, 0, 8);

    thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..300 {
                backend
                    .insert_past_state(i * 10, i * 10 + 9, 0, StateValue::Long(i))
                    .unwrap();
            }
        });
        scope.spawn(|| {
            for _ in 0..100 {
                let end = backend.end_time();
                if end == 0 {
                    thread::yield_now();
                    continue;
                }
                let interval = backend.do_singular_query(end, 0).unwrap();
                assert_eq!(interval.end(), end);
                assert_eq!(interval.value(), &StateValue::Long(end / 10));
            }
        });
    });

    backend.finished_building(2999).unwrap();
    assert_eq!(backend.do_query(1500).unwrap().len(), 1);
}
