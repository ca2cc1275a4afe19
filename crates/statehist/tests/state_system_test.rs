//! Integration tests for the state system façade.
//!
//! These tests verify:
//! - Stack attributes (push, pop, stack top queries)
//! - Attribute path patterns
//! - Queries while building and after closing
//! - Persisting and reopening a history with its attribute tree

use alopex_statehist::state_system::{PARENT, WILDCARD};
use alopex_statehist::{
    Backend, HistoryTreeBackend, HistoryTreeConfig, InMemoryBackend, ProviderVersionCheck,
    StateError, StateSystem, StateValue, ThreadedConfig, ThreadedHistoryTreeBackend,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn in_memory(start: i64) -> StateSystem {
    StateSystem::new(InMemoryBackend::new(start))
}

// ============================================================================
// Stack attributes
// ============================================================================

fn push_five(ss: &StateSystem) -> u32 {
    let base = ss.quark_absolute_and_add(&["Threads", "1", "CallStack"]).unwrap();
    ss.push_attribute(2, StateValue::from("A"), base).unwrap();
    ss.push_attribute(4, StateValue::Int(10), base).unwrap();
    ss.push_attribute(6, StateValue::Null, base).unwrap();
    ss.push_attribute(8, StateValue::from("D"), base).unwrap();
    ss.push_attribute(10, StateValue::Long(i64::MAX), base).unwrap();
    base
}

#[test]
fn test_pops_return_pushed_values_in_reverse_order() {
    let ss = in_memory(0);
    let base = push_five(&ss);
    assert_eq!(ss.query_ongoing(base).unwrap(), StateValue::Int(5));

    let popped: Vec<Option<StateValue>> = [12, 14, 16, 18, 20]
        .into_iter()
        .map(|t| ss.pop_attribute(t, base).unwrap())
        .collect();
    assert_eq!(
        popped,
        vec![
            Some(StateValue::Long(i64::MAX)),
            Some(StateValue::from("D")),
            Some(StateValue::Null),
            Some(StateValue::Int(10)),
            Some(StateValue::from("A")),
        ]
    );
    assert_eq!(ss.pop_attribute(22, base).unwrap(), None);
    assert!(ss.query_ongoing(base).unwrap().is_null());
}

#[test]
fn test_stack_top_over_time() {
    let ss = in_memory(0);
    let base = push_five(&ss);
    for t in [12, 14, 16, 18, 20] {
        ss.pop_attribute(t, base).unwrap();
    }
    ss.close_history(30).unwrap();

    assert_eq!(ss.query_single_stack_top(1, base).unwrap(), None);
    assert_eq!(ss.query_single_stack_top(25, base).unwrap(), None);

    let top = ss.query_single_stack_top(11, base).unwrap().unwrap();
    assert_eq!(top.value(), &StateValue::Long(i64::MAX));
    assert_eq!((top.start(), top.end()), (10, 11));

    let top = ss.query_single_stack_top(13, base).unwrap().unwrap();
    assert_eq!(top.value(), &StateValue::from("D"));
    assert_eq!((top.start(), top.end()), (8, 13));

    let top = ss.query_single_stack_top(3, base).unwrap().unwrap();
    assert_eq!(top.value(), &StateValue::from("A"));
    assert_eq!((top.start(), top.end()), (2, 19));

    let depth = ss.query_single_state(9, base).unwrap();
    assert_eq!(depth.value(), &StateValue::Int(4));
}

// ============================================================================
// Attribute tree
// ============================================================================

#[test]
fn test_attribute_navigation() {
    let ss = in_memory(0);
    let status = ss.quark_absolute_and_add(&["CPUs", "0", "Status"]).unwrap();
    let cpu0 = ss.quark_absolute(&["CPUs", "0"]).unwrap();
    let cpu1 = ss.quark_relative_and_add(ss.quark_absolute(&["CPUs"]).unwrap(), &["1"]).unwrap();

    assert_eq!(ss.nb_attributes().unwrap(), 4);
    assert_eq!(ss.attribute_name(status).unwrap(), "Status");
    assert_eq!(ss.full_attribute_path(status).unwrap(), "CPUs/0/Status");
    assert_eq!(ss.parent_attribute_quark(status).unwrap(), Some(cpu0));
    assert_eq!(ss.quark_relative(cpu0, &["Status"]).unwrap(), status);
    assert_eq!(ss.opt_quark_absolute(&["CPUs", "7"]).unwrap(), None);
    assert!(matches!(
        ss.quark_absolute(&["CPUs", "7"]),
        Err(StateError::AttributeNotFound(_))
    ));

    let cpus = ss.quark_absolute(&["CPUs"]).unwrap();
    assert_eq!(ss.sub_attributes(Some(cpus), false).unwrap(), vec![cpu0, cpu1]);
    assert_eq!(ss.sub_attributes(Some(cpus), true).unwrap().len(), 3);
    assert_eq!(ss.child_quarks(Some(cpus), "*", false).unwrap(), vec![cpu0, cpu1]);
    assert_eq!(ss.child_quarks(None, "Stat*", true).unwrap(), vec![status]);
}

#[test]
fn test_quark_patterns() {
    let ss = in_memory(0);
    let mut statuses = Vec::new();
    for tid in ["10", "11", "12"] {
        statuses.push(ss.quark_absolute_and_add(&["Threads", tid, "Status"]).unwrap());
        ss.quark_absolute_and_add(&["Threads", tid, "Prio"]).unwrap();
    }

    assert_eq!(ss.quarks(&["Threads", WILDCARD, "Status"]).unwrap(), statuses);
    assert_eq!(ss.quarks(&["Threads", WILDCARD, WILDCARD]).unwrap().len(), 6);

    let threads = ss.quark_absolute(&["Threads"]).unwrap();
    assert_eq!(
        ss.quarks_from(Some(statuses[0]), &[PARENT, PARENT, "12", "Status"])
            .unwrap(),
        vec![statuses[2]]
    );
    assert_eq!(ss.quarks_from(Some(statuses[1]), &[PARENT, PARENT]).unwrap(), vec![threads]);
    assert!(ss.quarks(&["Processes", WILDCARD]).unwrap().is_empty());
}

// ============================================================================
// Building and queries
// ============================================================================

#[test]
fn test_queries_while_building() {
    let ss = in_memory(100);
    let quark = ss.quark_absolute_and_add(&["cpu"]).unwrap();
    ss.modify_attribute(150, StateValue::from("busy"), quark).unwrap();
    ss.modify_attribute(200, StateValue::from("idle"), quark).unwrap();
    assert_eq!(ss.current_end_time(), 200);

    let committed = ss.query_single_state(120, quark).unwrap();
    assert_eq!((committed.start(), committed.end()), (100, 149));
    let ongoing = ss.query_single_state(200, quark).unwrap();
    assert_eq!(ongoing.value(), &StateValue::from("idle"));
    assert_eq!(ss.ongoing_start_time(quark).unwrap(), 200);

    assert!(matches!(
        ss.query_single_state(201, quark),
        Err(StateError::TimeRange { .. })
    ));
    assert!(matches!(
        ss.modify_attribute(50, StateValue::Null, quark),
        Err(StateError::TimeRange { .. })
    ));
    assert!(matches!(
        ss.query_single_state(150, 99),
        Err(StateError::AttributeNotFound(_))
    ));
}

#[test]
fn test_update_ongoing_state() {
    let ss = in_memory(0);
    let quark = ss.quark_absolute_and_add(&["a"]).unwrap();
    ss.modify_attribute(10, StateValue::Int(1), quark).unwrap();
    ss.update_ongoing_state(StateValue::Int(2), quark).unwrap();
    assert_eq!(ss.ongoing_start_time(quark).unwrap(), 10);

    ss.close_history(20).unwrap();
    let interval = ss.query_single_state(15, quark).unwrap();
    assert_eq!((interval.start(), interval.end()), (10, 20));
    assert_eq!(interval.value(), &StateValue::Int(2));
}

#[test]
fn test_full_state_and_ranges() {
    let ss = in_memory(0);
    let quarks: Vec<u32> = (0..5)
        .map(|i| ss.quark_absolute_and_add(&["attr", &i.to_string()]).unwrap())
        .collect();
    for t in (10..=100).step_by(10) {
        for (i, &quark) in quarks.iter().enumerate() {
            ss.modify_attribute(t + i as i64, StateValue::Long(t), quark)
                .unwrap();
        }
    }

    // While building, the full state merges committed and ongoing values.
    let state = ss.query_full_state(55).unwrap();
    assert_eq!(state.len(), ss.nb_attributes().unwrap());
    for interval in &state {
        assert!(interval.intersects(55));
    }

    ss.close_history(200).unwrap();
    assert!(ss.is_built());
    assert_eq!(ss.current_end_time(), 200);

    let history = ss.query_history_range(quarks[2], 0, 200, None, None).unwrap();
    assert_eq!(history.len(), 11);
    assert_eq!(history.first().unwrap().start(), 0);
    assert_eq!(history.last().unwrap().end(), 200);
    for pair in history.windows(2) {
        assert_eq!(pair[0].end() + 1, pair[1].start());
    }

    let grid = ss.query_2d(&quarks[..2], 40, 60).unwrap();
    assert_eq!(grid.len(), 6);
    assert!(grid[..3].iter().all(|iv| iv.attribute() == quarks[0]));
}

#[test]
fn test_wait_until_built() {
    let ss = Arc::new(in_memory(0));
    let quark = ss.quark_absolute_and_add(&["a"]).unwrap();
    assert!(!ss.wait_until_built_timeout(Duration::from_millis(10)));

    let waiter = {
        let ss = Arc::clone(&ss);
        thread::spawn(move || {
            ss.wait_until_built();
            ss.query_single_state(5, quark).unwrap()
        })
    };
    ss.modify_attribute(3, StateValue::Int(1), quark).unwrap();
    ss.close_history(10).unwrap();

    let interval = waiter.join().unwrap();
    assert_eq!(interval.value(), &StateValue::Int(1));
    assert!(ss.wait_until_built_timeout(Duration::from_millis(10)));
}

// ============================================================================
// Persistence
// ============================================================================

fn build_trace(ss: &StateSystem) {
    for cpu in 0..4 {
        let quark = ss
            .quark_absolute_and_add(&["CPUs", &cpu.to_string(), "Status"])
            .unwrap();
        for t in (0..1000).step_by(25) {
            let value = if (t / 25 + cpu) % 2 == 0 { "idle" } else { "busy" };
            ss.modify_attribute(t, StateValue::from(value), quark).unwrap();
        }
    }
    let stack = ss.quark_absolute_and_add(&["Stack"]).unwrap();
    ss.push_attribute(100, StateValue::from("main"), stack).unwrap();
    ss.push_attribute(200, StateValue::from("work"), stack).unwrap();
    ss.close_history(1000).unwrap();
}

fn check_trace(ss: &StateSystem) {
    for cpu in 0..4 {
        let quark = ss.quark_absolute(&["CPUs", &cpu.to_string(), "Status"]).unwrap();
        let interval = ss.query_single_state(530, quark).unwrap();
        let expected = if (525 / 25 + cpu) % 2 == 0 { "idle" } else { "busy" };
        assert_eq!(interval.value(), &StateValue::from(expected));
        assert_eq!((interval.start(), interval.end()), (525, 549));
    }
    let stack = ss.quark_absolute(&["Stack"]).unwrap();
    let top = ss.query_single_stack_top(500, stack).unwrap().unwrap();
    assert_eq!(top.value(), &StateValue::from("work"));
    assert_eq!(ss.query_full_state(1000).unwrap().len(), ss.nb_attributes().unwrap());
}

#[test]
fn test_reopen_history_tree() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("trace.ht");
    let config = HistoryTreeConfig::new(&path, 2, 0).with_block_size(4096);

    let ss = StateSystem::new(HistoryTreeBackend::new_for_building(config).unwrap());
    build_trace(&ss);
    check_trace(&ss);
    let nb_attributes = ss.nb_attributes().unwrap();
    ss.dispose();
    assert!(path.exists());

    let reopened = StateSystem::open_existing(&path, ProviderVersionCheck::Exact(2)).unwrap();
    assert!(reopened.is_built());
    assert_eq!(reopened.nb_attributes().unwrap(), nb_attributes);
    assert_eq!(reopened.current_end_time(), 1000);
    check_trace(&reopened);
    assert!(matches!(
        reopened.modify_attribute(1001, StateValue::Null, 0),
        Err(StateError::BuildingFinished)
    ));

    assert!(matches!(
        StateSystem::open_existing(&path, ProviderVersionCheck::Exact(9)),
        Err(StateError::ProviderVersionMismatch { .. })
    ));
}

#[test]
fn test_reopen_threaded_history_tree() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("threaded.ht");
    let config = HistoryTreeConfig::new(&path, 2, 0).with_block_size(4096);
    let backend =
        ThreadedHistoryTreeBackend::new_for_building(config, ThreadedConfig::default()).unwrap();

    let ss = StateSystem::new(backend);
    assert!(matches!(ss.backend(), Backend::Threaded(_)));
    build_trace(&ss);
    check_trace(&ss);
    ss.dispose();

    let reopened = StateSystem::open_existing(&path, ProviderVersionCheck::Exact(2)).unwrap();
    check_trace(&reopened);
}

#[test]
fn test_dispose_before_close_removes_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("partial.ht");
    let config = HistoryTreeConfig::new(&path, 1, 0);
    let ss = StateSystem::new(HistoryTreeBackend::new_for_building(config).unwrap());
    let quark = ss.quark_absolute_and_add(&["a"]).unwrap();
    ss.modify_attribute(10, StateValue::Int(1), quark).unwrap();

    ss.dispose();
    assert!(!path.exists());
    assert!(matches!(ss.query_full_state(5), Err(StateError::Disposed)));
}
