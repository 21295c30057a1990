//! Trace Tests.
//!
//! Verifies the text event format, reading and writing trace files, and replaying traces into
//! the single-owner and parallel sampled stacks.

use std::io::Write;

use pretty_assertions::assert_eq;
use rda_stacks::config::Semantics;
use rda_stacks::sampled::{SampleTracker, SampledStack, SharedSampledStack};
use rda_stacks::trace::{TraceEvent, read_trace, replay, replay_parallel, write_trace};
use rda_stacks::{Distance, ParallelEngine, RdaError};
use rstest::rstest;
use tempfile::NamedTempFile;

use crate::common::{SAMPLE_ADDRESS, block_address, serial_config};

fn sample_then_reuse(blocks: u64) -> Vec<TraceEvent> {
    let mut events = vec![TraceEvent::NewSample {
        thread: 0,
        address: SAMPLE_ADDRESS,
    }];
    events.extend((0..blocks).map(|i| TraceEvent::Access {
        thread: 0,
        address: block_address(i),
        is_write: false,
    }));
    events.push(TraceEvent::Access {
        thread: 0,
        address: SAMPLE_ADDRESS,
        is_write: false,
    });
    events
}

// ══════════════════════════════════════════════════════════
// 1. Event Format
// ══════════════════════════════════════════════════════════

/// Each event kind parses from and prints to its line form.
#[rstest]
#[case("N 0 3200", TraceEvent::NewSample { thread: 0, address: 0x3200 })]
#[case("A 2 ff40 w", TraceEvent::Access { thread: 2, address: 0xff40, is_write: true })]
#[case("A 1 0 r", TraceEvent::Access { thread: 1, address: 0, is_write: false })]
#[case("M 3", TraceEvent::Merge { thread: 3 })]
#[case("E 1 f", TraceEvent::Enable { thread: 1, enabled: false })]
fn line_format(#[case] line: &str, #[case] event: TraceEvent) {
    assert_eq!(line.parse::<TraceEvent>().unwrap(), event);
    assert_eq!(event.to_string(), line);
}

/// A `0x` prefix on addresses is accepted.
#[test]
fn hex_prefix_is_accepted() {
    assert_eq!(
        "N 0 0x40".parse::<TraceEvent>().unwrap(),
        TraceEvent::NewSample {
            thread: 0,
            address: 0x40
        }
    );
}

/// Malformed lines are rejected.
#[rstest]
#[case::unknown_kind("X 0 40")]
#[case::missing_thread("A")]
#[case::bad_thread("A x 40 r")]
#[case::missing_address("N 0")]
#[case::bad_access_type("A 0 40 x")]
#[case::bad_flag("E 0 yes")]
#[case::trailing("M 0 1")]
fn malformed_lines(#[case] line: &str) {
    assert!(matches!(
        line.parse::<TraceEvent>(),
        Err(RdaError::Trace { line: 1, .. })
    ));
}

// ══════════════════════════════════════════════════════════
// 2. Trace Files
// ══════════════════════════════════════════════════════════

/// Written traces read back unchanged.
#[test]
fn write_then_read() {
    let events = sample_then_reuse(5);
    let file = NamedTempFile::new().unwrap();
    write_trace(file.path(), &events).unwrap();
    assert_eq!(read_trace(file.path()).unwrap(), events);
}

/// Comments and blank lines are skipped; errors name the file line.
#[test]
fn read_skips_comments_and_reports_lines() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# sample trace\n\nN 0 40\n  A 0 80 r  \n").unwrap();
    file.flush().unwrap();
    assert_eq!(read_trace(file.path()).unwrap().len(), 2);

    writeln!(file, "A 0 zz r").unwrap();
    file.flush().unwrap();
    match read_trace(file.path()) {
        Err(RdaError::Trace { line, message }) => {
            assert_eq!(line, 6);
            assert!(message.contains("zz"), "{message}");
        }
        other => panic!("expected a trace error, got {other:?}"),
    }
}

/// A missing file is an I/O error.
#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        read_trace(dir.path().join("absent.trace")),
        Err(RdaError::Io(_))
    ));
}

// ══════════════════════════════════════════════════════════
// 3. Replay
// ══════════════════════════════════════════════════════════

/// Replaying into both single-owner stacks gives the same distance.
#[test]
fn replay_into_trackers() {
    let config = serial_config(Semantics::Private);
    let events = sample_then_reuse(7);
    let mut trackers: Vec<Box<dyn SampleTracker>> = vec![
        Box::new(SampledStack::new(&config).unwrap()),
        Box::new(SharedSampledStack::new(&config).unwrap()),
    ];
    for tracker in &mut trackers {
        tracker.allocate(0).unwrap();
        assert_eq!(replay(tracker.as_mut(), &events).unwrap(), 1);
        assert_eq!(tracker.last_distance(), Some(Distance::Finite(7)));
    }
}

/// A recorded sampled-stack trace replays to the same statistics.
#[test]
fn recorded_trace_replays_identically() {
    let config = serial_config(Semantics::Private);
    let mut original = SampledStack::new(&config).unwrap();
    original.allocate(0).unwrap();
    original.allocate(1).unwrap();
    original.record_trace();
    let _ = replay(&mut original, &sample_then_reuse(4)).unwrap();
    original.new_sample(0, 1, 0).unwrap();
    let _ = original.access(0x1000, 1, 0, false).unwrap();
    let _ = original.access(0, 0, 0, true).unwrap();

    let events = original.trace_events().unwrap().to_vec();
    let mut copy = SampledStack::new(&config).unwrap();
    copy.allocate(0).unwrap();
    copy.allocate(1).unwrap();
    let _ = replay(&mut copy, &events).unwrap();
    assert_eq!(copy.tracked_samples(), original.tracked_samples());
    assert_eq!(copy.last_distance(), Some(Distance::InvalidationMiss));
    assert_eq!(copy.report().invalidation_count, original.report().invalidation_count);
}

/// Parallel replay drives every handle from one thread, including merges.
#[test]
fn replay_into_parallel_handles() {
    let engine = ParallelEngine::new(&serial_config(Semantics::Private)).unwrap();
    let mut handles = vec![
        engine.register_thread(0).unwrap(),
        engine.register_thread(1).unwrap(),
    ];
    let mut events = sample_then_reuse(6);
    let reuse = events.pop().unwrap();
    events.push(TraceEvent::Access {
        thread: 1,
        address: block_address(0),
        is_write: true,
    });
    events.push(TraceEvent::Merge { thread: 1 });
    events.push(reuse);

    assert_eq!(replay_parallel(&mut handles, &events).unwrap(), 1);
    assert_eq!(engine.last_finalized(), Some(Distance::Finite(6)));
    assert_eq!(engine.active_samples(), 0);
}

/// An event for an unregistered thread names its position in the trace.
#[test]
fn replay_parallel_rejects_unknown_thread() {
    let engine = ParallelEngine::new(&serial_config(Semantics::Private)).unwrap();
    let mut handles = vec![engine.register_thread(0).unwrap()];
    let events = [
        TraceEvent::Access {
            thread: 0,
            address: 0,
            is_write: false,
        },
        TraceEvent::Merge { thread: 3 },
    ];
    assert!(matches!(
        replay_parallel(&mut handles, &events),
        Err(RdaError::Trace { line: 2, .. })
    ));
}
