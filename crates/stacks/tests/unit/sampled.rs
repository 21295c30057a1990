//! Sampled Stack Tests.
//!
//! Verifies the single-owner sampled stacks:
//! - Private semantics: per-thread samples, holes from remote writes, hole fills, nesting.
//! - Shared semantics: every thread's references count toward every sample.
//! - The sampling trigger and leftover flushing.

use pretty_assertions::assert_eq;
use rda_stacks::Distance;
use rda_stacks::config::{Config, Semantics};
use rda_stacks::sampled::{
    Leftovers, SampleTrigger, SampleTracker, SampleView, SampledStack, SharedSampledStack,
};
use rda_stacks::trace::TraceEvent;

use crate::common::{
    ACCESS_COUNT, GRANULARITY, SAMPLE_ADDRESS, block_address, init_tracing, serial_config,
};

const THREADS: usize = 4;

fn private_stack() -> SampledStack {
    init_tracing();
    let mut stack = SampledStack::new(&serial_config(Semantics::Private)).unwrap();
    for t in 0..THREADS {
        stack.allocate(t).unwrap();
    }
    stack
}

fn shared_stack() -> SharedSampledStack {
    let mut stack = SharedSampledStack::new(&serial_config(Semantics::Shared)).unwrap();
    for t in 0..THREADS {
        stack.allocate(t).unwrap();
    }
    stack
}

fn view(set_len: usize, holes: u64) -> (usize, u64) {
    (set_len, holes)
}

fn shape(v: Option<SampleView>) -> Option<(usize, u64)> {
    v.map(|v| (v.set_len, v.holes))
}

/// Thread 0 reads blocks `0..ACCESS_COUNT` while thread 1 writes the even ones.
fn holes_prefix(stack: &mut SampledStack) {
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        assert!(!stack.access(block_address(i), 0, 0, false).unwrap());
        if i % 2 == 0 {
            assert!(!stack.access(block_address(i), 1, 0, true).unwrap());
        }
    }
}

// ══════════════════════════════════════════════════════════
// 1. Private Semantics
// ══════════════════════════════════════════════════════════

/// One sample, twenty distinct blocks, then reuse.
#[test]
fn one_thread_reuse() {
    let mut stack = private_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        assert!(!stack.access(block_address(i), 0, 0, false).unwrap());
    }
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
    assert_eq!(stack.tracked_samples(), 0);
}

/// A read and a write of each block count once.
#[test]
fn one_thread_read_and_write() {
    let mut stack = private_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
        let _ = stack.access(block_address(i), 0, 0, true).unwrap();
    }
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
}

/// Remote writes turn set entries into holes; the distance is unchanged.
#[test]
fn holes_without_fill() {
    let mut stack = private_stack();
    holes_prefix(&mut stack);
    assert_eq!(shape(stack.sample(0, SAMPLE_ADDRESS)), Some(view(10, 10)));
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
    assert_eq!(stack.invalidation_count(), 10);
}

/// New blocks fill holes before they grow the distance.
#[test]
fn holes_fill_half() {
    let mut stack = private_stack();
    holes_prefix(&mut stack);
    for i in (ACCESS_COUNT..2 * ACCESS_COUNT).filter(|i| i % 4 == 0) {
        let _ = stack.access(block_address(i) + 20, 0, 0, false).unwrap();
    }
    assert_eq!(shape(stack.sample(0, SAMPLE_ADDRESS)), Some(view(15, 5)));
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
}

/// Once every hole is filled the distance grows again.
#[test]
fn holes_fill_all() {
    let mut stack = private_stack();
    holes_prefix(&mut stack);
    for i in ACCESS_COUNT..2 * ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    assert_eq!(shape(stack.sample(0, SAMPLE_ADDRESS)), Some(view(30, 0)));
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(30)));
}

/// A sample started inside another finishes first; the outer one counts the inner block.
#[test]
fn nested_samples() {
    let mut stack = private_stack();
    let inner = SAMPLE_ADDRESS + 100 * GRANULARITY;
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    stack.new_sample(inner, 0, 0).unwrap();
    for i in ACCESS_COUNT..2 * ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    assert!(!stack.access(inner, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
    assert!(stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(2 * ACCESS_COUNT + 1)));
    assert_eq!(stack.addresses_per_sample_total(), 63);
}

/// A sample started inside another outlives it.
#[test]
fn overlapped_samples() {
    let mut stack = private_stack();
    let second = SAMPLE_ADDRESS + GRANULARITY;
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    stack.new_sample(second, 0, 0).unwrap();
    for i in ACCESS_COUNT..2 * ACCESS_COUNT {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    assert!(!stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(2 * ACCESS_COUNT)));
    let _ = stack.access(0, 0, 0, false).unwrap();
    assert!(stack.access(second, 0, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT + 2)));
    assert_eq!(stack.addresses_per_sample_total(), 64);
}

/// A remote write to the sample block ends the sample as an invalidation miss.
#[test]
fn remote_write_to_sample_block_invalidates() {
    let mut stack = private_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0x40).unwrap();
    let _ = stack.access(0, 0, 0, false).unwrap();
    assert!(stack.access(SAMPLE_ADDRESS, 2, 0x44, true).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::InvalidationMiss));
    assert_eq!(stack.stats(0).unwrap().invalidation_misses(), 1);
    assert_eq!(stack.pc_stats().samples(0x44), 1);
}

/// Samples past the distance limit are abandoned as cold misses.
#[test]
fn distance_limit_abandons_sample() {
    let mut config = Config::default();
    config.sampling.max_distance = 5;
    let mut stack = SampledStack::new(&config).unwrap();
    stack.allocate(0).unwrap();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    let mut idle = false;
    for i in 0..10 {
        idle = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    assert!(idle);
    assert_eq!(stack.limit_count(), 1);
    assert_eq!(stack.last_distance(), Some(Distance::ColdMiss));
}

/// Disabled threads neither sample nor count accesses.
#[test]
fn disabled_thread_is_ignored() {
    let mut stack = private_stack();
    stack.set_thread_enabled(1, false);
    stack.new_sample(SAMPLE_ADDRESS, 1, 0).unwrap();
    assert_eq!(stack.tracked_samples(), 0);

    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    stack.set_enabled(false);
    assert!(!stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap());
    assert_eq!(stack.tracked_samples(), 1);
}

/// Leftover samples are flushed as cold misses with their set sizes.
#[test]
fn leftovers_are_cold_misses() {
    let mut stack = private_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    stack.new_sample(SAMPLE_ADDRESS, 1, 0).unwrap();
    for i in 0..3 {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    let leftovers = stack.record_leftovers().unwrap();
    assert_eq!(leftovers, Leftovers { count: 2, distance: 3 });
    assert_eq!(stack.tracked_samples(), 0);
    assert_eq!(stack.stats(0).unwrap().cold_misses(), 1);
    assert_eq!(stack.stats(1).unwrap().cold_misses(), 1);
}

/// Recorded traces list every new sample, access, and enable change.
#[test]
fn trace_recording() {
    let mut stack = private_stack();
    stack.record_trace();
    stack.new_sample(SAMPLE_ADDRESS + 3, 0, 0).unwrap();
    let _ = stack.access(0x81, 1, 0, true).unwrap();
    stack.set_thread_enabled(1, false);
    assert_eq!(
        stack.trace_events().unwrap(),
        &[
            TraceEvent::NewSample {
                thread: 0,
                address: SAMPLE_ADDRESS,
            },
            TraceEvent::Access {
                thread: 1,
                address: 0x80,
                is_write: true,
            },
            TraceEvent::Enable {
                thread: 1,
                enabled: false,
            },
        ]
    );
}

/// The report lists one stack per thread and the lifetime average.
#[test]
fn private_report() {
    let mut stack = private_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..4 {
        let _ = stack.access(block_address(i), 0, 0, false).unwrap();
    }
    let _ = stack.access(SAMPLE_ADDRESS, 0, 0, false).unwrap();
    let report = stack.report();
    assert_eq!(report.stacks.len(), THREADS);
    assert_eq!(report.stacks[0].thread, Some(0));
    assert_eq!(report.stacks[0].sampled_addresses, 1);
    assert_eq!(report.sample_accesses, 5);
    assert_eq!(report.average_lifetime, Some(4.0));
}

// ══════════════════════════════════════════════════════════
// 2. Shared Semantics
// ══════════════════════════════════════════════════════════

/// References by every thread count toward one sample, and any thread ends it.
#[test]
fn shared_counts_every_thread() {
    let mut stack = shared_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    for i in 0..ACCESS_COUNT {
        let _ = stack.access(block_address(i), (i % 4) as usize, 0, i % 3 == 0).unwrap();
    }
    assert_eq!(shape(stack.sample(SAMPLE_ADDRESS)), Some(view(20, 0)));
    assert!(stack.access(SAMPLE_ADDRESS, 3, 0, false).unwrap());
    assert_eq!(stack.last_distance(), Some(Distance::Finite(ACCESS_COUNT)));
    assert_eq!(stack.stats().total_samples(), 1);
}

/// A block is sampled at most once across threads.
#[test]
fn shared_ignores_duplicate_samples() {
    let mut stack = shared_stack();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    stack.new_sample(SAMPLE_ADDRESS + 8, 2, 0).unwrap();
    assert_eq!(stack.tracked_samples(), 1);
    let leftovers = stack.record_leftovers().unwrap();
    assert_eq!(leftovers.count, 1);
    assert_eq!(stack.limit_count(), 1);
    assert_eq!(stack.report().stacks[0].thread, None);
}

/// Threads must be allocated before they sample.
#[test]
fn shared_requires_allocation() {
    let mut stack = SharedSampledStack::new(&Config::default()).unwrap();
    stack.new_sample(SAMPLE_ADDRESS, 0, 0).unwrap();
    assert_eq!(stack.tracked_samples(), 0);
}

// ══════════════════════════════════════════════════════════
// 3. Sampling Trigger
// ══════════════════════════════════════════════════════════

/// Intervals average out near the configured mean.
#[test]
fn trigger_fires_near_mean() {
    let mut trigger = SampleTrigger::new(50, 7).unwrap();
    assert_eq!(trigger.mean(), 50);
    let fired = (0..100_000).filter(|_| trigger.tick()).count();
    assert!((1_500..=2_500).contains(&fired), "fired {fired} times");
}
