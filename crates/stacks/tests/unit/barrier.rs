//! Barrier Tests.
//!
//! Verifies that the three-stage barrier orders work across threads, that sleeping threads
//! drop out of rounds and count the rounds they missed, and that misuse panics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rda_stacks::RdaError;
use rda_stacks::sync::{MultistageBarrier, SerialBarrier, SyncBarrier};

const THREADS: usize = 4;
const LOOPS: usize = 5;

fn barrier_with(threads: usize) -> Arc<MultistageBarrier> {
    let barrier = Arc::new(MultistageBarrier::new(THREADS));
    for expected in 0..threads {
        assert_eq!(barrier.add_thread().unwrap(), expected);
    }
    barrier
}

/// One round: the thread at each stage position bumps the counter, and everyone sees the
/// previous stage's increment before moving on.
fn round(barrier: &MultistageBarrier, counter: &AtomicU64, tid: usize, i: usize, n: usize) {
    let before = counter.load(Ordering::Acquire);
    let _ = barrier.wait_start(tid);
    if tid == (1 + i) % n {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
    }
    barrier.wait_stage(1, tid);
    assert!(counter.load(Ordering::Acquire) > before);
    if tid == (2 + i) % n {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
    }
    barrier.wait_stage(2, tid);
    if tid == (3 + i) % n {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
    }
}

// ══════════════════════════════════════════════════════════
// 1. Rounds
// ══════════════════════════════════════════════════════════

/// Four threads run five rounds; three increments per round.
#[test]
fn rounds_order_stage_work() {
    let barrier = barrier_with(THREADS);
    let counter = AtomicU64::new(0);
    std::thread::scope(|s| {
        for tid in 0..THREADS {
            let barrier = &barrier;
            let counter = &counter;
            let _ = s.spawn(move || {
                for i in 0..LOOPS {
                    round(barrier, counter, tid, i, THREADS);
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::Acquire), 3 * LOOPS as u64);
    assert_eq!(barrier.generation(), 1 + LOOPS as u64);
    assert_eq!(barrier.stage(), 0);
}

/// The last thread sleeps, wakes once, and sleeps again while the others run their rounds;
/// its wake reports the rounds it missed.
#[test]
fn sleeping_thread_misses_rounds() {
    let barrier = barrier_with(THREADS);
    let counter = AtomicU64::new(0);
    let missed = AtomicU64::new(0);
    std::thread::scope(|s| {
        for tid in 0..THREADS - 1 {
            let barrier = &barrier;
            let counter = &counter;
            let _ = s.spawn(move || {
                for i in 0..LOOPS {
                    round(barrier, counter, tid, i, THREADS - 1);
                }
            });
        }
        let barrier = &barrier;
        let missed = &missed;
        let _ = s.spawn(move || {
            let sleeper = THREADS - 1;
            barrier.sleep(sleeper);
            let woke = barrier.wake(sleeper);
            let _ = missed.fetch_add(woke, Ordering::AcqRel);
            barrier.sleep(sleeper);
        });
    });
    assert_eq!(counter.load(Ordering::Acquire), 3 * LOOPS as u64);
    assert!(missed.load(Ordering::Acquire) <= LOOPS as u64);
}

// ══════════════════════════════════════════════════════════
// 2. Sleepers
// ══════════════════════════════════════════════════════════

/// The adjacent awake thread skips sleepers and wraps around.
#[test]
fn adjacent_sleepers_skip_sleeping_threads() {
    let barrier = barrier_with(THREADS);
    assert_eq!(barrier.adjacent_sleepers(0), 1);
    barrier.sleep(1);
    barrier.sleep(2);
    assert_eq!(barrier.adjacent_sleepers(0), 3);
    assert_eq!(barrier.adjacent_sleepers(3), 0);
    let _ = barrier.wake(2);
    assert_eq!(barrier.adjacent_sleepers(0), 2);
}

/// A lone awake thread is its own neighbour.
#[test]
fn lone_thread_is_adjacent_to_itself() {
    let barrier = barrier_with(1);
    assert_eq!(barrier.adjacent_sleepers(0), 0);
    assert_eq!(barrier.wait_start(0), 1);
    barrier.wait_stage(1, 0);
    barrier.wait_stage(2, 0);
    assert_eq!(barrier.generation(), 2);
}

/// A sleeping thread entering a round gets generation 0 once the awake thread finishes one.
#[test]
fn sleeping_thread_start_returns_zero() {
    let barrier = barrier_with(2);
    barrier.sleep(1);
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        let (b, d) = (&barrier, &done);
        let _ = s.spawn(move || {
            while !d.load(Ordering::Acquire) {
                assert!(b.wait_start(0) > 0);
                b.wait_stage(1, 0);
                b.wait_stage(2, 0);
            }
        });
        assert_eq!(barrier.wait_start(1), 0);
        done.store(true, Ordering::Release);
    });
    assert!(barrier.wake(1) >= 1);
}

// ══════════════════════════════════════════════════════════
// 3. Misuse
// ══════════════════════════════════════════════════════════

/// Waking an awake thread panics.
#[test]
#[should_panic(expected = "recursive wake")]
fn recursive_wake_panics() {
    let barrier = barrier_with(2);
    let _ = barrier.wake(0);
}

/// Stage 0 is entered with `wait_start`, never `wait_stage`.
#[test]
#[should_panic(expected = "invalid barrier stage")]
fn stage_zero_wait_panics() {
    let barrier = barrier_with(1);
    barrier.wait_stage(0, 0);
}

/// Registering past the limit fails for both barriers.
#[test]
fn too_many_threads() {
    let barrier = barrier_with(THREADS);
    assert!(matches!(
        barrier.add_thread(),
        Err(RdaError::TooManyThreads { max: THREADS })
    ));
    assert_eq!(barrier.total_threads(), THREADS);

    let serial = SerialBarrier::new(1);
    assert_eq!(serial.add_thread().unwrap(), 0);
    assert!(matches!(
        serial.add_thread(),
        Err(RdaError::TooManyThreads { max: 1 })
    ));
    assert_eq!(serial.adjacent_sleepers(0), 0);
}
