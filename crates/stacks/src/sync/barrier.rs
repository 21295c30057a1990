//! Spinning three-stage barrier with sleep/wake.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{SyncBarrier, spin_while};
use crate::common::constants::STAGE_COUNT;
use crate::common::{RdaError, Result};

/// Iterations between consistency checks while waiting in a stage.
const CONSISTENCY_INTERVAL: u64 = 10_000;

#[derive(Debug)]
struct BarrierState {
    /// Participants of the current round.
    threads: usize,
    /// Participants of the next round.
    next_threads: usize,
    count: [usize; STAGE_COUNT],
    awake: Vec<bool>,
    generations: Vec<u64>,
    total: usize,
}

/// Barrier where waiters spin on atomics and bookkeeping lives under a mutex.
pub struct MultistageBarrier {
    state: Mutex<BarrierState>,
    stage: AtomicUsize,
    generation: AtomicU64,
    max_threads: usize,
}

impl MultistageBarrier {
    /// Creates a barrier for at most `max_threads` threads.
    pub fn new(max_threads: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                threads: 0,
                next_threads: 0,
                count: [0; STAGE_COUNT],
                awake: vec![false; max_threads],
                generations: vec![0; max_threads],
                total: 0,
            }),
            stage: AtomicUsize::new(0),
            generation: AtomicU64::new(1),
            max_threads,
        }
    }

    /// Current generation (starts at 1).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current stage.
    pub fn stage(&self) -> usize {
        self.stage.load(Ordering::Acquire)
    }

    /// Registered threads.
    pub fn total_threads(&self) -> usize {
        self.state.lock().total
    }

    fn wait_for_end(&self, generation: u64) {
        spin_while(|| self.generation.load(Ordering::Acquire) == generation, 0, || {});
    }

    /// Releases the lock and waits for the barrier to become idle, then re-locks.
    fn wait_idle(&self) -> parking_lot::MutexGuard<'_, BarrierState> {
        let mut state = self.state.lock();
        while self.stage.load(Ordering::Acquire) > 0 || state.count[0] > 0 {
            let generation = self.generation.load(Ordering::Acquire);
            drop(state);
            self.wait_for_end(generation);
            state = self.state.lock();
        }
        state
    }

    fn check_consistency(&self) {
        let state = self.state.lock();
        let arrived: usize = state.count.iter().sum();
        assert!(
            arrived <= state.threads,
            "barrier arrivals {arrived} exceed participating threads {}",
            state.threads
        );
    }
}

impl fmt::Debug for MultistageBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultistageBarrier")
            .field("stage", &self.stage())
            .field("generation", &self.generation())
            .field("max_threads", &self.max_threads)
            .finish_non_exhaustive()
    }
}

impl SyncBarrier for MultistageBarrier {
    fn add_thread(&self) -> Result<usize> {
        let mut state = self.wait_idle();
        if state.total == self.max_threads {
            return Err(RdaError::TooManyThreads {
                max: self.max_threads,
            });
        }
        let tid = state.total;
        state.total += 1;
        state.next_threads += 1;
        state.awake[tid] = true;
        state.generations[tid] = self.generation.load(Ordering::Acquire);
        Ok(tid)
    }

    fn wait_start(&self, tid: usize) -> u64 {
        let mut state = self.state.lock();
        let generation = self.generation.load(Ordering::Acquire);
        state.generations[tid] = generation;
        if !state.awake[tid] {
            drop(state);
            self.wait_for_end(generation);
            return 0;
        }
        assert!(
            self.stage.load(Ordering::Acquire) == 0 && state.count[1] == 0 && state.count[2] == 0,
            "barrier entered while a round is in progress"
        );
        if state.count[0] == 0 {
            state.threads = state.next_threads;
        }
        state.count[0] += 1;
        if state.count[0] == state.threads {
            state.count[0] = 0;
            self.stage.store(1, Ordering::Release);
            drop(state);
        } else {
            drop(state);
            spin_while(|| self.stage.load(Ordering::Acquire) == 0, 0, || {});
        }
        generation
    }

    fn wait_stage(&self, stage: usize, tid: usize) {
        assert!(
            stage != 0 && stage < STAGE_COUNT,
            "invalid barrier stage {stage}"
        );
        let mut state = self.state.lock();
        assert!(state.awake[tid], "thread {tid} waited on the barrier while asleep");
        let current = self.stage.load(Ordering::Acquire);
        assert_eq!(current, stage, "thread {tid} waited on stage {stage} during stage {current}");
        state.generations[tid] = self.generation.load(Ordering::Acquire);
        state.count[stage] += 1;
        if state.count[stage] == state.threads {
            state.count[stage] = 0;
            if stage + 1 == STAGE_COUNT {
                self.stage.store(0, Ordering::Release);
                let _ = self.generation.fetch_add(1, Ordering::AcqRel);
            } else {
                self.stage.store(stage + 1, Ordering::Release);
            }
            drop(state);
        } else {
            drop(state);
            spin_while(
                || self.stage.load(Ordering::Acquire) == stage,
                CONSISTENCY_INTERVAL,
                || self.check_consistency(),
            );
        }
    }

    fn sleep(&self, tid: usize) {
        let mut state = self.state.lock();
        let stage = self.stage.load(Ordering::Acquire);
        assert!(stage == 0, "thread {tid} went to sleep during barrier stage {stage}");
        state.next_threads -= 1;
        state.awake[tid] = false;
        // Threads already waiting at stage 0 may have been waiting only for this one.
        if state.count[0] != 0 {
            state.threads -= 1;
            if state.count[0] == state.threads {
                state.count[0] = 0;
                self.stage.store(1, Ordering::Release);
            }
        }
        state.generations[tid] = self.generation.load(Ordering::Acquire);
    }

    fn wake(&self, tid: usize) -> u64 {
        assert!(!self.state.lock().awake[tid], "recursive wake of thread {tid}");
        let mut state = self.wait_idle();
        state.next_threads += 1;
        state.awake[tid] = true;
        self.generation.load(Ordering::Acquire) - state.generations[tid]
    }

    fn adjacent_sleepers(&self, tid: usize) -> usize {
        let state = self.state.lock();
        let total = state.total.max(1);
        let mut next = (tid + 1) % total;
        while next != tid {
            if state.awake[next] {
                return next;
            }
            next = (next + 1) % total;
        }
        assert!(
            state.threads <= 1 || state.next_threads <= 1,
            "thread {tid} wrapped around the sleepers without finding itself awake"
        );
        tid
    }
}
