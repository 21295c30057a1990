//! Thread synchronization for the parallel sampled stack.
//!
//! A synchronization round has three stages. Every awake thread calls `wait_start`, does its
//! stage-0 work, calls `wait_stage(1)`, does its stage-1 work, and calls `wait_stage(2)`. No
//! thread leaves a stage before every participant has arrived, so the work of one stage sees the
//! completed work of the previous stage on every thread.
//!
//! Threads blocked in a system call go to sleep and drop out of the rounds; the next awake
//! thread (see [`SyncBarrier::adjacent_sleepers`]) does their share of the work.

/// Spinning three-stage barrier.
pub mod barrier;

/// No-op barrier for single-OS-thread driving.
pub mod serial;

pub use barrier::MultistageBarrier;
pub use serial::SerialBarrier;

use crate::common::Result;

/// Spins before yielding the processor.
const SPIN_LIMIT: u32 = 1000;

/// Busy-waits while `cond` holds, yielding after a spin phase. `check` runs every
/// `check_every` iterations (0 disables it).
pub(crate) fn spin_while(mut cond: impl FnMut() -> bool, check_every: u64, mut check: impl FnMut()) {
    let mut spins = 0u32;
    let mut iterations = 0u64;
    while cond() {
        if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        iterations += 1;
        if check_every != 0 && iterations % check_every == 0 {
            check();
        }
    }
}

/// Barrier interface used by the parallel engine.
///
/// Stage numbers passed to [`wait_stage`](Self::wait_stage) are 1 and 2; stage 0 is entered
/// with [`wait_start`](Self::wait_start).
pub trait SyncBarrier: Send + Sync {
    /// Registers the next thread and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::TooManyThreads`](crate::RdaError::TooManyThreads) once the barrier
    /// is full.
    fn add_thread(&self) -> Result<usize>;

    /// Enters a round.
    ///
    /// # Returns
    ///
    /// The round's generation, or 0 if the caller is asleep (after the current round ended).
    fn wait_start(&self, tid: usize) -> u64;

    /// Waits until every participant has finished `stage`.
    fn wait_stage(&self, stage: usize, tid: usize);

    /// Removes `tid` from future rounds.
    fn sleep(&self, tid: usize);

    /// Returns `tid` to the rounds once the barrier is idle.
    ///
    /// # Returns
    ///
    /// Rounds completed while `tid` was asleep.
    fn wake(&self, tid: usize) -> u64;

    /// The next awake thread after `tid` (circular), or `tid` when it is the only one.
    fn adjacent_sleepers(&self, tid: usize) -> usize;
}
