//! Barrier for driving every thread from one OS thread.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::SyncBarrier;
use crate::common::{RdaError, Result};

/// Every wait returns immediately and each caller acts for all threads
/// (`adjacent_sleepers` returns the caller itself).
#[derive(Debug)]
pub struct SerialBarrier {
    total: AtomicUsize,
    max_threads: usize,
}

impl SerialBarrier {
    /// Creates a barrier for at most `max_threads` threads.
    pub const fn new(max_threads: usize) -> Self {
        Self {
            total: AtomicUsize::new(0),
            max_threads,
        }
    }
}

impl SyncBarrier for SerialBarrier {
    fn add_thread(&self) -> Result<usize> {
        let tid = self.total.fetch_add(1, Ordering::AcqRel);
        if tid >= self.max_threads {
            let _ = self.total.fetch_sub(1, Ordering::AcqRel);
            return Err(RdaError::TooManyThreads {
                max: self.max_threads,
            });
        }
        Ok(tid)
    }

    fn wait_start(&self, _tid: usize) -> u64 {
        1
    }

    fn wait_stage(&self, _stage: usize, _tid: usize) {}

    fn sleep(&self, _tid: usize) {}

    fn wake(&self, _tid: usize) -> u64 {
        1
    }

    fn adjacent_sleepers(&self, tid: usize) -> usize {
        tid
    }
}
