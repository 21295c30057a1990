//! Sampled reuse stacks.
//!
//! Instead of tracking every block, a sampled stack tracks a handful of sample blocks. Each sample
//! remembers the set of distinct blocks referenced since it started; the sample's distance is the
//! size of that set (plus holes left by invalidations) when the sample block is referenced again.
//!
//! # Trackers
//!
//! - `SampledStack`: Per-thread samples with coherence invalidation.
//! - `SharedSampledStack`: One sample map fed by every thread.

/// Private-semantics sampled stack.
pub mod private;

/// Shared-semantics sampled stack.
pub mod shared;

/// Random sampling intervals.
pub mod trigger;

use std::collections::HashSet;

use crate::common::{Distance, RdaError, Result};
use crate::report::SampledReport;

pub use private::SampledStack;
pub use shared::SharedSampledStack;
pub use trigger::SampleTrigger;

/// Live state of one sample.
#[derive(Clone, Debug, Default)]
pub(crate) struct Sample {
    pub(crate) set: HashSet<u64>,
    pub(crate) holes: u64,
    pub(crate) lifetime: u64,
    pub(crate) pc: u64,
}

impl Sample {
    pub(crate) fn new(pc: u64) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }

    /// Distance if the sample block were referenced now.
    pub(crate) fn distance(&self) -> u64 {
        self.set.len() as u64 + self.holes
    }

    /// Records a reference to `block`, filling a hole if the block is new to the set.
    pub(crate) fn record(&mut self, block: u64) -> Result<()> {
        self.lifetime += 1;
        if !self.set.contains(&block) {
            if self.holes > 0 {
                self.holes -= 1;
            }
            self.set
                .try_reserve(1)
                .map_err(|e| RdaError::allocation("sample set", e))?;
            let _ = self.set.insert(block);
        }
        Ok(())
    }

    pub(crate) fn view(&self) -> SampleView {
        SampleView {
            set_len: self.set.len(),
            holes: self.holes,
            lifetime: self.lifetime,
        }
    }
}

/// Read-only snapshot of a live sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleView {
    /// Distinct blocks referenced since the sample started.
    pub set_len: usize,
    /// Blocks removed from the set by remote writes and not yet refilled.
    pub holes: u64,
    /// References observed while the sample was live.
    pub lifetime: u64,
}

/// Samples flushed by [`SampleTracker::record_leftovers`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Leftovers {
    /// Samples recorded as cold misses.
    pub count: u64,
    /// Sum of their set sizes at flush time.
    pub distance: u64,
}

/// Interface shared by the single-owner sampled stacks.
pub trait SampleTracker: Send {
    /// Prepares per-thread state for `thread`, resetting it if it already existed.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Allocation`] if the thread table cannot grow.
    fn allocate(&mut self, thread: usize) -> Result<()>;

    /// Starts sampling the block of `address` on behalf of `thread`.
    ///
    /// Ignored while disabled or if the block is already sampled.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Allocation`] if the sample map cannot grow.
    fn new_sample(&mut self, address: u64, thread: usize, pc: u64) -> Result<()>;

    /// Records a reference and finalizes every sample it ends.
    ///
    /// # Returns
    ///
    /// `true` when no sample is tracked by any thread afterwards.
    ///
    /// # Errors
    ///
    /// Propagates statistics and allocation errors.
    fn access(&mut self, address: u64, thread: usize, pc: u64, is_write: bool) -> Result<bool>;

    /// Enables or disables sampling globally.
    fn set_enabled(&mut self, enabled: bool);

    /// Enables or disables sampling for one thread.
    fn set_thread_enabled(&mut self, thread: usize, enabled: bool);

    /// Finalizes every live sample as a cold miss.
    ///
    /// # Errors
    ///
    /// Propagates statistics errors.
    fn record_leftovers(&mut self) -> Result<Leftovers>;

    /// Samples currently tracked by all threads.
    fn tracked_samples(&self) -> usize;

    /// Distance of the most recently finalized sample.
    fn last_distance(&self) -> Option<Distance>;

    /// Serializable summary.
    fn report(&self) -> SampledReport;
}
