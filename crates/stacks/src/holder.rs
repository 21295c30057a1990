//! Per-thread reuse stacks behind one `access` call.
//!
//! The holder keeps, for every allocated thread:
//! - a **simulated** stack, where a write by any other thread invalidates the block;
//! - optionally a **single** stack that sees only the thread's own references;
//! - optionally a prefetch arbiter whose requests are prefetched into the simulated stack.
//!
//! An optional **shared** stack sees the references of every thread. Alongside it, threads are
//! paired (`thread / 2`) and each pair owns a stack that a write from outside the pair
//! invalidates. Distances returned by [`StackHolder::access`] come from the simulated stack and
//! feed the per-PC statistics.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::common::{Distance, Granularity, RdaError, Result};
use crate::config::{Config, StackConfig, StatsConfig};
use crate::prefetch::PrefetchArbiter;
use crate::report::{HolderPairReport, HolderReport, HolderThreadReport};
use crate::stack::{AccessKind, ReuseStack, StackImpl};
use crate::stats::PcStats;

#[derive(Debug)]
struct HolderThread {
    simulated: ReuseStack,
    single: Option<ReuseStack>,
    prefetcher: Option<PrefetchArbiter>,
    enabled: bool,
}

/// Multi-thread front door over [`ReuseStack`]s.
///
/// # Examples
///
/// ```
/// use rda_stacks::{Config, Distance, StackHolder};
///
/// let mut holder = StackHolder::new(&Config::default()).unwrap();
/// holder.allocate(0).unwrap();
/// holder.allocate(1).unwrap();
///
/// holder.access(0, 0x1000, 8, 0x400, false).unwrap();
/// holder.access(1, 0x1000, 8, 0x404, true).unwrap();
/// let d = holder.access(0, 0x1000, 8, 0x400, false).unwrap();
/// assert_eq!(d, Some(Distance::InvalidationMiss));
/// ```
#[derive(Debug)]
pub struct StackHolder {
    granularity: Granularity,
    stack_config: StackConfig,
    stats_config: StatsConfig,
    shuffle_seed: u64,
    max_threads: usize,
    max_access_size: u64,
    threads: BTreeMap<usize, HolderThread>,
    shared: Option<ReuseStack>,
    pairs: BTreeMap<usize, ReuseStack>,
    pair_prediction_sizes: Vec<u64>,
    enabled: bool,
    pc_stats: PcStats,
    read_pc_stats: PcStats,
}

impl StackHolder {
    /// Creates a holder with no allocated threads.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Config::validate`].
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let granularity = config.granularity()?;
        let mut holder = Self {
            granularity,
            stack_config: config.stack.clone(),
            stats_config: config.stats.clone(),
            shuffle_seed: config.general.shuffle_seed,
            max_threads: config.general.max_threads,
            max_access_size: config.general.max_access_size,
            threads: BTreeMap::new(),
            shared: None,
            pairs: BTreeMap::new(),
            pair_prediction_sizes: Vec::new(),
            enabled: true,
            pc_stats: PcStats::new(),
            read_pc_stats: PcStats::new(),
        };
        if config.stack.simulate_shared {
            holder.shared = Some(holder.new_stack()?);
        }
        Ok(holder)
    }

    fn new_stack(&self) -> Result<ReuseStack> {
        let stack = StackImpl::from_config(&self.stack_config, self.shuffle_seed)?;
        Ok(
            ReuseStack::with_parts(self.granularity, stack, &self.stats_config)
                .with_max_access_size(self.max_access_size),
        )
    }

    /// Pair whose stack `thread` feeds.
    pub const fn pair_of(thread: usize) -> usize {
        thread / 2
    }

    /// Creates the stacks of `thread`. Allocating a known thread resets it.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::TooManyThreads`] for an id past the thread limit.
    pub fn allocate(&mut self, thread: usize) -> Result<()> {
        if thread >= self.max_threads {
            return Err(RdaError::TooManyThreads {
                max: self.max_threads,
            });
        }
        let single = if self.stack_config.simulate_single {
            Some(self.new_stack()?)
        } else {
            None
        };
        let prefetcher = self
            .stack_config
            .prefetch
            .as_ref()
            .map(PrefetchArbiter::from_config);
        let state = HolderThread {
            simulated: self.new_stack()?,
            single,
            prefetcher,
            enabled: true,
        };
        let pair = Self::pair_of(thread);
        if self.shared.is_some() && !self.pairs.contains_key(&pair) {
            let mut stack = self.new_stack()?;
            stack.set_prediction_sizes(&self.pair_prediction_sizes);
            let _ = self.pairs.insert(pair, stack);
            debug!(thread, pair, "allocated pair-share stack");
        }
        if self.threads.insert(thread, state).is_some() {
            warn!(thread, "reallocated stack holder thread");
        } else {
            debug!(thread, "allocated stack holder thread");
        }
        Ok(())
    }

    /// Whether `thread` has not been allocated yet.
    pub fn is_new_thread(&self, thread: usize) -> bool {
        !self.threads.contains_key(&thread)
    }

    /// Allocated threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Enables or disables every thread.
    pub const fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Enables or disables one thread.
    pub fn set_thread_enabled(&mut self, thread: usize, enabled: bool) {
        if let Some(state) = self.threads.get_mut(&thread) {
            state.enabled = enabled;
        }
    }

    /// Whether `thread` is allocated and enabled.
    pub fn thread_enabled(&self, thread: usize) -> bool {
        self.threads.get(&thread).is_some_and(|t| t.enabled)
    }

    /// Records a data reference of `size` bytes by `thread`; unknown threads are allocated
    /// first.
    ///
    /// # Returns
    ///
    /// The simulated-stack distance of the last block touched, or `None` when the holder or
    /// the thread is disabled.
    ///
    /// With prefetching enabled, the thread's arbiter observes the first block of the access
    /// and any block it issues is prefetched into the simulated stack.
    ///
    /// # Errors
    ///
    /// Returns thread-limit, access-size, counter, and allocation errors. An oversized access
    /// is rejected before any stack changes.
    pub fn access(
        &mut self,
        thread: usize,
        address: u64,
        size: u64,
        pc: u64,
        is_write: bool,
    ) -> Result<Option<Distance>> {
        if self.is_new_thread(thread) {
            self.allocate(thread)?;
        }
        if !self.enabled || !self.thread_enabled(thread) {
            return Ok(None);
        }
        let kind = if is_write {
            AccessKind::Write
        } else {
            AccessKind::Read
        };

        if size > self.max_access_size {
            return Err(RdaError::AccessTooLarge {
                size,
                max: self.max_access_size,
            });
        }

        let granularity = self.granularity;
        let Some(state) = self.threads.get_mut(&thread) else {
            return Ok(None);
        };
        if let Some(single) = state.single.as_mut() {
            let _ = single.access(address, size, kind)?;
        }
        let distance = state.simulated.access(address, size, kind)?;
        if let Some(arbiter) = state.prefetcher.as_mut() {
            let block = granularity.block(address);
            if let Some(target) = arbiter.observe(block, pc, distance, is_write) {
                let _ = state.simulated.prefetch(granularity.address_of(target))?;
            }
        }
        if is_write {
            for (_, other) in self.threads.iter_mut().filter(|(t, _)| **t != thread) {
                let _ = other.simulated.snoop(address, size)?;
            }
        }
        if let Some(shared) = self.shared.as_mut() {
            let _ = shared.access(address, size, kind)?;
            let own = Self::pair_of(thread);
            if let Some(pair) = self.pairs.get_mut(&own) {
                let _ = pair.access(address, size, kind)?;
            }
            if is_write {
                for (_, other) in self.pairs.iter_mut().filter(|(p, _)| **p != own) {
                    let _ = other.snoop(address, size)?;
                }
            }
        }

        self.pc_stats.add_sample(pc, distance)?;
        if !is_write {
            self.read_pc_stats.add_sample(pc, distance)?;
        }
        Ok(Some(distance))
    }

    /// Records an instruction fetch of `size` bytes at `pc` in the simulated stack of `thread`.
    ///
    /// # Errors
    ///
    /// Returns counter and allocation errors.
    pub fn fetch(&mut self, thread: usize, pc: u64, size: u64) -> Result<Option<Distance>> {
        if !self.enabled || !self.thread_enabled(thread) {
            return Ok(None);
        }
        match self.threads.get_mut(&thread) {
            Some(state) => state.simulated.access(pc, size, AccessKind::Fetch).map(Some),
            None => Ok(None),
        }
    }

    /// Adds a ratio prediction size (bytes) to every per-thread stack.
    pub fn add_prediction_size(&mut self, size: u64) {
        self.stats_config.prediction_sizes.push(size);
        for state in self.threads.values_mut() {
            state.simulated.add_prediction_size(size);
            if let Some(single) = state.single.as_mut() {
                single.add_prediction_size(size);
            }
        }
    }

    /// Adds a ratio prediction size (bytes) to the shared stack.
    pub fn add_shared_prediction_size(&mut self, size: u64) {
        if let Some(shared) = self.shared.as_mut() {
            shared.add_prediction_size(size);
        }
    }

    /// Adds a ratio prediction size (bytes) to every pair-share stack, including pairs
    /// allocated later.
    pub fn add_pair_prediction_size(&mut self, size: u64) {
        self.pair_prediction_sizes.push(size);
        for stack in self.pairs.values_mut() {
            stack.add_prediction_size(size);
        }
    }

    /// Starts a prediction period, discarding hits counted since the last boundary.
    pub fn begin_period(&mut self) {
        self.for_each_stack(ReuseStack::reset_predictions);
    }

    /// Ends a prediction period and records its hits.
    pub fn end_period(&mut self) {
        self.for_each_stack(ReuseStack::update_predictions);
    }

    fn for_each_stack(&mut self, mut f: impl FnMut(&mut ReuseStack)) {
        for state in self.threads.values_mut() {
            f(&mut state.simulated);
            if let Some(single) = state.single.as_mut() {
                f(single);
            }
        }
        if let Some(shared) = self.shared.as_mut() {
            f(shared);
        }
        for stack in self.pairs.values_mut() {
            f(stack);
        }
    }

    /// Simulated stack of `thread`.
    pub fn simulated(&self, thread: usize) -> Option<&ReuseStack> {
        self.threads.get(&thread).map(|t| &t.simulated)
    }

    /// Single stack of `thread`, if enabled.
    pub fn single(&self, thread: usize) -> Option<&ReuseStack> {
        self.threads.get(&thread).and_then(|t| t.single.as_ref())
    }

    /// Shared stack, if enabled.
    pub const fn shared(&self) -> Option<&ReuseStack> {
        self.shared.as_ref()
    }

    /// Pair-share stack of `pair`, if allocated.
    pub fn pair(&self, pair: usize) -> Option<&ReuseStack> {
        self.pairs.get(&pair)
    }

    /// Prefetch arbiter of `thread`, if prefetching is enabled.
    pub fn prefetcher(&self, thread: usize) -> Option<&PrefetchArbiter> {
        self.threads.get(&thread).and_then(|t| t.prefetcher.as_ref())
    }

    /// Per-PC statistics of the simulated stacks.
    pub const fn pc_stats(&self) -> &PcStats {
        &self.pc_stats
    }

    /// Per-PC statistics of reads in the simulated stacks.
    pub const fn read_pc_stats(&self) -> &PcStats {
        &self.read_pc_stats
    }

    /// Serializable dump of every stack.
    pub fn report(&self) -> HolderReport {
        HolderReport {
            threads: self
                .threads
                .iter()
                .map(|(&thread, state)| HolderThreadReport {
                    thread,
                    simulated: state.simulated.report(),
                    single: state.single.as_ref().map(ReuseStack::report),
                    prefetch: state.prefetcher.as_ref().map(PrefetchArbiter::report),
                })
                .collect(),
            shared: self.shared.as_ref().map(ReuseStack::report),
            pairs: self
                .pairs
                .iter()
                .map(|(&pair, stack)| HolderPairReport {
                    pair,
                    stack: stack.report(),
                })
                .collect(),
            pc: self.pc_stats.report(),
            read_pc: self.read_pc_stats.report(),
        }
    }
}
