//! Reuse stacks.
//!
//! Implements the per-reference reuse-distance stacks and the wrapper that turns their answers
//! into statistics.
//!
//! # Implementations
//!
//! - `Exact`: Splay tree with one node per block.
//! - `Approximate`: Interval nodes under a relative error bound.

/// Error-bounded approximate stack.
pub mod approximate;

/// Exact splay-tree stack.
pub mod exact;

use std::collections::HashSet;

use serde::Serialize;

use crate::common::constants::DEFAULT_MAX_ACCESS_SIZE;
use crate::common::{Distance, Granularity, RdaError, Result};
use crate::config::{Config, StackConfig, StackKind, StatsConfig};
use crate::report::{ReuseStackReport, StatsReport};
use crate::stats::{Predictions, StackStats};

pub use approximate::ApproximateStack;
pub use exact::ExactStack;

/// Kind of memory reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Fetch,
}

/// Stack implementation selected by [`StackKind`].
#[derive(Clone, Debug)]
pub enum StackImpl {
    /// Exact distances.
    Exact(ExactStack),
    /// Approximate distances.
    Approximate(ApproximateStack),
}

impl StackImpl {
    /// Builds the implementation named by `config.kind`.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a bad approximate error rate.
    pub fn from_config(config: &StackConfig, seed: u64) -> Result<Self> {
        Ok(match config.kind {
            StackKind::Exact => Self::Exact(ExactStack::new()),
            StackKind::Approximate => {
                Self::Approximate(ApproximateStack::new(config.error_rate, seed)?)
            }
        })
    }

    /// References `block`; `None` on a first reference since the last invalidation.
    ///
    /// # Errors
    ///
    /// Propagates counter and allocation errors of the implementation.
    pub fn access(&mut self, block: u64) -> Result<Option<u64>> {
        match self {
            Self::Exact(s) => s.access(block),
            Self::Approximate(s) => s.access(block),
        }
    }

    /// Invalidates `block`; returns its last time if it was tracked.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Internal`] if the exact stack lost the block's node.
    pub fn invalidate(&mut self, block: u64) -> Result<Option<u64>> {
        match self {
            Self::Exact(s) => s.invalidate(block),
            Self::Approximate(s) => Ok(s.invalidate(block)),
        }
    }

    /// Tracked blocks.
    pub fn len(&self) -> usize {
        match self {
            Self::Exact(s) => s.len(),
            Self::Approximate(s) => s.len(),
        }
    }

    /// Returns `true` if no block is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structural validation.
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency.
    pub fn check(&self) {
        match self {
            Self::Exact(s) => s.check(),
            Self::Approximate(s) => s.check(),
        }
    }

    /// Implementation kind.
    pub const fn kind(&self) -> StackKind {
        match self {
            Self::Exact(_) => StackKind::Exact,
            Self::Approximate(_) => StackKind::Approximate,
        }
    }
}

/// Reference counters kept by a [`ReuseStack`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StackCounters {
    /// Calls to `access`.
    pub accesses: u64,
    /// Blocks referenced (an access may span several).
    pub block_accesses: u64,
    /// Sum of access sizes in bytes.
    pub total_bytes: u64,
    /// Blocks referenced by writes.
    pub writes: u64,
    /// Blocks referenced by fetches.
    pub fetches: u64,
    /// First-reference misses.
    pub cold_misses: u64,
    /// Misses on blocks invalidated by a snoop.
    pub coherence_misses: u64,
    /// Snooped blocks that were tracked.
    pub invalidations: u64,
    /// Blocks snooped.
    pub invalidate_calls: u64,
    /// Calls to `prefetch`.
    pub prefetches: u64,
    /// Prefetches of blocks never seen before.
    pub prefetch_cold_misses: u64,
    /// Prefetches of blocks invalidated by a snoop.
    pub prefetch_coherence_misses: u64,
}

/// A reuse stack that folds every distance into statistics.
#[derive(Clone, Debug)]
pub struct ReuseStack {
    granularity: Granularity,
    max_access_size: u64,
    stack: StackImpl,
    counters: StackCounters,
    invalidated: HashSet<u64>,
    stats: StackStats,
    read_stats: StackStats,
    prefetch_stats: StackStats,
}

impl ReuseStack {
    /// Builds a stack from the `stack`, `stats` and `general` sections of `config`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for a zero granularity or a bad error rate.
    pub fn new(config: &Config) -> Result<Self> {
        let granularity = config.granularity()?;
        let stack = StackImpl::from_config(&config.stack, config.general.shuffle_seed)?;
        Ok(Self::with_parts(granularity, stack, &config.stats)
            .with_max_access_size(config.general.max_access_size))
    }

    /// Builds a stack around an existing implementation, accepting accesses of up to
    /// [`DEFAULT_MAX_ACCESS_SIZE`] bytes.
    pub fn with_parts(granularity: Granularity, stack: StackImpl, stats: &StatsConfig) -> Self {
        let block_size = granularity.bytes();
        Self {
            granularity,
            max_access_size: DEFAULT_MAX_ACCESS_SIZE,
            stack,
            counters: StackCounters::default(),
            invalidated: HashSet::new(),
            stats: StackStats::new(stats, block_size),
            read_stats: StackStats::new(stats, block_size),
            prefetch_stats: StackStats::new(stats, block_size),
        }
    }

    /// Replaces the largest `size` accepted by [`access`](Self::access) and
    /// [`snoop`](Self::snoop).
    #[must_use]
    pub fn with_max_access_size(mut self, max: u64) -> Self {
        self.max_access_size = max;
        self
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_access_size {
            return Err(RdaError::AccessTooLarge {
                size,
                max: self.max_access_size,
            });
        }
        Ok(())
    }

    /// Moves `block` to the top and classifies a first reference.
    fn reference(&mut self, block: u64) -> Result<Distance> {
        Ok(match self.stack.access(block)? {
            Some(d) => Distance::Finite(d),
            None if self.invalidated.remove(&block) => Distance::InvalidationMiss,
            None => Distance::ColdMiss,
        })
    }

    /// References `size` bytes at `address` and returns the distance of the last block touched.
    ///
    /// A first reference is a cold miss, unless the block was invalidated by [`snoop`]
    /// since its last reference, in which case it is an invalidation miss.
    ///
    /// [`snoop`]: Self::snoop
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::AccessTooLarge`] for a `size` above the configured limit, and
    /// propagates counter, allocation, and histogram errors.
    pub fn access(&mut self, address: u64, size: u64, kind: AccessKind) -> Result<Distance> {
        self.check_size(size)?;
        self.counters.accesses += 1;
        self.counters.total_bytes = self.counters.total_bytes.saturating_add(size);
        let mut distance = Distance::ColdMiss;
        for block in self.granularity.blocks(address, size) {
            self.counters.block_accesses += 1;
            match kind {
                AccessKind::Write => self.counters.writes += 1,
                AccessKind::Fetch => self.counters.fetches += 1,
                AccessKind::Read => {}
            }
            distance = self.reference(block)?;
            match distance {
                Distance::ColdMiss => self.counters.cold_misses += 1,
                Distance::InvalidationMiss => self.counters.coherence_misses += 1,
                Distance::Finite(_) => {}
            }
            self.stats.add_sample(distance)?;
            if kind == AccessKind::Read {
                self.read_stats.add_sample(distance)?;
            }
        }
        Ok(distance)
    }

    /// Brings the block of `address` to the top on behalf of a prefetcher.
    ///
    /// The distance is recorded in the prefetch statistics only.
    ///
    /// # Errors
    ///
    /// Propagates counter, allocation, and histogram errors.
    pub fn prefetch(&mut self, address: u64) -> Result<Distance> {
        self.counters.prefetches += 1;
        let distance = self.reference(self.granularity.block(address))?;
        match distance {
            Distance::ColdMiss => self.counters.prefetch_cold_misses += 1,
            Distance::InvalidationMiss => self.counters.prefetch_coherence_misses += 1,
            Distance::Finite(_) => {}
        }
        self.prefetch_stats.add_sample(distance)?;
        Ok(distance)
    }

    /// Invalidates every block of `size` bytes at `address`, as a remote write would.
    ///
    /// Returns the number of blocks that were tracked.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::AccessTooLarge`] for a `size` above the configured limit and
    /// [`RdaError::Allocation`] if the invalidated-block set cannot grow.
    pub fn snoop(&mut self, address: u64, size: u64) -> Result<usize> {
        self.check_size(size)?;
        let mut hits = 0;
        for block in self.granularity.blocks(address, size) {
            self.counters.invalidate_calls += 1;
            if self.stack.invalidate(block)?.is_some() {
                self.counters.invalidations += 1;
                self.invalidated
                    .try_reserve(1)
                    .map_err(|e| RdaError::allocation("invalidated-block set", e))?;
                let _ = self.invalidated.insert(block);
                hits += 1;
            }
        }
        Ok(hits)
    }

    /// Block granularity.
    pub const fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Reference counters.
    pub const fn counters(&self) -> &StackCounters {
        &self.counters
    }

    /// Statistics over every reference.
    pub const fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Statistics over reads only.
    pub const fn read_stats(&self) -> &StackStats {
        &self.read_stats
    }

    /// Statistics over prefetches.
    pub const fn prefetch_stats(&self) -> &StackStats {
        &self.prefetch_stats
    }

    /// Largest accepted access size in bytes.
    pub const fn max_access_size(&self) -> u64 {
        self.max_access_size
    }

    /// Underlying stack.
    pub const fn implementation(&self) -> &StackImpl {
        &self.stack
    }

    /// Blocks currently tracked.
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Replaces the ratio prediction sizes (bytes).
    pub fn set_prediction_sizes(&mut self, sizes: &[u64]) {
        self.stats.set_prediction_sizes(sizes);
    }

    /// Adds a ratio prediction size (bytes).
    pub fn add_prediction_size(&mut self, size: u64) {
        self.stats.add_prediction_size(size);
    }

    /// Current ratio prediction sizes.
    pub fn prediction_sizes(&self) -> Vec<u64> {
        self.stats.prediction_sizes()
    }

    /// Ends a prediction period.
    pub fn update_predictions(&mut self) {
        self.stats.update_predictions();
    }

    /// Discards the current prediction period.
    pub fn reset_predictions(&mut self) {
        self.stats.reset_predictions();
    }

    /// Completed prediction periods.
    pub fn predictions(&self) -> Predictions {
        self.stats.predictions()
    }

    /// Serializable summary.
    pub fn report(&self) -> ReuseStackReport {
        ReuseStackReport {
            kind: self.stack.kind().to_string(),
            granularity: self.granularity.bytes(),
            stack_size: self.stack.len(),
            counters: self.counters,
            stats: StatsReport::from(&self.stats),
            read: StatsReport::from(&self.read_stats),
            prefetch: StatsReport::from(&self.prefetch_stats),
            predictions: self.stats.predictions(),
        }
    }
}
