//! Prefetcher models driven by reuse distances.
//!
//! A prefetcher watches the block stream of one thread, together with the PC and the distance
//! the simulated stack reported, and proposes at most one block to bring in early. The
//! [`PrefetchArbiter`] combines several models, filters repeated requests and optionally delays
//! issue. All addresses here are block numbers.

/// Request arbitration, delay and duplicate filtering.
pub mod arbiter;

/// Next-block prefetcher triggered by quick repeats.
pub mod dcu;

/// PC-independent stream prefetcher.
pub mod stream;

/// Per-PC stride prefetcher.
pub mod stride;

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::common::Distance;
use crate::config::PrefetcherKind;

pub use self::arbiter::PrefetchArbiter;
pub use self::dcu::DcuPrefetcher;
pub use self::stream::GlobalStreamPrefetcher;
pub use self::stride::StridePrefetcher;

/// Distances above this many blocks (64 KiB of 64-byte lines) count as misses.
pub const MISS_DISTANCE: u64 = 64 * 1024 / 64;

/// Returns `true` if `distance` would miss in a [`MISS_DISTANCE`]-block cache.
pub const fn is_miss(distance: Distance) -> bool {
    match distance {
        Distance::Finite(d) => d > MISS_DISTANCE,
        Distance::ColdMiss | Distance::InvalidationMiss => true,
    }
}

/// Trait for prefetcher models.
///
/// Prefetchers observe the reference stream and propose blocks to prefetch.
pub trait Prefetcher: Send + Sync + fmt::Debug {
    /// Observes a reference to `block` and returns a block to prefetch, if any.
    ///
    /// # Arguments
    ///
    /// * `block` - The block that was referenced
    /// * `pc` - Program counter of the reference
    /// * `distance` - Reuse distance the simulated stack reported
    /// * `is_write` - Whether the reference was a store
    fn observe(&mut self, block: u64, pc: u64, distance: Distance, is_write: bool) -> Option<u64>;

    /// Counters of this model.
    fn stats(&self) -> PrefetcherStats;
}

/// Builds the model named by `kind`.
pub fn from_kind(kind: PrefetcherKind) -> Box<dyn Prefetcher> {
    match kind {
        PrefetcherKind::Stride => Box::new(StridePrefetcher::new()),
        PrefetcherKind::Dcu => Box::new(DcuPrefetcher::new()),
        PrefetcherKind::GlobalStream => Box::new(GlobalStreamPrefetcher::new()),
    }
}

/// Counters shared by every model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PrefetcherStats {
    /// Model name.
    pub name: &'static str,
    /// Blocks proposed.
    pub prefetches: u64,
    /// Observations that trained the model because they missed.
    pub miss_triggers: u64,
    /// Observations that trained the model because they hit a block it proposed.
    pub prefetch_hit_triggers: u64,
}

/// Trigger rule of the table-based models: train on a miss, or on a hit to a block the model
/// proposed itself.
#[derive(Clone, Debug)]
struct Trigger {
    name: &'static str,
    proposed: HashSet<u64>,
    prefetches: u64,
    miss_triggers: u64,
    prefetch_hit_triggers: u64,
}

impl Trigger {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            proposed: HashSet::new(),
            prefetches: 0,
            miss_triggers: 0,
            prefetch_hit_triggers: 0,
        }
    }

    /// Whether this reference trains the model; consumes the proposal for `block`.
    fn fires(&mut self, block: u64, distance: Distance) -> bool {
        let proposed = self.proposed.remove(&block);
        if is_miss(distance) {
            self.miss_triggers += 1;
            true
        } else if proposed {
            self.prefetch_hit_triggers += 1;
            true
        } else {
            false
        }
    }

    fn propose(&mut self, block: u64) -> u64 {
        let _ = self.proposed.insert(block);
        self.prefetches += 1;
        block
    }

    const fn stats(&self) -> PrefetcherStats {
        PrefetcherStats {
            name: self.name,
            prefetches: self.prefetches,
            miss_triggers: self.miss_triggers,
            prefetch_hit_triggers: self.prefetch_hit_triggers,
        }
    }
}
