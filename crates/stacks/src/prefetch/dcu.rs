//! DCU Prefetcher.
//!
//! Proposes the next block when the same block is referenced twice within a short window, the
//! way a data-cache-unit streamer reacts to a line being touched again soon after a fill.

use super::{Prefetcher, PrefetcherStats};
use crate::common::Distance;

/// References between two touches of a block that still count as a repeat.
pub const REQUEST_PROXIMITY: usize = 10;

/// DCU prefetcher state.
#[derive(Clone, Debug)]
pub struct DcuPrefetcher {
    /// Ring of the most recent blocks.
    recent: [Option<u64>; REQUEST_PROXIMITY],
    /// Next ring slot to overwrite.
    next: usize,
    prefetches: u64,
}

impl DcuPrefetcher {
    /// Creates a prefetcher with an empty window.
    pub const fn new() -> Self {
        Self {
            recent: [None; REQUEST_PROXIMITY],
            next: 0,
            prefetches: 0,
        }
    }
}

impl Default for DcuPrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Prefetcher for DcuPrefetcher {
    /// Proposes `block + 1` if `block` is still in the window, then records it.
    fn observe(&mut self, block: u64, _pc: u64, _distance: Distance, _is_write: bool) -> Option<u64> {
        let repeat = self.recent.contains(&Some(block));
        self.recent[self.next] = Some(block);
        self.next = (self.next + 1) % REQUEST_PROXIMITY;
        if repeat {
            self.prefetches += 1;
            Some(block.wrapping_add(1))
        } else {
            None
        }
    }

    fn stats(&self) -> PrefetcherStats {
        PrefetcherStats {
            name: "DCU",
            prefetches: self.prefetches,
            ..PrefetcherStats::default()
        }
    }
}
