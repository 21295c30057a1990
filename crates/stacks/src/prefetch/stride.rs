//! Stride Prefetcher.
//!
//! A prefetcher that detects constant stride patterns per instruction. It keeps a table keyed by
//! PC with the last trained block and stride of each instruction, and proposes the next block
//! along the stride once the same nonzero stride has been seen twice in a row.
//!
//! Training happens only on misses and on hits to blocks the prefetcher proposed, so a stream
//! that already fits in the cache does not keep the table busy.

use std::collections::BTreeMap;

use super::{Prefetcher, PrefetcherStats, Trigger};
use crate::common::Distance;

/// Instructions tracked at once.
pub const TABLE_SIZE: usize = 256;

/// Saturation point of the confidence counter.
const MAX_CONFIDENCE: u32 = 65_535;

/// Entry in the stride table.
#[derive(Clone, Copy, Debug)]
struct StrideEntry {
    /// Block of the last training reference.
    last_block: u64,
    /// Stride between the last two training references.
    stride: i64,
    /// Consecutive repeats of `stride`.
    confidence: u32,
}

/// Stride prefetcher state.
#[derive(Clone, Debug)]
pub struct StridePrefetcher {
    table: BTreeMap<u64, StrideEntry>,
    trigger: Trigger,
}

impl StridePrefetcher {
    /// Creates a prefetcher with an empty table.
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
            trigger: Trigger::new("IP stride"),
        }
    }

    /// Instructions currently in the table.
    pub fn tracked_pcs(&self) -> usize {
        self.table.len()
    }

    fn evict_weakest(&mut self) {
        let weakest = self
            .table
            .iter()
            .min_by_key(|(_, e)| e.confidence)
            .map(|(&pc, _)| pc);
        if let Some(pc) = weakest {
            let _ = self.table.remove(&pc);
        }
    }
}

impl Default for StridePrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Prefetcher for StridePrefetcher {
    fn observe(&mut self, block: u64, pc: u64, distance: Distance, _is_write: bool) -> Option<u64> {
        if !self.trigger.fires(block, distance) {
            return None;
        }
        if !self.table.contains_key(&pc) {
            if self.table.len() >= TABLE_SIZE {
                self.evict_weakest();
            }
            let _ = self.table.insert(
                pc,
                StrideEntry {
                    last_block: block,
                    stride: 0,
                    confidence: 0,
                },
            );
            return None;
        }
        let entry = self.table.get_mut(&pc)?;

        let stride = block.wrapping_sub(entry.last_block) as i64;
        if stride == entry.stride && stride != 0 {
            entry.confidence = (entry.confidence + 1).min(MAX_CONFIDENCE);
        } else {
            entry.stride = stride;
            entry.confidence = 0;
        }
        entry.last_block = block;

        if entry.confidence == 0 {
            return None;
        }
        Some(self.trigger.propose(block.wrapping_add_signed(stride)))
    }

    fn stats(&self) -> PrefetcherStats {
        self.trigger.stats()
    }
}
