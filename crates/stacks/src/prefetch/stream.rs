//! Global Stream Prefetcher.
//!
//! A prefetcher that follows a few access streams regardless of which instruction issued them.
//! Each stream remembers its last trained block and up to two strides, so both constant strides
//! and strides that alternate between two values lock on. A trained block that falls close to an
//! existing stream refines it; anything else starts a new stream, replacing the weakest one when
//! the table is full.
//!
//! Stores never train the streams.

use super::{Prefetcher, PrefetcherStats, Trigger};
use crate::common::Distance;

/// Streams tracked at once.
pub const STREAM_TABLE_SIZE: usize = 8;

/// Saturation point of a stream's confidence.
const MAX_CONFIDENCE: u32 = 7;

/// Confidence a matched stream needs before it issues.
const CONFIDENCE_THRESHOLD: u32 = 2;

/// Blocks around a stream's last miss that still belong to it.
const STREAM_PROXIMITY: u64 = 4;

/// One tracked stream.
#[derive(Clone, Copy, Debug)]
struct StreamEntry {
    last_miss: u64,
    stride: i64,
    last_stride: i64,
    confidence: u32,
}

impl StreamEntry {
    const fn new(last_miss: u64) -> Self {
        Self {
            last_miss,
            stride: 0,
            last_stride: 0,
            confidence: 0,
        }
    }

    const fn bump(&mut self) {
        if self.confidence < MAX_CONFIDENCE {
            self.confidence += 1;
        }
    }
}

/// Global stream prefetcher state.
#[derive(Clone, Debug)]
pub struct GlobalStreamPrefetcher {
    streams: Vec<StreamEntry>,
    trigger: Trigger,
}

impl GlobalStreamPrefetcher {
    /// Creates a prefetcher with no streams.
    pub fn new() -> Self {
        Self {
            streams: Vec::with_capacity(STREAM_TABLE_SIZE),
            trigger: Trigger::new("global stream"),
        }
    }

    /// Streams currently tracked.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Follows a stream whose stride (or alternate stride) leads to `block`.
    ///
    /// Returns `None` if no stream matches, otherwise the proposal (if confident enough).
    fn follow(&mut self, block: u64) -> Option<Option<u64>> {
        let (i, stride) = self.streams.iter_mut().enumerate().find_map(|(i, s)| {
            if s.stride != 0 && s.last_miss.wrapping_add_signed(s.stride) == block {
                s.bump();
                Some((i, s.stride))
            } else if s.last_stride != 0 && s.last_miss.wrapping_add_signed(s.last_stride) == block {
                s.bump();
                s.last_stride = s.stride;
                s.stride = block.wrapping_sub(s.last_miss) as i64;
                Some((i, s.last_stride))
            } else {
                None
            }
        })?;
        let stream = &mut self.streams[i];
        if stream.confidence < CONFIDENCE_THRESHOLD {
            return Some(None);
        }
        stream.last_miss = block;
        Some(Some(self.trigger.propose(block.wrapping_add_signed(stride))))
    }

    /// Trains the streams near `block`; returns whether any was near and an optional proposal.
    fn train(&mut self, block: u64) -> (bool, Option<u64>) {
        let mut near = false;
        for s in &mut self.streams {
            if block.abs_diff(s.last_miss) > STREAM_PROXIMITY {
                continue;
            }
            near = true;
            if s.stride == 0 {
                s.stride = block.wrapping_sub(s.last_miss) as i64;
                s.last_miss = block;
                s.bump();
                break;
            } else if s.last_stride == 0 {
                s.last_stride = s.stride;
                s.stride = block.wrapping_sub(s.last_miss) as i64;
                s.last_miss = block;
                break;
            }
            s.confidence = s.confidence.saturating_sub(1);
            if s.confidence > CONFIDENCE_THRESHOLD {
                s.last_miss = block;
                let target = block.wrapping_add_signed(s.stride);
                return (true, Some(self.trigger.propose(target)));
            }
        }
        (near, None)
    }
}

impl Default for GlobalStreamPrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Prefetcher for GlobalStreamPrefetcher {
    fn observe(&mut self, block: u64, _pc: u64, distance: Distance, is_write: bool) -> Option<u64> {
        if is_write || !self.trigger.fires(block, distance) {
            return None;
        }
        if let Some(proposal) = self.follow(block) {
            return proposal;
        }
        let (near, proposal) = self.train(block);
        if !near {
            if self.streams.len() >= STREAM_TABLE_SIZE {
                let weakest = self
                    .streams
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.confidence)
                    .map(|(i, _)| i);
                if let Some(i) = weakest {
                    let _ = self.streams.remove(i);
                }
            }
            self.streams.push(StreamEntry::new(block));
        }
        proposal
    }

    fn stats(&self) -> PrefetcherStats {
        self.trigger.stats()
    }
}
