//! Prefetch arbitration.
//!
//! The arbiter sits between the prefetcher models and the stack. Each observation advances its
//! clock by one. Requests from the models are queued in model order, a block requested recently
//! is not requested again, and a queued request is canceled when the program references the
//! block itself. At most one request is issued per observation; other requests that are due at
//! the same time are dropped.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::debug;

use super::{Prefetcher, from_kind, is_miss};
use crate::common::Distance;
use crate::config::PrefetchConfig;
use crate::report::{PrefetchPcReport, PrefetchReport, PrefetcherReport};

/// Observations during which a prefetched block is not requested again.
pub const REPEAT_WINDOW: u64 = 100;

#[derive(Clone, Copy, Debug)]
struct Request {
    block: u64,
    pc: u64,
    due: u64,
    source: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct PcCounts {
    requests: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct Source {
    model: Box<dyn Prefetcher>,
    accepted: u64,
    dropped: u64,
}

/// Combines prefetcher models into at most one request per observation.
///
/// # Examples
///
/// ```
/// use rda_stacks::prefetch::{DcuPrefetcher, PrefetchArbiter};
/// use rda_stacks::Distance;
///
/// let mut arbiter = PrefetchArbiter::new(0);
/// arbiter.add_prefetcher(Box::new(DcuPrefetcher::new()));
/// assert_eq!(arbiter.observe(6, 0, Distance::ColdMiss, false), None);
/// assert_eq!(arbiter.observe(6, 0, Distance::Finite(0), false), Some(7));
/// ```
#[derive(Debug)]
pub struct PrefetchArbiter {
    delay: u64,
    time: u64,
    sources: Vec<Source>,
    queue: VecDeque<Request>,
    recent: VecDeque<(u64, u64)>,
    recent_blocks: HashSet<u64>,
    issued: HashSet<u64>,
    canceled: u64,
    pcs: BTreeMap<u64, PcCounts>,
}

impl PrefetchArbiter {
    /// Creates an arbiter without models that issues requests `delay` observations after they
    /// are made.
    pub fn new(delay: u64) -> Self {
        Self {
            delay,
            time: 0,
            sources: Vec::new(),
            queue: VecDeque::new(),
            recent: VecDeque::new(),
            recent_blocks: HashSet::new(),
            issued: HashSet::new(),
            canceled: 0,
            pcs: BTreeMap::new(),
        }
    }

    /// Builds an arbiter with the models listed in `config`.
    pub fn from_config(config: &PrefetchConfig) -> Self {
        let mut arbiter = Self::new(config.delay);
        for &kind in &config.prefetchers {
            arbiter.add_prefetcher(from_kind(kind));
        }
        debug!(
            prefetchers = arbiter.sources.len(),
            delay = config.delay,
            "built prefetch arbiter"
        );
        arbiter
    }

    /// Appends a model; earlier models win when several request at once.
    pub fn add_prefetcher(&mut self, model: Box<dyn Prefetcher>) {
        self.sources.push(Source {
            model,
            accepted: 0,
            dropped: 0,
        });
    }

    /// Models consulted.
    pub fn prefetcher_count(&self) -> usize {
        self.sources.len()
    }

    /// Requests waiting for their issue time.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Observes a reference and returns the block to prefetch now, if any.
    pub fn observe(&mut self, block: u64, pc: u64, distance: Distance, is_write: bool) -> Option<u64> {
        self.time += 1;

        let before = self.queue.len();
        self.queue.retain(|r| r.block != block);
        self.canceled += (before - self.queue.len()) as u64;

        if self.issued.remove(&block) {
            let counts = self.pcs.entry(pc).or_default();
            if is_miss(distance) {
                counts.misses += 1;
            } else {
                counts.hits += 1;
            }
        }

        for source in 0..self.sources.len() {
            let requested = self.sources[source]
                .model
                .observe(block, pc, distance, is_write);
            if let Some(target) = requested {
                self.request(target, pc, source);
            }
        }
        self.issue()
    }

    fn request(&mut self, block: u64, pc: u64, source: usize) {
        while let Some(&(old, expires)) = self.recent.front() {
            if expires > self.time {
                break;
            }
            let _ = self.recent_blocks.remove(&old);
            let _ = self.recent.pop_front();
        }
        if self.recent_blocks.insert(block) {
            self.queue.push_back(Request {
                block,
                pc,
                due: self.time + self.delay,
                source,
            });
            self.recent.push_back((block, self.time + REPEAT_WINDOW));
        }
    }

    fn issue(&mut self) -> Option<u64> {
        let now = self.time;
        let front = self.queue.front().filter(|r| r.due <= now).copied()?;
        let _ = self.queue.pop_front();
        self.sources[front.source].accepted += 1;
        self.pcs.entry(front.pc).or_default().requests += 1;
        let _ = self.issued.insert(front.block);
        while let Some(r) = self.queue.front().filter(|r| r.due <= now).copied() {
            self.sources[r.source].dropped += 1;
            let _ = self.queue.pop_front();
        }
        Some(front.block)
    }

    /// Serializable summary.
    pub fn report(&self) -> PrefetchReport {
        PrefetchReport {
            prefetches: self.sources.iter().map(|s| s.accepted).sum(),
            dropped: self.sources.iter().map(|s| s.dropped).sum(),
            canceled: self.canceled,
            prefetchers: self
                .sources
                .iter()
                .map(|s| PrefetcherReport {
                    accepted: s.accepted,
                    dropped: s.dropped,
                    stats: s.model.stats(),
                })
                .collect(),
            pcs: self
                .pcs
                .iter()
                .map(|(&pc, c)| PrefetchPcReport {
                    pc,
                    requests: c.requests,
                    hits: c.hits,
                    misses: c.misses,
                })
                .collect(),
        }
    }
}
