//! Approximate reuse stack.
//!
//! Each node stands for `size` references that fall in the interval `(predecessor.time, time]`.
//! A reference is located by the oldest node whose time is not older than it, and its distance
//! is the total size of strictly newer nodes. When the tree grows past a logarithmic bound, it is
//! compressed by merging adjacent nodes whose combined size stays under a capacity derived from
//! their distance, which keeps every reported distance within a relative error `eps` of the exact
//! value (the approximation never overestimates).

use std::collections::{BTreeSet, HashMap};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::common::{MAX_ACCESS_COUNT, RdaError, Result};
use crate::tree::{Entry, SplayTree};

/// Error-bounded LRU stack; node payload is the merge capacity.
#[derive(Clone, Debug)]
pub struct ApproximateStack {
    tree: SplayTree<u64>,
    last_access: HashMap<u64, u64>,
    holes: BTreeSet<u64>,
    time: u64,
    error_rate: f64,
    rng: StdRng,
    compressions: u64,
}

impl ApproximateStack {
    /// Creates an empty stack with relative error bound `error_rate` (in (0, 1)) and a seeded
    /// shuffle for tree rebuilds.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for an error rate outside (0, 1).
    pub fn new(error_rate: f64, seed: u64) -> Result<Self> {
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(RdaError::InvalidConfig(format!(
                "error rate must be in (0, 1), got {error_rate}"
            )));
        }
        Ok(Self {
            tree: SplayTree::new(),
            last_access: HashMap::new(),
            holes: BTreeSet::new(),
            time: 0,
            error_rate,
            rng: StdRng::seed_from_u64(seed),
            compressions: 0,
        })
    }

    fn tick(&mut self) -> Result<u64> {
        if self.time >= MAX_ACCESS_COUNT {
            return Err(RdaError::CounterOverflow(self.time));
        }
        self.time += 1;
        Ok(self.time)
    }

    fn capacity_for(&self, distance: u64) -> u64 {
        let cap = distance as f64 * self.error_rate / (1.0 - self.error_rate);
        if cap > 1.0 { cap as u64 } else { 1 }
    }

    /// Distance of the reference at `time`; with `delete`, that reference leaves its node.
    fn search(&mut self, time: u64, delete: bool) -> Result<u64> {
        let Some((node_time, distance)) = self.tree.ceiling(time) else {
            return Err(RdaError::Internal(format!(
                "no stack interval covers time {time}"
            )));
        };
        if delete {
            self.tree.set_root_value(self.capacity_for(distance));
            if self.tree.shrink_root() == 0 {
                let _ = self.tree.remove(node_time);
            }
        }
        Ok(distance)
    }

    /// References `block` and returns its approximate reuse distance, or `None` on a first
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::CounterOverflow`] when the logical clock is exhausted,
    /// [`RdaError::Allocation`] when a table cannot grow, and [`RdaError::Internal`] when no
    /// interval covers a tracked reference.
    pub fn access(&mut self, block: u64) -> Result<Option<u64>> {
        let now = self.tick()?;
        let last = self.last_access.get(&block).copied();
        let mut distance = None;

        match self.holes.first().copied() {
            Some(hole) if hole > last.unwrap_or(0) => {
                let _ = self.holes.remove(&hole);
                if let Some(last) = last {
                    distance = Some(self.search(last, false)?);
                    let _ = self.holes.insert(last);
                }
                let _ = self.search(hole, true)?;
            }
            _ => {
                if let Some(last) = last {
                    distance = Some(self.search(last, true)?);
                }
            }
        }

        self.tree.insert(now, 1, 1)?;
        self.last_access
            .try_reserve(1)
            .map_err(|e| RdaError::allocation("last-access map", e))?;
        let _ = self.last_access.insert(block, now);

        if self.needs_compression() {
            self.compress()?;
        }
        Ok(distance)
    }

    /// Forgets `block`, leaving its reference behind as a hole.
    ///
    /// Returns the time of its last reference, or `None` if it was not tracked.
    pub fn invalidate(&mut self, block: u64) -> Option<u64> {
        let time = self.last_access.remove(&block)?;
        let _ = self.holes.insert(time);
        Some(time)
    }

    fn needs_compression(&self) -> bool {
        let nodes = self.tree.len() as f64;
        let weight = self.tree.total_weight() as f64;
        nodes >= 4.0 * weight.ln() / self.error_rate.ln_1p() + 4.0
    }

    fn compress(&mut self) -> Result<()> {
        let before = self.tree.len();
        let mut newest_first = self.tree.entries().into_iter().rev();
        let Some(mut current) = newest_first.next() else {
            return Ok(());
        };
        current.value = 1;
        let mut survivors: Vec<Entry<u64>> = Vec::with_capacity(before);
        let mut distance = 0;
        for older in newest_first {
            if older.size + current.size <= current.value {
                current.size += older.size;
            } else {
                distance += current.size;
                survivors.push(current);
                current = older;
                current.value = self.capacity_for(distance);
            }
        }
        survivors.push(current);
        survivors.shuffle(&mut self.rng);
        self.tree.rebuild(&survivors)?;
        self.compressions += 1;
        debug!(before, after = survivors.len(), "compressed approximate stack");
        Ok(())
    }

    /// References that have been accounted for, excluding holes.
    pub fn len(&self) -> usize {
        self.last_access.len()
    }

    /// Returns `true` if no block is tracked.
    pub fn is_empty(&self) -> bool {
        self.last_access.is_empty()
    }

    /// Interval nodes currently in the tree.
    pub fn node_count(&self) -> usize {
        self.tree.len()
    }

    /// Pending holes.
    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    /// Number of compression passes so far.
    pub const fn compressions(&self) -> u64 {
        self.compressions
    }

    /// Validates the tree; the total weight must cover every tracked reference and hole.
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency.
    pub fn check(&self) {
        self.tree.check();
        let expected = (self.last_access.len() + self.holes.len()) as u64;
        assert_eq!(
            self.tree.total_weight(),
            expected,
            "approximate stack weight does not match tracked references"
        );
    }
}
