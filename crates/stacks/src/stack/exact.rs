//! Exact reuse stack.
//!
//! One tree node per tracked block, ordered by the logical time of its last reference. The
//! distance of a reference is the number of nodes newer than the block's node. Invalidated blocks
//! leave a hole node behind so the depth of every other block is unchanged; the next reference
//! that would move a block past the oldest hole consumes that hole instead.

use std::collections::{BTreeSet, HashMap};

use crate::common::{MAX_ACCESS_COUNT, RdaError, Result};
use crate::tree::SplayTree;

/// Exact LRU stack with coherence holes.
#[derive(Clone, Debug, Default)]
pub struct ExactStack {
    /// Payload is the block, or `None` for a hole.
    tree: SplayTree<Option<u64>>,
    last_access: HashMap<u64, u64>,
    holes: BTreeSet<u64>,
    time: u64,
    hole_jumps: u64,
}

impl ExactStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> Result<u64> {
        if self.time >= MAX_ACCESS_COUNT {
            return Err(RdaError::CounterOverflow(self.time));
        }
        self.time += 1;
        Ok(self.time)
    }

    fn rank_of(&mut self, time: u64) -> Result<u64> {
        self.tree
            .rank(time)
            .ok_or_else(|| RdaError::Internal(format!("no stack node at tracked time {time}")))
    }

    /// References `block` and returns its reuse distance, or `None` on a first reference.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::CounterOverflow`] when the logical clock is exhausted,
    /// [`RdaError::Allocation`] when a table cannot grow, and [`RdaError::Internal`] when the
    /// block map names a time the tree does not hold.
    pub fn access(&mut self, block: u64) -> Result<Option<u64>> {
        let now = self.tick()?;
        let last = self.last_access.get(&block).copied();
        let mut distance = None;

        match self.holes.first().copied() {
            Some(hole) if hole > last.unwrap_or(0) => {
                self.hole_jumps += 1;
                let _ = self.holes.remove(&hole);
                if let Some(last) = last {
                    distance = Some(self.rank_of(last)?);
                    // The rank lookup left `last` at the root.
                    self.tree.set_root_value(None);
                    let _ = self.holes.insert(last);
                }
                if self.tree.remove(hole).is_none() {
                    return Err(RdaError::Internal(format!(
                        "hole at time {hole} has no stack node"
                    )));
                }
            }
            _ => {
                if let Some(last) = last {
                    distance = Some(self.rank_of(last)?);
                    let _ = self.tree.remove(last);
                }
            }
        }

        self.tree.insert(now, 1, Some(block))?;
        self.last_access
            .try_reserve(1)
            .map_err(|e| RdaError::allocation("last-access map", e))?;
        let _ = self.last_access.insert(block, now);
        Ok(distance)
    }

    /// Turns the node of `block` into a hole and forgets the block.
    ///
    /// Returns the time of its last reference, or `None` if it was not tracked.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Internal`] if the block's node is missing from the tree.
    pub fn invalidate(&mut self, block: u64) -> Result<Option<u64>> {
        let Some(time) = self.last_access.remove(&block) else {
            return Ok(None);
        };
        let _ = self.rank_of(time)?;
        self.tree.set_root_value(None);
        let _ = self.holes.insert(time);
        Ok(Some(time))
    }

    /// Current depth of `block` (the distance it would see if referenced now).
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Internal`] if the block's node is missing from the tree.
    pub fn depth(&mut self, block: u64) -> Result<Option<u64>> {
        match self.last_access.get(&block).copied() {
            Some(time) => self.rank_of(time).map(Some),
            None => Ok(None),
        }
    }

    /// Block at `depth` positions from the top, or `None` for a hole or past the bottom.
    pub fn block_at_depth(&self, depth: u64) -> Option<u64> {
        self.tree.nth_newest(depth).and_then(|e| e.value)
    }

    /// Returns `true` if `block` would hit in a fully associative LRU cache of `capacity` blocks.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`depth`](Self::depth).
    pub fn contains_within(&mut self, block: u64, capacity: u64) -> Result<bool> {
        Ok(self.depth(block)?.is_some_and(|d| d < capacity))
    }

    /// Stack size excluding holes.
    pub fn len(&self) -> usize {
        self.tree.len() - self.holes.len()
    }

    /// Returns `true` if no block is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct blocks currently tracked.
    pub fn distinct_blocks(&self) -> usize {
        self.last_access.len()
    }

    /// Pending holes.
    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    /// References that consumed a hole.
    pub const fn hole_jumps(&self) -> u64 {
        self.hole_jumps
    }

    /// Logical time of the latest reference.
    pub const fn time(&self) -> u64 {
        self.time
    }

    /// Validates the tree and its agreement with the block map and the hole set.
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency.
    pub fn check(&self) {
        self.tree.check();
        let entries = self.tree.entries();
        let mut holes = 0usize;
        for e in &entries {
            assert!(e.time <= self.time, "stack node from the future at {}", e.time);
            match e.value {
                Some(block) => assert_eq!(
                    self.last_access.get(&block),
                    Some(&e.time),
                    "stale node for block {block:#x}"
                ),
                None => {
                    assert!(self.holes.contains(&e.time), "untracked hole at {}", e.time);
                    holes += 1;
                }
            }
        }
        assert_eq!(holes, self.holes.len(), "hole set does not match hole nodes");
        assert_eq!(entries.len() - holes, self.last_access.len(), "block map size mismatch");
    }

    #[cfg(test)]
    pub(crate) fn set_time(&mut self, time: u64) {
        self.time = time;
    }
}
