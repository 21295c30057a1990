//! Distance sets and write sets of the parallel sampled stack.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{RdaError, Result};
use crate::sampled::SampleView;

/// Why a sample is being finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FinalizeKind {
    /// The owner referenced the sample block.
    Reuse,
    /// Another thread wrote the sample block (private semantics).
    Invalidate,
    /// Another thread referenced the sample block (shared semantics).
    RemoteReuse,
    /// The sample outgrew the pruning target.
    Prune,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Finalization {
    pub(crate) kind: FinalizeKind,
    pub(crate) pc: u64,
    pub(crate) is_write: bool,
}

/// Finalization mark shared between a distance set and its write sets. The first mark wins.
#[derive(Debug, Default)]
pub(crate) struct SampleStatus {
    finalization: Mutex<Option<Finalization>>,
}

impl SampleStatus {
    /// Marks the sample; returns `false` if it was already marked.
    pub(crate) fn mark(&self, finalization: Finalization) -> bool {
        let mut slot = self.finalization.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(finalization);
        true
    }

    pub(crate) fn get(&self) -> Option<Finalization> {
        *self.finalization.lock()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.finalization.lock().is_none()
    }
}

fn insert_block(set: &mut HashSet<u64>, block: u64, what: &'static str) -> Result<bool> {
    if set.contains(&block) {
        return Ok(false);
    }
    set.try_reserve(1)
        .map_err(|e| RdaError::allocation(what, e))?;
    Ok(set.insert(block))
}

/// A sample as seen by its owner thread.
#[derive(Debug)]
pub(crate) struct DistanceSet {
    pub(crate) id: u64,
    pub(crate) block: u64,
    pub(crate) pc: u64,
    pub(crate) set: HashSet<u64>,
    pub(crate) holes: u64,
    /// Owner's sampled-access count when the sample started.
    pub(crate) creation_time: u64,
    pub(crate) status: Arc<SampleStatus>,
    /// Write sets pulled back from the other threads for finalization.
    pub(crate) merged: Vec<WriteSet>,
}

impl DistanceSet {
    pub(crate) fn new(id: u64, block: u64, pc: u64, creation_time: u64) -> Self {
        Self {
            id,
            block,
            pc,
            set: HashSet::new(),
            holes: 0,
            creation_time,
            status: Arc::new(SampleStatus::default()),
            merged: Vec::new(),
        }
    }

    pub(crate) fn distance(&self) -> u64 {
        self.set.len() as u64 + self.holes
    }

    /// Records an owner reference to `block`, filling a hole if the block is new to the set.
    pub(crate) fn record(&mut self, block: u64) -> Result<()> {
        if !self.set.contains(&block) && self.holes > 0 {
            self.holes -= 1;
        }
        let _ = insert_block(&mut self.set, block, "distance set")?;
        Ok(())
    }

    /// Turns remote writes into holes.
    pub(crate) fn subtract(&mut self, writes: &HashSet<u64>) {
        for block in writes {
            if self.set.remove(block) {
                self.holes += 1;
            }
        }
    }

    /// Adds remote references to the set.
    pub(crate) fn union(&mut self, accesses: &HashSet<u64>) {
        self.set.extend(accesses.iter().copied());
    }

    /// Folds every pulled-back write set into the distance set.
    pub(crate) fn absorb_merged(&mut self, shared: bool) {
        let merged = std::mem::take(&mut self.merged);
        for ws in &merged {
            if shared {
                self.union(&ws.set);
            } else {
                self.subtract(&ws.set);
            }
        }
    }

    pub(crate) fn view(&self, now: u64) -> SampleView {
        SampleView {
            set_len: self.set.len(),
            holes: self.holes,
            lifetime: now - self.creation_time,
        }
    }
}

/// What one non-owner thread did to a sample's blocks since the last merge.
#[derive(Debug)]
pub(crate) struct WriteSet {
    pub(crate) id: u64,
    pub(crate) block: u64,
    pub(crate) owner: Arc<SampleStatus>,
    pub(crate) set: HashSet<u64>,
}

impl WriteSet {
    pub(crate) fn for_sample(ds: &DistanceSet) -> Self {
        Self {
            id: ds.id,
            block: ds.block,
            owner: Arc::clone(&ds.status),
            set: HashSet::new(),
        }
    }

    pub(crate) fn record(&mut self, block: u64) -> Result<()> {
        let _ = insert_block(&mut self.set, block, "write set")?;
        Ok(())
    }
}
