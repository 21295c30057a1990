//! Per-PC distance statistics.

use std::collections::HashMap;

use serde::Serialize;

use super::histogram::LogHistogram;
use crate::common::{Distance, MAX_ACCESS_COUNT, RdaError, Result};

const PC_DENSITY: u32 = 2;
const PC_INITIAL_OCTAVES: u32 = 8;

#[derive(Clone, Debug)]
struct PcDistanceStats {
    histogram: LogHistogram,
    bucket_avg: Vec<f64>,
    total_distance: u64,
    samples: u64,
    cold: u64,
    invalidations: u64,
}

impl PcDistanceStats {
    fn new() -> Self {
        let histogram = LogHistogram::new(PC_DENSITY, PC_INITIAL_OCTAVES);
        Self {
            histogram,
            bucket_avg: Vec::new(),
            total_distance: 0,
            samples: 0,
            cold: 0,
            invalidations: 0,
        }
    }

    fn add_sample(&mut self, distance: Distance) -> Result<()> {
        if self.samples >= MAX_ACCESS_COUNT {
            return Err(RdaError::CounterOverflow(self.samples));
        }
        match distance {
            Distance::Finite(d) => {
                let bucket = self.histogram.record(d)?;
                if bucket >= self.bucket_avg.len() {
                    self.bucket_avg.resize(bucket + 1, 0.0);
                }
                let n = self.histogram.count(bucket) as f64;
                let avg = &mut self.bucket_avg[bucket];
                *avg += (d as f64 - *avg) / n;
                self.total_distance = self.total_distance.saturating_add(d);
            }
            Distance::ColdMiss => self.cold += 1,
            Distance::InvalidationMiss => self.invalidations += 1,
        }
        self.samples += 1;
        Ok(())
    }

    fn report(&self, pc: u64) -> PcReport {
        PcReport {
            pc,
            samples: self.samples,
            total_distance: self.total_distance,
            cold_misses: self.cold,
            invalidation_misses: self.invalidations,
            buckets: self
                .histogram
                .nonzero()
                .map(|(i, count)| PcBucket {
                    label: self.histogram.label(i),
                    count,
                    average: self.bucket_avg.get(i).copied().unwrap_or(0.0),
                })
                .collect(),
        }
    }
}

/// One histogram bucket of a PC.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PcBucket {
    /// Lower bound of the bucket.
    pub label: f64,
    /// Samples in the bucket.
    pub count: u64,
    /// Mean distance of those samples.
    pub average: f64,
}

/// Statistics of one instruction address.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PcReport {
    /// Instruction address.
    pub pc: u64,
    /// Samples attributed to the PC.
    pub samples: u64,
    /// Sum of finite distances.
    pub total_distance: u64,
    /// Cold misses.
    pub cold_misses: u64,
    /// Invalidation misses.
    pub invalidation_misses: u64,
    /// Non-empty buckets (density 2).
    pub buckets: Vec<PcBucket>,
}

/// Distance histograms keyed by the PC of the reference that ended each distance.
#[derive(Clone, Debug, Default)]
pub struct PcStats {
    per_pc: HashMap<u64, PcDistanceStats>,
}

impl PcStats {
    /// Creates empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `distance` for `pc`.
    ///
    /// # Errors
    ///
    /// Returns the counter, bucket, and allocation errors of the per-PC histogram.
    pub fn add_sample(&mut self, pc: u64, distance: Distance) -> Result<()> {
        if !self.per_pc.contains_key(&pc) {
            self.per_pc
                .try_reserve(1)
                .map_err(|e| RdaError::allocation("per-PC statistics", e))?;
        }
        self.per_pc
            .entry(pc)
            .or_insert_with(PcDistanceStats::new)
            .add_sample(distance)
    }

    /// Number of distinct PCs.
    pub fn len(&self) -> usize {
        self.per_pc.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.per_pc.is_empty()
    }

    /// Samples recorded for `pc`.
    pub fn samples(&self, pc: u64) -> u64 {
        self.per_pc.get(&pc).map_or(0, |s| s.samples)
    }

    /// Reports sorted by PC.
    pub fn report(&self) -> Vec<PcReport> {
        let mut out: Vec<PcReport> = self.per_pc.iter().map(|(&pc, s)| s.report(pc)).collect();
        out.sort_unstable_by_key(|r| r.pc);
        out
    }
}
