//! Reuse-distance statistics.
//!
//! This module folds per-reference distances into summary data. It provides:
//! 1. **Histograms:** Log2-bucketed counts with separate cold and invalidation miss counters.
//! 2. **Working-set sizes:** The smallest cache size that reaches a target hit rate.
//! 3. **Ratio predictions:** Per-period hit counts for a set of candidate cache sizes.
//! 4. **Per-PC statistics:** Coarser histograms keyed by instruction address.

/// Log2 distance histogram shared by every statistics type.
pub mod histogram;

/// Per-instruction-address statistics.
pub mod pc;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::common::constants::{COLD_MISS_LABEL, INVALIDATION_MISS_LABEL};
use crate::common::{Distance, MAX_ACCESS_COUNT, RdaError, Result};
use crate::config::StatsConfig;

pub use histogram::LogHistogram;
pub use pc::PcStats;

/// Octaves pre-allocated for the main histogram.
const INITIAL_OCTAVES: u32 = 20;

/// One histogram point: bucket label and count.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HistogramEntry {
    /// Lower bound of the bucket, or a miss sentinel label.
    pub label: f64,
    /// References in the bucket.
    pub count: u64,
}

/// Working-set size for one target hit rate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TargetSize {
    /// Hit rate in `[0, 1)`.
    pub rate: f64,
    /// Blocks needed to reach it; 0 if it is never reached.
    pub size: u64,
}

/// Summary attributes of a [`StackStats`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsAttributes {
    /// All samples, misses included.
    pub sample_count: u64,
    /// Sum of finite distances.
    pub total_distance: u64,
    /// Mean finite distance; `None` without finite samples.
    pub average_distance: Option<f64>,
    /// First-reference misses.
    pub cold_misses: u64,
    /// Misses caused by remote invalidation.
    pub invalidation_misses: u64,
    /// Size reaching a 50% hit rate over all samples.
    pub median_distance: u64,
    /// Samples seen by the ratio predictor.
    pub total_prediction_accesses: u64,
    /// Hits counted across every prediction size.
    pub total_prediction_hits: u64,
    /// Size for each configured hit rate, over all samples.
    pub target_sizes: Vec<TargetSize>,
}

/// Per-period hit counts for each prediction size.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Predictions {
    /// Cache size in bytes to hits per completed period.
    pub sizes: BTreeMap<u64, Vec<u64>>,
    /// Samples per completed period.
    pub accesses: Vec<u64>,
}

#[derive(Clone, Debug, Default)]
struct RatioPredictor {
    current_hits: BTreeMap<u64, u64>,
    history: BTreeMap<u64, Vec<u64>>,
    current_accesses: u64,
    total_accesses: u64,
    total_hits: u64,
    period_accesses: Vec<u64>,
}

impl RatioPredictor {
    fn record(&mut self, distance: Distance, block_size: u64) {
        self.current_accesses += 1;
        self.total_accesses += 1;
        let Some(d) = distance.finite() else {
            return;
        };
        let bytes = d.saturating_mul(block_size);
        for (&size, hits) in &mut self.current_hits {
            if bytes < size {
                *hits += 1;
                self.total_hits += 1;
            }
        }
    }
}

/// Distance statistics for one stack.
#[derive(Clone, Debug)]
pub struct StackStats {
    histogram: LogHistogram,
    block_size: u64,
    samples: u64,
    cold: u64,
    invalidations: u64,
    total_distance: u64,
    target_rates: Vec<f64>,
    predictor: RatioPredictor,
}

impl StackStats {
    /// Creates empty statistics for blocks of `block_size` bytes.
    pub fn new(config: &StatsConfig, block_size: u64) -> Self {
        let mut stats = Self {
            histogram: LogHistogram::new(config.density, INITIAL_OCTAVES),
            block_size,
            samples: 0,
            cold: 0,
            invalidations: 0,
            total_distance: 0,
            target_rates: config.target_rates.clone(),
            predictor: RatioPredictor::default(),
        };
        stats.set_prediction_sizes(&config.prediction_sizes);
        stats
    }

    /// Default density and hit rates for blocks of `block_size` bytes.
    pub fn with_block_size(block_size: u64) -> Self {
        Self::new(&StatsConfig::default(), block_size)
    }

    /// Folds one distance into the statistics.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::CounterOverflow`] when the sample count or the distance total is
    /// exhausted, and the errors of [`LogHistogram::record`].
    pub fn add_sample(&mut self, distance: Distance) -> Result<()> {
        if self.samples >= MAX_ACCESS_COUNT {
            return Err(RdaError::CounterOverflow(self.samples));
        }
        match distance {
            Distance::Finite(d) => {
                let total = self
                    .total_distance
                    .checked_add(d)
                    .ok_or(RdaError::CounterOverflow(self.samples))?;
                let _ = self.histogram.record(d)?;
                self.total_distance = total;
            }
            Distance::ColdMiss => self.cold += 1,
            Distance::InvalidationMiss => self.invalidations += 1,
        }
        self.samples += 1;
        self.predictor.record(distance, self.block_size);
        Ok(())
    }

    /// All samples, misses included.
    pub const fn total_samples(&self) -> u64 {
        self.samples
    }

    /// Sum of finite distances.
    pub const fn total_distance(&self) -> u64 {
        self.total_distance
    }

    /// First-reference misses.
    pub const fn cold_misses(&self) -> u64 {
        self.cold
    }

    /// Invalidation misses.
    pub const fn invalidation_misses(&self) -> u64 {
        self.invalidations
    }

    /// Samples with a finite distance.
    pub const fn finite_samples(&self) -> u64 {
        self.samples - self.cold - self.invalidations
    }

    /// Block size used for prediction hits.
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Underlying finite-distance histogram.
    pub const fn distance_histogram(&self) -> &LogHistogram {
        &self.histogram
    }

    /// Smallest size (in blocks) at which `rate` of the finite samples hit.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidHitRate`] unless `0 <= rate < 1`.
    pub fn target_size(&self, rate: f64) -> Result<u64> {
        if !(0.0..1.0).contains(&rate) {
            return Err(RdaError::InvalidHitRate(rate));
        }
        let target = (self.finite_samples() as f64 * rate) as u64;
        // The histogram holds exactly the finite samples, so the target is always reached.
        Ok(self.histogram.size_for_count(target).unwrap_or(0))
    }

    /// Summary attributes. Target sizes here are computed over every sample, so a high miss
    /// share leaves large rates unreached (size 0).
    pub fn attributes(&self) -> StatsAttributes {
        let size_for = |rate: f64| {
            let target = (self.samples as f64 * rate) as u64;
            self.histogram.size_for_count(target).unwrap_or(0)
        };
        let finite = self.finite_samples();
        StatsAttributes {
            sample_count: self.samples,
            total_distance: self.total_distance,
            average_distance: (finite > 0).then(|| self.total_distance as f64 / finite as f64),
            cold_misses: self.cold,
            invalidation_misses: self.invalidations,
            median_distance: size_for(0.5),
            total_prediction_accesses: self.predictor.total_accesses,
            total_prediction_hits: self.predictor.total_hits,
            target_sizes: self
                .target_rates
                .iter()
                .map(|&rate| TargetSize {
                    rate,
                    size: size_for(rate),
                })
                .collect(),
        }
    }

    /// Non-empty buckets followed by the invalidation and cold entries.
    pub fn histogram(&self) -> Vec<HistogramEntry> {
        let mut entries: Vec<HistogramEntry> = self
            .histogram
            .nonzero()
            .map(|(i, count)| HistogramEntry {
                label: self.histogram.label(i),
                count,
            })
            .collect();
        entries.push(HistogramEntry {
            label: INVALIDATION_MISS_LABEL,
            count: self.invalidations,
        });
        entries.push(HistogramEntry {
            label: COLD_MISS_LABEL,
            count: self.cold,
        });
        entries
    }

    /// Histogram as a `{label:count, ...}` dictionary string.
    pub fn histogram_string(&self) -> String {
        let mut out = String::from("{");
        for (i, count) in self.histogram.nonzero() {
            if i == 0 {
                out.push_str(&format!("0:{count}, "));
            } else {
                out.push_str(&format!("{:.6}:{count}, ", self.histogram.label(i)));
            }
        }
        out.push_str(&format!(
            "{INVALIDATION_MISS_LABEL:.6}:{}, {COLD_MISS_LABEL:.6}:{}}}",
            self.invalidations, self.cold
        ));
        out
    }

    /// Replaces the prediction sizes (bytes), clearing the current period.
    pub fn set_prediction_sizes(&mut self, sizes: &[u64]) {
        self.predictor.current_hits = sizes.iter().map(|&s| (s, 0)).collect();
    }

    /// Adds one prediction size, starting a fresh history for it.
    pub fn add_prediction_size(&mut self, size: u64) {
        if !self.predictor.current_hits.contains_key(&size) {
            let _ = self.predictor.current_hits.insert(size, 0);
            let _ = self.predictor.history.insert(size, Vec::new());
        }
    }

    /// Prediction sizes in increasing order.
    pub fn prediction_sizes(&self) -> Vec<u64> {
        self.predictor.current_hits.keys().copied().collect()
    }

    /// Ends a period: appends the current hits and access count to the history and resets them.
    pub fn update_predictions(&mut self) {
        let p = &mut self.predictor;
        for (&size, hits) in &mut p.current_hits {
            p.history.entry(size).or_default().push(*hits);
            *hits = 0;
        }
        p.period_accesses.push(p.current_accesses);
        p.current_accesses = 0;
    }

    /// Discards the current period without recording it.
    pub fn reset_predictions(&mut self) {
        self.predictor.current_accesses = 0;
        for hits in self.predictor.current_hits.values_mut() {
            *hits = 0;
        }
    }

    /// Completed-period history.
    pub fn predictions(&self) -> Predictions {
        Predictions {
            sizes: self.predictor.history.clone(),
            accesses: self.predictor.period_accesses.clone(),
        }
    }
}
