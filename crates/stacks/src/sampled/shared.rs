//! Sampled stack with shared semantics.
//!
//! Every thread feeds one sample map, so a sample's distance counts the distinct blocks touched
//! by all threads. There is no invalidation.

use std::collections::BTreeMap;

use tracing::info;

use super::{Leftovers, Sample, SampleTracker, SampleView};
use crate::common::{Distance, Granularity, RdaError, Result};
use crate::config::Config;
use crate::report::{SampledReport, SampledStackReport, StatsReport};
use crate::stats::{PcStats, StackStats};

/// One sample map shared by all threads.
#[derive(Clone, Debug)]
pub struct SharedSampledStack {
    granularity: Granularity,
    max_distance: u64,
    stats: StackStats,
    samples: BTreeMap<u64, Sample>,
    enabled: bool,
    thread_enabled: Vec<bool>,
    started: u64,
    sample_accesses: u64,
    addresses_per_sample_total: u64,
    lifetime_total: u64,
    limit_count: u64,
    last_distance: Option<Distance>,
    pc_stats: PcStats,
}

impl SharedSampledStack {
    /// Creates an enabled stack.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero granularity.
    pub fn new(config: &Config) -> Result<Self> {
        let granularity = config.granularity()?;
        Ok(Self {
            granularity,
            max_distance: config.sampling.max_distance,
            stats: StackStats::new(&config.stats, granularity.bytes()),
            samples: BTreeMap::new(),
            enabled: true,
            thread_enabled: Vec::new(),
            started: 0,
            sample_accesses: 0,
            addresses_per_sample_total: 0,
            lifetime_total: 0,
            limit_count: 0,
            last_distance: None,
            pc_stats: PcStats::new(),
        })
    }

    /// Live sample for the block of `address`.
    pub fn sample(&self, address: u64) -> Option<SampleView> {
        self.samples
            .get(&self.granularity.block(address))
            .map(Sample::view)
    }

    /// Statistics of all finalized samples.
    pub const fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Sum over accesses of the number of samples tracked at that access.
    pub const fn addresses_per_sample_total(&self) -> u64 {
        self.addresses_per_sample_total
    }

    /// Samples abandoned at the distance limit or flushed as leftovers.
    pub const fn limit_count(&self) -> u64 {
        self.limit_count
    }

    fn is_enabled(&self, thread: usize) -> bool {
        self.enabled && self.thread_enabled.get(thread).copied().unwrap_or(false)
    }

    fn finalize(&mut self, block: u64, pc: u64, limit: bool) -> Result<()> {
        let Some(sample) = self.samples.remove(&block) else {
            return Ok(());
        };
        let distance = if limit {
            Distance::ColdMiss
        } else {
            Distance::Finite(sample.distance())
        };
        self.stats.add_sample(distance)?;
        self.pc_stats.add_sample(pc, distance)?;
        self.lifetime_total += sample.lifetime;
        self.last_distance = Some(distance);
        Ok(())
    }
}

impl SampleTracker for SharedSampledStack {
    fn allocate(&mut self, thread: usize) -> Result<()> {
        if thread >= self.thread_enabled.len() {
            self.thread_enabled
                .try_reserve(thread + 1 - self.thread_enabled.len())
                .map_err(|e| RdaError::allocation("sampled thread table", e))?;
            self.thread_enabled.resize(thread + 1, false);
        }
        self.thread_enabled[thread] = true;
        Ok(())
    }

    fn new_sample(&mut self, address: u64, thread: usize, pc: u64) -> Result<()> {
        if !self.is_enabled(thread) {
            return Ok(());
        }
        let block = self.granularity.block(address);
        if self.samples.contains_key(&block) {
            return Ok(());
        }
        let _ = self.samples.insert(block, Sample::new(pc));
        self.started += 1;
        Ok(())
    }

    fn access(&mut self, address: u64, thread: usize, pc: u64, _is_write: bool) -> Result<bool> {
        if !self.is_enabled(thread) {
            return Ok(false);
        }
        let block = self.granularity.block(address);
        self.sample_accesses += 1;
        self.addresses_per_sample_total += self.samples.len() as u64;
        if self.samples.contains_key(&block) {
            self.finalize(block, pc, false)?;
        }

        let mut full = Vec::new();
        for (&sampled, sample) in &mut self.samples {
            sample.record(block)?;
            if sample.distance() > self.max_distance {
                full.push(sampled);
            }
        }
        for sampled in full {
            self.finalize(sampled, pc, true)?;
            self.limit_count += 1;
        }
        Ok(self.samples.is_empty())
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_thread_enabled(&mut self, thread: usize, enabled: bool) {
        if let Some(flag) = self.thread_enabled.get_mut(thread) {
            *flag = enabled;
        }
    }

    fn record_leftovers(&mut self) -> Result<Leftovers> {
        let mut leftovers = Leftovers::default();
        while let Some((&block, sample)) = self.samples.first_key_value() {
            leftovers.count += 1;
            leftovers.distance += sample.set.len() as u64;
            self.limit_count += 1;
            self.finalize(block, 0, true)?;
        }
        info!(
            count = leftovers.count,
            distance = leftovers.distance,
            "recorded leftover shared samples as cold misses"
        );
        Ok(leftovers)
    }

    fn tracked_samples(&self) -> usize {
        self.samples.len()
    }

    fn last_distance(&self) -> Option<Distance> {
        self.last_distance
    }

    fn report(&self) -> SampledReport {
        SampledReport::new(
            vec![SampledStackReport {
                thread: None,
                sampled_addresses: self.started,
                stats: StatsReport::from(&self.stats),
            }],
            self.sample_accesses,
            self.addresses_per_sample_total,
            self.lifetime_total,
            self.limit_count,
            0,
            self.pc_stats.report(),
        )
    }
}
