//! Sampled stack with private (per-thread) semantics.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{Leftovers, Sample, SampleTracker, SampleView};
use crate::common::{Distance, Granularity, RdaError, Result};
use crate::config::{Config, StatsConfig};
use crate::report::{SampledReport, SampledStackReport, StatsReport};
use crate::stats::{PcStats, StackStats};
use crate::trace::TraceEvent;

#[derive(Clone, Debug)]
struct ThreadSamples {
    stats: StackStats,
    samples: BTreeMap<u64, Sample>,
    started: u64,
    enabled: bool,
}

/// Per-thread sampled stacks where a write by one thread invalidates the block in every other
/// thread's samples.
#[derive(Clone, Debug)]
pub struct SampledStack {
    granularity: Granularity,
    max_distance: u64,
    stats_config: StatsConfig,
    threads: Vec<Option<ThreadSamples>>,
    enabled: bool,
    tracked: usize,
    sample_accesses: u64,
    addresses_per_sample_total: u64,
    lifetime_total: u64,
    limit_count: u64,
    invalidation_count: u64,
    last_distance: Option<Distance>,
    pc_stats: PcStats,
    trace: Option<Vec<TraceEvent>>,
}

impl SampledStack {
    /// Creates an enabled stack with no allocated threads.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero granularity.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            granularity: config.granularity()?,
            max_distance: config.sampling.max_distance,
            stats_config: config.stats.clone(),
            threads: Vec::new(),
            enabled: true,
            tracked: 0,
            sample_accesses: 0,
            addresses_per_sample_total: 0,
            lifetime_total: 0,
            limit_count: 0,
            invalidation_count: 0,
            last_distance: None,
            pc_stats: PcStats::new(),
            trace: None,
        })
    }

    /// Starts recording every new sample, access, and enable change as trace events.
    pub fn record_trace(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    /// Recorded trace events, if recording was started.
    pub fn trace_events(&self) -> Option<&[TraceEvent]> {
        self.trace.as_deref()
    }

    /// Live sample of `thread` for the block of `address`.
    pub fn sample(&self, thread: usize, address: u64) -> Option<SampleView> {
        let block = self.granularity.block(address);
        self.thread(thread)?.samples.get(&block).map(Sample::view)
    }

    /// Statistics of `thread`.
    pub fn stats(&self, thread: usize) -> Option<&StackStats> {
        self.thread(thread).map(|t| &t.stats)
    }

    /// Sum over accesses of the number of samples tracked at that access.
    pub const fn addresses_per_sample_total(&self) -> u64 {
        self.addresses_per_sample_total
    }

    /// Samples abandoned at the distance limit or flushed as leftovers.
    pub const fn limit_count(&self) -> u64 {
        self.limit_count
    }

    /// Set entries and sample blocks removed by remote writes.
    pub const fn invalidation_count(&self) -> u64 {
        self.invalidation_count
    }

    /// Per-PC statistics of finalized samples.
    pub const fn pc_stats(&self) -> &PcStats {
        &self.pc_stats
    }

    fn thread(&self, thread: usize) -> Option<&ThreadSamples> {
        self.threads.get(thread).and_then(Option::as_ref)
    }

    fn is_enabled(&self, thread: usize) -> bool {
        self.enabled && self.thread(thread).is_some_and(|t| t.enabled)
    }

    fn trace_event(&mut self, event: TraceEvent) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(event);
        }
    }

    /// Removes the sample of `block` from `thread` and records its distance.
    fn finalize(&mut self, thread: usize, block: u64, pc: u64, kind: Finalize) -> Result<()> {
        let Some(state) = self.threads.get_mut(thread).and_then(Option::as_mut) else {
            return Ok(());
        };
        let Some(sample) = state.samples.remove(&block) else {
            return Ok(());
        };
        let distance = match kind {
            Finalize::Reuse => Distance::Finite(sample.distance()),
            Finalize::Limit => Distance::ColdMiss,
            Finalize::Invalidated => Distance::InvalidationMiss,
        };
        state.stats.add_sample(distance)?;
        self.pc_stats.add_sample(pc, distance)?;
        self.lifetime_total += sample.lifetime;
        self.tracked -= 1;
        self.last_distance = Some(distance);
        Ok(())
    }

    /// Applies a write to `block` by another thread to the samples of `thread`.
    fn invalidate(&mut self, thread: usize, block: u64, pc: u64) -> Result<()> {
        let Some(state) = self.threads.get_mut(thread).and_then(Option::as_mut) else {
            return Ok(());
        };
        let mut own_sample = false;
        for (&sampled, sample) in &mut state.samples {
            if sampled == block {
                own_sample = true;
            } else if sample.set.remove(&block) {
                sample.holes += 1;
                self.invalidation_count += 1;
            }
        }
        if own_sample {
            self.invalidation_count += 1;
            self.finalize(thread, block, pc, Finalize::Invalidated)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Finalize {
    Reuse,
    Limit,
    Invalidated,
}

impl SampleTracker for SampledStack {
    fn allocate(&mut self, thread: usize) -> Result<()> {
        if thread >= self.threads.len() {
            self.threads
                .try_reserve(thread + 1 - self.threads.len())
                .map_err(|e| RdaError::allocation("sampled thread table", e))?;
            self.threads.resize_with(thread + 1, || None);
        }
        if let Some(old) = self.threads[thread].take() {
            self.tracked -= old.samples.len();
        }
        self.threads[thread] = Some(ThreadSamples {
            stats: StackStats::new(&self.stats_config, self.granularity.bytes()),
            samples: BTreeMap::new(),
            started: 0,
            enabled: true,
        });
        debug!(thread, "allocated sampled stack thread");
        Ok(())
    }

    fn new_sample(&mut self, address: u64, thread: usize, pc: u64) -> Result<()> {
        if !self.is_enabled(thread) {
            return Ok(());
        }
        let block = self.granularity.block(address);
        let Some(state) = self.threads.get_mut(thread).and_then(Option::as_mut) else {
            return Ok(());
        };
        if state.samples.contains_key(&block) {
            return Ok(());
        }
        let _ = state.samples.insert(block, Sample::new(pc));
        state.started += 1;
        self.tracked += 1;
        self.trace_event(TraceEvent::NewSample {
            thread,
            address: self.granularity.address_of(block),
        });
        Ok(())
    }

    fn access(&mut self, address: u64, thread: usize, pc: u64, is_write: bool) -> Result<bool> {
        if !self.is_enabled(thread) {
            return Ok(false);
        }
        let block = self.granularity.block(address);
        self.sample_accesses += 1;
        self.addresses_per_sample_total += self.tracked as u64;

        if self.thread(thread).is_some_and(|t| t.samples.contains_key(&block)) {
            self.finalize(thread, block, pc, Finalize::Reuse)?;
        }
        if is_write {
            for other in (0..self.threads.len()).filter(|&t| t != thread) {
                self.invalidate(other, block, pc)?;
            }
        }
        self.trace_event(TraceEvent::Access {
            thread,
            address: self.granularity.address_of(block),
            is_write,
        });

        let max_distance = self.max_distance;
        let mut full = Vec::new();
        if let Some(state) = self.threads.get_mut(thread).and_then(Option::as_mut) {
            for (&sampled, sample) in &mut state.samples {
                sample.record(block)?;
                if sample.distance() > max_distance {
                    full.push(sampled);
                }
            }
        }
        for sampled in full {
            self.finalize(thread, sampled, pc, Finalize::Limit)?;
            self.limit_count += 1;
        }
        Ok(self.tracked == 0)
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_thread_enabled(&mut self, thread: usize, enabled: bool) {
        if let Some(state) = self.threads.get_mut(thread).and_then(Option::as_mut) {
            state.enabled = enabled;
        }
        self.trace_event(TraceEvent::Enable { thread, enabled });
    }

    fn record_leftovers(&mut self) -> Result<Leftovers> {
        let mut leftovers = Leftovers::default();
        for thread in 0..self.threads.len() {
            loop {
                let next = self
                    .thread(thread)
                    .and_then(|t| t.samples.first_key_value())
                    .map(|(&block, sample)| (block, sample.set.len() as u64));
                let Some((block, set_len)) = next else {
                    break;
                };
                self.limit_count += 1;
                leftovers.count += 1;
                leftovers.distance += set_len;
                self.finalize(thread, block, 0, Finalize::Limit)?;
            }
        }
        info!(
            count = leftovers.count,
            distance = leftovers.distance,
            "recorded leftover samples as cold misses"
        );
        Ok(leftovers)
    }

    fn tracked_samples(&self) -> usize {
        self.tracked
    }

    fn last_distance(&self) -> Option<Distance> {
        self.last_distance
    }

    fn report(&self) -> SampledReport {
        let stacks = self
            .threads
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
            .map(|(thread, t)| SampledStackReport {
                thread: Some(thread),
                sampled_addresses: t.started,
                stats: StatsReport::from(&t.stats),
            })
            .collect();
        SampledReport::new(
            stacks,
            self.sample_accesses,
            self.addresses_per_sample_total,
            self.lifetime_total,
            self.limit_count,
            self.invalidation_count,
            self.pc_stats.report(),
        )
    }
}
