//! Serializable dumps.
//!
//! Every stack produces one of these structures from `report()`. They serialize with `serde` and
//! are written as JSON by [`to_json`] and [`write_json`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::common::Result;
use crate::prefetch::PrefetcherStats;
use crate::stack::StackCounters;
use crate::stats::pc::PcReport;
use crate::stats::{HistogramEntry, Predictions, StackStats, StatsAttributes};

/// Histogram and attributes of one [`StackStats`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsReport {
    /// Non-empty buckets, then the invalidation and cold entries.
    pub histogram: Vec<HistogramEntry>,
    /// Summary attributes.
    pub attributes: StatsAttributes,
}

impl From<&StackStats> for StatsReport {
    fn from(stats: &StackStats) -> Self {
        Self {
            histogram: stats.histogram(),
            attributes: stats.attributes(),
        }
    }
}

/// Dump of a [`ReuseStack`](crate::stack::ReuseStack).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReuseStackReport {
    /// `exact` or `approximate`.
    pub kind: String,
    /// Block size in bytes.
    pub granularity: u64,
    /// Blocks tracked at dump time.
    pub stack_size: usize,
    /// Reference counters.
    pub counters: StackCounters,
    /// Statistics over every reference.
    pub stats: StatsReport,
    /// Statistics over reads.
    pub read: StatsReport,
    /// Statistics over prefetches.
    pub prefetch: StatsReport,
    /// Ratio prediction history.
    pub predictions: Predictions,
}

/// Stacks of one thread in a [`HolderReport`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HolderThreadReport {
    /// Thread id.
    pub thread: usize,
    /// Stack with coherence invalidation.
    pub simulated: ReuseStackReport,
    /// Stack without invalidation, if enabled.
    pub single: Option<ReuseStackReport>,
    /// Prefetch arbiter of the simulated stack, if enabled.
    pub prefetch: Option<PrefetchReport>,
}

/// Stack of one pair of threads in a [`HolderReport`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HolderPairReport {
    /// Pair id (`thread / 2`).
    pub pair: usize,
    /// Stack fed by both threads of the pair.
    pub stack: ReuseStackReport,
}

/// Dump of a [`StackHolder`](crate::holder::StackHolder).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HolderReport {
    /// Allocated threads in id order.
    pub threads: Vec<HolderThreadReport>,
    /// Stack shared by all threads, if enabled.
    pub shared: Option<ReuseStackReport>,
    /// Pair-share stacks in pair order; empty unless the shared stack is enabled.
    pub pairs: Vec<HolderPairReport>,
    /// Per-PC statistics of the simulated stacks.
    pub pc: Vec<PcReport>,
    /// Per-PC statistics of reads in the simulated stacks.
    pub read_pc: Vec<PcReport>,
}

/// Dump of a [`PrefetchArbiter`](crate::prefetch::PrefetchArbiter).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PrefetchReport {
    /// Requests issued.
    pub prefetches: u64,
    /// Requests dropped because another one was issued at the same time.
    pub dropped: u64,
    /// Queued requests canceled by a reference to the same block.
    pub canceled: u64,
    /// Per-model counters, in arbitration order.
    pub prefetchers: Vec<PrefetcherReport>,
    /// Per-PC outcomes, in PC order.
    pub pcs: Vec<PrefetchPcReport>,
}

/// One model of a [`PrefetchReport`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrefetcherReport {
    /// Requests of this model that were issued.
    pub accepted: u64,
    /// Requests of this model that were dropped.
    pub dropped: u64,
    /// The model's own counters.
    #[serde(flatten)]
    pub stats: PrefetcherStats,
}

/// Prefetch outcomes of one PC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PrefetchPcReport {
    /// Program counter.
    pub pc: u64,
    /// Requests issued on behalf of this PC.
    pub requests: u64,
    /// Prefetched blocks this PC later referenced within the miss distance.
    pub hits: u64,
    /// Prefetched blocks this PC later referenced beyond it.
    pub misses: u64,
}

/// One stack of a [`SampledReport`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampledStackReport {
    /// Thread id; `None` for the shared stack.
    pub thread: Option<usize>,
    /// Samples started.
    pub sampled_addresses: u64,
    /// Finalized sample statistics.
    pub stats: StatsReport,
}

/// Dump of a single-owner sampled stack.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampledReport {
    /// Per-thread (or shared) statistics.
    pub stacks: Vec<SampledStackReport>,
    /// Enabled accesses.
    pub sample_accesses: u64,
    /// Sum over accesses of the samples tracked at that access.
    pub addresses_per_sample_total: u64,
    /// Mean samples tracked per access.
    pub addresses_per_sample: Option<f64>,
    /// Mean references a finalized sample lived for.
    pub average_lifetime: Option<f64>,
    /// Samples abandoned at the distance limit or flushed as leftovers.
    pub limit_count: u64,
    /// Remote-write invalidations.
    pub invalidation_count: u64,
    /// Per-PC statistics.
    pub pc: Vec<PcReport>,
}

impl SampledReport {
    pub(crate) fn new(
        stacks: Vec<SampledStackReport>,
        sample_accesses: u64,
        addresses_per_sample_total: u64,
        lifetime_total: u64,
        limit_count: u64,
        invalidation_count: u64,
        pc: Vec<PcReport>,
    ) -> Self {
        let finalized: u64 = stacks.iter().map(|s| s.stats.attributes.sample_count).sum();
        Self {
            stacks,
            sample_accesses,
            addresses_per_sample_total,
            addresses_per_sample: ratio(addresses_per_sample_total, sample_accesses),
            average_lifetime: ratio(lifetime_total, finalized),
            limit_count,
            invalidation_count,
            pc,
        }
    }
}

/// One thread of a [`ParallelReport`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParallelThreadReport {
    /// Thread id.
    pub thread: usize,
    /// Enabled accesses.
    pub sampled_accesses: u64,
    /// Synchronization rounds entered.
    pub sync_count: u64,
    /// Samples finalized as invalidation misses.
    pub invalidations: u64,
    /// Samples pruned.
    pub prunes: u64,
    /// Sum of sample lifetimes in this thread's accesses.
    pub lifetime_total: u64,
    /// Statistics of finalized samples.
    pub stats: StatsReport,
    /// Statistics of samples whose final reference was a read.
    pub read: StatsReport,
}

/// Dump of a [`ParallelEngine`](crate::parallel::ParallelEngine).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParallelReport {
    /// `Private` or `Shared`.
    pub semantics: String,
    /// Registered threads in id order.
    pub threads: Vec<ParallelThreadReport>,
    /// Samples still live at dump time.
    pub active_samples: i64,
    /// Per-PC statistics.
    pub pc: Vec<PcReport>,
    /// Per-PC statistics of read-terminated samples.
    pub read_pc: Vec<PcReport>,
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Serializes `report` as pretty JSON.
///
/// # Errors
///
/// Returns [`RdaError::Json`](crate::RdaError::Json) on serialization failure.
pub fn to_json<T: Serialize>(report: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Writes `report` as pretty JSON to `path`.
///
/// # Errors
///
/// Returns I/O and serialization errors.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, report: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
