//! Configuration system for the reuse-distance engine.
//!
//! This module defines all configuration structures and enums used to parameterize the stacks.
//! It provides:
//! 1. **Defaults:** Baseline constants (granularity, error rate, sampling interval, limits).
//! 2. **Structures:** Hierarchical config for general, stack, statistics, and sampling settings.
//! 3. **Enums:** Stack implementation, sharing semantics, barrier kind, and prefetcher kind.
//!
//! Configuration is supplied as JSON (`Config::from_json`) or via `Config::default()`.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::common::constants::{DEFAULT_MAX_ACCESS_SIZE, MAX_THREADS};
use crate::common::{Granularity, RdaError, Result};

/// Default configuration constants for the engine.
///
/// These values define the baseline configuration when not explicitly overridden in JSON.
mod defaults {
    /// Tracking granularity in bytes (one 64-byte cache line).
    pub const GRANULARITY: u64 = 64;

    /// Upper bound on concurrently registered threads.
    pub const MAX_THREADS: usize = super::MAX_THREADS;

    /// Largest access accepted by a reuse stack (one page).
    pub const MAX_ACCESS_SIZE: u64 = super::DEFAULT_MAX_ACCESS_SIZE;

    /// References a prefetch request waits before it is issued.
    pub const PREFETCH_DELAY: u64 = 0;

    /// Seed for the approximate stack's compression shuffle.
    pub const SHUFFLE_SEED: u64 = 0x5EED_0F5E_ED5E_ED00;

    /// Relative error bound of the approximate stack (1%).
    pub const ERROR_RATE: f64 = 0.01;

    /// Histogram buckets per octave of distance.
    pub const DENSITY: u32 = 10;

    /// Hit rates for which working-set sizes are reported.
    pub const TARGET_RATES: [f64; 4] = [0.5, 0.9, 0.95, 0.99];

    /// Mean number of references between two samples.
    pub const SAMPLE_INTERVAL: u64 = 1_000_000;

    /// Largest sampled distance before a sample is abandoned as a cold miss.
    pub const MAX_DISTANCE: u64 = 50_000_000;

    /// Finalized samples required before pruning starts.
    pub const PRUNE_MIN_SAMPLES: u64 = 100;

    /// Hit rate whose working-set size bounds live samples when pruning.
    pub const PRUNE_TARGET_RATE: f64 = 0.99;
}

/// Reuse stack implementation.
///
/// Deserialized from `"exact"` or `"approximate"` (case-insensitive); any other string is
/// rejected with [`RdaError::UnknownStackKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum StackKind {
    /// Splay tree with one node per block; exact distances.
    #[default]
    Exact,
    /// Interval nodes merged under a relative error bound.
    Approximate,
}

impl FromStr for StackKind {
    type Err = RdaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "approximate" | "approx" => Ok(Self::Approximate),
            _ => Err(RdaError::UnknownStackKind(s.to_owned())),
        }
    }
}

impl TryFrom<String> for StackKind {
    type Error = RdaError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Approximate => write!(f, "approximate"),
        }
    }
}

/// Whether threads model private caches (with coherence invalidation) or one shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Semantics {
    /// Per-thread stacks; a write invalidates the block in every other thread.
    #[default]
    Private,
    /// One logical stack; every thread's references count toward every sample.
    Shared,
}

/// Prefetcher model fed by the holder's simulated stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PrefetcherKind {
    /// Per-PC stride table.
    Stride,
    /// Next-block prefetch on a quick repeat of the same block.
    Dcu,
    /// PC-independent stream table.
    GlobalStream,
}

/// Barrier used by the parallel sampled stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BarrierKind {
    /// Three-stage spinning barrier for one OS thread per registered thread.
    #[default]
    Spin,
    /// No-op barrier for driving every thread from a single OS thread.
    Serial,
}

/// Root configuration structure containing all engine settings.
///
/// # Examples
///
/// Creating a default configuration:
///
/// ```
/// use rda_stacks::config::{Config, StackKind};
///
/// let config = Config::default();
/// assert_eq!(config.general.granularity, 64);
/// assert_eq!(config.stack.kind, StackKind::Exact);
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use rda_stacks::config::{Config, Semantics, StackKind};
///
/// let json = r#"{
///     "general": { "granularity": 8, "max_threads": 4, "semantics": "Shared" },
///     "stack": { "kind": "approximate", "error_rate": 0.05 },
///     "sampling": { "sample_interval": 1000, "prune": { "min_samples": 10 } }
/// }"#;
///
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.general.semantics, Semantics::Shared);
/// assert_eq!(config.stack.kind, StackKind::Approximate);
/// assert_eq!(config.sampling.prune.unwrap().target_rate, 0.99);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Granularity, thread limit, and semantics.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Stack implementation settings.
    #[serde(default)]
    pub stack: StackConfig,
    /// Histogram and prediction settings.
    #[serde(default)]
    pub stats: StatsConfig,
    /// Sampled and parallel stack settings.
    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl Config {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Json`] for malformed JSON or an unknown stack kind, and any error of
    /// [`Config::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero granularity, an error rate outside (0, 1),
    /// a zero density, a thread limit outside `1..=16`, a zero sample interval, a zero access
    /// size limit, or an empty prefetcher list, and [`RdaError::InvalidHitRate`] for a target
    /// rate outside `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        let _ = self.granularity()?;
        if self.general.max_access_size == 0 {
            return Err(RdaError::InvalidConfig(
                "max_access_size must be positive".to_owned(),
            ));
        }
        if self
            .stack
            .prefetch
            .as_ref()
            .is_some_and(|p| p.prefetchers.is_empty())
        {
            return Err(RdaError::InvalidConfig(
                "prefetch needs at least one prefetcher".to_owned(),
            ));
        }
        if !(self.stack.error_rate > 0.0 && self.stack.error_rate < 1.0) {
            return Err(RdaError::InvalidConfig(format!(
                "error rate must be in (0, 1), got {}",
                self.stack.error_rate
            )));
        }
        if self.stats.density == 0 {
            return Err(RdaError::InvalidConfig(
                "histogram density must be positive".to_owned(),
            ));
        }
        if self.general.max_threads == 0 || self.general.max_threads > MAX_THREADS {
            return Err(RdaError::InvalidConfig(format!(
                "max_threads must be in 1..={MAX_THREADS}, got {}",
                self.general.max_threads
            )));
        }
        if self.sampling.sample_interval == 0 {
            return Err(RdaError::InvalidConfig(
                "sample interval must be positive".to_owned(),
            ));
        }
        let prune_rate = self.sampling.prune.map(|p| p.target_rate);
        for &rate in self.stats.target_rates.iter().chain(prune_rate.iter()) {
            if !(0.0..1.0).contains(&rate) {
                return Err(RdaError::InvalidHitRate(rate));
            }
        }
        Ok(())
    }

    /// Block granularity derived from `general.granularity`.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero granularity.
    pub fn granularity(&self) -> Result<Granularity> {
        Granularity::new(self.general.granularity)
    }
}

/// General engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Block size in bytes; rounded down to a power of two.
    #[serde(default = "GeneralConfig::default_granularity")]
    pub granularity: u64,
    /// Maximum number of threads (at most 16).
    #[serde(default = "GeneralConfig::default_max_threads")]
    pub max_threads: usize,
    /// Private (invalidating) or shared semantics.
    #[serde(default)]
    pub semantics: Semantics,
    /// Seed for every internal random number generator.
    #[serde(default = "GeneralConfig::default_shuffle_seed")]
    pub shuffle_seed: u64,
    /// Largest `size` a reuse stack accepts for one access or snoop.
    #[serde(default = "GeneralConfig::default_max_access_size")]
    pub max_access_size: u64,
}

impl GeneralConfig {
    fn default_granularity() -> u64 {
        defaults::GRANULARITY
    }

    fn default_max_threads() -> usize {
        defaults::MAX_THREADS
    }

    fn default_shuffle_seed() -> u64 {
        defaults::SHUFFLE_SEED
    }

    fn default_max_access_size() -> u64 {
        defaults::MAX_ACCESS_SIZE
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            granularity: defaults::GRANULARITY,
            max_threads: defaults::MAX_THREADS,
            semantics: Semantics::default(),
            shuffle_seed: defaults::SHUFFLE_SEED,
            max_access_size: defaults::MAX_ACCESS_SIZE,
        }
    }
}

/// Reuse stack settings used by [`ReuseStack`](crate::stack::ReuseStack) and the holder.
#[derive(Debug, Clone, Deserialize)]
pub struct StackConfig {
    /// Exact or approximate implementation.
    #[serde(default)]
    pub kind: StackKind,
    /// Relative error bound for the approximate stack.
    #[serde(default = "StackConfig::default_error_rate")]
    pub error_rate: f64,
    /// Also keep per-thread stacks that ignore invalidations.
    #[serde(default)]
    pub simulate_single: bool,
    /// Also keep one stack shared by every thread, and one per pair of threads.
    #[serde(default)]
    pub simulate_shared: bool,
    /// Per-thread prefetchers feeding the simulated stacks; disabled when absent.
    #[serde(default)]
    pub prefetch: Option<PrefetchConfig>,
}

impl StackConfig {
    fn default_error_rate() -> f64 {
        defaults::ERROR_RATE
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            kind: StackKind::default(),
            error_rate: defaults::ERROR_RATE,
            simulate_single: false,
            simulate_shared: false,
            prefetch: None,
        }
    }
}

/// Prefetcher models and the arbiter's issue delay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrefetchConfig {
    /// Models consulted in order; earlier entries win ties.
    #[serde(default = "PrefetchConfig::default_prefetchers")]
    pub prefetchers: Vec<PrefetcherKind>,
    /// References between a request and its issue.
    #[serde(default = "PrefetchConfig::default_delay")]
    pub delay: u64,
}

impl PrefetchConfig {
    fn default_prefetchers() -> Vec<PrefetcherKind> {
        vec![PrefetcherKind::Stride]
    }

    fn default_delay() -> u64 {
        defaults::PREFETCH_DELAY
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            prefetchers: Self::default_prefetchers(),
            delay: defaults::PREFETCH_DELAY,
        }
    }
}

/// Histogram and ratio-prediction settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Histogram buckets per octave.
    #[serde(default = "StatsConfig::default_density")]
    pub density: u32,
    /// Cache sizes in bytes for which per-period hit counts are collected.
    #[serde(default)]
    pub prediction_sizes: Vec<u64>,
    /// Hit rates reported in the working-set size table.
    #[serde(default = "StatsConfig::default_target_rates")]
    pub target_rates: Vec<f64>,
}

impl StatsConfig {
    fn default_density() -> u32 {
        defaults::DENSITY
    }

    fn default_target_rates() -> Vec<f64> {
        defaults::TARGET_RATES.to_vec()
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            density: defaults::DENSITY,
            prediction_sizes: Vec::new(),
            target_rates: defaults::TARGET_RATES.to_vec(),
        }
    }
}

/// Sampled and parallel stack settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Mean references between samples, used by [`SampleTrigger`](crate::sampled::SampleTrigger).
    #[serde(default = "SamplingConfig::default_sample_interval")]
    pub sample_interval: u64,
    /// Samples whose distance grows beyond this are finalized as cold misses.
    #[serde(default = "SamplingConfig::default_max_distance")]
    pub max_distance: u64,
    /// Pruning of long-lived samples in the parallel stack; disabled when absent.
    #[serde(default)]
    pub prune: Option<PruneConfig>,
    /// Barrier implementation for the parallel stack.
    #[serde(default)]
    pub barrier: BarrierKind,
}

impl SamplingConfig {
    fn default_sample_interval() -> u64 {
        defaults::SAMPLE_INTERVAL
    }

    fn default_max_distance() -> u64 {
        defaults::MAX_DISTANCE
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_interval: defaults::SAMPLE_INTERVAL,
            max_distance: defaults::MAX_DISTANCE,
            prune: None,
            barrier: BarrierKind::default(),
        }
    }
}

/// Pruning policy: once enough samples have finished, a new sample abandons this thread's
/// oldest live sample if it already exceeds the working-set size for `target_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PruneConfig {
    /// Finalized samples required before pruning is considered.
    #[serde(default = "PruneConfig::default_min_samples")]
    pub min_samples: u64,
    /// Hit rate whose working-set size is the pruning threshold.
    #[serde(default = "PruneConfig::default_target_rate")]
    pub target_rate: f64,
}

impl PruneConfig {
    fn default_min_samples() -> u64 {
        defaults::PRUNE_MIN_SAMPLES
    }

    fn default_target_rate() -> f64 {
        defaults::PRUNE_TARGET_RATE
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            min_samples: defaults::PRUNE_MIN_SAMPLES,
            target_rate: defaults::PRUNE_TARGET_RATE,
        }
    }
}
