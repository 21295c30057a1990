//! Reuse-distance (LRU stack distance) engine.
//!
//! This crate computes, for every memory reference, how many distinct blocks were touched since
//! the previous reference to the same block. It provides the following:
//! 1. **Exact stack:** An arena splay tree ranked by subtree weight, with hole tombstones so that
//!    coherence invalidations leave the distances of other blocks untouched.
//! 2. **Approximate stack:** The same contract with interval nodes that are merged under a
//!    relative error bound and rebuilt from a shuffled node list.
//! 3. **Statistics:** Log2 histograms, working-set size for a target hit rate, period-based
//!    ratio predictions, and per-PC histograms.
//! 4. **Sampling:** Single-owner sampled stacks that track a few sample blocks at a time.
//! 5. **Parallel sampling:** Per-thread sampled stacks that merge through a three-stage barrier
//!    with sleep/wake support.
//! 6. **Prefetching:** Stride, DCU and stream prefetcher models behind an arbiter, feeding the
//!    holder's simulated stacks.
//!
//! Configuration is supplied as JSON (`Config`) or via `Config::default()`.

/// Common types (blocks, distances, errors, limits).
pub mod common;
/// Engine configuration (defaults, enums, hierarchical config structures).
pub mod config;
/// Per-thread stack front door for instrumentation callers.
pub mod holder;
/// Multithreaded sampled stack and its shared engine.
pub mod parallel;
/// Prefetcher models and the request arbiter.
pub mod prefetch;
/// Serializable dump structures.
pub mod report;
/// Sampled stacks (private and shared semantics) and the sampling trigger.
pub mod sampled;
/// Exact and approximate reuse stacks and the statistics-collecting wrapper.
pub mod stack;
/// Distance histograms, target sizes, and ratio predictions.
pub mod stats;
/// Barrier trait and implementations for the parallel stack.
pub mod sync;
/// Text trace format and replay.
pub mod trace;
/// Arena splay tree with weighted subtree ranks.
pub mod tree;

/// Error type and result alias used by every fallible operation.
pub use crate::common::{Distance, RdaError, Result};
/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Multi-thread front door; one `access` call per memory reference.
pub use crate::holder::StackHolder;
/// Shared engine and per-thread handle of the parallel sampled stack.
pub use crate::parallel::{ParallelEngine, ParallelSampledStack};
/// Statistics-collecting stack with exact or approximate implementation.
pub use crate::stack::ReuseStack;
