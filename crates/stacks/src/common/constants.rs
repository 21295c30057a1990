//! Engine-wide constants.

/// Largest value any logical-time or sample counter may reach.
///
/// The two values above it are reserved for the invalidation-miss and cold-miss sentinels, so a
/// counter that reaches this limit can no longer produce distinguishable distances.
pub const MAX_ACCESS_COUNT: u64 = i64::MAX as u64 - 2;

/// Histogram label used for cold misses in dumps (2^63).
pub const COLD_MISS_LABEL: f64 = 9_223_372_036_854_775_808.0;

/// Histogram label used for invalidation misses in dumps (2^62).
pub const INVALIDATION_MISS_LABEL: f64 = 4_611_686_018_427_387_904.0;

/// Upper bound on registered threads for the parallel stack and its barrier.
pub const MAX_THREADS: usize = 16;

/// Number of barrier stages per synchronization round.
pub const STAGE_COUNT: usize = 3;

/// Default upper bound on the size of one access, in bytes.
pub const DEFAULT_MAX_ACCESS_SIZE: u64 = 4096;
