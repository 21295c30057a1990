//! Reuse distance values.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::{COLD_MISS_LABEL, INVALIDATION_MISS_LABEL};

/// Outcome of one reference: the number of distinct blocks since the previous reference to the
/// same block, or one of the two miss kinds for which no such count exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    /// Distinct blocks referenced since the last reference to this block.
    Finite(u64),
    /// First reference to the block.
    ColdMiss,
    /// The block was invalidated by another thread's write before this reference.
    InvalidationMiss,
}

impl Distance {
    /// Returns the finite distance, if any.
    pub const fn finite(self) -> Option<u64> {
        match self {
            Self::Finite(d) => Some(d),
            Self::ColdMiss | Self::InvalidationMiss => None,
        }
    }

    /// Returns `true` for the cold and invalidation sentinels.
    pub const fn is_miss(self) -> bool {
        !matches!(self, Self::Finite(_))
    }

    /// Label used for this distance in histogram dumps.
    pub fn label(self) -> f64 {
        match self {
            Self::Finite(d) => d as f64,
            Self::ColdMiss => COLD_MISS_LABEL,
            Self::InvalidationMiss => INVALIDATION_MISS_LABEL,
        }
    }
}

impl From<u64> for Distance {
    fn from(d: u64) -> Self {
        Self::Finite(d)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(d) => write!(f, "{d}"),
            Self::ColdMiss => write!(f, "cold"),
            Self::InvalidationMiss => write!(f, "invalidated"),
        }
    }
}
