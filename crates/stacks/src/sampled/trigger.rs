//! Random sampling intervals.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{RdaError, Result};

/// Counts references down to the next sample point.
///
/// Intervals are drawn uniformly from `1..=2 * mean - 1`, so their mean is `mean` and samples do
/// not lock onto periodic access patterns.
#[derive(Clone, Debug)]
pub struct SampleTrigger {
    mean: u64,
    remaining: u64,
    rng: StdRng,
}

impl SampleTrigger {
    /// Creates a trigger with the given mean interval and seed.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero mean.
    pub fn new(mean: u64, seed: u64) -> Result<Self> {
        if mean == 0 {
            return Err(RdaError::InvalidConfig(
                "sample interval must be positive".to_owned(),
            ));
        }
        let mut trigger = Self {
            mean,
            remaining: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        trigger.remaining = trigger.next_interval();
        Ok(trigger)
    }

    /// Draws a fresh interval.
    pub fn next_interval(&mut self) -> u64 {
        match self.mean {
            1 => 1,
            mean => self.rng.gen_range(1..=mean.saturating_mul(2) - 1),
        }
    }

    /// Counts one reference; returns `true` when it should start a sample.
    pub fn tick(&mut self) -> bool {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.remaining = self.next_interval();
            true
        } else {
            false
        }
    }

    /// Mean interval.
    pub const fn mean(&self) -> u64 {
        self.mean
    }

    /// References left until the next sample.
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }
}
