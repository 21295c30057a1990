//! Log2-bucketed distance histogram.
//!
//! Bucket 0 holds distance 0; distance `d >= 1` lands in bucket `floor(log2(d) * density) + 1`,
//! whose label is `2^((i - 1) / density)`. The bucket vector grows on demand.

use crate::common::{MAX_ACCESS_COUNT, RdaError, Result};

/// Histogram of finite distances with `density` buckets per octave.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHistogram {
    density: u32,
    buckets: Vec<u64>,
}

impl LogHistogram {
    /// Creates a histogram pre-sized for `octaves` powers of two.
    pub fn new(density: u32, octaves: u32) -> Self {
        let density = density.max(1);
        Self {
            density,
            buckets: vec![0; (density * octaves) as usize + 1],
        }
    }

    /// Buckets per octave.
    pub const fn density(&self) -> u32 {
        self.density
    }

    /// Bucket index for distance `d`.
    pub fn bucket_of(&self, d: u64) -> usize {
        if d == 0 {
            0
        } else {
            ((d as f64).log2() * f64::from(self.density)) as usize + 1
        }
    }

    /// Lower-bound label of bucket `i`.
    pub fn label(&self, i: usize) -> f64 {
        if i == 0 {
            0.0
        } else {
            2f64.powf((i - 1) as f64 / f64::from(self.density))
        }
    }

    /// Counts `d`, returning its bucket.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::BucketOverflow`] if the bucket is saturated and
    /// [`RdaError::Allocation`] if the bucket vector cannot grow.
    pub fn record(&mut self, d: u64) -> Result<usize> {
        let bucket = self.bucket_of(d);
        if bucket >= self.buckets.len() {
            let extra = bucket + 1 - self.buckets.len();
            self.buckets
                .try_reserve(extra)
                .map_err(|e| RdaError::allocation("distance histogram", e))?;
            self.buckets.resize(bucket + 1, 0);
        }
        if self.buckets[bucket] >= MAX_ACCESS_COUNT {
            return Err(RdaError::BucketOverflow { bucket });
        }
        self.buckets[bucket] += 1;
        Ok(bucket)
    }

    /// Count in bucket `i`.
    pub fn count(&self, i: usize) -> u64 {
        self.buckets.get(i).copied().unwrap_or(0)
    }

    /// Non-empty buckets as `(index, count)`, in increasing distance order.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.buckets
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, c)| c > 0)
    }

    /// Smallest bucket label at which the cumulative count reaches `target`, using 1 when
    /// bucket 0 already suffices. `None` if the histogram holds fewer than `target` samples.
    pub fn size_for_count(&self, target: u64) -> Option<u64> {
        let mut cumulative = 0;
        for (i, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return Some(if i == 0 { 1 } else { self.label(i) as u64 });
            }
        }
        None
    }
}
