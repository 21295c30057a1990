//! Address-to-block conversion.

use tracing::warn;

use super::error::{RdaError, Result};

/// Tracking granularity: the power-of-two block size in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Granularity {
    bytes: u64,
    shift: u32,
}

impl Granularity {
    /// Creates a granularity of `bytes` bytes.
    ///
    /// A value that is not a power of two is rounded down to the nearest power of two and a
    /// warning is logged.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::InvalidConfig`] for a zero granularity.
    pub fn new(bytes: u64) -> Result<Self> {
        if bytes == 0 {
            return Err(RdaError::InvalidConfig(
                "granularity must be at least one byte".to_owned(),
            ));
        }
        let shift = 63 - bytes.leading_zeros();
        let rounded = 1u64 << shift;
        if rounded != bytes {
            warn!(
                requested = bytes,
                used = rounded,
                "granularity must be a power of 2, rounding down"
            );
        }
        Ok(Self {
            bytes: rounded,
            shift,
        })
    }

    /// Block size in bytes.
    pub const fn bytes(self) -> u64 {
        self.bytes
    }

    /// Block containing `address`.
    #[inline]
    pub const fn block(self, address: u64) -> u64 {
        address >> self.shift
    }

    /// First byte address of `block`.
    pub const fn address_of(self, block: u64) -> u64 {
        block << self.shift
    }

    /// Every block touched by an access of `size` bytes at `address`.
    ///
    /// A zero size is treated as a one-byte access; the range is clamped at the top of the
    /// address space.
    pub fn blocks(self, address: u64, size: u64) -> impl Iterator<Item = u64> {
        let last = address.saturating_add(size.max(1) - 1);
        self.block(address)..=self.block(last)
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self { bytes: 8, shift: 3 }
    }
}
