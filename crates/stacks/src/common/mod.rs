//! Common types shared by every stack implementation.
//!
//! This module provides the fundamental building blocks of the engine. It includes:
//! 1. **Blocks:** Granularity handling that turns byte addresses into tracked blocks.
//! 2. **Distances:** The reuse-distance value with its cold and invalidation sentinels.
//! 3. **Constants:** Counter limits and dump labels.
//! 4. **Error Handling:** The crate error enum and result alias.

/// Address-to-block conversion.
pub mod block;

/// Counter limits and sentinel labels.
pub mod constants;

/// Reuse distance value type.
pub mod distance;

/// Error types.
pub mod error;

pub use block::Granularity;
pub use constants::MAX_ACCESS_COUNT;
pub use distance::Distance;
pub use error::{RdaError, Result};
