//! Difficulty thresholds derived from a multiplier.
//!
//! Higher threshold values mean harder work. A multiplier scales difficulty
//! by shrinking the "inverse gap" (`2^64 - threshold`), so multiplier 64 over
//! the receive base lands exactly on the send threshold.

/// Base threshold at multiplier 1 (receive blocks, and all Banano blocks).
pub const BASE_THRESHOLD: u64 = 0xFFFFFE00_00000000;

/// Largest multiplier a requester may ask for.
pub const MAX_MULTIPLIER: u32 = 128;

/// Clamp a requested multiplier into `[1, MAX_MULTIPLIER]`.
pub fn clamp_multiplier(requested: i64) -> u32 {
    requested.clamp(1, MAX_MULTIPLIER as i64) as u32
}

/// Multiplier-based PoW thresholds over a configurable base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkThresholds {
    pub base: u64,
}

impl WorkThresholds {
    pub fn new() -> Self {
        Self {
            base: BASE_THRESHOLD,
        }
    }

    /// Construct with a custom base (useful in tests or low-difficulty devnets).
    pub fn with_base(base: u64) -> Self {
        Self { base }
    }

    /// Threshold a work value must reach for `multiplier`.
    ///
    /// Computed as `2^64 - (2^64 - base) / multiplier` in integer arithmetic.
    /// A multiplier of 0 is treated as 1. When `base` is 0 (PoW disabled)
    /// every threshold is 0.
    pub fn threshold_for(&self, multiplier: u32) -> u64 {
        if self.base == 0 {
            return 0;
        }
        let multiplier = u64::from(multiplier.max(1));
        // (2^64 - base) without overflowing: (u64::MAX - base) + 1.
        let difficulty_inv = (u64::MAX - self.base) + 1;
        let scaled_inv = difficulty_inv / multiplier;
        if scaled_inv == 0 {
            return u64::MAX;
        }
        (u64::MAX - scaled_inv) + 1
    }
}

impl Default for WorkThresholds {
    fn default() -> Self {
        Self::new()
    }
}
