//! Scavenger configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ScavengeConfig {
    /// Discard everything for tombstoned streams, tombstone included,
    /// and force every chunk to rewrite. Unsafe: a resurrected replica
    /// can no longer learn the stream was deleted.
    pub unsafe_ignore_hard_deletes: bool,
    /// Minimum aggregate chunk weight for a rewrite. `-1` forces
    /// none; `0` rewrites on any positive weight.
    pub threshold: i64,
    /// Records between cancellation polls inside a chunk rewrite.
    pub cancellation_check_period: u32,
    /// Bytes per logical chunk.
    pub chunk_size: u64,
    /// Safety margin for the coarse max-age comparison against
    /// per-chunk timestamp ranges.
    pub skew_tolerance_ms: u64,
    /// Percent of each chunk's elapsed time the executor is allowed
    /// to use; the rest is slept. 100 disables pacing.
    pub throttle_percent: u32,
    /// Entries in the hash-to-stream-name lookup cache.
    pub hash_cache_capacity: usize,
    /// Streams between `Calculating` checkpoints.
    pub calculator_checkpoint_interval: usize,
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            unsafe_ignore_hard_deletes: false,
            threshold: 0,
            cancellation_check_period: 1024,
            chunk_size: 256 * 1024 * 1024,
            skew_tolerance_ms: 60_000,
            throttle_percent: 100,
            hash_cache_capacity: 10_000,
            calculator_checkpoint_interval: 512,
        }
    }
}

/// Partial config layered over a base (file over defaults, flags over
/// file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ScavengeConfigOverride {
    pub unsafe_ignore_hard_deletes: Option<bool>,
    pub threshold: Option<i64>,
    pub cancellation_check_period: Option<u32>,
    pub chunk_size: Option<u64>,
    pub skew_tolerance_ms: Option<u64>,
    pub throttle_percent: Option<u32>,
    pub hash_cache_capacity: Option<usize>,
    pub calculator_checkpoint_interval: Option<usize>,
}

impl ScavengeConfigOverride {
    pub fn apply_to(&self, target: &mut ScavengeConfig) {
        if let Some(value) = self.unsafe_ignore_hard_deletes {
            target.unsafe_ignore_hard_deletes = value;
        }
        if let Some(value) = self.threshold {
            target.threshold = value;
        }
        if let Some(value) = self.cancellation_check_period {
            target.cancellation_check_period = value;
        }
        if let Some(value) = self.chunk_size {
            target.chunk_size = value;
        }
        if let Some(value) = self.skew_tolerance_ms {
            target.skew_tolerance_ms = value;
        }
        if let Some(value) = self.throttle_percent {
            target.throttle_percent = value;
        }
        if let Some(value) = self.hash_cache_capacity {
            target.hash_cache_capacity = value;
        }
        if let Some(value) = self.calculator_checkpoint_interval {
            target.calculator_checkpoint_interval = value;
        }
    }
}
