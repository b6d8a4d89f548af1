//! Logical-chunk arithmetic and per-chunk timestamp ranges.

use serde::{Deserialize, Serialize};

/// The logical chunk containing a log position.
pub fn chunk_of(position: u64, chunk_size: u64) -> u32 {
    debug_assert!(chunk_size > 0, "chunk size must be positive");
    (position / chunk_size) as u32
}

/// Observed timestamp range of the records in one physical chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTimeRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl ChunkTimeRange {
    pub fn of(timestamp_ms: u64) -> Self {
        Self {
            min_ms: timestamp_ms,
            max_ms: timestamp_ms,
        }
    }

    /// Widen the range to cover `timestamp_ms`.
    pub fn widen(&mut self, timestamp_ms: u64) {
        self.min_ms = self.min_ms.min(timestamp_ms);
        self.max_ms = self.max_ms.max(timestamp_ms);
    }

    /// Every record in this chunk is older than `cutoff_ms`, with
    /// `skew_ms` of safety margin for clock drift between writers.
    pub fn ended_before(&self, cutoff_ms: u64, skew_ms: u64) -> bool {
        self.max_ms < cutoff_ms.saturating_sub(skew_ms)
    }
}
