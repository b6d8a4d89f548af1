//! The scavenge point marker: an ordered log record demarcating one
//! retention round.

use serde::{Deserialize, Serialize};

/// A scavenge point, written to the `$scavenges` stream.
///
/// A run operates over the half-open log interval from the previous
/// completed point (exclusive) up to this one (inclusive). Records at
/// or past `position` are never touched by the run that targets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengePoint {
    /// Log offset of the marker record itself.
    pub position: u64,
    /// Index within the `$scavenges` stream; doubles as the monotonic
    /// scavenge-point id.
    pub event_number: i64,
    /// Wall clock captured when the point was written; the basis for
    /// all max-age decisions in this round.
    pub effective_now_ms: u64,
    /// Minimum aggregate chunk weight for a rewrite. `-1` forces
    /// none; `0` rewrites on any positive weight.
    pub threshold: i64,
}

impl ScavengePoint {
    /// The upper bound chunk this round may touch.
    pub fn last_chunk(&self, chunk_size: u64) -> u32 {
        super::chunks::chunk_of(self.position, chunk_size)
    }
}
