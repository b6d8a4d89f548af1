//! Stream retention metadata and the per-stream scavenge state rows.

use serde::{Deserialize, Serialize};

use super::discard::DiscardPoint;
use super::handle::StreamHash;

/// Retention options projected from the last metadata event in a
/// stream's metastream. Any subset may be present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamMetadata {
    /// Keep only the last N events.
    pub max_count: Option<u64>,
    /// Drop events older than this.
    pub max_age_ms: Option<u64>,
    /// Drop events numbered below this.
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    pub fn is_empty(&self) -> bool {
        self.max_count.is_none() && self.max_age_ms.is_none() && self.truncate_before.is_none()
    }

    /// Parse a metadata event payload. Unknown fields are ignored the
    /// way the engine ignores user metadata it does not understand.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Where a stream sits in its scavenge lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Has (or may have) retention work left.
    Active,
    /// No retention work left; the row can be pruned.
    Spent,
    /// Tombstoned; the row is kept unless the operator reclaims it.
    Archived,
}

impl StreamStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(StreamStatus::Active),
            1 => Some(StreamStatus::Spent),
            2 => Some(StreamStatus::Archived),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            StreamStatus::Active => 0,
            StreamStatus::Spent => 1,
            StreamStatus::Archived => 2,
        }
    }
}

/// Scavenge state for one original stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OriginalStreamData {
    pub metadata: StreamMetadata,
    pub is_tombstoned: bool,
    pub status: StreamStatus,
    /// Definite lower bound: always safe to discard below this.
    pub discard_point: DiscardPoint,
    /// Tentative point raised by max-age; confirmed per record at
    /// execution time. Invariant: `maybe_discard_point >= discard_point`.
    pub maybe_discard_point: DiscardPoint,
}

impl Default for OriginalStreamData {
    fn default() -> Self {
        Self {
            metadata: StreamMetadata::default(),
            is_tombstoned: false,
            status: StreamStatus::Active,
            discard_point: DiscardPoint::keep_all(),
            maybe_discard_point: DiscardPoint::keep_all(),
        }
    }
}

/// Scavenge state for one metastream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetastreamData {
    /// Hash of the original stream this metastream governs.
    pub original_stream_hash: StreamHash,
    /// Keeps only the latest metadata event.
    pub discard_point: DiscardPoint,
    /// Whether the underlying original stream is tombstoned.
    pub is_tombstoned: bool,
    /// Position of the latest metadata event seen, so a replacement
    /// can weight the superseded record's chunk.
    pub last_metadata_position: Option<u64>,
}
