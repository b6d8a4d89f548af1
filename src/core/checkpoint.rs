//! Durable progress marker for a scavenge run.
//!
//! Transitions are one-way within a run; on restart the driver reads
//! the checkpoint and resumes the owning stage from its sub-progress.

use serde::{Deserialize, Serialize};

use super::handle::StreamHandle;
use super::scavenge_point::ScavengePoint;

/// The checkpoint state machine, stored as a single tagged row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ScavengeCheckpoint {
    Accumulating {
        scavenge_point: ScavengePoint,
        /// First chunk this round sweeps (the chunk holding the
        /// previous completed point, or 0).
        first_chunk: u32,
        /// Last chunk fully accumulated, if any.
        done_chunk: Option<u32>,
    },
    Calculating {
        scavenge_point: ScavengePoint,
        /// Last handle fully calculated, if any.
        last_handle: Option<StreamHandle>,
    },
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        /// Last chunk decided (rewritten or skipped), if any.
        done_chunk: Option<u32>,
    },
    MergingChunks {
        scavenge_point: ScavengePoint,
    },
    ExecutingIndex {
        scavenge_point: ScavengePoint,
    },
    Cleaning {
        scavenge_point: ScavengePoint,
    },
    Done {
        scavenge_point: ScavengePoint,
    },
}

impl ScavengeCheckpoint {
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { scavenge_point, .. }
            | ScavengeCheckpoint::Calculating { scavenge_point, .. }
            | ScavengeCheckpoint::ExecutingChunks { scavenge_point, .. }
            | ScavengeCheckpoint::MergingChunks { scavenge_point }
            | ScavengeCheckpoint::ExecutingIndex { scavenge_point }
            | ScavengeCheckpoint::Cleaning { scavenge_point }
            | ScavengeCheckpoint::Done { scavenge_point } => scavenge_point,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ScavengeCheckpoint::Done { .. })
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            ScavengeCheckpoint::Accumulating { .. } => "accumulating",
            ScavengeCheckpoint::Calculating { .. } => "calculating",
            ScavengeCheckpoint::ExecutingChunks { .. } => "executing_chunks",
            ScavengeCheckpoint::MergingChunks { .. } => "merging_chunks",
            ScavengeCheckpoint::ExecutingIndex { .. } => "executing_index",
            ScavengeCheckpoint::Cleaning { .. } => "cleaning",
            ScavengeCheckpoint::Done { .. } => "done",
        }
    }
}
