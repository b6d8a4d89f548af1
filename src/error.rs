use std::path::PathBuf;

use thiserror::Error;

use crate::state::StateError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (the next run resumes from the checkpoint).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (state or chunk files).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Who asked the run to end early.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CancelReason {
    /// Operator stop request.
    Stop,
    /// Process shutdown.
    Shutdown,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Stop => "stop",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

/// Canonical error enum for the scavenger.
///
/// There are no in-core retries: recovery is resumption from the
/// checkpoint on the next run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScavengeError {
    /// A logically impossible state was read. Fatal; the run aborts
    /// without mutating state further.
    #[error("scavenge state is corrupt: {reason}")]
    CorruptState { reason: String },

    /// A tombstone was discovered inside a metastream.
    #[error("tombstone written to metastream `{metastream}` at position {position}")]
    InvalidMetastreamOperation { metastream: String, position: u64 },

    /// Underlying chunk I/O failed.
    #[error("chunk io failed{}: {source}", path_suffix(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// The chunk was re-replicated out from under the rewrite.
    #[error("chunk {chunk} is being deleted")]
    ChunkBeingDeleted { chunk: u32 },

    /// Cooperative cancellation from the driver.
    #[error("scavenge cancelled ({})", .reason.as_str())]
    Cancelled { reason: CancelReason },

    /// Reported by the index port; verification happens on the next
    /// index startup, not here.
    #[error("index may be corrupt: {reason}")]
    IndexMaybeCorrupt { reason: String },

    /// Fault in the durable scavenge state store.
    #[error(transparent)]
    State(#[from] StateError),

    /// Stream metadata payload that does not parse. Not fatal to a
    /// run; the offending event is skipped and the previous metadata
    /// stands.
    #[error("stream metadata for `{stream}` is invalid: {source}")]
    Metadata {
        stream: String,
        #[source]
        source: serde_json::Error,
    },
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" at {}", path.display()),
        None => String::new(),
    }
}

impl ScavengeError {
    pub fn transience(&self) -> Transience {
        match self {
            ScavengeError::CorruptState { .. } => Transience::Permanent,
            ScavengeError::InvalidMetastreamOperation { .. } => Transience::Permanent,
            ScavengeError::Io { .. } => Transience::Unknown,
            ScavengeError::ChunkBeingDeleted { .. } => Transience::Retryable,
            ScavengeError::Cancelled { .. } => Transience::Retryable,
            ScavengeError::IndexMaybeCorrupt { .. } => Transience::Unknown,
            ScavengeError::State(err) => err.transience(),
            ScavengeError::Metadata { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ScavengeError::CorruptState { .. } => Effect::None,
            ScavengeError::InvalidMetastreamOperation { .. } => Effect::None,
            ScavengeError::Io { .. } => Effect::Unknown,
            ScavengeError::ChunkBeingDeleted { .. } => Effect::None,
            ScavengeError::Cancelled { .. } => Effect::None,
            ScavengeError::IndexMaybeCorrupt { .. } => Effect::Unknown,
            ScavengeError::State(_) => Effect::Unknown,
            ScavengeError::Metadata { .. } => Effect::None,
        }
    }
}
