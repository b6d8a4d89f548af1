#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod ports;
pub mod scavenge;
pub mod state;
pub mod telemetry;
pub mod test_harness;

pub use error::{CancelReason, Effect, ScavengeError, Transience};
pub type Result<T> = std::result::Result<T, ScavengeError>;

// Re-export the main surface at the crate root for convenience
pub use crate::config::{ScavengeConfig, ScavengeConfigOverride};
pub use crate::core::{
    ChunkTimeRange, DiscardPoint, MetastreamData, OriginalStreamData, PrepareBuffer,
    RecordKind, ScavengeCheckpoint, ScavengePoint, StreamHandle, StreamHash, StreamMetadata,
    StreamStatus, SystemBuffer, chunk_of,
};
pub use crate::ports::{
    ChunkManager, ChunkReader, ChunkWriter, Clock, CompletedChunk, EventInfo, IndexEntry,
    IndexReader, IndexWriter, MetastreamLookup, ScavengePointSource, ScavengerLog,
    StandardStreamNames, StreamHasher, SystemClock, TracingScavengerLog, TwoHalfHasher,
};
pub use crate::scavenge::{
    CancellationToken, ScavengeOutcome, ScavengeRunner, Scavenger, StartOutcome, StopOutcome,
};
pub use crate::state::ScavengeState;
