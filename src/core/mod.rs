//! Domain types for the scavenger: discard points, stream handles,
//! record buffers, scavenge points, and the checkpoint state machine.

mod checkpoint;
mod chunks;
mod discard;
mod handle;
mod metadata;
mod record;
mod scavenge_point;
mod streams;

pub use checkpoint::ScavengeCheckpoint;
pub use chunks::{ChunkTimeRange, chunk_of};
pub use discard::DiscardPoint;
pub use handle::{StreamHandle, StreamHash};
pub use metadata::{MetastreamData, OriginalStreamData, StreamMetadata, StreamStatus};
pub use record::{PrepareBuffer, RecordKind, SystemBuffer};
pub use scavenge_point::ScavengePoint;
pub use streams::{SCAVENGES_STREAM, is_metastream, metastream_of, original_stream_of};
