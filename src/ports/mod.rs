//! Abstract collaborators consumed by the scavenger core.
//!
//! The core owns only its durable state; chunk files and index tables
//! are mutated through these single-writer ports.

mod hasher;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::Result;
use crate::core::{
    PrepareBuffer, RecordKind, ScavengePoint, StreamHandle, StreamHash, SystemBuffer,
};
use crate::scavenge::{CancellationToken, ScavengeOutcome};

pub use hasher::{StreamHasher, TwoHalfHasher};

/// Sequential reader over one physical chunk.
///
/// Records are streamed into two caller-owned buffers (see
/// [`PrepareBuffer`], [`SystemBuffer`]); `next_record` reports which
/// one it filled.
pub trait ChunkReader {
    /// First logical chunk number this physical chunk covers.
    fn chunk_start_number(&self) -> u32;
    /// Last logical chunk number this physical chunk covers (equal to
    /// the start unless chunks were merged).
    fn chunk_end_number(&self) -> u32;
    fn chunk_start_position(&self) -> u64;
    fn chunk_end_position(&self) -> u64;
    /// A completed chunk; the open chunk at the write head is not.
    fn is_read_only(&self) -> bool;
    fn file_size(&self) -> u64;
    fn name(&self) -> &str;
    fn next_record(
        &mut self,
        prepare: &mut PrepareBuffer,
        system: &mut SystemBuffer,
    ) -> Result<Option<RecordKind>>;
}

/// The committed replacement for a rewritten chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedChunk {
    pub path: PathBuf,
    pub file_size: u64,
}

/// Writer for the temp output chunk of a rewrite.
pub trait ChunkWriter {
    fn write_prepare(&mut self, record: &PrepareBuffer) -> Result<()>;
    fn write_system(&mut self, record: &SystemBuffer) -> Result<()>;
    /// Atomically commit the new chunk in place of its source.
    fn complete(self: Box<Self>) -> Result<CompletedChunk>;
    /// Abandon the rewrite. The temp file is deleted immediately on
    /// I/O failure and kept on cancellation so the next run can clean
    /// up after inspecting it.
    fn abort(self: Box<Self>, delete_immediately: bool);
}

/// Chunk-file access for the accumulator and chunk executor.
pub trait ChunkManager: Send + Sync {
    /// Reader for the physical chunk containing `position`.
    fn reader_for_position(&self, position: u64) -> Result<Box<dyn ChunkReader>>;
    /// Open a temp output chunk covering the same logical range as
    /// `source`.
    fn create_writer(&self, source: &dyn ChunkReader) -> Result<Box<dyn ChunkWriter>>;
    /// Stream id of the record at `position`, or `None` if no record
    /// survives there. Used to resolve index entries under colliding
    /// hashes.
    fn stream_id_at(&self, position: u64) -> Result<Option<String>>;
    /// Merge adjacent scavenged chunks. Entirely implementation
    /// defined; the core only sequences and checkpoints it.
    fn merge_chunks(&self, cancel: &CancellationToken) -> Result<()>;
}

/// One index entry's identity, as seen by the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub stream_hash: StreamHash,
    pub event_number: i64,
    pub log_position: u64,
}

/// Event identity returned by forward index walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventInfo {
    pub event_number: i64,
    pub log_position: u64,
}

/// Read access to the secondary index.
pub trait IndexReader: Send + Sync {
    /// Last event number of the stream as of the scavenge point, or
    /// `None` when the stream has no events at or before it.
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>>;

    /// Up to `max_count` events of the stream, ascending, starting at
    /// `from_event_number`, restricted to positions before the
    /// scavenge point.
    fn event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>>;
}

/// Outcome counters from an index scavenge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexScavengeStats {
    pub kept: u64,
    pub dropped: u64,
}

/// Write access to the secondary index.
pub trait IndexWriter: Send + Sync {
    /// Rewrite the index keeping only entries the predicate accepts.
    /// `threads` bounds the worker pool for table compaction.
    fn scavenge(
        &self,
        should_keep: &mut dyn FnMut(&IndexEntry) -> Result<bool>,
        threads: usize,
        cancel: &CancellationToken,
    ) -> Result<IndexScavengeStats>;
}

/// Source of scavenge point markers in the log.
pub trait ScavengePointSource: Send + Sync {
    /// The latest existing scavenge point, if any.
    fn latest(&self) -> Result<Option<ScavengePoint>>;
    /// Append a new scavenge point carrying the given clock reading
    /// and threshold.
    fn add(&self, effective_now_ms: u64, threshold: i64) -> Result<ScavengePoint>;
}

/// Metastream naming, injected so handle resolution does not depend
/// on the engine's stream-name module directly.
pub trait MetastreamLookup: Send + Sync {
    fn is_metastream(&self, stream_id: &str) -> bool;
    fn metastream_of(&self, stream_id: &str) -> String;
    fn original_stream_of<'a>(&self, metastream_id: &'a str) -> Option<&'a str>;
}

/// The engine's standard `$$`-prefix naming.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardStreamNames;

impl MetastreamLookup for StandardStreamNames {
    fn is_metastream(&self, stream_id: &str) -> bool {
        crate::core::is_metastream(stream_id)
    }

    fn metastream_of(&self, stream_id: &str) -> String {
        crate::core::metastream_of(stream_id)
    }

    fn original_stream_of<'a>(&self, metastream_id: &'a str) -> Option<&'a str> {
        crate::core::original_stream_of(metastream_id)
    }
}

/// Wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Structured progress and result reporting for a run.
pub trait ScavengerLog: Send + Sync {
    fn run_started(&self, scavenge_id: Uuid, scavenge_point: &ScavengePoint);
    fn stage_started(&self, stage: &'static str);
    fn chunk_scavenged(&self, chunk: u32, kept: u64, discarded: u64, elapsed_ms: u64);
    fn chunk_skipped(&self, chunk: u32, weight: f64);
    fn index_scavenged(&self, kept: u64, dropped: u64);
    fn run_completed(&self, scavenge_id: Uuid, outcome: &ScavengeOutcome, elapsed_ms: u64);
}

/// Default reporter emitting `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingScavengerLog;

impl ScavengerLog for TracingScavengerLog {
    fn run_started(&self, scavenge_id: Uuid, scavenge_point: &ScavengePoint) {
        tracing::info!(
            %scavenge_id,
            position = scavenge_point.position,
            scavenge_point = scavenge_point.event_number,
            threshold = scavenge_point.threshold,
            "scavenge started"
        );
    }

    fn stage_started(&self, stage: &'static str) {
        tracing::info!(stage, "scavenge stage started");
    }

    fn chunk_scavenged(&self, chunk: u32, kept: u64, discarded: u64, elapsed_ms: u64) {
        tracing::info!(chunk, kept, discarded, elapsed_ms, "chunk scavenged");
    }

    fn chunk_skipped(&self, chunk: u32, weight: f64) {
        tracing::debug!(chunk, weight, "chunk below threshold, skipped");
    }

    fn index_scavenged(&self, kept: u64, dropped: u64) {
        tracing::info!(kept, dropped, "index scavenged");
    }

    fn run_completed(&self, scavenge_id: Uuid, outcome: &ScavengeOutcome, elapsed_ms: u64) {
        tracing::info!(%scavenge_id, ?outcome, elapsed_ms, "scavenge completed");
    }
}
