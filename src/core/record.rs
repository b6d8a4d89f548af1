//! Reusable record buffers for streaming records out of a chunk.
//!
//! Readers fill one of two caller-owned buffers per record (one for
//! prepares, one for system records) so a chunk sweep allocates only
//! when a payload outgrows its buffer.

use super::streams::is_metastream;

/// Which buffer the reader filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Prepare,
    System,
}

/// A user event record (prepare).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrepareBuffer {
    pub log_position: u64,
    pub stream_id: String,
    pub event_number: i64,
    pub timestamp_ms: u64,
    /// A single-record transaction: the prepare is its own commit.
    pub is_self_committed: bool,
    /// Terminal delete of the stream.
    pub is_tombstone: bool,
    pub payload: Vec<u8>,
}

impl PrepareBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_metadata(&self) -> bool {
        is_metastream(&self.stream_id)
    }

    /// Reset and refill the buffer, reusing its allocations.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        &mut self,
        log_position: u64,
        stream_id: &str,
        event_number: i64,
        timestamp_ms: u64,
        is_self_committed: bool,
        is_tombstone: bool,
        payload: &[u8],
    ) {
        self.log_position = log_position;
        self.stream_id.clear();
        self.stream_id.push_str(stream_id);
        self.event_number = event_number;
        self.timestamp_ms = timestamp_ms;
        self.is_self_committed = is_self_committed;
        self.is_tombstone = is_tombstone;
        self.payload.clear();
        self.payload.extend_from_slice(payload);
    }
}

/// A system record (epoch markers and the like). Executors copy these
/// through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemBuffer {
    pub log_position: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl SystemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&mut self, log_position: u64, timestamp_ms: u64, payload: &[u8]) {
        self.log_position = log_position;
        self.timestamp_ms = timestamp_ms;
        self.payload.clear();
        self.payload.extend_from_slice(payload);
    }
}
