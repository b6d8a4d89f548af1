//! In-memory fakes for exercising the pipeline without a chunk store
//! or index on disk: a chunked fake log, an index twin, a controlled
//! clock, and a hasher with pinnable collisions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Result;
use crate::core::{
    PrepareBuffer, RecordKind, SCAVENGES_STREAM, ScavengePoint, StreamHandle, StreamHash,
    SystemBuffer, chunk_of, metastream_of,
};
use crate::error::ScavengeError;
use crate::ports::{
    ChunkManager, ChunkReader, ChunkWriter, Clock, CompletedChunk, EventInfo, IndexEntry,
    IndexReader, IndexScavengeStats, IndexWriter, ScavengePointSource, StreamHasher,
    TwoHalfHasher,
};
use crate::scavenge::CancellationToken;

pub const RECORD_SIZE: u64 = 100;

/// Deterministic clock backed by an atomic millisecond counter.
#[derive(Clone, Debug)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hasher with per-name overrides, for forcing collisions in tests.
#[derive(Clone, Debug, Default)]
pub struct ControlledHasher {
    overrides: HashMap<String, u64>,
}

impl ControlledHasher {
    pub fn with_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, u64)>,
    {
        Self {
            overrides: overrides
                .into_iter()
                .map(|(name, hash)| (name.to_string(), hash))
                .collect(),
        }
    }
}

impl StreamHasher for ControlledHasher {
    fn hash(&self, stream_id: &str) -> StreamHash {
        match self.overrides.get(stream_id) {
            Some(hash) => StreamHash::new(*hash),
            None => TwoHalfHasher.hash(stream_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeRecord {
    Prepare(PrepareBuffer),
    System(SystemBuffer),
}

impl FakeRecord {
    pub fn position(&self) -> u64 {
        match self {
            FakeRecord::Prepare(record) => record.log_position,
            FakeRecord::System(record) => record.log_position,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeChunk {
    pub start_number: u32,
    pub end_number: u32,
    pub read_only: bool,
    pub records: Vec<FakeRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeIndexEntry {
    pub stream_id: String,
    pub hash: StreamHash,
    pub event_number: i64,
    pub log_position: u64,
}

/// Failure to inject into the next chunk rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewriteFailure {
    Io,
    ChunkBeingDeleted,
}

#[derive(Debug, Default)]
struct FakeStore {
    chunks: Vec<FakeChunk>,
    index: Vec<FakeIndexEntry>,
    scavenge_points: Vec<ScavengePoint>,
    next_position: u64,
    stream_tails: HashMap<String, i64>,
    rewrite_failure: Option<RewriteFailure>,
    /// `delete_immediately` flags from writer aborts, in order.
    aborts: Vec<bool>,
}

/// A chunked fake log plus its index twin, shared by the fake ports.
#[derive(Clone)]
pub struct LogFixture {
    store: Arc<Mutex<FakeStore>>,
    hasher: Arc<dyn StreamHasher>,
    chunk_size: u64,
}

impl LogFixture {
    pub fn new(chunk_size: u64, hasher: Arc<dyn StreamHasher>) -> Self {
        Self {
            store: Arc::new(Mutex::new(FakeStore::default())),
            hasher,
            chunk_size,
        }
    }

    pub fn with_default_hasher(chunk_size: u64) -> Self {
        Self::new(chunk_size, Arc::new(TwoHalfHasher))
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_manager(&self) -> Arc<InMemoryChunkManager> {
        Arc::new(InMemoryChunkManager {
            fixture: self.clone(),
        })
    }

    pub fn index(&self) -> Arc<InMemoryIndex> {
        Arc::new(InMemoryIndex {
            fixture: self.clone(),
        })
    }

    pub fn scavenge_point_source(&self) -> Arc<InMemoryScavengePointSource> {
        Arc::new(InMemoryScavengePointSource {
            fixture: self.clone(),
        })
    }

    /// Append a plain event; returns its log position.
    pub fn append_event(&self, stream_id: &str, timestamp_ms: u64) -> u64 {
        self.append_prepare(stream_id, timestamp_ms, true, false, b"{}")
    }

    /// Append a mid-transaction (not self-committed) event.
    pub fn append_transaction_part(&self, stream_id: &str, timestamp_ms: u64) -> u64 {
        self.append_prepare(stream_id, timestamp_ms, false, false, b"{}")
    }

    /// Append a metadata event into `$$<stream_id>`.
    pub fn append_metadata(&self, stream_id: &str, payload: &str, timestamp_ms: u64) -> u64 {
        self.append_prepare(
            &metastream_of(stream_id),
            timestamp_ms,
            true,
            false,
            payload.as_bytes(),
        )
    }

    /// Append a tombstone for `stream_id`.
    pub fn append_tombstone(&self, stream_id: &str, timestamp_ms: u64) -> u64 {
        self.append_prepare(stream_id, timestamp_ms, true, true, b"")
    }

    /// Append a tombstone *into a metastream* (invalid; for the fatal
    /// path).
    pub fn append_metastream_tombstone(&self, stream_id: &str, timestamp_ms: u64) -> u64 {
        self.append_prepare(&metastream_of(stream_id), timestamp_ms, true, true, b"")
    }

    /// Append a system (non-prepare) record.
    pub fn append_system(&self, timestamp_ms: u64) -> u64 {
        let mut store = self.lock();
        let position = store.next_position;
        let mut record = SystemBuffer::new();
        record.fill(position, timestamp_ms, b"epoch");
        self.push_record(&mut store, FakeRecord::System(record));
        position
    }

    /// Append a scavenge point marker and seal the chunk it lands in,
    /// the way the engine completes a chunk when one is written.
    pub fn append_scavenge_point(&self, effective_now_ms: u64, threshold: i64) -> ScavengePoint {
        let mut store = self.lock();
        let position = store.next_position;
        let event_number = Self::next_event_number(&mut store, SCAVENGES_STREAM);
        let point = ScavengePoint {
            position,
            event_number,
            effective_now_ms,
            threshold,
        };

        let mut record = PrepareBuffer::new();
        let payload = format!(
            "{{\"effectiveNowMs\":{effective_now_ms},\"threshold\":{threshold}}}"
        );
        record.fill(
            position,
            SCAVENGES_STREAM,
            event_number,
            effective_now_ms,
            true,
            false,
            payload.as_bytes(),
        );
        let hash = self.hasher.hash(SCAVENGES_STREAM);
        store.index.push(FakeIndexEntry {
            stream_id: SCAVENGES_STREAM.to_string(),
            hash,
            event_number,
            log_position: position,
        });
        self.push_record(&mut store, FakeRecord::Prepare(record));
        store.scavenge_points.push(point);

        // Seal everything up to and including this chunk and open a
        // fresh one at the next boundary.
        let sealed_through = chunk_of(position, self.chunk_size);
        for chunk in &mut store.chunks {
            if chunk.end_number <= sealed_through {
                chunk.read_only = true;
            }
        }
        store.next_position = u64::from(sealed_through + 1) * self.chunk_size;
        point
    }

    pub fn fail_next_rewrite(&self, failure: RewriteFailure) {
        self.lock().rewrite_failure = Some(failure);
    }

    /// `delete_immediately` flags from chunk writer aborts, oldest
    /// first.
    pub fn writer_aborts(&self) -> Vec<bool> {
        self.lock().aborts.clone()
    }

    /// Event numbers of the stream's surviving records, log order.
    pub fn surviving_events(&self, stream_id: &str) -> Vec<i64> {
        let store = self.lock();
        let mut numbers = Vec::new();
        for chunk in &store.chunks {
            for record in &chunk.records {
                if let FakeRecord::Prepare(prepare) = record {
                    if prepare.stream_id == stream_id {
                        numbers.push(prepare.event_number);
                    }
                }
            }
        }
        numbers
    }

    /// (stream, event number) pairs surviving in one logical chunk.
    pub fn chunk_contents(&self, chunk_number: u32) -> Vec<(String, i64)> {
        let store = self.lock();
        let mut contents = Vec::new();
        for chunk in &store.chunks {
            if chunk.start_number <= chunk_number && chunk_number <= chunk.end_number {
                for record in &chunk.records {
                    if let FakeRecord::Prepare(prepare) = record {
                        if chunk_of(prepare.log_position, self.chunk_size) == chunk_number {
                            contents.push((prepare.stream_id.clone(), prepare.event_number));
                        }
                    }
                }
            }
        }
        contents
    }

    /// Full record copy of one physical chunk, for byte-identity
    /// checks.
    pub fn chunk_records(&self, chunk_number: u32) -> Vec<FakeRecord> {
        let store = self.lock();
        store
            .chunks
            .iter()
            .find(|chunk| {
                chunk.start_number <= chunk_number && chunk_number <= chunk.end_number
            })
            .map(|chunk| chunk.records.clone())
            .unwrap_or_default()
    }

    /// Surviving index event numbers for a stream, ascending.
    pub fn index_event_numbers(&self, stream_id: &str) -> Vec<i64> {
        let store = self.lock();
        let mut numbers: Vec<i64> = store
            .index
            .iter()
            .filter(|entry| entry.stream_id == stream_id)
            .map(|entry| entry.event_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn index_entries(&self) -> Vec<FakeIndexEntry> {
        self.lock().index.clone()
    }

    /// True when every index entry points at a surviving record.
    pub fn index_is_consistent(&self) -> bool {
        let store = self.lock();
        store.index.iter().all(|entry| {
            store.chunks.iter().any(|chunk| {
                chunk.records.iter().any(|record| match record {
                    FakeRecord::Prepare(prepare) => {
                        prepare.log_position == entry.log_position
                            && prepare.stream_id == entry.stream_id
                            && prepare.event_number == entry.event_number
                    }
                    FakeRecord::System(_) => false,
                })
            })
        })
    }

    fn append_prepare(
        &self,
        stream_id: &str,
        timestamp_ms: u64,
        is_self_committed: bool,
        is_tombstone: bool,
        payload: &[u8],
    ) -> u64 {
        let mut store = self.lock();
        let position = store.next_position;
        let event_number = Self::next_event_number(&mut store, stream_id);

        let mut record = PrepareBuffer::new();
        record.fill(
            position,
            stream_id,
            event_number,
            timestamp_ms,
            is_self_committed,
            is_tombstone,
            payload,
        );
        store.index.push(FakeIndexEntry {
            stream_id: stream_id.to_string(),
            hash: self.hasher.hash(stream_id),
            event_number,
            log_position: position,
        });
        self.push_record(&mut store, FakeRecord::Prepare(record));
        position
    }

    fn next_event_number(store: &mut FakeStore, stream_id: &str) -> i64 {
        let tail = store.stream_tails.entry(stream_id.to_string()).or_insert(0);
        let number = *tail;
        *tail += 1;
        number
    }

    fn push_record(&self, store: &mut FakeStore, record: FakeRecord) {
        let position = record.position();
        let chunk_number = chunk_of(position, self.chunk_size);
        let needs_new_chunk = store
            .chunks
            .last()
            .map_or(true, |chunk| chunk.end_number < chunk_number);
        if needs_new_chunk {
            if let Some(last) = store.chunks.last_mut() {
                last.read_only = true;
            }
            store.chunks.push(FakeChunk {
                start_number: chunk_number,
                end_number: chunk_number,
                read_only: false,
                records: Vec::new(),
            });
        }
        let chunk = store.chunks.last_mut().expect("chunk exists after push");
        chunk.records.push(record);
        store.next_position = position + RECORD_SIZE;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeStore> {
        self.store.lock().expect("fake store lock")
    }
}

pub struct InMemoryChunkManager {
    fixture: LogFixture,
}

impl ChunkManager for InMemoryChunkManager {
    fn reader_for_position(&self, position: u64) -> Result<Box<dyn ChunkReader>> {
        let chunk_number = chunk_of(position, self.fixture.chunk_size);
        let store = self.fixture.lock();
        let chunk = store
            .chunks
            .iter()
            .find(|chunk| {
                chunk.start_number <= chunk_number && chunk_number <= chunk.end_number
            })
            .cloned()
            .ok_or_else(|| ScavengeError::Io {
                path: None,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no chunk covering logical chunk {chunk_number}"),
                ),
            })?;
        Ok(Box::new(InMemoryChunkReader {
            name: format!("chunk-{}-{}", chunk.start_number, chunk.end_number),
            chunk_size: self.fixture.chunk_size,
            cursor: 0,
            chunk,
        }))
    }

    fn create_writer(&self, source: &dyn ChunkReader) -> Result<Box<dyn ChunkWriter>> {
        Ok(Box::new(InMemoryChunkWriter {
            fixture: self.fixture.clone(),
            start_number: source.chunk_start_number(),
            end_number: source.chunk_end_number(),
            records: Vec::new(),
        }))
    }

    fn stream_id_at(&self, position: u64) -> Result<Option<String>> {
        let store = self.fixture.lock();
        for chunk in &store.chunks {
            for record in &chunk.records {
                if let FakeRecord::Prepare(prepare) = record {
                    if prepare.log_position == position {
                        return Ok(Some(prepare.stream_id.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    fn merge_chunks(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

struct InMemoryChunkReader {
    chunk: FakeChunk,
    chunk_size: u64,
    cursor: usize,
    name: String,
}

impl ChunkReader for InMemoryChunkReader {
    fn chunk_start_number(&self) -> u32 {
        self.chunk.start_number
    }

    fn chunk_end_number(&self) -> u32 {
        self.chunk.end_number
    }

    fn chunk_start_position(&self) -> u64 {
        u64::from(self.chunk.start_number) * self.chunk_size
    }

    fn chunk_end_position(&self) -> u64 {
        u64::from(self.chunk.end_number + 1) * self.chunk_size
    }

    fn is_read_only(&self) -> bool {
        self.chunk.read_only
    }

    fn file_size(&self) -> u64 {
        self.chunk.records.len() as u64 * RECORD_SIZE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn next_record(
        &mut self,
        prepare: &mut PrepareBuffer,
        system: &mut SystemBuffer,
    ) -> Result<Option<RecordKind>> {
        let Some(record) = self.chunk.records.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        match record {
            FakeRecord::Prepare(source) => {
                prepare.fill(
                    source.log_position,
                    &source.stream_id,
                    source.event_number,
                    source.timestamp_ms,
                    source.is_self_committed,
                    source.is_tombstone,
                    &source.payload,
                );
                Ok(Some(RecordKind::Prepare))
            }
            FakeRecord::System(source) => {
                system.fill(source.log_position, source.timestamp_ms, &source.payload);
                Ok(Some(RecordKind::System))
            }
        }
    }
}

struct InMemoryChunkWriter {
    fixture: LogFixture,
    start_number: u32,
    end_number: u32,
    records: Vec<FakeRecord>,
}

impl ChunkWriter for InMemoryChunkWriter {
    fn write_prepare(&mut self, record: &PrepareBuffer) -> Result<()> {
        if let Some(failure) = self.fixture.lock().rewrite_failure.take() {
            return Err(match failure {
                RewriteFailure::Io => ScavengeError::Io {
                    path: None,
                    source: std::io::Error::other("injected write failure"),
                },
                RewriteFailure::ChunkBeingDeleted => ScavengeError::ChunkBeingDeleted {
                    chunk: self.start_number,
                },
            });
        }
        self.records.push(FakeRecord::Prepare(record.clone()));
        Ok(())
    }

    fn write_system(&mut self, record: &SystemBuffer) -> Result<()> {
        self.records.push(FakeRecord::System(record.clone()));
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<CompletedChunk> {
        let mut store = self.fixture.lock();
        let file_size = self.records.len() as u64 * RECORD_SIZE;
        let replacement = FakeChunk {
            start_number: self.start_number,
            end_number: self.end_number,
            read_only: true,
            records: self.records,
        };
        let position = store
            .chunks
            .iter()
            .position(|chunk| chunk.start_number == self.start_number)
            .ok_or_else(|| ScavengeError::CorruptState {
                reason: format!("no chunk {} to replace", self.start_number),
            })?;
        store
            .chunks
            .retain(|chunk| !(chunk.start_number >= self.start_number
                && chunk.end_number <= self.end_number));
        store.chunks.insert(position, replacement);
        Ok(CompletedChunk {
            path: PathBuf::from(format!(
                "chunk-{}-{}.scavenged",
                self.start_number, self.end_number
            )),
            file_size,
        })
    }

    fn abort(self: Box<Self>, delete_immediately: bool) {
        self.fixture.lock().aborts.push(delete_immediately);
    }
}

pub struct InMemoryIndex {
    fixture: LogFixture,
}

impl InMemoryIndex {
    fn matches(handle: &StreamHandle, entry: &FakeIndexEntry) -> bool {
        match handle {
            StreamHandle::Hash { hash } => entry.hash == *hash,
            StreamHandle::Id { id, .. } => entry.stream_id == *id,
        }
    }
}

impl IndexReader for InMemoryIndex {
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>> {
        let store = self.fixture.lock();
        Ok(store
            .index
            .iter()
            .filter(|entry| {
                Self::matches(handle, entry) && entry.log_position <= scavenge_point.position
            })
            .map(|entry| entry.event_number)
            .max())
    }

    fn event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>> {
        let store = self.fixture.lock();
        let mut infos: Vec<EventInfo> = store
            .index
            .iter()
            .filter(|entry| {
                Self::matches(handle, entry)
                    && entry.event_number >= from_event_number
                    && entry.log_position <= scavenge_point.position
            })
            .map(|entry| EventInfo {
                event_number: entry.event_number,
                log_position: entry.log_position,
            })
            .collect();
        infos.sort_unstable_by_key(|info| info.event_number);
        infos.truncate(max_count);
        Ok(infos)
    }
}

impl IndexWriter for InMemoryIndex {
    fn scavenge(
        &self,
        should_keep: &mut dyn FnMut(&IndexEntry) -> Result<bool>,
        _threads: usize,
        cancel: &CancellationToken,
    ) -> Result<IndexScavengeStats> {
        // Snapshot outside the lock: the predicate may read back
        // through the chunk manager.
        let entries = self.fixture.lock().index.clone();
        let mut kept_entries = Vec::with_capacity(entries.len());
        let mut stats = IndexScavengeStats::default();

        for entry in entries {
            cancel.check()?;
            let keep = should_keep(&IndexEntry {
                stream_hash: entry.hash,
                event_number: entry.event_number,
                log_position: entry.log_position,
            })?;
            if keep {
                stats.kept += 1;
                kept_entries.push(entry);
            } else {
                stats.dropped += 1;
            }
        }

        self.fixture.lock().index = kept_entries;
        Ok(stats)
    }
}

pub struct InMemoryScavengePointSource {
    fixture: LogFixture,
}

impl ScavengePointSource for InMemoryScavengePointSource {
    fn latest(&self) -> Result<Option<ScavengePoint>> {
        Ok(self.fixture.lock().scavenge_points.last().copied())
    }

    fn add(&self, effective_now_ms: u64, threshold: i64) -> Result<ScavengePoint> {
        Ok(self.fixture.append_scavenge_point(effective_now_ms, threshold))
    }
}
