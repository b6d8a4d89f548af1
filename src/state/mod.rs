//! Durable scavenge state: the single mutable ground truth of the
//! pipeline.
//!
//! The concrete [`ScavengeState`] satisfies one narrow trait per
//! stage, so each stage can only touch the state it owns. Per-stream
//! rows live in collision-aware map pairs: the hash-keyed table while
//! a stream's hash is unique, the id-keyed table once it collides.

mod collision;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::core::{
    ChunkTimeRange, DiscardPoint, MetastreamData, OriginalStreamData, ScavengeCheckpoint,
    StreamHandle, StreamHash, StreamMetadata, StreamStatus,
};
use crate::ports::{MetastreamLookup, StreamHasher};

use collision::{CollisionTracker, Observation};
use sqlite::StateStore;

pub use sqlite::StateError;

/// Everything the executors need to know about one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamExecutionInfo {
    pub is_tombstoned: bool,
    pub is_metastream: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age_ms: Option<u64>,
}

impl StreamExecutionInfo {
    pub fn keep_all(is_metastream: bool) -> Self {
        Self {
            is_tombstoned: false,
            is_metastream,
            discard_point: DiscardPoint::keep_all(),
            maybe_discard_point: DiscardPoint::keep_all(),
            max_age_ms: None,
        }
    }
}

/// Rows deleted by a cleaning pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub originals: u64,
    pub metastreams: u64,
}

/// What recording a metadata event did to the metastream's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetastreamUpdate {
    /// The event is the newest seen. `superseded` is the position of
    /// the previous latest metadata event, if any.
    Applied { superseded: Option<u64> },
    /// An earlier run already absorbed this event; no state change.
    Stale,
}

/// Transaction control shared by every stage.
pub trait StateTransaction {
    fn begin(&mut self) -> Result<(), StateError>;
    /// Commit the open transaction together with the stage's progress
    /// marker. The checkpoint only ever advances through here.
    fn commit(&mut self, checkpoint: &ScavengeCheckpoint) -> Result<(), StateError>;
    fn rollback(&mut self) -> Result<(), StateError>;
    fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>, StateError>;
}

pub trait StateForAccumulator: StateTransaction {
    /// Run collision detection for a stream name seen in the log.
    fn observe_stream(&mut self, stream_id: &str) -> Result<(), StateError>;
    fn set_original_stream_metadata(
        &mut self,
        original_id: &str,
        metadata: StreamMetadata,
    ) -> Result<(), StateError>;
    /// Record the latest metadata event of a metastream and advance
    /// its discard point to keep only that event. Stale events (at or
    /// below the recorded latest position) are reported, not
    /// re-applied, so re-sweeping a chunk never double-counts a
    /// replacement.
    fn set_metastream_latest(
        &mut self,
        metastream_id: &str,
        original_id: &str,
        event_number: i64,
        position: u64,
    ) -> Result<MetastreamUpdate, StateError>;
    fn set_original_tombstoned(
        &mut self,
        original_id: &str,
        last_event_number: i64,
    ) -> Result<(), StateError>;
    fn widen_chunk_time_range(&mut self, chunk: u32, timestamp_ms: u64)
        -> Result<(), StateError>;
    fn add_chunk_weight(&mut self, chunk: u32, weight: f64) -> Result<(), StateError>;
}

pub trait StateForCalculator: StateTransaction {
    /// Active originals in stable handle order (hash side ascending,
    /// then id side ascending), strictly after `cursor`.
    fn active_originals_after(
        &self,
        cursor: Option<&StreamHandle>,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>, StateError>;
    fn update_original(
        &mut self,
        handle: &StreamHandle,
        data: &OriginalStreamData,
    ) -> Result<(), StateError>;
    fn chunk_time_range(&self, chunk: u32) -> Result<Option<ChunkTimeRange>, StateError>;
    fn add_chunk_weight(&mut self, chunk: u32, weight: f64) -> Result<(), StateError>;
}

pub trait StateForChunkExecutor: StateTransaction {
    fn sum_chunk_weights(&self, start: u32, end: u32) -> Result<f64, StateError>;
    fn reset_chunk_weights(&mut self, start: u32, end: u32) -> Result<(), StateError>;
    fn chunk_execution_info(&self, stream_id: &str) -> Result<StreamExecutionInfo, StateError>;
}

pub trait StateForIndexExecutor: StateTransaction {
    fn is_colliding_hash(&self, hash: StreamHash) -> bool;
    /// Execution info for a non-colliding hash. For colliding hashes
    /// the caller must resolve the stream name first.
    fn index_execution_info_by_hash(
        &self,
        hash: StreamHash,
    ) -> Result<StreamExecutionInfo, StateError>;
    fn index_execution_info_by_id(
        &self,
        stream_id: &str,
    ) -> Result<StreamExecutionInfo, StateError>;
    fn chunk_time_range(&self, chunk: u32) -> Result<Option<ChunkTimeRange>, StateError>;
}

pub trait StateForCleaner: StateTransaction {
    fn prune(&mut self, include_archived: bool) -> Result<PruneStats, StateError>;
}

/// The concrete durable state, backed by a single SQLite file.
pub struct ScavengeState {
    store: StateStore,
    tracker: CollisionTracker,
    metastreams: Arc<dyn MetastreamLookup>,
}

impl ScavengeState {
    pub fn open(
        store_dir: &Path,
        hasher: Arc<dyn StreamHasher>,
        metastreams: Arc<dyn MetastreamLookup>,
        hash_cache_capacity: usize,
    ) -> Result<Self, StateError> {
        let store = StateStore::open(store_dir)?;
        let tracker = CollisionTracker::load(&store, hasher, hash_cache_capacity)?;
        Ok(Self {
            store,
            tracker,
            metastreams,
        })
    }

    /// In-memory state for tests and dry runs.
    pub fn open_in_memory(
        hasher: Arc<dyn StreamHasher>,
        metastreams: Arc<dyn MetastreamLookup>,
        hash_cache_capacity: usize,
    ) -> Result<Self, StateError> {
        let store = StateStore::open_in_memory()?;
        let tracker = CollisionTracker::load(&store, hasher, hash_cache_capacity)?;
        Ok(Self {
            store,
            tracker,
            metastreams,
        })
    }

    /// The handle a stream's state lives under right now.
    pub fn handle_for(&self, stream_id: &str) -> StreamHandle {
        self.tracker.handle_for(stream_id)
    }

    pub fn collisions(&self) -> Result<Vec<String>, StateError> {
        self.store.collisions()
    }

    pub fn original_stream(
        &self,
        stream_id: &str,
    ) -> Result<Option<OriginalStreamData>, StateError> {
        self.get_original(&self.tracker.handle_for(stream_id))
    }

    pub fn metastream(&self, metastream_id: &str) -> Result<Option<MetastreamData>, StateError> {
        self.get_metastream(&self.tracker.handle_for(metastream_id))
    }

    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }

    fn get_original(
        &self,
        handle: &StreamHandle,
    ) -> Result<Option<OriginalStreamData>, StateError> {
        match handle {
            StreamHandle::Hash { hash } => self.store.original_by_hash(*hash),
            StreamHandle::Id { id, .. } => self.store.original_by_id(id),
        }
    }

    fn put_original(
        &mut self,
        handle: &StreamHandle,
        data: &OriginalStreamData,
    ) -> Result<(), StateError> {
        match handle {
            StreamHandle::Hash { hash } => self.store.upsert_original_by_hash(*hash, data),
            StreamHandle::Id { id, hash } => {
                let id = id.clone();
                self.store.upsert_original_by_id(&id, *hash, data)
            }
        }
    }

    fn get_metastream(
        &self,
        handle: &StreamHandle,
    ) -> Result<Option<MetastreamData>, StateError> {
        match handle {
            StreamHandle::Hash { hash } => self.store.metastream_by_hash(*hash),
            StreamHandle::Id { id, .. } => self.store.metastream_by_id(id),
        }
    }

    fn put_metastream(
        &mut self,
        handle: &StreamHandle,
        data: &MetastreamData,
    ) -> Result<(), StateError> {
        match handle {
            StreamHandle::Hash { hash } => self.store.upsert_metastream_by_hash(*hash, data),
            StreamHandle::Id { id, hash } => {
                let id = id.clone();
                self.store.upsert_metastream_by_id(&id, *hash, data)
            }
        }
    }
}

impl StateTransaction for ScavengeState {
    fn begin(&mut self) -> Result<(), StateError> {
        self.store.begin()
    }

    fn commit(&mut self, checkpoint: &ScavengeCheckpoint) -> Result<(), StateError> {
        self.store.set_checkpoint(checkpoint)?;
        self.store.commit()
    }

    fn rollback(&mut self) -> Result<(), StateError> {
        self.store.rollback()?;
        // The transaction may have discarded collision writes the
        // in-memory view already absorbed.
        self.tracker.reload(&self.store)
    }

    fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>, StateError> {
        self.store.checkpoint()
    }
}

impl StateForAccumulator for ScavengeState {
    fn observe_stream(&mut self, stream_id: &str) -> Result<(), StateError> {
        match self.tracker.observe(&mut self.store, stream_id)? {
            Observation::Unique(_) => Ok(()),
            Observation::NewCollision { hash, prior } => {
                // The prior owner's rows were keyed by the hash that
                // is no longer unique; move them to the id side.
                if let Some(data) = self.store.take_original_by_hash(hash)? {
                    self.store.upsert_original_by_id(&prior, hash, &data)?;
                }
                if let Some(data) = self.store.take_metastream_by_hash(hash)? {
                    self.store.upsert_metastream_by_id(&prior, hash, &data)?;
                }
                Ok(())
            }
        }
    }

    fn set_original_stream_metadata(
        &mut self,
        original_id: &str,
        metadata: StreamMetadata,
    ) -> Result<(), StateError> {
        let handle = self.tracker.handle_for(original_id);
        let mut data = self.get_original(&handle)?.unwrap_or_default();
        data.metadata = metadata;
        // New metadata can only add retention work.
        data.status = StreamStatus::Active;
        self.put_original(&handle, &data)
    }

    fn set_metastream_latest(
        &mut self,
        metastream_id: &str,
        original_id: &str,
        event_number: i64,
        position: u64,
    ) -> Result<MetastreamUpdate, StateError> {
        let handle = self.tracker.handle_for(metastream_id);
        let existing = self.get_metastream(&handle)?;
        let superseded = existing.as_ref().and_then(|data| data.last_metadata_position);
        if superseded.is_some_and(|latest| latest >= position) {
            return Ok(MetastreamUpdate::Stale);
        }
        let (discard_point, is_tombstoned) = match &existing {
            Some(data) => (data.discard_point, data.is_tombstoned),
            None => (DiscardPoint::keep_all(), false),
        };
        let data = MetastreamData {
            original_stream_hash: self.tracker.hash_of(original_id),
            // All but this latest metadata event may eventually go.
            discard_point: discard_point.or(DiscardPoint::discard_before(event_number)),
            is_tombstoned,
            last_metadata_position: Some(position),
        };
        self.put_metastream(&handle, &data)?;
        Ok(MetastreamUpdate::Applied { superseded })
    }

    fn set_original_tombstoned(
        &mut self,
        original_id: &str,
        last_event_number: i64,
    ) -> Result<(), StateError> {
        let handle = self.tracker.handle_for(original_id);
        let mut data = self.get_original(&handle)?.unwrap_or_default();
        data.is_tombstoned = true;
        // Only the tombstone itself survives.
        let point = DiscardPoint::discard_before(last_event_number);
        data.discard_point = data.discard_point.or(point);
        data.maybe_discard_point = data.maybe_discard_point.or(point);
        self.put_original(&handle, &data)?;

        let metastream_id = self.metastreams.metastream_of(original_id);
        let meta_handle = self.tracker.handle_for(&metastream_id);
        let mut meta = self.get_metastream(&meta_handle)?.unwrap_or(MetastreamData {
            original_stream_hash: self.tracker.hash_of(original_id),
            discard_point: DiscardPoint::keep_all(),
            is_tombstoned: false,
            last_metadata_position: None,
        });
        meta.is_tombstoned = true;
        self.put_metastream(&meta_handle, &meta)
    }

    fn widen_chunk_time_range(
        &mut self,
        chunk: u32,
        timestamp_ms: u64,
    ) -> Result<(), StateError> {
        self.store.widen_chunk_time_range(chunk, timestamp_ms)
    }

    fn add_chunk_weight(&mut self, chunk: u32, weight: f64) -> Result<(), StateError> {
        self.store.add_chunk_weight(chunk, weight)
    }
}

impl StateForCalculator for ScavengeState {
    fn active_originals_after(
        &self,
        cursor: Option<&StreamHandle>,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>, StateError> {
        let (hash_cursor, id_cursor, hash_side_done) = match cursor {
            None => (None, None, false),
            Some(StreamHandle::Hash { hash }) => (Some(*hash), None, false),
            Some(StreamHandle::Id { id, .. }) => (None, Some(id.as_str()), true),
        };

        let mut out = Vec::new();
        if !hash_side_done {
            for (hash, data) in self.store.active_originals_by_hash_after(hash_cursor, limit)? {
                out.push((StreamHandle::for_hash(hash), data));
            }
        }
        if out.len() < limit {
            let remaining = limit - out.len();
            for (id, hash, data) in
                self.store.active_originals_by_id_after(id_cursor, remaining)?
            {
                out.push((StreamHandle::for_id(id, hash), data));
            }
        }
        Ok(out)
    }

    fn update_original(
        &mut self,
        handle: &StreamHandle,
        data: &OriginalStreamData,
    ) -> Result<(), StateError> {
        self.put_original(handle, data)
    }

    fn chunk_time_range(&self, chunk: u32) -> Result<Option<ChunkTimeRange>, StateError> {
        self.store.chunk_time_range(chunk)
    }

    fn add_chunk_weight(&mut self, chunk: u32, weight: f64) -> Result<(), StateError> {
        self.store.add_chunk_weight(chunk, weight)
    }
}

impl StateForChunkExecutor for ScavengeState {
    fn sum_chunk_weights(&self, start: u32, end: u32) -> Result<f64, StateError> {
        self.store.sum_chunk_weights(start, end)
    }

    fn reset_chunk_weights(&mut self, start: u32, end: u32) -> Result<(), StateError> {
        self.store.reset_chunk_weights(start, end)
    }

    fn chunk_execution_info(&self, stream_id: &str) -> Result<StreamExecutionInfo, StateError> {
        let handle = self.tracker.handle_for(stream_id);
        if self.metastreams.is_metastream(stream_id) {
            Ok(match self.get_metastream(&handle)? {
                Some(meta) => StreamExecutionInfo {
                    is_tombstoned: meta.is_tombstoned,
                    is_metastream: true,
                    discard_point: meta.discard_point,
                    maybe_discard_point: meta.discard_point,
                    max_age_ms: None,
                },
                None => StreamExecutionInfo::keep_all(true),
            })
        } else {
            Ok(match self.get_original(&handle)? {
                Some(original) => StreamExecutionInfo {
                    is_tombstoned: original.is_tombstoned,
                    is_metastream: false,
                    discard_point: original.discard_point,
                    maybe_discard_point: original.maybe_discard_point,
                    max_age_ms: original.metadata.max_age_ms,
                },
                None => StreamExecutionInfo::keep_all(false),
            })
        }
    }
}

impl StateForIndexExecutor for ScavengeState {
    fn is_colliding_hash(&self, hash: StreamHash) -> bool {
        self.tracker.is_colliding_hash(hash)
    }

    fn index_execution_info_by_hash(
        &self,
        hash: StreamHash,
    ) -> Result<StreamExecutionInfo, StateError> {
        if let Some(meta) = self.store.metastream_by_hash(hash)? {
            return Ok(StreamExecutionInfo {
                is_tombstoned: meta.is_tombstoned,
                is_metastream: true,
                discard_point: meta.discard_point,
                maybe_discard_point: meta.discard_point,
                max_age_ms: None,
            });
        }
        if let Some(original) = self.store.original_by_hash(hash)? {
            return Ok(StreamExecutionInfo {
                is_tombstoned: original.is_tombstoned,
                is_metastream: false,
                discard_point: original.discard_point,
                maybe_discard_point: original.maybe_discard_point,
                max_age_ms: original.metadata.max_age_ms,
            });
        }
        Ok(StreamExecutionInfo::keep_all(false))
    }

    fn index_execution_info_by_id(
        &self,
        stream_id: &str,
    ) -> Result<StreamExecutionInfo, StateError> {
        self.chunk_execution_info(stream_id)
    }

    fn chunk_time_range(&self, chunk: u32) -> Result<Option<ChunkTimeRange>, StateError> {
        self.store.chunk_time_range(chunk)
    }
}

impl StateForCleaner for ScavengeState {
    fn prune(&mut self, include_archived: bool) -> Result<PruneStats, StateError> {
        let (originals, metastreams) = self.store.prune(include_archived)?;
        Ok(PruneStats {
            originals,
            metastreams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{StandardStreamNames, TwoHalfHasher};
    use crate::test_harness::ControlledHasher;

    fn state() -> ScavengeState {
        ScavengeState::open_in_memory(
            Arc::new(TwoHalfHasher),
            Arc::new(StandardStreamNames),
            128,
        )
        .unwrap()
    }

    fn state_with(hasher: ControlledHasher) -> ScavengeState {
        ScavengeState::open_in_memory(Arc::new(hasher), Arc::new(StandardStreamNames), 128)
            .unwrap()
    }

    #[test]
    fn metadata_update_preserves_discard_points() {
        let mut state = state();
        state.begin().unwrap();
        state.observe_stream("account-1").unwrap();
        state
            .set_original_stream_metadata(
                "account-1",
                StreamMetadata {
                    max_count: Some(1),
                    ..StreamMetadata::default()
                },
            )
            .unwrap();

        let handle = state.handle_for("account-1");
        let mut data = state.original_stream("account-1").unwrap().unwrap();
        data.discard_point = DiscardPoint::discard_before(5);
        data.maybe_discard_point = DiscardPoint::discard_before(5);
        data.status = StreamStatus::Spent;
        state.update_original(&handle, &data).unwrap();

        // Loosened metadata must not lose the discard points, and it
        // re-activates the stream.
        state
            .set_original_stream_metadata(
                "account-1",
                StreamMetadata {
                    max_count: Some(4),
                    ..StreamMetadata::default()
                },
            )
            .unwrap();
        commit_test(&mut state);

        let data = state.original_stream("account-1").unwrap().unwrap();
        assert_eq!(data.metadata.max_count, Some(4));
        assert_eq!(data.discard_point, DiscardPoint::discard_before(5));
        assert_eq!(data.status, StreamStatus::Active);
    }

    #[test]
    fn metastream_latest_reports_superseded_and_stale_events() {
        let mut state = state();
        state.begin().unwrap();
        let first = state
            .set_metastream_latest("$$account-1", "account-1", 0, 100)
            .unwrap();
        let second = state
            .set_metastream_latest("$$account-1", "account-1", 1, 700)
            .unwrap();
        // Re-sweeping the chunk replays the same event: no change.
        let replay = state
            .set_metastream_latest("$$account-1", "account-1", 0, 100)
            .unwrap();
        commit_test(&mut state);

        assert_eq!(first, MetastreamUpdate::Applied { superseded: None });
        assert_eq!(
            second,
            MetastreamUpdate::Applied {
                superseded: Some(100)
            }
        );
        assert_eq!(replay, MetastreamUpdate::Stale);
        let meta = state.metastream("$$account-1").unwrap().unwrap();
        assert_eq!(meta.discard_point, DiscardPoint::discard_before(1));
        assert_eq!(meta.last_metadata_position, Some(700));
    }

    #[test]
    fn tombstone_spares_only_the_last_event_and_flags_the_metastream() {
        let mut state = state();
        state.begin().unwrap();
        state.set_original_tombstoned("account-1", 7).unwrap();
        commit_test(&mut state);

        let data = state.original_stream("account-1").unwrap().unwrap();
        assert!(data.is_tombstoned);
        assert_eq!(data.discard_point, DiscardPoint::discard_before(7));

        let meta = state.metastream("$$account-1").unwrap().unwrap();
        assert!(meta.is_tombstoned);
    }

    #[test]
    fn collision_promotes_rows_to_the_id_side() {
        let hasher = ControlledHasher::with_overrides([("a", 9), ("b", 9)]);
        let mut state = state_with(hasher);

        state.begin().unwrap();
        state.observe_stream("a").unwrap();
        state
            .set_original_stream_metadata(
                "a",
                StreamMetadata {
                    truncate_before: Some(3),
                    ..StreamMetadata::default()
                },
            )
            .unwrap();
        assert!(!state.handle_for("a").is_colliding());

        state.observe_stream("b").unwrap();
        commit_test(&mut state);

        assert!(state.handle_for("a").is_colliding());
        assert!(state.handle_for("b").is_colliding());
        // The row is still reachable, now through the id handle.
        let data = state.original_stream("a").unwrap().unwrap();
        assert_eq!(data.metadata.truncate_before, Some(3));
        assert_eq!(
            state.collisions().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn enumeration_walks_hash_side_then_id_side() {
        let hasher = ControlledHasher::with_overrides([
            ("a", 9),
            ("b", 9),
            ("c", 20),
            ("d", 11),
        ]);
        let mut state = state_with(hasher);

        state.begin().unwrap();
        for stream in ["a", "b", "c", "d"] {
            state.observe_stream(stream).unwrap();
            state
                .set_original_stream_metadata(stream, StreamMetadata::default())
                .unwrap();
        }
        commit_test(&mut state);

        let mut seen = Vec::new();
        let mut cursor: Option<StreamHandle> = None;
        loop {
            let batch = state.active_originals_after(cursor.as_ref(), 2).unwrap();
            if batch.is_empty() {
                break;
            }
            cursor = Some(batch.last().unwrap().0.clone());
            seen.extend(batch.into_iter().map(|(handle, _)| handle));
        }

        // Non-colliding hashes ascending (11, 20), then colliding ids
        // ascending (a, b).
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].hash(), StreamHash::new(11));
        assert_eq!(seen[1].hash(), StreamHash::new(20));
        assert_eq!(seen[2].id(), Some("a"));
        assert_eq!(seen[3].id(), Some("b"));
    }

    fn commit_test(state: &mut ScavengeState) {
        let checkpoint = ScavengeCheckpoint::Cleaning {
            scavenge_point: crate::core::ScavengePoint {
                position: 0,
                event_number: 0,
                effective_now_ms: 0,
                threshold: 0,
            },
        };
        state.commit(&checkpoint).unwrap();
    }
}
