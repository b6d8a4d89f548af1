//! Hash-collision detection for stream names.
//!
//! Every stream the accumulator sees is looked up by hash. The first
//! name claims the hash; a second, different name under the same hash
//! marks both names as collisions, and their state rows move from the
//! hash-keyed tables to the id-keyed ones.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::core::{StreamHandle, StreamHash};
use crate::ports::StreamHasher;

use super::sqlite::{StateError, StateStore};

/// Result of observing one stream id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Observation {
    /// Hash is (still) unique.
    Unique(StreamHash),
    /// This observation just made the hash collide: `prior` owned it.
    NewCollision { hash: StreamHash, prior: String },
}

pub(crate) struct CollisionTracker {
    hasher: Arc<dyn StreamHasher>,
    /// Bounded hash→name cache in front of the `hashes` table.
    names: LruCache<u64, String>,
    colliding_names: HashSet<String>,
    colliding_hashes: HashSet<u64>,
}

impl CollisionTracker {
    pub fn load(
        store: &StateStore,
        hasher: Arc<dyn StreamHasher>,
        cache_capacity: usize,
    ) -> Result<Self, StateError> {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("capacity is non-zero");
        let mut tracker = Self {
            hasher,
            names: LruCache::new(capacity),
            colliding_names: HashSet::new(),
            colliding_hashes: HashSet::new(),
        };
        tracker.reload(store)?;
        Ok(tracker)
    }

    /// Refresh the in-memory view from the store. Called after a
    /// rollback, which may have discarded collision writes.
    pub fn reload(&mut self, store: &StateStore) -> Result<(), StateError> {
        self.names.clear();
        self.colliding_names.clear();
        self.colliding_hashes.clear();
        for name in store.collisions()? {
            let hash = self.hasher.hash(&name);
            self.colliding_hashes.insert(hash.get());
            self.colliding_names.insert(name);
        }
        Ok(())
    }

    pub fn hash_of(&self, stream_id: &str) -> StreamHash {
        self.hasher.hash(stream_id)
    }

    /// The handle a stream's state lives under right now.
    pub fn handle_for(&self, stream_id: &str) -> StreamHandle {
        let hash = self.hasher.hash(stream_id);
        if self.colliding_names.contains(stream_id) {
            StreamHandle::for_id(stream_id, hash)
        } else {
            StreamHandle::for_hash(hash)
        }
    }

    pub fn is_colliding_name(&self, stream_id: &str) -> bool {
        self.colliding_names.contains(stream_id)
    }

    pub fn is_colliding_hash(&self, hash: StreamHash) -> bool {
        self.colliding_hashes.contains(&hash.get())
    }

    /// Record that `stream_id` was seen, detecting new collisions.
    ///
    /// Must run inside the caller's open transaction so a detected
    /// collision commits together with the per-record work that
    /// surfaced it.
    pub fn observe(
        &mut self,
        store: &mut StateStore,
        stream_id: &str,
    ) -> Result<Observation, StateError> {
        let hash = self.hasher.hash(stream_id);
        if self.colliding_names.contains(stream_id) {
            return Ok(Observation::Unique(hash));
        }

        if let Some(owner) = self.names.get(&hash.get()) {
            if owner == stream_id {
                return Ok(Observation::Unique(hash));
            }
            let prior = owner.clone();
            self.mark_collision(store, hash, stream_id, &prior)?;
            return Ok(Observation::NewCollision { hash, prior });
        }

        // Cache miss: fall back to the on-disk table.
        match store.hash_owner(hash)? {
            None => {
                store.record_hash(hash, stream_id)?;
                self.names.put(hash.get(), stream_id.to_string());
                Ok(Observation::Unique(hash))
            }
            Some(owner) if owner == stream_id => {
                self.names.put(hash.get(), owner);
                Ok(Observation::Unique(hash))
            }
            Some(prior) => {
                self.mark_collision(store, hash, stream_id, &prior)?;
                Ok(Observation::NewCollision { hash, prior })
            }
        }
    }

    fn mark_collision(
        &mut self,
        store: &mut StateStore,
        hash: StreamHash,
        stream_id: &str,
        prior: &str,
    ) -> Result<(), StateError> {
        store.add_collision(prior)?;
        store.add_collision(stream_id)?;
        self.colliding_names.insert(prior.to_string());
        self.colliding_names.insert(stream_id.to_string());
        self.colliding_hashes.insert(hash.get());
        // A colliding hash is also the hash of the prior owner.
        self.colliding_hashes.insert(self.hasher.hash(prior).get());
        Ok(())
    }
}
