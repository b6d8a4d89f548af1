//! Stream handles: small when the hash is unique, explicit when not.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 64-bit stream-name hash, composed from two 32-bit halves.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamHash(u64);

impl StreamHash {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHash({:#018x})", self.0)
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Tagged reference to a stream.
///
/// `Hash` is used while the hash is known not to collide with any
/// other stream's; `Id` carries the full name once a collision has
/// been observed. Each variant indexes its own side of the
/// collision-aware state tables.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamHandle {
    Hash { hash: StreamHash },
    Id { id: String, hash: StreamHash },
}

impl StreamHandle {
    pub fn for_hash(hash: StreamHash) -> Self {
        StreamHandle::Hash { hash }
    }

    pub fn for_id(id: impl Into<String>, hash: StreamHash) -> Self {
        StreamHandle::Id {
            id: id.into(),
            hash,
        }
    }

    pub fn hash(&self) -> StreamHash {
        match self {
            StreamHandle::Hash { hash } => *hash,
            StreamHandle::Id { hash, .. } => *hash,
        }
    }

    /// The stream name, when the handle carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            StreamHandle::Hash { .. } => None,
            StreamHandle::Id { id, .. } => Some(id),
        }
    }

    pub fn is_colliding(&self) -> bool {
        matches!(self, StreamHandle::Id { .. })
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::Hash { hash } => write!(f, "Handle({hash})"),
            StreamHandle::Id { id, hash } => write!(f, "Handle({id:?}, {hash})"),
        }
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::Hash { hash } => write!(f, "{hash}"),
            StreamHandle::Id { id, .. } => f.write_str(id),
        }
    }
}
