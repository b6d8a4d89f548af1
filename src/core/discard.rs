//! The per-stream "first event number to keep" value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discard point for one stream: every event with a number strictly
/// below `first_to_keep` is discardable.
///
/// Discard points only ever move forward; combining with [`or`] takes
/// the point that would discard whenever either would.
///
/// [`or`]: DiscardPoint::or
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DiscardPoint {
    first_to_keep: i64,
}

impl DiscardPoint {
    /// Discards nothing.
    pub const fn keep_all() -> Self {
        Self { first_to_keep: 0 }
    }

    /// Keep events numbered `n` and up.
    pub fn discard_before(n: i64) -> Self {
        Self {
            first_to_keep: n.max(0),
        }
    }

    /// Discard events numbered up to and including `n`.
    ///
    /// Returns `None` for `n = i64::MAX`, which has no representable
    /// successor.
    pub fn discard_including(n: i64) -> Option<Self> {
        n.checked_add(1).map(Self::discard_before)
    }

    /// The monotonic max: discards whenever either side would.
    pub fn or(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn should_discard(self, event_number: i64) -> bool {
        event_number < self.first_to_keep
    }

    pub fn first_to_keep(self) -> i64 {
        self.first_to_keep
    }
}

impl Default for DiscardPoint {
    fn default() -> Self {
        Self::keep_all()
    }
}

impl fmt::Debug for DiscardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscardPoint(<{})", self.first_to_keep)
    }
}
