//! Inter-chunk pacing.

use std::time::Duration;

/// Sleeps between chunks so the scavenger uses at most
/// `percent` of wall-clock time. At 100 it never sleeps.
#[derive(Clone, Copy, Debug)]
pub struct Throttle {
    percent: u32,
}

impl Throttle {
    pub fn new(percent: u32) -> Self {
        Self {
            percent: percent.clamp(1, 100),
        }
    }

    /// How long to rest after a chunk that took `elapsed`.
    pub fn rest_for(&self, elapsed: Duration) -> Duration {
        if self.percent >= 100 {
            return Duration::ZERO;
        }
        let nanos = elapsed
            .as_nanos()
            .saturating_mul(u128::from(100 - self.percent))
            / u128::from(self.percent);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub fn rest(&self, elapsed: Duration) -> Duration {
        let wait = self.rest_for(elapsed);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        wait
    }
}
