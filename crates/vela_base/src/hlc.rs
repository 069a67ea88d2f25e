//! Hybrid-logical clock.
//!
//! Timestamps combine a wall-clock reading with a logical counter so that
//! readings are causally ordered even when the wall clock stalls or repeats.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A causally ordered timestamp with a wall-time projection.
///
/// Ordering is lexicographic on `(wall_time, logical)`, which the field
/// order encodes directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Nanoseconds since the unix epoch.
    pub wall_time: u64,
    /// Tie-breaker for readings taken within the same wall nanosecond.
    pub logical: u32,
}

impl Timestamp {
    pub const fn zero() -> Self {
        Self {
            wall_time: 0,
            logical: 0,
        }
    }

    /// Wall-time projection as a duration since the unix epoch.
    pub fn wall_duration(&self) -> Duration {
        Duration::from_nanos(self.wall_time)
    }
}

/// Clock producing monotonically increasing `Timestamp`s.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Timestamp>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reading. Strictly greater than every earlier reading from the
    /// same clock, regardless of what the wall clock does in between.
    pub fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0);

        let mut last = self.last.lock().unwrap();
        if wall > last.wall_time {
            *last = Timestamp {
                wall_time: wall,
                logical: 0,
            };
        } else {
            last.logical = last.logical.saturating_add(1);
        }
        *last
    }
}
