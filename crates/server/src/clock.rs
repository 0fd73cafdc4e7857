//! Timestamps for session state.
//!
//! Anchored to wall time once, then advanced by the tokio monotonic clock, so
//! successive readings never go backwards and paused-time tests move it too.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_anchor: DateTime<Utc>,
    mono_anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            mono_anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.mono_anchor.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall_anchor + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
