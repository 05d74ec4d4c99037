//! Re-entry suppression after a close.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct CooldownManager {
    interval: Duration,
}

impl CooldownManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::zero()),
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self::new(Duration::seconds(secs))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True while `now` is inside the quiet period after `last_close`.
    pub fn is_active(&self, last_close: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_close {
            Some(closed_at) => now < closed_at + self.interval,
            None => false,
        }
    }

    /// Time left before entries are allowed again.
    pub fn remaining(&self, last_close: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match last_close {
            Some(closed_at) => (closed_at + self.interval - now).max(Duration::zero()),
            None => Duration::zero(),
        }
    }
}
