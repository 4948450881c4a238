//! Retention policy for age-based deletion of archive data.
//!
//! Both backends delete whole units: the file backend removes daily table
//! directories and the SQL backend drops partitions. The policy only decides
//! which units are expired; the backends do the deleting.

use crate::data::Timestamp;
use chrono::{Duration, NaiveDate};

/// Retention policy for determining expired units.
pub trait RetentionPolicy: Send + Sync {
    /// Returns the retention duration.
    fn retention_duration(&self) -> Duration;

    /// Oldest instant still retained at `now`.
    fn cutoff(&self, now: Timestamp) -> Timestamp {
        now - self.retention_duration()
    }

    /// Returns true if a unit ending at `end` (exclusive) is expired.
    fn is_expired(&self, end: Timestamp, now: Timestamp) -> bool {
        end <= self.cutoff(now)
    }

    /// Returns true if a daily unit is expired.
    ///
    /// The day containing the cutoff is kept.
    fn is_date_expired(&self, date: NaiveDate, now: Timestamp) -> bool {
        date < self.cutoff(now).date_naive()
    }
}

/// Keeps a fixed number of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaysRetention {
    days: u32,
}

impl DaysRetention {
    /// Creates a policy keeping `days` days.
    pub fn new(days: u32) -> Self {
        Self { days }
    }

    /// Number of days kept.
    pub fn days(&self) -> u32 {
        self.days
    }
}

impl RetentionPolicy for DaysRetention {
    fn retention_duration(&self) -> Duration {
        Duration::days(i64::from(self.days))
    }
}
