//! Calendar partition spans.
//!
//! Historical SQL data is split into partitions of a day, a month or a year.
//! A partition is named from the archive code and its start date, so the
//! name alone is enough to recover its span.

use crate::data::{day_start, TimeRange, Timestamp};
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Supported partition spans.
///
/// # Examples
/// ```rust,ignore
/// use alopex_archive::lifecycle::partition::PartitionSize;
///
/// let span = PartitionSize::OneMonth.span_of(date);
/// let suffix = PartitionSize::OneMonth.name_suffix(span.start);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionSize {
    /// One-day partitions.
    OneDay,
    /// One-month partitions.
    #[default]
    OneMonth,
    /// One-year partitions.
    OneYear,
}

impl PartitionSize {
    /// Returns the span of the partition containing the date.
    pub fn span_of(self, date: NaiveDate) -> PartitionSpan {
        let start = match self {
            Self::OneDay => date,
            Self::OneMonth => date.with_day(1).unwrap_or(date),
            Self::OneYear => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        };
        let end = match self {
            Self::OneDay => start.succ_opt(),
            Self::OneMonth => start.checked_add_months(Months::new(1)),
            Self::OneYear => start.checked_add_months(Months::new(12)),
        }
        .unwrap_or(NaiveDate::MAX);

        PartitionSpan { start, end }
    }

    /// Returns the span of the partition containing the timestamp.
    pub fn span_of_timestamp(self, timestamp: Timestamp) -> PartitionSpan {
        self.span_of(timestamp.date_naive())
    }

    /// Builds the name suffix of a partition starting at `start`.
    ///
    /// Suffixes are fixed-width: `yyyymmdd`, `yyyymm` or `yyyy`.
    pub fn name_suffix(self, start: NaiveDate) -> String {
        match self {
            Self::OneDay => start.format("%Y%m%d").to_string(),
            Self::OneMonth => start.format("%Y%m").to_string(),
            Self::OneYear => start.format("%Y").to_string(),
        }
    }

    /// Parses a name suffix back into a partition span.
    ///
    /// Returns `None` if the suffix does not match this partition size.
    pub fn parse_suffix(self, suffix: &str) -> Option<PartitionSpan> {
        if !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let start = match (self, suffix.len()) {
            (Self::OneDay, 8) => NaiveDate::parse_from_str(suffix, "%Y%m%d").ok()?,
            (Self::OneMonth, 6) => {
                let year: i32 = suffix[0..4].parse().ok()?;
                let month: u32 = suffix[4..6].parse().ok()?;
                NaiveDate::from_ymd_opt(year, month, 1)?
            }
            (Self::OneYear, 4) => {
                let year: i32 = suffix.parse().ok()?;
                NaiveDate::from_ymd_opt(year, 1, 1)?
            }
            _ => return None,
        };

        Some(self.span_of(start))
    }

    /// Lists the spans overlapping a time range, in increasing order.
    pub fn spans_in_range(self, range: &TimeRange) -> Vec<PartitionSpan> {
        let mut spans: Vec<PartitionSpan> = Vec::new();
        for date in range.dates() {
            if spans.last().is_some_and(|span| span.contains_date(date)) {
                continue;
            }
            spans.push(self.span_of(date));
        }
        spans
    }
}

/// Date span `[start, end)` of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionSpan {
    /// First date of the partition.
    pub start: NaiveDate,
    /// First date after the partition.
    pub end: NaiveDate,
}

impl PartitionSpan {
    /// Start as a timestamp.
    pub fn start_time(&self) -> Timestamp {
        day_start(self.start)
    }

    /// End as a timestamp (exclusive).
    pub fn end_time(&self) -> Timestamp {
        day_start(self.end)
    }

    /// Returns true if the date lies in the span.
    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// Returns true if the span shares at least one instant with the range.
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        !range.is_empty()
            && range.start_millis() < self.end_time().timestamp_millis()
            && self.start_time().timestamp_millis() < range.end_millis_exclusive()
    }
}
