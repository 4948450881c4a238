//! Point, slice and trend types shared by all archive backends.
//!
//! # Components
//!
//! - [`ChannelValue`]: One observation of a channel (value and status)
//! - [`Point`]: A channel value at a timestamp, the atomic write unit
//! - [`Slice`]: Many channels at one instant
//! - [`Trend`] / [`TrendBundle`]: One or many channels over a time range
//! - [`ChannelNumberList`]: Ordered channel numbers with a stable identity
//! - [`CurrentData`]: The host's current sample passed to `process_data`

pub mod merge;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use merge::{bundle_trends, merge_bundles, merge_segments, merge_trends};

/// Timestamp type used throughout the archive (UTC).
pub type Timestamp = DateTime<Utc>;

/// Numeric identifier of a channel.
pub type ChannelNumber = i32;

/// Milliseconds in one day.
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Converts a timestamp to milliseconds since the Unix epoch.
pub fn to_millis(timestamp: Timestamp) -> i64 {
    timestamp.timestamp_millis()
}

/// Converts milliseconds since the Unix epoch to a timestamp.
///
/// Out-of-range values saturate to the minimum representable timestamp.
pub fn from_millis(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Returns midnight (UTC) of the given date.
pub fn day_start(date: NaiveDate) -> Timestamp {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// One observation of a channel.
///
/// `status == 0` means the value is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelValue {
    /// Measured or calculated value.
    pub value: f64,
    /// Channel status; zero means undefined.
    pub status: u8,
}

impl ChannelValue {
    /// Undefined value.
    pub const EMPTY: ChannelValue = ChannelValue {
        value: 0.0,
        status: 0,
    };

    /// Creates a new channel value.
    pub fn new(value: f64, status: u8) -> Self {
        Self { value, status }
    }

    /// Returns true if the value is defined.
    pub fn is_defined(&self) -> bool {
        self.status != 0
    }
}

/// A channel value at a point in time. Also the write queue element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Channel number.
    pub channel_number: ChannelNumber,
    /// Timestamp of the value.
    pub timestamp: Timestamp,
    /// Value and status.
    pub value: ChannelValue,
}

impl Point {
    /// Creates a new point.
    pub fn new(channel_number: ChannelNumber, timestamp: Timestamp, value: ChannelValue) -> Self {
        Self {
            channel_number,
            timestamp,
            value,
        }
    }
}

/// All requested channel values at one instant.
///
/// `values` is index-aligned with `channel_numbers`.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    /// Timestamp of the slice.
    pub timestamp: Timestamp,
    /// Channel numbers.
    pub channel_numbers: Vec<ChannelNumber>,
    /// Values, one per channel number.
    pub values: Vec<ChannelValue>,
}

impl Slice {
    /// Creates a slice with every value undefined.
    pub fn new(timestamp: Timestamp, channel_numbers: Vec<ChannelNumber>) -> Self {
        let values = vec![ChannelValue::EMPTY; channel_numbers.len()];
        Self {
            timestamp,
            channel_numbers,
            values,
        }
    }

    /// Returns the value of the channel, if the slice contains it.
    pub fn get(&self, channel_number: ChannelNumber) -> Option<ChannelValue> {
        self.channel_numbers
            .iter()
            .position(|&cnl| cnl == channel_number)
            .map(|idx| self.values[idx])
    }

    /// Number of channels in the slice.
    pub fn len(&self) -> usize {
        self.channel_numbers.len()
    }

    /// Returns true if the slice has no channels.
    pub fn is_empty(&self) -> bool {
        self.channel_numbers.is_empty()
    }
}

/// A timestamped value of a trend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendPoint {
    /// Timestamp.
    pub timestamp: Timestamp,
    /// Value and status.
    pub value: ChannelValue,
}

/// One channel over a time range. Timestamps are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct Trend {
    /// Channel number.
    pub channel_number: ChannelNumber,
    /// Points ordered by timestamp.
    pub points: Vec<TrendPoint>,
}

impl Trend {
    /// Creates an empty trend.
    pub fn new(channel_number: ChannelNumber) -> Self {
        Self {
            channel_number,
            points: Vec::new(),
        }
    }

    /// Appends a point.
    pub fn push(&mut self, timestamp: Timestamp, value: ChannelValue) {
        self.points.push(TrendPoint { timestamp, value });
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if the trend has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns the timestamps of the trend.
    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.points.iter().map(|p| p.timestamp).collect()
    }
}

/// Several channels over a time range sharing one timestamp sequence.
///
/// Every column in `trends` has the same length as `timestamps`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrendBundle {
    /// Channel numbers, one per column.
    pub channel_numbers: Vec<ChannelNumber>,
    /// Shared timestamps.
    pub timestamps: Vec<Timestamp>,
    /// Value columns, index-aligned with `channel_numbers`.
    pub trends: Vec<Vec<ChannelValue>>,
}

impl TrendBundle {
    /// Creates an empty bundle for the channels.
    pub fn new(channel_numbers: Vec<ChannelNumber>) -> Self {
        let trends = vec![Vec::new(); channel_numbers.len()];
        Self {
            channel_numbers,
            timestamps: Vec::new(),
            trends,
        }
    }

    /// Appends a row. `values` must be aligned with the channel numbers.
    pub fn push_row(&mut self, timestamp: Timestamp, values: &[ChannelValue]) {
        debug_assert_eq!(values.len(), self.trends.len());
        self.timestamps.push(timestamp);
        for (column, value) in self.trends.iter_mut().zip(values) {
            column.push(*value);
        }
    }

    /// Returns the column of a channel.
    pub fn column(&self, channel_number: ChannelNumber) -> Option<&[ChannelValue]> {
        self.channel_numbers
            .iter()
            .position(|&cnl| cnl == channel_number)
            .map(|idx| self.trends[idx].as_slice())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the bundle has no rows.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

static NEXT_LIST_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_list_id() -> u64 {
    let seq = NEXT_LIST_SEQ.fetch_add(1, Ordering::Relaxed);
    let micros = Utc::now().timestamp_micros() as u64;
    (micros << 12) | (seq & 0xFFF)
}

/// Ordered, distinct channel numbers with an identity.
///
/// The identity is the compatibility key between a persisted page and the
/// configured channel set. Once assigned it never changes; a reconciled list
/// adopts the identity of the persisted one.
#[derive(Debug, Clone)]
pub struct ChannelNumberList {
    list_id: u64,
    numbers: Arc<[ChannelNumber]>,
}

impl ChannelNumberList {
    /// Creates a list with a newly generated identity.
    pub fn new(numbers: Vec<ChannelNumber>) -> Self {
        Self::with_id(generate_list_id(), numbers)
    }

    /// Creates a list with a known identity.
    pub fn with_id(list_id: u64, numbers: Vec<ChannelNumber>) -> Self {
        Self {
            list_id,
            numbers: numbers.into(),
        }
    }

    /// Returns the list identity.
    pub fn list_id(&self) -> u64 {
        self.list_id
    }

    /// Returns the channel numbers.
    pub fn numbers(&self) -> &[ChannelNumber] {
        &self.numbers
    }

    /// Returns a copy of this list that carries another identity.
    pub fn reidentify(&self, list_id: u64) -> Self {
        Self {
            list_id,
            numbers: Arc::clone(&self.numbers),
        }
    }

    /// Returns true if both lists contain the same numbers in the same order.
    pub fn has_same_numbers(&self, other: &ChannelNumberList) -> bool {
        self.numbers == other.numbers
    }

    /// Position of a channel in the list.
    pub fn index_of(&self, channel_number: ChannelNumber) -> Option<usize> {
        self.numbers.iter().position(|&cnl| cnl == channel_number)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

/// Time range used by range queries.
///
/// The end is exclusive unless `end_inclusive` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start of the range (inclusive).
    pub start: Timestamp,
    /// End of the range.
    pub end: Timestamp,
    /// Whether `end` itself belongs to the range.
    pub end_inclusive: bool,
}

impl TimeRange {
    /// Creates a half-open range `[start, end)`.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            end_inclusive: false,
        }
    }

    /// Creates a closed range `[start, end]`.
    pub fn inclusive(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            end_inclusive: true,
        }
    }

    /// Returns true if the timestamp lies in the range.
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start
            && (timestamp < self.end || (self.end_inclusive && timestamp == self.end))
    }

    /// Start in epoch milliseconds (inclusive).
    pub fn start_millis(&self) -> i64 {
        to_millis(self.start)
    }

    /// End in epoch milliseconds (exclusive).
    pub fn end_millis_exclusive(&self) -> i64 {
        let end = to_millis(self.end);
        if self.end_inclusive {
            end + 1
        } else {
            end
        }
    }

    /// Returns true if no timestamp can fall in the range.
    pub fn is_empty(&self) -> bool {
        self.start_millis() >= self.end_millis_exclusive()
    }

    /// Calendar dates overlapping the range, in increasing order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        if self.is_empty() {
            return Vec::new();
        }

        let first = self.start.date_naive();
        let last = from_millis(self.end_millis_exclusive() - 1).date_naive();
        let mut dates = Vec::new();
        let mut date = first;
        while date <= last {
            dates.push(date);
            date += Duration::days(1);
        }
        dates
    }
}

/// The host's current sample for all of its channels.
///
/// Besides the sample timestamp, every channel carries its own timestamp of
/// last update, used by the current-value archive.
#[derive(Debug, Clone)]
pub struct CurrentData {
    /// Sample timestamp.
    pub timestamp: Timestamp,
    channel_numbers: Vec<ChannelNumber>,
    values: Vec<ChannelValue>,
    timestamps: Vec<Timestamp>,
    index: HashMap<ChannelNumber, usize>,
}

impl CurrentData {
    /// Creates a sample with every channel undefined.
    pub fn new(timestamp: Timestamp, channel_numbers: Vec<ChannelNumber>) -> Self {
        let index = channel_numbers
            .iter()
            .enumerate()
            .map(|(idx, &cnl)| (cnl, idx))
            .collect();
        let len = channel_numbers.len();
        Self {
            timestamp,
            channel_numbers,
            values: vec![ChannelValue::EMPTY; len],
            timestamps: vec![DateTime::<Utc>::MIN_UTC; len],
            index,
        }
    }

    /// Channel numbers of the sample.
    pub fn channel_numbers(&self) -> &[ChannelNumber] {
        &self.channel_numbers
    }

    /// Values, aligned with the channel numbers.
    pub fn values(&self) -> &[ChannelValue] {
        &self.values
    }

    /// Per-channel timestamps, aligned with the channel numbers.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// Position of a channel in the sample.
    pub fn index_of(&self, channel_number: ChannelNumber) -> Option<usize> {
        self.index.get(&channel_number).copied()
    }

    /// Returns the value of a channel.
    pub fn get(&self, channel_number: ChannelNumber) -> Option<ChannelValue> {
        self.index_of(channel_number).map(|idx| self.values[idx])
    }

    /// Sets a channel value stamped with the sample timestamp.
    ///
    /// Returns false if the channel is not part of the sample.
    pub fn set(&mut self, channel_number: ChannelNumber, value: ChannelValue) -> bool {
        let timestamp = self.timestamp;
        self.set_at(channel_number, timestamp, value)
    }

    /// Sets a channel value with its own timestamp.
    pub fn set_at(
        &mut self,
        channel_number: ChannelNumber,
        timestamp: Timestamp,
        value: ChannelValue,
    ) -> bool {
        match self.index_of(channel_number) {
            Some(idx) => {
                self.values[idx] = value;
                self.timestamps[idx] = timestamp;
                true
            }
            None => false,
        }
    }
}
