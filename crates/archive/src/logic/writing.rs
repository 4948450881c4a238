//! Writing-mode decisions shared by every backend.
//!
//! [`WritingScheduler`] decides, per reporting cycle, whether the archive
//! writes and what. [`ChannelIndexMap`] maps the host's channel array onto
//! the archive's channel order and is rebuilt only when the host's channel
//! set changes.

use crate::config::WritingMode;
use crate::data::{ChannelNumber, ChannelValue, CurrentData, Timestamp};
use crate::logic::period::{closest_write_time, next_write_time};

/// Outcome of a writing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteDecision {
    /// Nothing to write.
    Skip,
    /// Write a slice of all channels at `write_time`.
    Slice {
        /// Period-aligned write time.
        write_time: Timestamp,
    },
    /// Write the channels whose values changed.
    Changes {
        /// Indexes of the changed channels in archive order.
        indexes: Vec<usize>,
    },
}

/// Writing-mode state machine.
///
/// # Examples
/// ```rust,ignore
/// let mut scheduler = WritingScheduler::new(WritingMode::AutoPeriodic, 60);
/// scheduler.start(clock.now());
/// if let WriteDecision::Slice { write_time } = scheduler.decide(ts, &values) {
///     write_slice(write_time, &values)?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct WritingScheduler {
    mode: WritingMode,
    period_secs: i64,
    next_write_time: Option<Timestamp>,
    previous: Option<Vec<ChannelValue>>,
}

impl WritingScheduler {
    /// Creates a scheduler.
    pub fn new(mode: WritingMode, period_secs: i64) -> Self {
        Self {
            mode,
            period_secs,
            next_write_time: None,
            previous: None,
        }
    }

    /// Writing mode.
    pub fn mode(&self) -> WritingMode {
        self.mode
    }

    /// Next scheduled periodic write, if any.
    pub fn next_write_time(&self) -> Option<Timestamp> {
        self.next_write_time
    }

    /// Resets the schedule when the archive becomes ready.
    ///
    /// The first periodic write happens at the first boundary after `now`;
    /// the on-change baseline is cleared.
    pub fn start(&mut self, now: Timestamp) {
        self.next_write_time = match self.mode {
            WritingMode::AutoPeriodic => Some(next_write_time(now, self.period_secs)),
            _ => None,
        };
        self.previous = None;
    }

    /// Decides whether the sample is written.
    ///
    /// `values` are in archive channel order.
    pub fn decide(&mut self, timestamp: Timestamp, values: &[ChannelValue]) -> WriteDecision {
        match self.mode {
            WritingMode::AutoPeriodic => {
                if self.next_write_time.is_some_and(|next| timestamp < next) {
                    return WriteDecision::Skip;
                }
                let write_time = closest_write_time(timestamp, self.period_secs);
                self.next_write_time =
                    Some(write_time + chrono::Duration::seconds(self.period_secs));
                WriteDecision::Slice { write_time }
            }
            WritingMode::AutoOnChange => match self.previous.as_mut() {
                None => {
                    self.previous = Some(values.to_vec());
                    WriteDecision::Skip
                }
                Some(previous) => {
                    if previous.len() != values.len() {
                        *previous = values.to_vec();
                        return WriteDecision::Skip;
                    }
                    let indexes: Vec<usize> = previous
                        .iter_mut()
                        .zip(values)
                        .enumerate()
                        .filter_map(|(idx, (prev, cur))| {
                            (*prev != *cur).then(|| {
                                *prev = *cur;
                                idx
                            })
                        })
                        .collect();
                    if indexes.is_empty() {
                        WriteDecision::Skip
                    } else {
                        WriteDecision::Changes { indexes }
                    }
                }
            },
            WritingMode::OnDemand => WriteDecision::Skip,
        }
    }
}

/// Mapping from archive channel order to positions in the host's sample.
#[derive(Debug, Clone, Default)]
pub struct ChannelIndexMap {
    source: Vec<ChannelNumber>,
    indexes: Vec<Option<usize>>,
}

impl ChannelIndexMap {
    /// Creates an empty map; it is built on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the sample's values into `target` in archive channel order.
    ///
    /// Channels the sample lacks become [`ChannelValue::EMPTY`].
    pub fn map_values(
        &mut self,
        archive_channels: &[ChannelNumber],
        data: &CurrentData,
        target: &mut Vec<ChannelValue>,
    ) {
        if self.source.as_slice() != data.channel_numbers()
            || self.indexes.len() != archive_channels.len()
        {
            self.source = data.channel_numbers().to_vec();
            self.indexes = archive_channels
                .iter()
                .map(|&cnl| data.index_of(cnl))
                .collect();
        }

        let values = data.values();
        target.clear();
        target.extend(
            self.indexes
                .iter()
                .map(|idx| idx.map_or(ChannelValue::EMPTY, |i| values[i])),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, s).unwrap()
    }

    fn v(value: f64) -> ChannelValue {
        ChannelValue::new(value, 1)
    }

    #[test]
    fn test_periodic_fires_once_per_period() {
        let mut scheduler = WritingScheduler::new(WritingMode::AutoPeriodic, 60);
        scheduler.start(at(12, 0, 0));
        assert_eq!(scheduler.next_write_time(), Some(at(12, 1, 0)));

        assert_eq!(scheduler.decide(at(12, 0, 30), &[v(1.0)]), WriteDecision::Skip);
        assert_eq!(
            scheduler.decide(at(12, 1, 0), &[v(1.0)]),
            WriteDecision::Slice {
                write_time: at(12, 1, 0)
            }
        );
        assert_eq!(scheduler.decide(at(12, 1, 59), &[v(1.0)]), WriteDecision::Skip);
    }

    #[test]
    fn test_periodic_does_not_drift() {
        let mut scheduler = WritingScheduler::new(WritingMode::AutoPeriodic, 60);
        scheduler.start(at(12, 0, 0));

        let mut writes = Vec::new();
        let mut ts = at(12, 0, 0);
        for _ in 0..600 {
            ts += Duration::milliseconds(1100);
            if let WriteDecision::Slice { write_time } = scheduler.decide(ts, &[v(1.0)]) {
                writes.push(write_time);
            }
        }
        let expected: Vec<Timestamp> = (1..=11).map(|m| at(12, m, 0)).collect();
        assert_eq!(writes, expected);
    }

    #[test]
    fn test_on_change_baseline_then_changes() {
        let mut scheduler = WritingScheduler::new(WritingMode::AutoOnChange, 0);
        scheduler.start(at(12, 0, 0));

        assert_eq!(scheduler.decide(at(12, 0, 1), &[v(10.0)]), WriteDecision::Skip);
        assert_eq!(scheduler.decide(at(12, 0, 2), &[v(10.0)]), WriteDecision::Skip);
        assert_eq!(
            scheduler.decide(at(12, 0, 3), &[v(12.0)]),
            WriteDecision::Changes { indexes: vec![0] }
        );
    }

    #[test]
    fn test_on_change_reports_only_changed_channels() {
        let mut scheduler = WritingScheduler::new(WritingMode::AutoOnChange, 0);
        scheduler.decide(at(12, 0, 0), &[v(1.0), v(2.0), v(3.0)]);
        assert_eq!(
            scheduler.decide(at(12, 0, 1), &[v(1.0), v(5.0), ChannelValue::new(3.0, 0)]),
            WriteDecision::Changes {
                indexes: vec![1, 2]
            }
        );
    }

    #[test]
    fn test_on_demand_never_writes() {
        let mut scheduler = WritingScheduler::new(WritingMode::OnDemand, 60);
        scheduler.start(at(12, 0, 0));
        assert_eq!(scheduler.decide(at(13, 0, 0), &[v(1.0)]), WriteDecision::Skip);
    }

    #[test]
    fn test_channel_index_map() {
        let mut map = ChannelIndexMap::new();
        let mut data = CurrentData::new(at(12, 0, 0), vec![30, 10]);
        data.set(10, v(1.0));
        data.set(30, v(3.0));

        let mut values = Vec::new();
        map.map_values(&[10, 20, 30], &data, &mut values);
        assert_eq!(values, vec![v(1.0), ChannelValue::EMPTY, v(3.0)]);

        let mut other = CurrentData::new(at(12, 0, 0), vec![20]);
        other.set(20, v(2.0));
        map.map_values(&[10, 20, 30], &other, &mut values);
        assert_eq!(values, vec![ChannelValue::EMPTY, v(2.0), ChannelValue::EMPTY]);
    }
}
