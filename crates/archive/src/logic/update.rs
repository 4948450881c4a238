//! Update window buffer.
//!
//! Between `begin_update` and `end_update` an archive records single-point
//! writes for the window's timestamp so they can be read back before they
//! are durable.

use crate::data::{ChannelNumber, ChannelValue, Timestamp};
use std::collections::HashMap;

/// Values written during an update window.
#[derive(Debug, Clone)]
pub struct UpdateBuffer {
    timestamp: Timestamp,
    device_num: i32,
    values: HashMap<ChannelNumber, ChannelValue>,
}

impl UpdateBuffer {
    /// Opens a buffer for the timestamp.
    pub fn new(timestamp: Timestamp, device_num: i32) -> Self {
        Self {
            timestamp,
            device_num,
            values: HashMap::new(),
        }
    }

    /// Timestamp of the window.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Device that opened the window.
    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    /// Records a written value. Writes for other timestamps are ignored.
    pub fn record(&mut self, timestamp: Timestamp, channel_number: ChannelNumber, value: ChannelValue) {
        if timestamp == self.timestamp {
            self.values.insert(channel_number, value);
        }
    }

    /// Returns a buffered value.
    pub fn get(&self, timestamp: Timestamp, channel_number: ChannelNumber) -> Option<ChannelValue> {
        if timestamp == self.timestamp {
            self.values.get(&channel_number).copied()
        } else {
            None
        }
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
