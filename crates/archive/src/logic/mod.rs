//! Archive contracts and the lifecycle state machine.
//!
//! # Architecture
//!
//! Query callers and the host depend only on [`ArchiveLogic`] (historical
//! archives) and [`CurrentArchiveLogic`] (current-value archives). Each
//! backend implements the full contract; shared behaviour lives in small
//! composable helpers:
//!
//! - [`period`]: period grid arithmetic
//! - [`writing`]: writing-mode decisions and channel index mapping
//! - [`update`]: the update window buffer
//! - [`ArchiveLifecycle`]: `Idle → Ready → Closed` transitions
//!
//! # Example
//!
//! ```rust,ignore
//! archive.make_ready()?;
//! if let Some(ts) = archive.accept_data(sample.timestamp) {
//!     archive.process_data(&sample)?;
//! }
//! {
//!     let _window = UpdateGuard::begin(&archive, ts, device_num)?;
//!     archive.write_cnl_data(ts, 101, ChannelValue::new(42.0, 1))?;
//! }
//! archive.close()?;
//! ```

pub mod period;
pub mod update;
pub mod writing;

use crate::data::{
    ChannelNumber, ChannelValue, CurrentData, Slice, TimeRange, Timestamp, Trend, TrendBundle,
};
use crate::error::{ArchiveError, Result};
use parking_lot::Mutex;
use std::fmt;

pub use update::UpdateBuffer;
pub use writing::{ChannelIndexMap, WriteDecision, WritingScheduler};

/// Lifecycle state of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    /// Constructed, resources not allocated.
    Idle,
    /// Accepting writes and queries.
    Ready,
    /// Closed; resources released.
    Closed,
}

/// Lifecycle transitions guarded by a mutex.
#[derive(Debug)]
pub struct ArchiveLifecycle {
    code: String,
    state: Mutex<ArchiveState>,
}

impl ArchiveLifecycle {
    /// Creates an idle lifecycle for the archive.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            state: Mutex::new(ArchiveState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> ArchiveState {
        *self.state.lock()
    }

    /// Fails unless the archive is ready.
    pub fn require_ready(&self) -> Result<()> {
        match self.state() {
            ArchiveState::Ready => Ok(()),
            state => Err(ArchiveError::NotReady {
                code: self.code.clone(),
                state,
            }),
        }
    }

    /// Fails unless the archive is idle.
    pub fn require_idle(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            ArchiveState::Idle => Ok(()),
            state => Err(ArchiveError::InvalidState {
                code: self.code.clone(),
                operation,
                state,
            }),
        }
    }

    /// Marks the archive ready.
    pub fn set_ready(&self) {
        *self.state.lock() = ArchiveState::Ready;
    }

    /// Marks the archive closed and returns the previous state.
    pub fn set_closed(&self) -> ArchiveState {
        std::mem::replace(&mut *self.state.lock(), ArchiveState::Closed)
    }
}

/// Queue depth reported by queued archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Queued points.
    pub len: usize,
    /// Queue capacity.
    pub capacity: usize,
}

/// Operational status of an archive.
///
/// Its `Display` form is the status text shown on dashboards, e.g.
/// `Ready, queue 12 of 1000` or `Ready, error, queue 1000 of 1000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStatus {
    /// Lifecycle state.
    pub state: ArchiveState,
    /// Whether a write, read or maintenance error was observed.
    pub has_error: bool,
    /// Queue depth of queued archives.
    pub queue: Option<QueueStatus>,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ArchiveState::Idle => "Not ready",
            ArchiveState::Ready => "Ready",
            ArchiveState::Closed => "Closed",
        };
        f.write_str(state)?;
        if self.has_error {
            f.write_str(", error")?;
        }
        if let Some(queue) = self.queue {
            write!(f, ", queue {} of {}", queue.len, queue.capacity)?;
        }
        Ok(())
    }
}

/// Contract of historical archives.
///
/// All operations take `&self`; an archive can be shared between the host's
/// real-time path and any number of query callers.
pub trait ArchiveLogic: Send + Sync {
    /// Archive code.
    fn code(&self) -> &str;

    /// Current status.
    fn status(&self) -> ArchiveStatus;

    /// Status text for dashboards.
    fn status_text(&self) -> String {
        self.status().to_string()
    }

    /// Allocates backend resources. Failure leaves the archive unusable.
    fn make_ready(&self) -> Result<()>;

    /// Stops background work, flushes pending data and releases resources.
    fn close(&self) -> Result<()>;

    /// Deletes data older than the retention period and returns the number
    /// of removed units.
    fn delete_outdated_data(&self) -> Result<usize>;

    /// Checks a candidate timestamp.
    ///
    /// Returns the timestamp to write with (possibly pulled to the period
    /// grid), or `None` if the archive does not take data at that time.
    fn accept_data(&self, timestamp: Timestamp) -> Option<Timestamp>;

    /// Applies the writing mode to the current sample.
    ///
    /// Returns true if anything was written or queued.
    fn process_data(&self, data: &CurrentData) -> Result<bool>;

    /// Opens an update window for the timestamp.
    fn begin_update(&self, timestamp: Timestamp, device_num: i32) -> Result<()>;

    /// Closes the update window.
    fn end_update(&self, timestamp: Timestamp, device_num: i32);

    /// Writes one channel value regardless of the writing mode.
    fn write_cnl_data(
        &self,
        timestamp: Timestamp,
        channel_number: ChannelNumber,
        value: ChannelValue,
    ) -> Result<()>;

    /// Reads the channels at a timestamp.
    fn get_slice(&self, timestamp: Timestamp, channel_numbers: &[ChannelNumber]) -> Result<Slice>;

    /// Reads one channel at a timestamp.
    fn get_cnl_data(&self, timestamp: Timestamp, channel_number: ChannelNumber)
        -> Result<ChannelValue>;

    /// Reads one channel over a range.
    fn get_trend(&self, range: &TimeRange, channel_number: ChannelNumber) -> Result<Trend>;

    /// Reads several channels over a range.
    fn get_trends(&self, range: &TimeRange, channel_numbers: &[ChannelNumber])
        -> Result<TrendBundle>;

    /// Lists the timestamps with data in a range.
    fn get_timestamps(&self, range: &TimeRange) -> Result<Vec<Timestamp>>;
}

/// Contract of current-value archives.
pub trait CurrentArchiveLogic: Send + Sync {
    /// Archive code.
    fn code(&self) -> &str;

    /// Current status.
    fn status(&self) -> ArchiveStatus;

    /// Status text for dashboards.
    fn status_text(&self) -> String {
        self.status().to_string()
    }

    /// Allocates backend resources.
    fn make_ready(&self) -> Result<()>;

    /// Stops background work, flushes pending data and releases resources.
    fn close(&self) -> Result<()>;

    /// Loads persisted current values into `data` and returns how many were
    /// loaded.
    fn read_data(&self, data: &mut CurrentData) -> Result<usize>;

    /// Persists all current values.
    fn write_data(&self, data: &CurrentData) -> Result<()>;

    /// Persists current values when the writing period has elapsed.
    fn process_data(&self, data: &CurrentData) -> Result<bool>;
}

/// Scoped update window.
///
/// Dropping the guard closes the window, also when the update is abandoned
/// through an early return or a panic.
pub struct UpdateGuard<'a> {
    archive: &'a dyn ArchiveLogic,
    timestamp: Timestamp,
    device_num: i32,
}

impl<'a> UpdateGuard<'a> {
    /// Opens an update window on the archive.
    pub fn begin(
        archive: &'a dyn ArchiveLogic,
        timestamp: Timestamp,
        device_num: i32,
    ) -> Result<Self> {
        archive.begin_update(timestamp, device_num)?;
        Ok(Self {
            archive,
            timestamp,
            device_num,
        })
    }

    /// Timestamp of the window.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.archive.end_update(self.timestamp, self.device_num);
    }
}

impl fmt::Debug for UpdateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateGuard")
            .field("archive", &self.archive.code())
            .field("timestamp", &self.timestamp)
            .field("device_num", &self.device_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        let status = ArchiveStatus {
            state: ArchiveState::Ready,
            has_error: false,
            queue: Some(QueueStatus {
                len: 12,
                capacity: 1000,
            }),
        };
        assert_eq!(status.to_string(), "Ready, queue 12 of 1000");

        let failed = ArchiveStatus {
            state: ArchiveState::Idle,
            has_error: true,
            queue: None,
        };
        assert_eq!(failed.to_string(), "Not ready, error");
    }

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = ArchiveLifecycle::new("Min");
        assert!(lifecycle.require_ready().is_err());
        assert!(lifecycle.require_idle("make ready").is_ok());

        lifecycle.set_ready();
        assert!(lifecycle.require_ready().is_ok());
        assert!(matches!(
            lifecycle.require_idle("make ready"),
            Err(ArchiveError::InvalidState { state: ArchiveState::Ready, .. })
        ));

        assert_eq!(lifecycle.set_closed(), ArchiveState::Ready);
        assert_eq!(lifecycle.set_closed(), ArchiveState::Closed);
        assert!(matches!(
            lifecycle.require_ready(),
            Err(ArchiveError::NotReady { state: ArchiveState::Closed, .. })
        ));
    }
}
