//! Current-value archive stored as one SQL row per channel.

use crate::clock::Clock;
use crate::config::{validate_code, ArchiveOptions};
use crate::data::{from_millis, ChannelNumber, CurrentData, Point, Timestamp};
use crate::error::Result;
use crate::logic::period::next_write_time;
use crate::logic::{ArchiveLifecycle, ArchiveState, ArchiveStatus, CurrentArchiveLogic, QueueStatus};
use crate::queue::{queue_capacity, PointQueue, DEFAULT_BATCH_SIZE};
use crate::sql::connection::SqlStorage;
use crate::sql::query::{value_from_row, QueryBuilder};
use crate::sql::writer::{CurrentSink, PointSink, WriterThread};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Archive keeping the latest value of every channel.
///
/// Values are persisted through a queue once per writing period, so a
/// restarted host can restore its last known state with
/// [`read_data`](CurrentArchiveLogic::read_data).
#[derive(Debug)]
pub struct SqlCurrentArchive {
    code: String,
    options: ArchiveOptions,
    period_secs: i64,
    storage: Arc<SqlStorage>,
    queries: QueryBuilder,
    clock: Arc<dyn Clock>,
    channels: Vec<ChannelNumber>,
    lifecycle: ArchiveLifecycle,
    queue: Arc<PointQueue>,
    next_write: Mutex<Option<Timestamp>>,
    thread: Mutex<Option<WriterThread<CurrentSink>>>,
    has_error: Arc<AtomicBool>,
}

impl SqlCurrentArchive {
    /// Creates an idle archive.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidConfig` for an invalid code, a zero
    /// writing period or other invalid options.
    pub fn new(
        code: impl Into<String>,
        options: ArchiveOptions,
        storage: Arc<SqlStorage>,
        mut channel_numbers: Vec<ChannelNumber>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let code = code.into();
        validate_code(&code)?;
        let queries = QueryBuilder::new(storage.schema(), &code)?;
        options.validate_for(true)?;

        channel_numbers.sort_unstable();
        channel_numbers.dedup();

        let queue = PointQueue::new(
            code.as_str(),
            queue_capacity(options.max_queue_size, channel_numbers.len()),
        );
        Ok(Self {
            period_secs: options.writing_period_secs(),
            queries,
            lifecycle: ArchiveLifecycle::new(code.as_str()),
            queue: Arc::new(queue),
            next_write: Mutex::new(None),
            thread: Mutex::new(None),
            has_error: Arc::new(AtomicBool::new(false)),
            channels: channel_numbers,
            code,
            options,
            storage,
            clock,
        })
    }

    fn start_writer(&self) -> Result<()> {
        let conn = self.storage.connect()?;
        conn.execute_batch(&self.queries.create_schema())?;
        conn.execute_batch(&self.queries.create_current_table())?;

        let thread = WriterThread::spawn(
            format!("{}-writer", self.code),
            conn,
            Arc::clone(&self.queue),
            CurrentSink::new(self.queries.clone()),
            Arc::clone(&self.clock),
            Arc::clone(&self.has_error),
        )?;
        *self.thread.lock() = Some(thread);
        *self.next_write.lock() = Some(next_write_time(self.clock.now(), self.period_secs));
        Ok(())
    }

    fn load_values(&self, data: &mut CurrentData) -> Result<usize> {
        let mut conn = self.storage.connect()?;
        let tx = conn.transaction()?;

        let mut loaded = 0;
        {
            let mut stmt = tx.prepare(&self.queries.select_current())?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i32>(3)?,
                ))
            })?;
            for row in rows {
                let (cnl, ts, val, stat) = row?;
                if self.channels.binary_search(&cnl).is_ok()
                    && data.set_at(cnl, from_millis(ts), value_from_row(val, stat))
                {
                    loaded += 1;
                }
            }
        }

        let deleted = tx.execute(&self.queries.delete_current_except(&self.channels), [])?;
        tx.commit()?;

        if deleted > 0 {
            info!(
                "Archive {}: deleted {} values of unconfigured channels",
                self.code, deleted
            );
        }
        Ok(loaded)
    }
}

impl CurrentArchiveLogic for SqlCurrentArchive {
    fn code(&self) -> &str {
        &self.code
    }

    fn status(&self) -> ArchiveStatus {
        ArchiveStatus {
            state: self.lifecycle.state(),
            has_error: self.has_error.load(Ordering::Acquire) || self.queue.has_error(),
            queue: Some(QueueStatus {
                len: self.queue.len(),
                capacity: self.queue.capacity(),
            }),
        }
    }

    fn make_ready(&self) -> Result<()> {
        self.lifecycle.require_idle("make ready")?;

        if let Err(err) = self.start_writer() {
            self.has_error.store(true, Ordering::Release);
            error!("Archive {}: make ready failed: {}", self.code, err);
            return Err(err);
        }

        self.lifecycle.set_ready();
        info!(
            "Archive {} is ready: {} channels in {}.{}",
            self.code,
            self.channels.len(),
            self.queries.schema(),
            self.queries.current_table()
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.lifecycle.set_closed() == ArchiveState::Closed {
            return Ok(());
        }

        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };
        let (mut conn, mut sink) = thread.stop().inspect_err(|err| {
            self.has_error.store(true, Ordering::Release);
            error!("Archive {}: {}", self.code, err);
        })?;

        match self.queue.flush_all(DEFAULT_BATCH_SIZE, |batch| {
            sink.write_batch(&mut conn, batch)
        }) {
            Ok(flushed) => {
                info!(
                    "Archive {} closed, {} queued values flushed",
                    self.code, flushed
                );
                Ok(())
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!(
                    "Archive {}: {} queued values not written on close: {}",
                    self.code,
                    self.queue.len(),
                    err
                );
                Err(err)
            }
        }
    }

    fn read_data(&self, data: &mut CurrentData) -> Result<usize> {
        self.lifecycle.require_ready()?;

        match self.load_values(data) {
            Ok(loaded) => {
                self.has_error.store(false, Ordering::Release);
                if self.options.log_enabled {
                    debug!("Archive {}: loaded {} current values", self.code, loaded);
                }
                Ok(loaded)
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!("Archive {}: error reading current data: {}", self.code, err);
                Err(err)
            }
        }
    }

    fn write_data(&self, data: &CurrentData) -> Result<()> {
        self.lifecycle.require_ready()?;

        let timestamps = data.timestamps();
        let values = data.values();
        let added = self.queue.enqueue_batch(self.channels.iter().filter_map(|&cnl| {
            data.index_of(cnl)
                .map(|idx| Point::new(cnl, timestamps[idx], values[idx]))
        }));

        if self.options.log_enabled {
            debug!("Archive {}: queued {} current values", self.code, added);
        }
        Ok(())
    }

    fn process_data(&self, data: &CurrentData) -> Result<bool> {
        self.lifecycle.require_ready()?;

        {
            let mut next = self.next_write.lock();
            if next.is_some_and(|due| data.timestamp < due) {
                return Ok(false);
            }
            *next = Some(next_write_time(data.timestamp, self.period_secs));
        }
        self.write_data(data)?;
        Ok(true)
    }
}

impl Drop for SqlCurrentArchive {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to close archive {} on drop: {:?}", self.code, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DbConnectionOptions, TimeUnit};
    use crate::data::ChannelValue;
    use crate::error::ArchiveError;
    use chrono::{Duration, TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, s).unwrap()
    }

    fn archive(clock: Arc<ManualClock>) -> SqlCurrentArchive {
        let storage = Arc::new(SqlStorage::open(DbConnectionOptions::default()).unwrap());
        SqlCurrentArchive::new(
            "Cur",
            ArchiveOptions::default().with_writing_period(10, TimeUnit::Second),
            storage,
            vec![1, 2],
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let storage = Arc::new(SqlStorage::open(DbConnectionOptions::default()).unwrap());
        let result = SqlCurrentArchive::new(
            "Cur",
            ArchiveOptions::default().with_writing_period(0, TimeUnit::Second),
            storage,
            vec![1],
            Arc::new(ManualClock::new(at(12, 0, 0))),
        );
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_process_data_once_per_period() {
        let clock = Arc::new(ManualClock::new(at(12, 0, 3)));
        let archive = archive(Arc::clone(&clock));
        archive.make_ready().unwrap();

        let mut data = CurrentData::new(at(12, 0, 5), vec![1, 2, 3]);
        data.set(1, ChannelValue::new(1.0, 1));
        assert!(!archive.process_data(&data).unwrap());

        data.timestamp = at(12, 0, 10);
        assert!(archive.process_data(&data).unwrap());
        data.timestamp = at(12, 0, 15);
        assert!(!archive.process_data(&data).unwrap());
        data.timestamp = at(12, 0, 10) + Duration::seconds(10);
        assert!(archive.process_data(&data).unwrap());

        archive.close().unwrap();
        assert_eq!(archive.status_text(), "Closed, queue 0 of 1000");
    }

    #[test]
    fn test_successful_read_clears_error() {
        let archive = archive(Arc::new(ManualClock::new(at(12, 0, 0))));
        archive.make_ready().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));

        archive.has_error.store(true, Ordering::Release);
        assert!(archive.status_text().starts_with("Ready, error"));

        let mut data = CurrentData::new(at(12, 0, 0), vec![1, 2]);
        assert_eq!(archive.read_data(&mut data).unwrap(), 0);
        assert!(!archive.status().has_error);
    }

    #[test]
    fn test_requires_ready() {
        let archive = archive(Arc::new(ManualClock::new(at(12, 0, 0))));
        let data = CurrentData::new(at(12, 0, 0), vec![1]);
        assert!(matches!(
            archive.write_data(&data),
            Err(ArchiveError::NotReady { .. })
        ));
    }
}
