//! Historical archive stored in SQL partitions.

use crate::clock::Clock;
use crate::config::{validate_code, ArchiveOptions, SqlArchiveOptions, WritingMode};
use crate::data::{
    bundle_trends, from_millis, merge_segments, merge_trends, to_millis, ChannelNumber,
    ChannelValue, CurrentData, Point, Slice, TimeRange, Timestamp, Trend, TrendBundle,
};
use crate::error::Result;
use crate::lifecycle::{DaysRetention, PartitionSize, PartitionSpan, RetentionPolicy};
use crate::logic::period::align_to_period;
use crate::logic::{
    ArchiveLifecycle, ArchiveLogic, ArchiveState, ArchiveStatus, ChannelIndexMap, QueueStatus,
    UpdateBuffer, WriteDecision, WritingScheduler,
};
use crate::queue::{queue_capacity, PointQueue, DEFAULT_BATCH_SIZE};
use crate::sql::connection::SqlStorage;
use crate::sql::query::{value_from_row, QueryBuilder};
use crate::sql::writer::{HistoricalSink, PointSink, WriterThread};
use duckdb::{params, Connection, OptionalExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct WriterState {
    scheduler: WritingScheduler,
    index_map: ChannelIndexMap,
    values: Vec<ChannelValue>,
    channels: Vec<ChannelNumber>,
}

/// Historical archive writing through a queue into SQL partitions.
///
/// The real-time path only enqueues points; a writer thread persists them.
/// Partitions span a day, a month or a year and retention drops them whole.
///
/// # Examples
/// ```rust,ignore
/// let storage = Arc::new(SqlStorage::open(DbConnectionOptions::new("Main", "arc.duckdb"))?);
/// let archive = SqlHistoricalArchive::new(
///     "Hour",
///     ArchiveOptions::default().with_writing_period(1, TimeUnit::Hour),
///     &SqlArchiveOptions::default(),
///     storage,
///     vec![101, 102],
///     Arc::new(SystemClock),
/// )?;
/// archive.make_ready()?;
/// ```
#[derive(Debug)]
pub struct SqlHistoricalArchive {
    code: String,
    options: ArchiveOptions,
    partition_size: PartitionSize,
    period_secs: i64,
    storage: Arc<SqlStorage>,
    queries: QueryBuilder,
    clock: Arc<dyn Clock>,
    retention: DaysRetention,
    lifecycle: ArchiveLifecycle,
    queue: Arc<PointQueue>,
    writer: Mutex<WriterState>,
    thread: Mutex<Option<WriterThread<HistoricalSink>>>,
    update: Mutex<Option<UpdateBuffer>>,
    has_error: Arc<AtomicBool>,
}

impl SqlHistoricalArchive {
    /// Creates an idle archive.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidConfig` for an invalid code or options.
    pub fn new(
        code: impl Into<String>,
        options: ArchiveOptions,
        sql_options: &SqlArchiveOptions,
        storage: Arc<SqlStorage>,
        mut channel_numbers: Vec<ChannelNumber>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let code = code.into();
        validate_code(&code)?;
        let queries = QueryBuilder::new(storage.schema(), &code)?;
        options.validate()?;

        channel_numbers.sort_unstable();
        channel_numbers.dedup();

        let period_secs = options.writing_period_secs();
        let queue = PointQueue::new(
            code.as_str(),
            queue_capacity(options.max_queue_size, channel_numbers.len()),
        );
        Ok(Self {
            partition_size: sql_options.partition_size,
            queries,
            retention: DaysRetention::new(options.retention_days),
            lifecycle: ArchiveLifecycle::new(code.as_str()),
            queue: Arc::new(queue),
            writer: Mutex::new(WriterState {
                scheduler: WritingScheduler::new(options.writing_mode, period_secs),
                index_map: ChannelIndexMap::new(),
                values: Vec::with_capacity(channel_numbers.len()),
                channels: channel_numbers,
            }),
            thread: Mutex::new(None),
            update: Mutex::new(None),
            has_error: Arc::new(AtomicBool::new(false)),
            code,
            options,
            period_secs,
            storage,
            clock,
        })
    }

    fn start_writer(&self) -> Result<()> {
        let conn = self.storage.connect()?;
        conn.execute_batch(&self.queries.create_schema())?;

        let now = self.clock.now();
        let mut sink = HistoricalSink::new(self.queries.clone(), self.partition_size);
        sink.prepare(&conn, now.date_naive())?;

        if self.options.writing_mode == WritingMode::AutoOnChange {
            warn!(
                "Archive {}: writing on change compares every channel each cycle and is slow",
                self.code
            );
        }
        self.writer.lock().scheduler.start(now);

        let thread = WriterThread::spawn(
            format!("{}-writer", self.code),
            conn,
            Arc::clone(&self.queue),
            sink,
            Arc::clone(&self.clock),
            Arc::clone(&self.has_error),
        )?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    /// Existing partitions keyed by span.
    fn partitions(&self, conn: &Connection) -> Result<BTreeMap<PartitionSpan, String>> {
        let mut stmt = conn.prepare(self.queries.list_partitions())?;
        let names = stmt.query_map(
            params![self.queries.schema(), self.queries.partition_pattern()],
            |row| row.get::<_, String>(0),
        )?;

        let mut partitions = BTreeMap::new();
        for name in names {
            let name = name?;
            if let Some(span) = self.queries.parse_partition_name(self.partition_size, &name) {
                partitions.insert(span, name);
            }
        }
        Ok(partitions)
    }

    /// Names of the existing partitions overlapping a range, in time order.
    fn partitions_in_range(&self, conn: &Connection, range: &TimeRange) -> Result<Vec<String>> {
        let partitions = self.partitions(conn)?;
        Ok(self
            .partition_size
            .spans_in_range(range)
            .into_iter()
            .filter_map(|span| partitions.get(&span).cloned())
            .collect())
    }

    fn partition_at(&self, conn: &Connection, timestamp: Timestamp) -> Result<Option<String>> {
        let span = self.partition_size.span_of_timestamp(timestamp);
        Ok(self.partitions(conn)?.remove(&span))
    }

    fn read_trend_rows(
        &self,
        conn: &Connection,
        partitions: &[String],
        range: &TimeRange,
        channel_number: ChannelNumber,
        mut visit: impl FnMut(Timestamp, ChannelValue),
    ) -> Result<()> {
        for name in partitions {
            let mut stmt = conn.prepare(&self.queries.select_trend(name))?;
            let rows = stmt.query_map(
                params![
                    channel_number,
                    range.start_millis(),
                    range.end_millis_exclusive()
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i32>(2)?,
                    ))
                },
            )?;
            for row in rows {
                let (ts, val, stat) = row?;
                visit(from_millis(ts), value_from_row(val, stat));
            }
        }
        Ok(())
    }

    fn read_trend(
        &self,
        conn: &Connection,
        partitions: &[String],
        range: &TimeRange,
        channel_number: ChannelNumber,
    ) -> Result<Trend> {
        let segments = partitions
            .iter()
            .map(|name| {
                let mut trend = Trend::new(channel_number);
                self.read_trend_rows(
                    conn,
                    std::slice::from_ref(name),
                    range,
                    channel_number,
                    |ts, value| trend.push(ts, value),
                )?;
                Ok(trend)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_trends(channel_number, segments))
    }

    fn drop_outdated_partitions(&self, now: Timestamp) -> Result<usize> {
        let conn = self.storage.connect()?;
        let mut dropped = 0;
        for (span, name) in self.partitions(&conn)? {
            if !self.retention.is_expired(span.end_time(), now) {
                continue;
            }
            conn.execute_batch(&self.queries.drop_partition(&name))?;
            info!("Archive {}: dropped partition {}", self.code, name);
            dropped += 1;
        }
        Ok(dropped)
    }

    fn log_read(&self, what: &str, points: usize, started: Instant) {
        if self.options.log_enabled {
            debug!(
                "Archive {}: read {} with {} points in {:?}",
                self.code,
                what,
                points,
                started.elapsed()
            );
        }
    }
}

impl ArchiveLogic for SqlHistoricalArchive {
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
        let started = Instant::now();

        if let Err(err) = self.start_writer() {
            self.has_error.store(true, Ordering::Release);
            error!("Archive {}: make ready failed: {}", self.code, err);
            return Err(err);
        }

        self.lifecycle.set_ready();
        info!(
            "Archive {} is ready: {} channels, {:?} partitions in schema {}",
            self.code,
            self.writer.lock().channels.len(),
            self.partition_size,
            self.queries.schema()
        );
        if self.options.log_enabled {
            debug!("Archive {}: make ready took {:?}", self.code, started.elapsed());
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.lifecycle.set_closed() == ArchiveState::Closed {
            return Ok(());
        }
        self.update.lock().take();

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
                    "Archive {} closed, {} queued points flushed",
                    self.code, flushed
                );
                Ok(())
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!(
                    "Archive {}: {} queued points not written on close: {}",
                    self.code,
                    self.queue.len(),
                    err
                );
                Err(err)
            }
        }
    }

    fn delete_outdated_data(&self) -> Result<usize> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();

        match self.drop_outdated_partitions(self.clock.now()) {
            Ok(dropped) => {
                self.has_error.store(false, Ordering::Release);
                if self.options.log_enabled {
                    debug!(
                        "Archive {}: retention dropped {} partitions in {:?}",
                        self.code,
                        dropped,
                        started.elapsed()
                    );
                }
                Ok(dropped)
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!("Archive {}: error deleting outdated data: {}", self.code, err);
                Err(err)
            }
        }
    }

    fn accept_data(&self, timestamp: Timestamp) -> Option<Timestamp> {
        // Only periodic archives are bound to the grid.
        if self.options.writing_mode != WritingMode::AutoPeriodic || self.period_secs <= 0 {
            return Some(timestamp);
        }
        align_to_period(
            timestamp,
            self.period_secs,
            i64::from(self.options.pull_to_period),
        )
    }

    fn process_data(&self, data: &CurrentData) -> Result<bool> {
        self.lifecycle.require_ready()?;

        let mut guard = self.writer.lock();
        let writer = &mut *guard;
        writer
            .index_map
            .map_values(&writer.channels, data, &mut writer.values);

        let added = match writer.scheduler.decide(data.timestamp, &writer.values) {
            WriteDecision::Skip => return Ok(false),
            WriteDecision::Slice { write_time } => self.queue.enqueue_batch(
                writer
                    .channels
                    .iter()
                    .zip(&writer.values)
                    .map(|(&cnl, &value)| Point::new(cnl, write_time, value)),
            ),
            WriteDecision::Changes { indexes } => {
                self.queue
                    .enqueue_batch(indexes.into_iter().map(|idx| {
                        Point::new(writer.channels[idx], data.timestamp, writer.values[idx])
                    }))
            }
        };

        if self.options.log_enabled {
            debug!(
                "Archive {}: queued {} points at {}",
                self.code, added, data.timestamp
            );
        }
        Ok(added > 0)
    }

    fn begin_update(&self, timestamp: Timestamp, device_num: i32) -> Result<()> {
        self.lifecycle.require_ready()?;
        *self.update.lock() = Some(UpdateBuffer::new(timestamp, device_num));
        Ok(())
    }

    fn end_update(&self, _timestamp: Timestamp, _device_num: i32) {
        self.update.lock().take();
    }

    fn write_cnl_data(
        &self,
        timestamp: Timestamp,
        channel_number: ChannelNumber,
        value: ChannelValue,
    ) -> Result<()> {
        self.lifecycle.require_ready()?;
        self.queue
            .enqueue(Point::new(channel_number, timestamp, value));
        if let Some(buffer) = self.update.lock().as_mut() {
            buffer.record(timestamp, channel_number, value);
        }
        Ok(())
    }

    fn get_slice(&self, timestamp: Timestamp, channel_numbers: &[ChannelNumber]) -> Result<Slice> {
        self.lifecycle.require_ready()?;
        let mut slice = Slice::new(timestamp, channel_numbers.to_vec());
        if channel_numbers.is_empty() {
            return Ok(slice);
        }

        let conn = self.storage.connect()?;
        let Some(name) = self.partition_at(&conn, timestamp)? else {
            return Ok(slice);
        };
        let mut stmt = conn.prepare(&self.queries.select_slice(&name, channel_numbers))?;
        let rows = stmt.query_map(params![to_millis(timestamp)], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i32>(2)?,
            ))
        })?;
        for row in rows {
            let (cnl, val, stat) = row?;
            for (idx, _) in channel_numbers
                .iter()
                .enumerate()
                .filter(|&(_, &requested)| requested == cnl)
            {
                slice.values[idx] = value_from_row(val, stat);
            }
        }
        Ok(slice)
    }

    fn get_cnl_data(
        &self,
        timestamp: Timestamp,
        channel_number: ChannelNumber,
    ) -> Result<ChannelValue> {
        self.lifecycle.require_ready()?;
        let buffered = self
            .update
            .lock()
            .as_ref()
            .and_then(|buffer| buffer.get(timestamp, channel_number));
        if let Some(value) = buffered {
            return Ok(value);
        }

        let conn = self.storage.connect()?;
        let Some(name) = self.partition_at(&conn, timestamp)? else {
            return Ok(ChannelValue::EMPTY);
        };
        let value = conn
            .query_row(
                &self.queries.select_value(&name),
                params![channel_number, to_millis(timestamp)],
                |row| Ok(value_from_row(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(value.unwrap_or(ChannelValue::EMPTY))
    }

    fn get_trend(&self, range: &TimeRange, channel_number: ChannelNumber) -> Result<Trend> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();
        let conn = self.storage.connect()?;
        let partitions = self.partitions_in_range(&conn, range)?;
        let trend = self.read_trend(&conn, &partitions, range, channel_number)?;
        self.log_read("trend", trend.len(), started);
        Ok(trend)
    }

    fn get_trends(
        &self,
        range: &TimeRange,
        channel_numbers: &[ChannelNumber],
    ) -> Result<TrendBundle> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();
        let conn = self.storage.connect()?;
        let partitions = self.partitions_in_range(&conn, range)?;

        let bundle = if let [channel_number] = channel_numbers {
            let mut bundle = TrendBundle::new(vec![*channel_number]);
            self.read_trend_rows(&conn, &partitions, range, *channel_number, |ts, value| {
                bundle.push_row(ts, &[value]);
            })?;
            bundle
        } else {
            let trends = channel_numbers
                .iter()
                .map(|&cnl| self.read_trend(&conn, &partitions, range, cnl))
                .collect::<Result<Vec<_>>>()?;
            bundle_trends(trends)
        };

        self.log_read("trends", bundle.len(), started);
        Ok(bundle)
    }

    fn get_timestamps(&self, range: &TimeRange) -> Result<Vec<Timestamp>> {
        self.lifecycle.require_ready()?;
        let conn = self.storage.connect()?;
        let mut segments = Vec::new();
        for name in self.partitions_in_range(&conn, range)? {
            let mut stmt = conn.prepare(&self.queries.select_timestamps(&name))?;
            let rows = stmt.query_map(
                params![range.start_millis(), range.end_millis_exclusive()],
                |row| row.get::<_, i64>(0),
            )?;
            segments.push(
                rows.map(|ts| ts.map(from_millis))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            );
        }
        Ok(merge_segments(segments))
    }
}

impl Drop for SqlHistoricalArchive {
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
    use crate::error::ArchiveError;
    use chrono::{TimeZone, Utc};

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, 0).unwrap()
    }

    fn archive(options: ArchiveOptions) -> SqlHistoricalArchive {
        let storage = Arc::new(SqlStorage::open(DbConnectionOptions::default()).unwrap());
        SqlHistoricalArchive::new(
            "Hour",
            options,
            &SqlArchiveOptions::default(),
            storage,
            vec![2, 1],
            Arc::new(ManualClock::new(at(12, 0))),
        )
        .unwrap()
    }

    #[test]
    fn test_accept_data_follows_grid() {
        let archive = archive(
            ArchiveOptions::default()
                .with_writing_period(1, TimeUnit::Hour)
                .with_pull_to_period(60),
        );
        assert_eq!(archive.accept_data(at(12, 1)), Some(at(12, 0)));
        assert_eq!(archive.accept_data(at(12, 30)), None);

        let unscheduled = self::archive(
            ArchiveOptions::default()
                .with_writing_mode(WritingMode::OnDemand)
                .with_writing_period(0, TimeUnit::Second),
        );
        assert_eq!(unscheduled.accept_data(at(12, 7)), Some(at(12, 7)));
    }

    #[test]
    fn test_accept_data_ignores_grid_outside_periodic_mode() {
        let off_grid = at(12, 0) + chrono::Duration::seconds(7);
        for mode in [WritingMode::AutoOnChange, WritingMode::OnDemand] {
            let archive = archive(ArchiveOptions::default().with_writing_mode(mode));
            assert_eq!(archive.accept_data(off_grid), Some(off_grid));
        }
        let periodic = archive(ArchiveOptions::default());
        assert_eq!(periodic.accept_data(off_grid), None);
    }

    #[test]
    fn test_status_reports_queue() {
        let archive = archive(ArchiveOptions::default());
        assert_eq!(archive.status_text(), "Not ready, queue 0 of 1000");
        assert!(matches!(
            archive.write_cnl_data(at(12, 0), 1, ChannelValue::new(1.0, 1)),
            Err(ArchiveError::NotReady { .. })
        ));

        archive.make_ready().unwrap();
        assert!(archive.status_text().starts_with("Ready, queue "));
        archive.close().unwrap();
        assert_eq!(archive.status_text(), "Closed, queue 0 of 1000");
    }

    #[test]
    fn test_successful_retention_clears_error() {
        let archive = archive(ArchiveOptions::default().with_retention_days(30));
        archive.make_ready().unwrap();
        // Let the writer finish its first pass.
        std::thread::sleep(std::time::Duration::from_millis(300));

        archive.has_error.store(true, Ordering::Release);
        assert!(archive.status_text().starts_with("Ready, error"));

        assert_eq!(archive.delete_outdated_data().unwrap(), 0);
        assert!(!archive.status().has_error);
    }

    #[test]
    fn test_update_buffer_serves_reads() {
        let archive = archive(ArchiveOptions::default());
        archive.make_ready().unwrap();

        archive.begin_update(at(11, 0), 4).unwrap();
        archive
            .write_cnl_data(at(11, 0), 1, ChannelValue::new(8.0, 1))
            .unwrap();
        assert_eq!(
            archive.get_cnl_data(at(11, 0), 1).unwrap(),
            ChannelValue::new(8.0, 1)
        );
        archive.end_update(at(11, 0), 4);
        archive.close().unwrap();
    }
}
