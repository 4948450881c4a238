//! Historical archive stored in paged daily tables.

use crate::cache::MemoryCache;
use crate::clock::Clock;
use crate::config::{validate_code, ArchiveOptions, PathOptions};
use crate::data::{
    merge_bundles, merge_segments, merge_trends, ChannelNumber, ChannelNumberList, ChannelValue,
    CurrentData, Slice, TimeRange, Timestamp, Trend, TrendBundle,
};
use crate::error::{ArchiveError, Result};
use crate::file::adapter::TrendTableAdapter;
use crate::file::layout::TableLayout;
use crate::file::table::{PositionKind, TableMeta, TrendTable};
use crate::lifecycle::{DaysRetention, RetentionPolicy};
use crate::logic::period::{align_to_period, closest_write_time, is_multiple_of_period};
use crate::logic::{
    ArchiveLifecycle, ArchiveLogic, ArchiveState, ArchiveStatus, ChannelIndexMap, UpdateBuffer,
    WriteDecision, WritingScheduler,
};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Writing state touched only by the real-time path.
#[derive(Debug)]
struct WriterState {
    scheduler: WritingScheduler,
    index_map: ChannelIndexMap,
    values: Vec<ChannelValue>,
    channels: ChannelNumberList,
}

#[derive(Debug)]
struct UpdateWindow {
    buffer: UpdateBuffer,
    table: Arc<TrendTable>,
}

/// Historical archive backed by daily table directories.
///
/// Writes are synchronous and land in the table of the write time's date.
/// The table of the current date is held outside the cache; tables of other
/// dates are loaded through a [`MemoryCache`].
///
/// # Examples
/// ```rust,ignore
/// let archive = BasicArchive::new(
///     "Min",
///     ArchiveOptions::default(),
///     vec![101, 102],
///     &PathOptions::new("/data/arc", "/data/arc_copy"),
///     Arc::new(SystemClock),
/// )?;
/// archive.make_ready()?;
/// archive.process_data(&current)?;
/// ```
#[derive(Debug)]
pub struct BasicArchive {
    code: String,
    options: ArchiveOptions,
    period_secs: i64,
    clock: Arc<dyn Clock>,
    retention: DaysRetention,
    lifecycle: ArchiveLifecycle,
    adapter: TrendTableAdapter,
    table_cache: MemoryCache<NaiveDate, TrendTable>,
    writer: Mutex<WriterState>,
    current_table: Mutex<Option<Arc<TrendTable>>>,
    update: Mutex<Option<UpdateWindow>>,
    has_error: AtomicBool,
}

impl BasicArchive {
    /// Creates an idle archive.
    ///
    /// Channel numbers are sorted and de-duplicated.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidConfig` for an invalid code or options.
    pub fn new(
        code: impl Into<String>,
        options: ArchiveOptions,
        mut channel_numbers: Vec<ChannelNumber>,
        paths: &PathOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let code = code.into();
        validate_code(&code)?;
        options.validate_for(true)?;

        channel_numbers.sort_unstable();
        channel_numbers.dedup();

        let period_secs = options.writing_period_secs();
        let layout = TableLayout::new(paths.archive_root(&code, options.use_copy_dir), code.as_str());
        Ok(Self {
            retention: DaysRetention::new(options.retention_days),
            lifecycle: ArchiveLifecycle::new(code.as_str()),
            adapter: TrendTableAdapter::new(layout),
            table_cache: MemoryCache::default(),
            writer: Mutex::new(WriterState {
                scheduler: WritingScheduler::new(options.writing_mode, period_secs),
                index_map: ChannelIndexMap::new(),
                values: Vec::with_capacity(channel_numbers.len()),
                channels: ChannelNumberList::new(channel_numbers),
            }),
            current_table: Mutex::new(None),
            update: Mutex::new(None),
            has_error: AtomicBool::new(false),
            code,
            options,
            period_secs,
            clock,
        })
    }

    /// Directory layout of the archive.
    pub fn layout(&self) -> &TableLayout {
        self.adapter.layout()
    }

    /// Channels of the archive with their current list identity.
    pub fn channel_numbers(&self) -> ChannelNumberList {
        self.writer.lock().channels.clone()
    }

    fn expected_meta(&self, date: NaiveDate) -> TableMeta {
        TableMeta::new(date, self.period_secs as u32)
    }

    fn create_table(&self, date: NaiveDate) -> Result<TrendTable> {
        let table = TrendTable::new(self.expected_meta(date));
        self.adapter.write_metadata(&table)?;
        Ok(table)
    }

    fn backup_and_create(&self, date: NaiveDate, reason: &str) -> Result<TrendTable> {
        let backup = self.adapter.backup_table(date, self.clock.now().timestamp())?;
        warn!(
            "Archive {}: table {} backed up to {} ({})",
            self.code,
            date,
            backup.display(),
            reason
        );
        self.create_table(date)
    }

    /// Opens the table of a date for writing, repairing it if needed.
    ///
    /// Equal metadata keeps the table; with `reconcile` set, the page holding
    /// the next write is reconciled with the archive channels. Unequal or
    /// unreadable metadata moves the table to a backup and starts afresh.
    fn prepare_table(
        &self,
        date: NaiveDate,
        reconcile: Option<(&mut ChannelNumberList, Timestamp)>,
    ) -> Result<Arc<TrendTable>> {
        let expected = self.expected_meta(date);
        let table = match self.adapter.read_metadata(date) {
            Ok(Some(meta)) if meta == expected => {
                let table = TrendTable::persisted(meta);
                if let Some((channels, now)) = reconcile {
                    self.reconcile_page(&table, channels, now)?;
                }
                table
            }
            Ok(Some(meta)) => self.backup_and_create(
                date,
                &format!(
                    "period {}s, expected {}s",
                    meta.writing_period, expected.writing_period
                ),
            )?,
            Ok(None) => self.create_table(date)?,
            Err(err) if err.is_corruption() => {
                self.backup_and_create(date, &format!("unreadable metadata: {err}"))?
            }
            Err(err) => return Err(err),
        };
        self.table_cache.remove(&date);
        Ok(Arc::new(table))
    }

    fn reconcile_page(
        &self,
        table: &TrendTable,
        channels: &mut ChannelNumberList,
        now: Timestamp,
    ) -> Result<()> {
        let Some(pos) = table.meta().position(now, PositionKind::Ceiling) else {
            return Ok(());
        };

        match self.adapter.read_page_channels(table.date(), pos.page_number) {
            Ok(Some(persisted)) if persisted.has_same_numbers(channels) => {
                *channels = channels.reidentify(persisted.list_id());
            }
            Ok(Some(persisted)) => {
                info!(
                    "Archive {}: page {} of {} has {} channels, rewriting for {}",
                    self.code,
                    pos.page_number,
                    table.date(),
                    persisted.len(),
                    channels.len()
                );
                self.adapter
                    .update_page_channels(table, pos.page_number, channels)?;
            }
            Ok(None) => {}
            Err(err) if err.is_corruption() => {
                warn!(
                    "Archive {}: deleting corrupt page {} of {}: {}",
                    self.code,
                    pos.page_number,
                    table.date(),
                    err
                );
                self.adapter.delete_page(table.date(), pos.page_number)?;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Table of the current date, rotating to a newer date when needed.
    fn current_table_for(&self, date: NaiveDate) -> Result<Arc<TrendTable>> {
        let mut current = self.current_table.lock();
        let current_date = current.as_ref().map(|table| table.date());
        match current_date {
            Some(current_date) if current_date == date => {
                if let Some(table) = current.as_ref() {
                    return Ok(Arc::clone(table));
                }
            }
            Some(current_date) if current_date > date => {
                drop(current);
                return self.get_table(date);
            }
            _ => {}
        }

        let table = self.prepare_table(date, None)?;
        if let Some(previous) = current.replace(Arc::clone(&table)) {
            self.table_cache.add_shared(previous.date(), previous);
        }
        debug!("Archive {}: switched to table {}", self.code, date);
        Ok(table)
    }

    /// Table of any date. Tables absent on disk are created lazily on write.
    fn get_table(&self, date: NaiveDate) -> Result<Arc<TrendTable>> {
        if let Some(table) = self
            .current_table
            .lock()
            .as_ref()
            .filter(|table| table.date() == date)
        {
            return Ok(Arc::clone(table));
        }

        self.table_cache.get_or_try_insert_with(date, || {
            Ok(match self.adapter.read_metadata(date)? {
                Some(meta) => TrendTable::persisted(meta),
                None => TrendTable::new(self.expected_meta(date)),
            })
        })
    }

    fn track_write(&self, result: Result<bool>, started: Instant, what: &str) -> Result<bool> {
        match result {
            Ok(written) => {
                self.has_error.store(false, Ordering::Release);
                if self.options.log_enabled {
                    debug!(
                        "Archive {}: {} {} in {:?}",
                        self.code,
                        what,
                        if written { "written" } else { "skipped" },
                        started.elapsed()
                    );
                }
                Ok(written)
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!("Archive {}: error writing {}: {}", self.code, what, err);
                Err(err)
            }
        }
    }

    fn try_make_ready(&self) -> Result<()> {
        fs::create_dir_all(self.adapter.layout().root())?;
        let now = self.clock.now();

        let mut writer = self.writer.lock();
        let table = self.prepare_table(now.date_naive(), Some((&mut writer.channels, now)))?;
        *self.current_table.lock() = Some(table);
        writer.scheduler.start(now);
        Ok(())
    }

    fn read_dates<T>(
        &self,
        range: &TimeRange,
        mut read: impl FnMut(&TrendTable) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut segments = Vec::new();
        for date in range.dates() {
            let table = self.get_table(date)?;
            segments.push(read(&*table)?);
        }
        Ok(segments)
    }
}

impl ArchiveLogic for BasicArchive {
    fn code(&self) -> &str {
        &self.code
    }

    fn status(&self) -> ArchiveStatus {
        ArchiveStatus {
            state: self.lifecycle.state(),
            has_error: self.has_error.load(Ordering::Acquire),
            queue: None,
        }
    }

    fn make_ready(&self) -> Result<()> {
        self.lifecycle.require_idle("make ready")?;
        let started = Instant::now();

        if let Err(err) = self.try_make_ready() {
            self.has_error.store(true, Ordering::Release);
            error!("Archive {}: make ready failed: {}", self.code, err);
            return Err(err);
        }

        self.lifecycle.set_ready();
        info!(
            "Archive {} is ready: {} channels, period {}s, root {}",
            self.code,
            self.writer.lock().channels.len(),
            self.period_secs,
            self.adapter.layout().root().display()
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
        self.current_table.lock().take();
        self.table_cache.clear();
        info!("Archive {} closed", self.code);
        Ok(())
    }

    fn delete_outdated_data(&self) -> Result<usize> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();
        let now = self.clock.now();

        let sweep = || -> Result<usize> {
            let mut deleted = 0;
            for (date, path) in self.adapter.layout().list_table_dirs()? {
                if !self.retention.is_date_expired(date, now) {
                    continue;
                }
                self.table_cache.remove(&date);
                if self.adapter.delete_dir(&path)? {
                    debug!("Archive {}: deleted {}", self.code, path.display());
                    deleted += 1;
                }
            }
            Ok(deleted)
        };

        match sweep() {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(
                        "Archive {}: deleted {} outdated tables older than {} days",
                        self.code,
                        deleted,
                        self.retention.days()
                    );
                }
                if self.options.log_enabled {
                    debug!(
                        "Archive {}: retention took {:?}",
                        self.code,
                        started.elapsed()
                    );
                }
                Ok(deleted)
            }
            Err(err) => {
                self.has_error.store(true, Ordering::Release);
                error!("Archive {}: error deleting outdated data: {}", self.code, err);
                Err(err)
            }
        }
    }

    fn accept_data(&self, timestamp: Timestamp) -> Option<Timestamp> {
        align_to_period(
            timestamp,
            self.period_secs,
            i64::from(self.options.pull_to_period),
        )
    }

    fn process_data(&self, data: &CurrentData) -> Result<bool> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();

        let mut guard = self.writer.lock();
        let writer = &mut *guard;
        writer
            .index_map
            .map_values(writer.channels.numbers(), data, &mut writer.values);

        match writer.scheduler.decide(data.timestamp, &writer.values) {
            WriteDecision::Skip => Ok(false),
            WriteDecision::Slice { write_time } => {
                let result = self
                    .current_table_for(write_time.date_naive())
                    .and_then(|table| {
                        self.adapter
                            .write_slice(&table, &writer.channels, write_time, &writer.values)
                    });
                self.track_write(result, started, "slice")
            }
            WriteDecision::Changes { indexes } => {
                let write_time = closest_write_time(data.timestamp, self.period_secs);
                let changes: Vec<(usize, ChannelValue)> = indexes
                    .iter()
                    .map(|&idx| (idx, writer.values[idx]))
                    .collect();
                let result = self
                    .current_table_for(write_time.date_naive())
                    .and_then(|table| {
                        self.adapter
                            .write_values(&table, &writer.channels, write_time, &changes)
                    });
                self.track_write(result, started, "changes")
            }
        }
    }

    fn begin_update(&self, timestamp: Timestamp, device_num: i32) -> Result<()> {
        self.lifecycle.require_ready()?;
        let table = self.get_table(timestamp.date_naive())?;
        let previous = self.update.lock().replace(UpdateWindow {
            buffer: UpdateBuffer::new(timestamp, device_num),
            table,
        });
        if let Some(previous) = previous {
            debug!(
                "Archive {}: update window of device {} replaced",
                self.code,
                previous.buffer.device_num()
            );
        }
        Ok(())
    }

    fn end_update(&self, _timestamp: Timestamp, _device_num: i32) {
        if let Some(window) = self.update.lock().take() {
            if self.options.log_enabled {
                debug!(
                    "Archive {}: update of device {} at {} ended with {} values",
                    self.code,
                    window.buffer.device_num(),
                    window.buffer.timestamp(),
                    window.buffer.len()
                );
            }
        }
    }

    fn write_cnl_data(
        &self,
        timestamp: Timestamp,
        channel_number: ChannelNumber,
        value: ChannelValue,
    ) -> Result<()> {
        self.lifecycle.require_ready()?;
        if !is_multiple_of_period(timestamp, self.period_secs) {
            return Err(ArchiveError::TimestampNotAligned {
                timestamp,
                period: self.period_secs,
            });
        }

        // Page rewrites for a new channel list must not interleave.
        let writer = self.writer.lock();
        let channels = &writer.channels;
        let Some(column) = channels.index_of(channel_number) else {
            debug!(
                "Archive {}: channel {} is not archived",
                self.code, channel_number
            );
            return Ok(());
        };

        let started = Instant::now();
        let date = timestamp.date_naive();
        let window_table = self
            .update
            .lock()
            .as_ref()
            .filter(|window| window.table.date() == date)
            .map(|window| Arc::clone(&window.table));
        let result = match window_table {
            Some(table) => Ok(table),
            None => self.get_table(date),
        }
        .and_then(|table| {
            self.adapter
                .write_values(&table, channels, timestamp, &[(column, value)])
        });
        drop(writer);

        if !self.track_write(result, started, "channel value")? {
            warn!(
                "Archive {}: {} is not a slot of the stored table, value dropped",
                self.code, timestamp
            );
            return Ok(());
        }
        if let Some(window) = self.update.lock().as_mut() {
            window.buffer.record(timestamp, channel_number, value);
        }
        Ok(())
    }

    fn get_slice(&self, timestamp: Timestamp, channel_numbers: &[ChannelNumber]) -> Result<Slice> {
        self.lifecycle.require_ready()?;
        let table = self.get_table(timestamp.date_naive())?;
        self.adapter.read_slice(&table, timestamp, channel_numbers)
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
            .and_then(|window| window.buffer.get(timestamp, channel_number));
        if let Some(value) = buffered {
            return Ok(value);
        }

        let table = self.get_table(timestamp.date_naive())?;
        self.adapter.read_cnl_data(&table, timestamp, channel_number)
    }

    fn get_trend(&self, range: &TimeRange, channel_number: ChannelNumber) -> Result<Trend> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();
        let trends = self.read_dates(range, |table| {
            self.adapter.read_trend(table, range, channel_number)
        })?;
        let trend = merge_trends(channel_number, trends);
        if self.options.log_enabled {
            debug!(
                "Archive {}: read trend of channel {} with {} points in {:?}",
                self.code,
                channel_number,
                trend.len(),
                started.elapsed()
            );
        }
        Ok(trend)
    }

    fn get_trends(
        &self,
        range: &TimeRange,
        channel_numbers: &[ChannelNumber],
    ) -> Result<TrendBundle> {
        self.lifecycle.require_ready()?;
        let started = Instant::now();
        let bundles = self.read_dates(range, |table| {
            self.adapter.read_trends(table, range, channel_numbers)
        })?;
        let bundle = merge_bundles(channel_numbers, bundles);
        if self.options.log_enabled {
            debug!(
                "Archive {}: read {} trends with {} points in {:?}",
                self.code,
                channel_numbers.len(),
                bundle.len(),
                started.elapsed()
            );
        }
        Ok(bundle)
    }

    fn get_timestamps(&self, range: &TimeRange) -> Result<Vec<Timestamp>> {
        self.lifecycle.require_ready()?;
        let segments = self.read_dates(range, |table| self.adapter.read_timestamps(table, range))?;
        Ok(merge_segments(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{TimeUnit, WritingMode};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, s).unwrap()
    }

    fn archive(temp_dir: &TempDir, options: ArchiveOptions) -> BasicArchive {
        let paths = PathOptions::new(temp_dir.path().join("arc"), temp_dir.path().join("copy"));
        BasicArchive::new(
            "Min",
            options,
            vec![3, 1, 2, 1],
            &paths,
            Arc::new(ManualClock::new(at(12, 0, 10))),
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_options() {
        let temp_dir = TempDir::new().unwrap();
        let paths = PathOptions::new(temp_dir.path(), temp_dir.path());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(0, 0, 0)));

        let zero_period = ArchiveOptions::default()
            .with_writing_mode(WritingMode::OnDemand)
            .with_writing_period(0, TimeUnit::Second);
        assert!(matches!(
            BasicArchive::new("Min", zero_period, vec![1], &paths, Arc::clone(&clock)),
            Err(ArchiveError::InvalidConfig(_))
        ));
        assert!(matches!(
            BasicArchive::new("Min/..", ArchiveOptions::default(), vec![1], &paths, clock),
            Err(ArchiveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_channels_sorted_and_distinct() {
        let temp_dir = TempDir::new().unwrap();
        let archive = archive(&temp_dir, ArchiveOptions::default());
        assert_eq!(archive.channel_numbers().numbers(), &[1, 2, 3]);
        assert!(archive.layout().root().ends_with("arc/Min"));

        let copy = self::archive(&temp_dir, ArchiveOptions::default().with_copy_dir(true));
        assert!(copy.layout().root().ends_with("copy/Min"));
    }

    #[test]
    fn test_operations_require_ready() {
        let temp_dir = TempDir::new().unwrap();
        let archive = archive(&temp_dir, ArchiveOptions::default());

        assert!(matches!(
            archive.get_cnl_data(at(12, 0, 0), 1),
            Err(ArchiveError::NotReady { .. })
        ));
        assert_eq!(archive.accept_data(at(12, 0, 0)), Some(at(12, 0, 0)));

        archive.make_ready().unwrap();
        assert!(matches!(
            archive.make_ready(),
            Err(ArchiveError::InvalidState { .. })
        ));
        assert!(archive.layout().meta_path(at(0, 0, 0).date_naive()).exists());

        archive.close().unwrap();
        archive.close().unwrap();
        assert!(matches!(
            archive.process_data(&CurrentData::new(at(12, 1, 0), vec![1])),
            Err(ArchiveError::NotReady { .. })
        ));
        assert_eq!(archive.status_text(), "Closed");
    }

    #[test]
    fn test_write_cnl_data_requires_alignment() {
        let temp_dir = TempDir::new().unwrap();
        let archive = archive(&temp_dir, ArchiveOptions::default());
        archive.make_ready().unwrap();

        assert!(matches!(
            archive.write_cnl_data(at(12, 0, 30), 1, ChannelValue::new(1.0, 1)),
            Err(ArchiveError::TimestampNotAligned { period: 60, .. })
        ));
        archive
            .write_cnl_data(at(12, 0, 0), 99, ChannelValue::new(1.0, 1))
            .unwrap();
        archive
            .write_cnl_data(at(12, 0, 0), 2, ChannelValue::new(4.0, 1))
            .unwrap();
        assert_eq!(
            archive.get_cnl_data(at(12, 0, 0), 2).unwrap(),
            ChannelValue::new(4.0, 1)
        );
        assert_eq!(archive.get_cnl_data(at(12, 0, 0), 99).unwrap(), ChannelValue::EMPTY);
    }
}
