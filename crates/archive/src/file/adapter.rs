//! Reads and writes daily tables on disk.
//!
//! [`TrendTableAdapter`] owns the directory layout and the channel-list
//! cache. It opens page files per call; the archive above it decides which
//! table a write or read goes to.

use crate::cache::MemoryCache;
use crate::data::{
    ChannelNumber, ChannelNumberList, ChannelValue, Slice, TimeRange, Timestamp, Trend,
    TrendBundle,
};
use crate::error::{ArchiveError, Result};
use crate::file::layout::TableLayout;
use crate::file::page::{PageFile, PageHeader, SlotBlock};
use crate::file::table::{PositionKind, TableMeta, TrendTable};
use chrono::NaiveDate;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Slot span `[from, to)` inside one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageSpan {
    page_number: u32,
    from: u32,
    to: u32,
}

fn page_spans(meta: &TableMeta, first: u32, last: u32) -> Vec<PageSpan> {
    let capacity = meta.page_capacity;
    let mut spans = Vec::new();
    let mut slot = first;
    while slot < last {
        let page_number = slot / capacity;
        let page_start = page_number * capacity;
        let end = (page_start + capacity).min(last);
        spans.push(PageSpan {
            page_number,
            from: slot - page_start,
            to: end - page_start,
        });
        slot = end;
    }
    spans
}

/// Disk access for the daily tables of one archive.
#[derive(Debug)]
pub struct TrendTableAdapter {
    layout: TableLayout,
    cnl_num_cache: MemoryCache<u64, ChannelNumberList>,
}

impl TrendTableAdapter {
    /// Creates an adapter over the layout.
    pub fn new(layout: TableLayout) -> Self {
        Self {
            layout,
            cnl_num_cache: MemoryCache::default(),
        }
    }

    /// Directory layout.
    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Reads the persisted metadata of a date, `None` if the table is absent.
    pub fn read_metadata(&self, date: NaiveDate) -> Result<Option<TableMeta>> {
        TableMeta::load(&self.layout.meta_path(date))
    }

    /// Persists the metadata of a table and marks it ready.
    pub fn write_metadata(&self, table: &TrendTable) -> Result<()> {
        table.meta().save(&self.layout.meta_path(table.date()))?;
        table.set_ready();
        Ok(())
    }

    /// Persists the metadata unless the table is already on disk.
    pub fn ensure_ready(&self, table: &TrendTable) -> Result<()> {
        if table.is_ready() {
            return Ok(());
        }
        self.write_metadata(table)
    }

    /// Moves a table directory aside and returns the backup path.
    ///
    /// Earlier backups with the same stamp are kept; the new one gets the
    /// next free sequence number.
    pub fn backup_table(&self, date: NaiveDate, stamp: i64) -> Result<PathBuf> {
        let mut seq = 0;
        let mut backup = self.layout.backup_dir(date, stamp, seq);
        while backup.exists() {
            seq += 1;
            backup = self.layout.backup_dir(date, stamp, seq);
        }
        fs::rename(self.layout.table_dir(date), &backup)?;
        Ok(backup)
    }

    /// Removes a table or backup directory. Returns false if it was already gone.
    pub fn delete_dir(&self, path: &Path) -> Result<bool> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    fn open_page(&self, date: NaiveDate, page_number: u32) -> Result<Option<PageFile>> {
        let path = self.layout.page_path(date, page_number);
        let opened = PageFile::open(&path, |list_id| {
            self.cnl_num_cache
                .get(&list_id)
                .map(|list| ChannelNumberList::clone(&list))
        });
        match opened {
            Ok(page) => {
                let channels = &page.header().channels;
                self.cnl_num_cache.add(channels.list_id(), channels.clone());
                Ok(Some(page))
            }
            Err(ArchiveError::IoError(err)) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_page(
        &self,
        table: &TrendTable,
        page_number: u32,
        channels: &ChannelNumberList,
    ) -> Result<PageFile> {
        let header = PageHeader::new(
            page_number,
            table.meta().page_slot_count(page_number),
            channels.clone(),
        );
        let page = PageFile::create(&self.layout.page_path(table.date(), page_number), header)?;
        self.cnl_num_cache.add(channels.list_id(), channels.clone());
        Ok(page)
    }

    /// Reads the channel list of a page, `None` if the page does not exist.
    pub fn read_page_channels(
        &self,
        date: NaiveDate,
        page_number: u32,
    ) -> Result<Option<ChannelNumberList>> {
        Ok(self
            .open_page(date, page_number)?
            .map(|page| page.header().channels.clone()))
    }

    /// Rewrites a page for another channel list.
    ///
    /// Values of channels present in both lists are carried over; the new
    /// page replaces the old one atomically.
    pub fn update_page_channels(
        &self,
        table: &TrendTable,
        page_number: u32,
        channels: &ChannelNumberList,
    ) -> Result<PageFile> {
        let date = table.date();
        let path = self.layout.page_path(date, page_number);
        let mut old = self
            .open_page(date, page_number)?
            .ok_or_else(|| ArchiveError::CorruptPage {
                path: path.clone(),
                reason: "page file is missing".to_string(),
            })?;

        let slot_count = table.meta().page_slot_count(page_number);
        let block = old.read_slots(0, slot_count)?;
        let columns: Vec<Option<usize>> = channels
            .numbers()
            .iter()
            .map(|&cnl| old.header().channels.index_of(cnl))
            .collect();
        drop(old);

        let tmp_path = path.with_extension("tmp");
        let mut page = PageFile::create(
            &tmp_path,
            PageHeader::new(page_number, slot_count, channels.clone()),
        )?;
        let mut row = Vec::with_capacity(columns.len());
        let mut copied = 0;
        for i in 0..block.len() {
            let Some(timestamp) = block.timestamp(i) else {
                continue;
            };
            row.clear();
            row.extend(
                columns
                    .iter()
                    .map(|column| column.map_or(ChannelValue::EMPTY, |c| block.value(i, c))),
            );
            page.write_slot(block.first() + i as u32, timestamp, &row)?;
            copied += 1;
        }
        page.sync()?;
        drop(page);
        fs::rename(&tmp_path, &path)?;

        debug!(
            "Rewrote page {} for {} channels, {} slots carried over",
            path.display(),
            channels.len(),
            copied
        );
        self.cnl_num_cache.add(channels.list_id(), channels.clone());
        self.open_page(date, page_number)?
            .ok_or_else(|| ArchiveError::CorruptPage {
                path,
                reason: "page file vanished after rewrite".to_string(),
            })
    }

    /// Deletes a page. Returns false if it did not exist.
    pub fn delete_page(&self, date: NaiveDate, page_number: u32) -> Result<bool> {
        match fs::remove_file(self.layout.page_path(date, page_number)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens a page for writing with the given channels, creating, rewriting
    /// or replacing it as needed.
    fn open_page_for_write(
        &self,
        table: &TrendTable,
        page_number: u32,
        channels: &ChannelNumberList,
    ) -> Result<PageFile> {
        match self.open_page(table.date(), page_number) {
            Ok(Some(page)) if page.header().channels.has_same_numbers(channels) => Ok(page),
            Ok(Some(page)) => {
                drop(page);
                self.update_page_channels(table, page_number, channels)
            }
            Ok(None) => self.create_page(table, page_number, channels),
            Err(err) if err.is_corruption() => {
                warn!(
                    "Replacing corrupt page {}: {}",
                    self.layout.page_path(table.date(), page_number).display(),
                    err
                );
                self.delete_page(table.date(), page_number)?;
                self.create_page(table, page_number, channels)
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes a slice of all channels.
    ///
    /// Returns false if the write time is not a slot of the table.
    pub fn write_slice(
        &self,
        table: &TrendTable,
        channels: &ChannelNumberList,
        write_time: Timestamp,
        values: &[ChannelValue],
    ) -> Result<bool> {
        let Some(pos) = table.meta().position(write_time, PositionKind::Exact) else {
            return Ok(false);
        };
        self.ensure_ready(table)?;
        let mut page = self.open_page_for_write(table, pos.page_number, channels)?;
        page.write_slot(pos.index, write_time, values)?;
        Ok(true)
    }

    /// Writes individual channel values into one slot.
    ///
    /// `changes` pairs a column of `channels` with its value. Returns false if
    /// the write time is not a slot of the table.
    pub fn write_values(
        &self,
        table: &TrendTable,
        channels: &ChannelNumberList,
        write_time: Timestamp,
        changes: &[(usize, ChannelValue)],
    ) -> Result<bool> {
        let Some(pos) = table.meta().position(write_time, PositionKind::Exact) else {
            return Ok(false);
        };
        self.ensure_ready(table)?;
        let mut page = self.open_page_for_write(table, pos.page_number, channels)?;
        for (column, value) in changes {
            page.write_value(pos.index, write_time, *column, value)?;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read_range<F>(&self, table: &TrendTable, range: &TimeRange, mut visit: F) -> Result<()>
    where
        F: FnMut(&PageFile, &SlotBlock),
    {
        if !table.is_ready() {
            return Ok(());
        }
        let meta = table.meta();
        let (first, last) = meta.slot_range(range);
        for span in page_spans(meta, first, last) {
            let Some(mut page) = self.open_page(table.date(), span.page_number)? else {
                continue;
            };
            let block = page.read_slots(span.from, span.to)?;
            visit(&page, &block);
        }
        Ok(())
    }

    /// Reads one channel of a table over a range.
    pub fn read_trend(
        &self,
        table: &TrendTable,
        range: &TimeRange,
        channel_number: ChannelNumber,
    ) -> Result<Trend> {
        let mut trend = Trend::new(channel_number);
        self.read_range(table, range, |page, block| {
            let column = page.header().channels.index_of(channel_number);
            for i in 0..block.len() {
                match block.timestamp(i) {
                    Some(ts) if range.contains(ts) => {
                        let value = column.map_or(ChannelValue::EMPTY, |c| block.value(i, c));
                        trend.push(ts, value);
                    }
                    _ => {}
                }
            }
        })?;
        Ok(trend)
    }

    /// Reads several channels of a table over a range.
    pub fn read_trends(
        &self,
        table: &TrendTable,
        range: &TimeRange,
        channel_numbers: &[ChannelNumber],
    ) -> Result<TrendBundle> {
        let mut bundle = TrendBundle::new(channel_numbers.to_vec());
        let mut row = Vec::with_capacity(channel_numbers.len());
        self.read_range(table, range, |page, block| {
            let columns: Vec<Option<usize>> = channel_numbers
                .iter()
                .map(|&cnl| page.header().channels.index_of(cnl))
                .collect();
            for i in 0..block.len() {
                match block.timestamp(i) {
                    Some(ts) if range.contains(ts) => {
                        row.clear();
                        row.extend(
                            columns
                                .iter()
                                .map(|c| c.map_or(ChannelValue::EMPTY, |c| block.value(i, c))),
                        );
                        bundle.push_row(ts, &row);
                    }
                    _ => {}
                }
            }
        })?;
        Ok(bundle)
    }

    /// Lists the timestamps of written slots in a range.
    pub fn read_timestamps(&self, table: &TrendTable, range: &TimeRange) -> Result<Vec<Timestamp>> {
        let mut timestamps = Vec::new();
        self.read_range(table, range, |_, block| {
            timestamps.extend(
                (0..block.len())
                    .filter_map(|i| block.timestamp(i))
                    .filter(|ts| range.contains(*ts)),
            );
        })?;
        Ok(timestamps)
    }

    /// Reads the channels at a timestamp. Unwritten values are empty.
    pub fn read_slice(
        &self,
        table: &TrendTable,
        timestamp: Timestamp,
        channel_numbers: &[ChannelNumber],
    ) -> Result<Slice> {
        let mut slice = Slice::new(timestamp, channel_numbers.to_vec());
        if !table.is_ready() {
            return Ok(slice);
        }
        let Some(pos) = table.meta().position(timestamp, PositionKind::Exact) else {
            return Ok(slice);
        };
        let Some(mut page) = self.open_page(table.date(), pos.page_number)? else {
            return Ok(slice);
        };

        let block = page.read_slots(pos.index, pos.index + 1)?;
        if block.is_empty() || block.timestamp(0).is_none() {
            return Ok(slice);
        }
        for (value, &cnl) in slice.values.iter_mut().zip(channel_numbers) {
            if let Some(column) = page.header().channels.index_of(cnl) {
                *value = block.value(0, column);
            }
        }
        Ok(slice)
    }

    /// Reads one channel at a timestamp.
    pub fn read_cnl_data(
        &self,
        table: &TrendTable,
        timestamp: Timestamp,
        channel_number: ChannelNumber,
    ) -> Result<ChannelValue> {
        let slice = self.read_slice(table, timestamp, &[channel_number])?;
        Ok(slice.values[0])
    }
}
