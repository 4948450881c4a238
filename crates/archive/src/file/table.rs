//! Daily trend tables and their metadata.
//!
//! A table covers one calendar day split into fixed slots of one writing
//! period each. Slots are grouped into pages of at most
//! [`DEFAULT_PAGE_CAPACITY`] slots; a page is the unit of on-disk update.
//!
//! ## Metadata File
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Magic: "ARCM" (4 bytes)                  │
//! │  Version: u16 (2 bytes) = 1               │
//! │  Reserved: 2 bytes                        │
//! │  Date: i32 days from CE (4 bytes)         │
//! │  Writing Period: u32 seconds (4 bytes)    │
//! │  Page Capacity: u32 slots (4 bytes)       │
//! │  Page Count: u32 (4 bytes)                │
//! │  Reserved: 4 bytes                        │
//! │  CRC32 of the preceding 28 bytes          │
//! └──────────────────────────────────────────┘
//! ```

use crate::data::{day_start, from_millis, to_millis, TimeRange, Timestamp, MILLIS_PER_DAY};
use crate::error::{ArchiveError, Result};
use chrono::{Datelike, NaiveDate};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Magic bytes of the metadata file: "ARCM"
pub const META_MAGIC: [u8; 4] = *b"ARCM";

/// Current metadata format version.
pub const META_VERSION: u16 = 1;

/// Metadata file size in bytes.
pub const META_SIZE: usize = 32;

/// Default number of slots per page.
pub const DEFAULT_PAGE_CAPACITY: u32 = 1000;

const SECONDS_PER_DAY: u32 = 86_400;

/// How a timestamp is resolved to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    /// The timestamp must be a slot time.
    Exact,
    /// The first slot at or after the timestamp.
    Ceiling,
}

/// Location of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPosition {
    /// Page number.
    pub page_number: u32,
    /// Slot index inside the page.
    pub index: u32,
}

/// Persisted description of a daily table.
///
/// Two tables with equal metadata share the same slot layout; anything else
/// is incompatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    /// Date covered by the table.
    pub date: NaiveDate,
    /// Writing period in seconds.
    pub writing_period: u32,
    /// Slots per page.
    pub page_capacity: u32,
}

impl TableMeta {
    /// Creates metadata with the default page capacity.
    pub fn new(date: NaiveDate, writing_period: u32) -> Self {
        Self {
            date,
            writing_period: writing_period.clamp(1, SECONDS_PER_DAY),
            page_capacity: DEFAULT_PAGE_CAPACITY,
        }
    }

    /// Sets the page capacity.
    pub fn with_page_capacity(mut self, page_capacity: u32) -> Self {
        self.page_capacity = page_capacity.max(1);
        self
    }

    /// Number of slots in the day.
    pub fn slot_count(&self) -> u32 {
        SECONDS_PER_DAY.div_ceil(self.writing_period)
    }

    /// Number of pages in the day.
    pub fn page_count(&self) -> u32 {
        self.slot_count().div_ceil(self.page_capacity)
    }

    /// Number of slots of a page.
    pub fn page_slot_count(&self, page_number: u32) -> u32 {
        let first = page_number.saturating_mul(self.page_capacity);
        self.slot_count()
            .saturating_sub(first)
            .min(self.page_capacity)
    }

    /// Start of the day.
    pub fn start_time(&self) -> Timestamp {
        day_start(self.date)
    }

    fn period_millis(&self) -> i64 {
        i64::from(self.writing_period) * 1000
    }

    fn offset_millis(&self, timestamp: Timestamp) -> i64 {
        to_millis(timestamp) - to_millis(self.start_time())
    }

    /// Resolves a timestamp to a slot of this table.
    pub fn position(&self, timestamp: Timestamp, kind: PositionKind) -> Option<DataPosition> {
        let offset = self.offset_millis(timestamp);
        if offset >= MILLIS_PER_DAY {
            return None;
        }

        let period = self.period_millis();
        let slot = match kind {
            PositionKind::Exact => {
                if offset < 0 || offset % period != 0 {
                    return None;
                }
                offset / period
            }
            PositionKind::Ceiling => ceil_div(offset.max(0), period),
        };

        let slot = u32::try_from(slot).ok()?;
        (slot < self.slot_count()).then(|| DataPosition {
            page_number: slot / self.page_capacity,
            index: slot % self.page_capacity,
        })
    }

    /// Timestamp of a slot.
    pub fn slot_time(&self, page_number: u32, index: u32) -> Timestamp {
        let slot = i64::from(page_number) * i64::from(self.page_capacity) + i64::from(index);
        from_millis(to_millis(self.start_time()) + slot * self.period_millis())
    }

    /// Range of slots `[first, last)` whose times fall in the range.
    pub fn slot_range(&self, range: &TimeRange) -> (u32, u32) {
        let period = self.period_millis();
        let day = to_millis(self.start_time());
        let clamp = |value: i64| value.clamp(0, i64::from(self.slot_count())) as u32;

        let first = clamp(ceil_div((range.start_millis() - day).max(0), period));
        let last = clamp(ceil_div((range.end_millis_exclusive() - day).max(0), period));
        (first, last.max(first))
    }

    /// Writes the metadata using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; META_SIZE];
        // Magic (4 bytes)
        buf[0..4].copy_from_slice(&META_MAGIC);
        // Version (2 bytes)
        buf[4..6].copy_from_slice(&META_VERSION.to_le_bytes());
        // Reserved (2 bytes)
        // Date (4 bytes)
        buf[8..12].copy_from_slice(&self.date.num_days_from_ce().to_le_bytes());
        // Writing period (4 bytes)
        buf[12..16].copy_from_slice(&self.writing_period.to_le_bytes());
        // Page capacity (4 bytes)
        buf[16..20].copy_from_slice(&self.page_capacity.to_le_bytes());
        // Page count (4 bytes)
        buf[20..24].copy_from_slice(&self.page_count().to_le_bytes());
        // Reserved (4 bytes)
        // CRC32 (4 bytes)
        let crc = crc32fast::hash(&buf[0..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads metadata using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidMagic`, `ArchiveError::UnsupportedVersion`
    /// or `ArchiveError::ChecksumMismatch` for damaged files.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; META_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != META_MAGIC {
            return Err(ArchiveError::InvalidMagic {
                expected: META_MAGIC,
                actual: magic,
            });
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > META_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let expected = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let actual = crc32fast::hash(&buf[0..28]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }

        let days = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        let writing_period = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let page_capacity = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let page_count = u32::from_le_bytes(buf[20..24].try_into().unwrap());

        let date = NaiveDate::from_num_days_from_ce_opt(days)
            .ok_or_else(|| invalid_data(format!("invalid table date {days}")))?;
        if writing_period == 0 || writing_period > SECONDS_PER_DAY || page_capacity == 0 {
            return Err(invalid_data(format!(
                "invalid table layout: period {writing_period}, page capacity {page_capacity}"
            )));
        }

        let meta = Self {
            date,
            writing_period,
            page_capacity,
        };
        if meta.page_count() != page_count {
            return Err(invalid_data(format!(
                "page count {} does not match layout ({})",
                page_count,
                meta.page_count()
            )));
        }
        Ok(meta)
    }

    /// Loads metadata from a file. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Self::read_from(&mut file).map(Some)
    }

    /// Saves metadata to a file, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        self.write_to(&mut file)?;
        file.sync_all()?;
        Ok(())
    }
}

// Both operands are non-negative.
fn ceil_div(value: i64, divisor: i64) -> i64 {
    (value + divisor - 1) / divisor
}

fn invalid_data(message: String) -> ArchiveError {
    ArchiveError::IoError(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// A daily table.
///
/// Tables are shared through `Arc` between the hot slot, the update window
/// and the table cache. The metadata never changes; readiness flips once
/// the metadata file exists on disk.
#[derive(Debug)]
pub struct TrendTable {
    meta: TableMeta,
    ready: AtomicBool,
}

impl TrendTable {
    /// Creates a table that is not yet on disk.
    pub fn new(meta: TableMeta) -> Self {
        Self {
            meta,
            ready: AtomicBool::new(false),
        }
    }

    /// Creates a table whose metadata is already persisted.
    pub fn persisted(meta: TableMeta) -> Self {
        Self {
            meta,
            ready: AtomicBool::new(true),
        }
    }

    /// Date of the table.
    pub fn date(&self) -> NaiveDate {
        self.meta.date
    }

    /// Metadata of the table.
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Returns true if the metadata is persisted.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks the metadata as persisted.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}
