//! Alopex Archive - historical archive engine for channel data
//!
//! This crate stores timestamped channel values produced by a data
//! acquisition host and answers range queries over them.
//!
//! # Components
//!
//! - [`ArchiveLogic`] / [`CurrentArchiveLogic`]: contracts every backend implements
//! - [`BasicArchive`]: paged file tables, one directory per day
//! - [`SqlHistoricalArchive`]: queued writes into calendar partitions
//! - [`SqlCurrentArchive`]: queued writes of the latest value per channel
//! - [`PointQueue`]: bounded write queue shared with a writer thread
//! - [`MemoryCache`]: expiring cache of recently used tables
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_archive::{ArchiveLogic, ArchiveOptions, BasicArchive, PathOptions, SystemClock};
//!
//! let archive = BasicArchive::new(
//!     "Min",
//!     ArchiveOptions::default(),
//!     vec![101, 102],
//!     &PathOptions::new("ArchiveDAT", "ArchiveCopy"),
//!     Arc::new(SystemClock),
//! )?;
//! archive.make_ready()?;
//!
//! // Real-time path
//! if archive.accept_data(sample.timestamp).is_some() {
//!     archive.process_data(&sample)?;
//! }
//!
//! // Queries
//! let trend = archive.get_trend(&TimeRange::new(start, end), 101)?;
//! archive.close()?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod file;
pub mod lifecycle;
pub mod logic;
pub mod queue;
pub mod sql;

pub use cache::MemoryCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ArchiveOptions, DbConnectionOptions, ModuleConfig, PathOptions, SqlArchiveOptions, TimeUnit,
    WritingMode,
};
pub use data::{
    ChannelNumber, ChannelValue, CurrentData, Point, Slice, TimeRange, Timestamp, Trend,
    TrendBundle,
};
pub use error::{ArchiveError, Result};
pub use file::BasicArchive;
pub use lifecycle::{PartitionSize, RetentionPolicy};
pub use logic::{ArchiveLogic, ArchiveState, ArchiveStatus, CurrentArchiveLogic, UpdateGuard};
pub use queue::PointQueue;
pub use sql::{SqlCurrentArchive, SqlHistoricalArchive, SqlStorage};
