//! Queued SQL backend.
//!
//! Archives enqueue points on the real-time path; a writer thread per archive
//! drains the queue into an embedded DuckDB database.
//!
//! # Components
//!
//! - [`connection`]: [`SqlStorage`], the shared database handle
//! - [`query`]: statement text for current and partition tables
//! - [`writer`]: the writer thread and its point sinks
//! - [`historical`]: [`SqlHistoricalArchive`], calendar-partitioned history
//! - [`current`]: [`SqlCurrentArchive`], one row per channel

pub mod connection;
pub mod current;
pub mod historical;
pub mod query;
pub mod writer;

pub use connection::SqlStorage;
pub use current::SqlCurrentArchive;
pub use historical::SqlHistoricalArchive;
pub use query::QueryBuilder;
