//! Paged file backend.
//!
//! Every archive keeps one directory per calendar day. A day is divided into
//! slots of one writing period each; slots are grouped into fixed-size page
//! files so a slice write is a single in-place overwrite.
//!
//! # Components
//!
//! - [`layout`]: directory and file naming
//! - [`table`]: table metadata and slot addressing
//! - [`page`]: page file format
//! - [`adapter`]: reading and writing tables on disk
//! - [`archive`]: [`BasicArchive`], the archive contract over daily tables

pub mod adapter;
pub mod archive;
pub mod layout;
pub mod page;
pub mod table;

pub use adapter::TrendTableAdapter;
pub use archive::BasicArchive;
pub use layout::TableLayout;
pub use table::{TableMeta, TrendTable};
