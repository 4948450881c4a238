//! Error and Result types for archive operations.

use crate::data::Timestamp;
use crate::logic::ArchiveState;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// The error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Invalid magic bytes in a table metadata or page header.
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Magic bytes the format requires.
        expected: [u8; 4],
        /// Magic bytes found on disk.
        actual: [u8; 4],
    },

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A page file is structurally unusable.
    #[error("Corrupt page {}: {reason}", path.display())]
    CorruptPage {
        /// Path of the page file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Error reported by the SQL store.
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    /// The archive must be ready for the requested operation.
    #[error("Archive {code} is not ready (state: {state:?})")]
    NotReady {
        /// Archive code.
        code: String,
        /// State the archive was in.
        state: ArchiveState,
    },

    /// The requested lifecycle transition is not allowed.
    #[error("Archive {code} cannot {operation} in state {state:?}")]
    InvalidState {
        /// Archive code.
        code: String,
        /// Attempted operation.
        operation: &'static str,
        /// State the archive was in.
        state: ArchiveState,
    },

    /// Archive options or connection settings are invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A named database connection could not be resolved.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// The timestamp does not fall on the archive's period grid.
    #[error("Timestamp {timestamp} is not aligned with the {period}s writing period")]
    TimestampNotAligned {
        /// Offending timestamp.
        timestamp: Timestamp,
        /// Writing period in seconds.
        period: i64,
    },

    /// The background writer thread terminated abnormally.
    #[error("Writer thread failed: {0}")]
    WriterThread(String),
}

impl ArchiveError {
    /// Returns true if the error means persisted data is damaged rather than
    /// unreachable.
    pub fn is_corruption(&self) -> bool {
        match self {
            ArchiveError::InvalidMagic { .. }
            | ArchiveError::UnsupportedVersion(_)
            | ArchiveError::ChecksumMismatch { .. }
            | ArchiveError::CorruptPage { .. } => true,
            ArchiveError::IoError(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}
