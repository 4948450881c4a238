//! Archive configuration.
//!
//! Options are read-only once an archive is constructed. Every struct has a
//! `Default`, `with_*` builder methods and deserializes from partial host
//! configuration (missing fields take their defaults).
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_archive::config::{ArchiveOptions, TimeUnit, WritingMode};
//!
//! let options = ArchiveOptions::default()
//!     .with_writing_mode(WritingMode::AutoPeriodic)
//!     .with_writing_period(30, TimeUnit::Second)
//!     .with_retention_days(90);
//! options.validate()?;
//! ```

use crate::error::{ArchiveError, Result};
use crate::lifecycle::partition::PartitionSize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default write queue ceiling.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Default retention: one year.
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// Default database schema for SQL archives.
pub const DEFAULT_SCHEMA: &str = "arc";

/// In-memory database marker.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// How an archive decides when to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritingMode {
    /// Write a slice of all channels once per writing period.
    #[default]
    AutoPeriodic,
    /// Write each channel whose value changed.
    AutoOnChange,
    /// Write only on explicit requests.
    OnDemand,
}

impl WritingMode {
    /// Returns true for the automatic modes.
    pub fn is_auto(self) -> bool {
        matches!(self, Self::AutoPeriodic | Self::AutoOnChange)
    }
}

/// Unit of the writing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Seconds.
    Second,
    /// Minutes.
    #[default]
    Minute,
    /// Hours.
    Hour,
}

impl TimeUnit {
    /// Number of seconds in one unit.
    pub fn as_secs(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
        }
    }
}

/// Options shared by all archive kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    /// Writing mode.
    pub writing_mode: WritingMode,
    /// Writing period, in `writing_unit`s.
    pub writing_period: u32,
    /// Unit of the writing period.
    pub writing_unit: TimeUnit,
    /// Tolerance in seconds within which a timestamp is pulled to the period grid.
    ///
    /// Zero requires timestamps to fall exactly on the grid.
    pub pull_to_period: u32,
    /// Days of history to keep.
    pub retention_days: u32,
    /// Enables detailed per-archive diagnostics.
    pub log_enabled: bool,
    /// Stores data under the copy directory instead of the main one.
    pub use_copy_dir: bool,
    /// Write queue ceiling for queued backends.
    pub max_queue_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            writing_mode: WritingMode::default(),
            writing_period: 1,
            writing_unit: TimeUnit::default(),
            pull_to_period: 0,
            retention_days: DEFAULT_RETENTION_DAYS,
            log_enabled: false,
            use_copy_dir: false,
            max_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl ArchiveOptions {
    /// Returns the writing period in seconds.
    pub fn writing_period_secs(&self) -> i64 {
        i64::from(self.writing_period) * self.writing_unit.as_secs()
    }

    /// Sets the writing mode.
    pub fn with_writing_mode(mut self, mode: WritingMode) -> Self {
        self.writing_mode = mode;
        self
    }

    /// Sets the writing period.
    pub fn with_writing_period(mut self, period: u32, unit: TimeUnit) -> Self {
        self.writing_period = period;
        self.writing_unit = unit;
        self
    }

    /// Sets the pull-to-period tolerance in seconds.
    pub fn with_pull_to_period(mut self, tolerance_secs: u32) -> Self {
        self.pull_to_period = tolerance_secs;
        self
    }

    /// Sets the retention in days.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Enables or disables detailed diagnostics.
    pub fn with_log_enabled(mut self, enabled: bool) -> Self {
        self.log_enabled = enabled;
        self
    }

    /// Selects the copy directory.
    pub fn with_copy_dir(mut self, use_copy_dir: bool) -> Self {
        self.use_copy_dir = use_copy_dir;
        self
    }

    /// Sets the write queue ceiling.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Validates the options.
    ///
    /// Automatic periodic writing needs a positive period; so does any archive
    /// whose storage is laid out on the period grid (`grid_storage`).
    pub fn validate_for(&self, grid_storage: bool) -> Result<()> {
        let needs_period = grid_storage || self.writing_mode == WritingMode::AutoPeriodic;
        if needs_period && self.writing_period == 0 {
            return Err(ArchiveError::InvalidConfig(
                "writing period must be positive".to_string(),
            ));
        }
        if self.writing_period_secs() > 86_400 {
            return Err(ArchiveError::InvalidConfig(format!(
                "writing period of {}s exceeds one day",
                self.writing_period_secs()
            )));
        }
        if self.retention_days == 0 {
            return Err(ArchiveError::InvalidConfig(
                "retention must be at least one day".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates the options for a queued archive.
    pub fn validate(&self) -> Result<()> {
        self.validate_for(false)
    }
}

/// Storage directories supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOptions {
    /// Main archive directory.
    pub arc_dir: PathBuf,
    /// Copy archive directory.
    pub arc_copy_dir: PathBuf,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            arc_dir: PathBuf::from("ArchiveDAT"),
            arc_copy_dir: PathBuf::from("ArchiveCopy"),
        }
    }
}

impl PathOptions {
    /// Creates path options.
    pub fn new(arc_dir: impl AsRef<Path>, arc_copy_dir: impl AsRef<Path>) -> Self {
        Self {
            arc_dir: arc_dir.as_ref().to_path_buf(),
            arc_copy_dir: arc_copy_dir.as_ref().to_path_buf(),
        }
    }

    /// Root directory of an archive.
    pub fn archive_root(&self, code: &str, use_copy_dir: bool) -> PathBuf {
        let base = if use_copy_dir {
            &self.arc_copy_dir
        } else {
            &self.arc_dir
        };
        base.join(code)
    }
}

/// Descriptor of an embedded database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConnectionOptions {
    /// Connection name.
    pub name: String,
    /// Database file path, or `:memory:`.
    pub database: String,
    /// Schema holding archive tables.
    pub schema: String,
}

impl Default for DbConnectionOptions {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            database: IN_MEMORY_DATABASE.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

impl DbConnectionOptions {
    /// Creates a descriptor for a database file or `:memory:`.
    pub fn new(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Sets the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Returns true if the database lives in memory.
    pub fn is_in_memory(&self) -> bool {
        self.database.is_empty() || self.database == IN_MEMORY_DATABASE
    }
}

/// Options of SQL archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlArchiveOptions {
    /// Uses the instance storage connection instead of a named one.
    pub use_storage_conn: bool,
    /// Name of the module-level connection when `use_storage_conn` is off.
    pub connection: String,
    /// Span of historical partitions.
    pub partition_size: PartitionSize,
}

impl Default for SqlArchiveOptions {
    fn default() -> Self {
        Self {
            use_storage_conn: true,
            connection: String::new(),
            partition_size: PartitionSize::default(),
        }
    }
}

impl SqlArchiveOptions {
    /// Selects a named module-level connection.
    pub fn with_connection(mut self, name: impl Into<String>) -> Self {
        self.use_storage_conn = false;
        self.connection = name.into();
        self
    }

    /// Sets the partition span.
    pub fn with_partition_size(mut self, size: PartitionSize) -> Self {
        self.partition_size = size;
        self
    }
}

/// Module-level configuration holding named connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Named connections.
    pub connections: BTreeMap<String, DbConnectionOptions>,
}

impl ModuleConfig {
    /// Adds a named connection.
    pub fn with_connection(mut self, options: DbConnectionOptions) -> Self {
        self.connections.insert(options.name.clone(), options);
        self
    }

    /// Resolves the connection an SQL archive should use.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::ConnectionNotFound` if the storage connection is
    /// requested but absent, or the named connection is not configured.
    pub fn resolve_connection(
        &self,
        options: &SqlArchiveOptions,
        storage: Option<&DbConnectionOptions>,
    ) -> Result<DbConnectionOptions> {
        if options.use_storage_conn {
            return storage
                .cloned()
                .ok_or_else(|| ArchiveError::ConnectionNotFound("<storage>".to_string()));
        }

        self.connections
            .get(&options.connection)
            .cloned()
            .ok_or_else(|| ArchiveError::ConnectionNotFound(options.connection.clone()))
    }
}

/// Checks that an archive code can name directories and SQL tables.
pub fn validate_code(code: &str) -> Result<()> {
    if code.is_empty() {
        return Err(ArchiveError::InvalidConfig(
            "archive code must not be empty".to_string(),
        ));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ArchiveError::InvalidConfig(format!(
            "archive code {code:?} may contain only ASCII letters, digits and underscores"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writing_period_secs() {
        let options = ArchiveOptions::default().with_writing_period(2, TimeUnit::Hour);
        assert_eq!(options.writing_period_secs(), 7200);
        let options = ArchiveOptions::default();
        assert_eq!(options.writing_period_secs(), 60);
    }

    #[test]
    fn test_validate() {
        let zero = ArchiveOptions::default().with_writing_period(0, TimeUnit::Second);
        assert!(zero.validate().is_err());
        assert!(zero
            .clone()
            .with_writing_mode(WritingMode::OnDemand)
            .validate()
            .is_ok());
        assert!(zero
            .with_writing_mode(WritingMode::OnDemand)
            .validate_for(true)
            .is_err());
        assert!(ArchiveOptions::default()
            .with_writing_period(2, TimeUnit::Hour)
            .validate()
            .is_ok());
        assert!(ArchiveOptions::default()
            .with_writing_period(25, TimeUnit::Hour)
            .validate()
            .is_err());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ArchiveOptions =
            serde_json::from_str(r#"{"writing_mode":"AutoOnChange","retention_days":30}"#)
                .unwrap();
        assert_eq!(options.writing_mode, WritingMode::AutoOnChange);
        assert_eq!(options.retention_days, 30);
        assert_eq!(options.writing_unit, TimeUnit::Minute);
        assert_eq!(options.max_queue_size, DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn test_resolve_storage_connection() {
        let module = ModuleConfig::default();
        let storage = DbConnectionOptions::new("Storage", "/var/lib/arc.db");
        let resolved = module
            .resolve_connection(&SqlArchiveOptions::default(), Some(&storage))
            .unwrap();
        assert_eq!(resolved.name, "Storage");
        assert!(module
            .resolve_connection(&SqlArchiveOptions::default(), None)
            .is_err());
    }

    #[test]
    fn test_resolve_named_connection() {
        let module = ModuleConfig::default()
            .with_connection(DbConnectionOptions::new("Reports", ":memory:").with_schema("rep"));
        let options = SqlArchiveOptions::default().with_connection("Reports");
        let resolved = module.resolve_connection(&options, None).unwrap();
        assert_eq!(resolved.schema, "rep");
        assert!(resolved.is_in_memory());

        let missing = SqlArchiveOptions::default().with_connection("Other");
        assert!(matches!(
            module.resolve_connection(&missing, None),
            Err(ArchiveError::ConnectionNotFound(name)) if name == "Other"
        ));
    }

    #[test]
    fn test_archive_root() {
        let paths = PathOptions::new("/data/arc", "/data/copy");
        assert_eq!(paths.archive_root("Min", false), PathBuf::from("/data/arc/Min"));
        assert_eq!(paths.archive_root("Min", true), PathBuf::from("/data/copy/Min"));
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("Hour_1").is_ok());
        assert!(validate_code("").is_err());
        assert!(validate_code("a;drop").is_err());
    }
}
