//! Directory layout of a paged file archive.
//!
//! ```text
//! <root>/
//!   <code>_20261016/
//!     table.meta
//!     page_0000.dat
//!     page_0001.dat
//!   <code>_20261017/
//!   <code>_20261017_bak1792238400/   (backup of an incompatible table)
//! ```
//!
//! Table directory names are fixed-width and sort by date.

use crate::error::Result;
use chrono::NaiveDate;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the table metadata file.
pub const TABLE_META_FILE: &str = "table.meta";

/// Extension of page files.
pub const PAGE_FILE_EXTENSION: &str = "dat";

const DATE_FORMAT: &str = "%Y%m%d";
const DATE_WIDTH: usize = 8;

/// Paths of an archive's daily tables.
///
/// # Examples
/// ```rust,ignore
/// use alopex_archive::file::TableLayout;
///
/// let layout = TableLayout::new("/data/arc/Min", "Min");
/// let meta = layout.meta_path(date);
/// let page = layout.page_path(date, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    root: PathBuf,
    code: String,
}

impl TableLayout {
    /// Creates a layout rooted at `root` for the archive `code`.
    pub fn new(root: impl AsRef<Path>, code: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            code: code.into(),
        }
    }

    /// Archive root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Builds a table directory name using `{code}_{yyyymmdd}`.
    pub fn table_dir_name(&self, date: NaiveDate) -> String {
        format!("{}_{}", self.code, date.format(DATE_FORMAT))
    }

    /// Directory of the table for the date.
    pub fn table_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(self.table_dir_name(date))
    }

    /// Metadata file of the table for the date.
    pub fn meta_path(&self, date: NaiveDate) -> PathBuf {
        self.table_dir(date).join(TABLE_META_FILE)
    }

    /// Builds a page file name using `page_{number:04}.dat`.
    pub fn page_file_name(page_number: u32) -> String {
        format!("page_{page_number:04}.{PAGE_FILE_EXTENSION}")
    }

    /// Page file of the table for the date.
    pub fn page_path(&self, date: NaiveDate, page_number: u32) -> PathBuf {
        self.table_dir(date).join(Self::page_file_name(page_number))
    }

    /// Backup directory for the table, tagged with `stamp` and, for repeated
    /// backups within the same stamp, a sequence number above zero.
    ///
    /// Backups keep the date prefix so retention sweeps them with their date.
    pub fn backup_dir(&self, date: NaiveDate, stamp: i64, seq: u32) -> PathBuf {
        let name = match seq {
            0 => format!("{}_bak{}", self.table_dir_name(date), stamp),
            _ => format!("{}_bak{}_{}", self.table_dir_name(date), stamp, seq),
        };
        self.root.join(name)
    }

    /// Parses the date of a table or backup directory name.
    ///
    /// Returns `None` for names that do not belong to this archive.
    pub fn parse_table_date(&self, dir_name: &str) -> Option<NaiveDate> {
        let rest = dir_name.strip_prefix(self.code.as_str())?.strip_prefix('_')?;
        if rest.len() < DATE_WIDTH || !rest.is_char_boundary(DATE_WIDTH) {
            return None;
        }
        let (digits, suffix) = rest.split_at(DATE_WIDTH);
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !suffix.is_empty() && !suffix.starts_with("_bak") {
            return None;
        }
        NaiveDate::parse_from_str(digits, DATE_FORMAT).ok()
    }

    /// Lists table and backup directories with their dates, sorted by name.
    pub fn list_table_dirs(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(date) = self.parse_table_date(name) {
                dirs.push((date, entry.path()));
            }
        }
        dirs.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_table_paths() {
        let layout = TableLayout::new("/data/Min", "Min");
        assert_eq!(
            layout.table_dir(date(2026, 3, 7)),
            PathBuf::from("/data/Min/Min_20260307")
        );
        assert_eq!(
            layout.page_path(date(2026, 3, 7), 2),
            PathBuf::from("/data/Min/Min_20260307/page_0002.dat")
        );
        assert_eq!(
            layout.meta_path(date(2026, 3, 7)),
            PathBuf::from("/data/Min/Min_20260307/table.meta")
        );
    }

    #[test]
    fn test_backup_dir_sequence() {
        let layout = TableLayout::new("/data/Min", "Min");
        assert_eq!(
            layout.backup_dir(date(2026, 3, 7), 42, 0),
            PathBuf::from("/data/Min/Min_20260307_bak42")
        );
        assert_eq!(
            layout.backup_dir(date(2026, 3, 7), 42, 1),
            PathBuf::from("/data/Min/Min_20260307_bak42_1")
        );
    }

    #[test]
    fn test_parse_table_date() {
        let layout = TableLayout::new("/data/Min", "Min");
        assert_eq!(layout.parse_table_date("Min_20261017"), Some(date(2026, 10, 17)));
        assert_eq!(
            layout.parse_table_date("Min_20261017_bak1792238400"),
            Some(date(2026, 10, 17))
        );
        assert_eq!(
            layout.parse_table_date("Min_20261017_bak1792238400_2"),
            Some(date(2026, 10, 17))
        );
        assert_eq!(layout.parse_table_date("Hour_20261017"), None);
        assert_eq!(layout.parse_table_date("Min_2026101"), None);
        assert_eq!(layout.parse_table_date("Min_20261317"), None);
        assert_eq!(layout.parse_table_date("Min_20261017x"), None);
    }

    #[test]
    fn test_list_table_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let layout = TableLayout::new(temp_dir.path(), "Min");
        fs::create_dir_all(layout.table_dir(date(2026, 10, 17))).unwrap();
        fs::create_dir_all(layout.table_dir(date(2026, 10, 16))).unwrap();
        fs::create_dir_all(layout.backup_dir(date(2026, 10, 16), 42, 0)).unwrap();
        fs::create_dir_all(temp_dir.path().join("other")).unwrap();
        fs::write(temp_dir.path().join("Min_20261015"), b"not a dir").unwrap();

        let dirs = layout.list_table_dirs().unwrap();
        let dates: Vec<NaiveDate> = dirs.iter().map(|(d, _)| *d).collect();
        assert_eq!(
            dates,
            vec![date(2026, 10, 16), date(2026, 10, 16), date(2026, 10, 17)]
        );
    }

    #[test]
    fn test_list_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let layout = TableLayout::new(temp_dir.path().join("absent"), "Min");
        assert!(layout.list_table_dirs().unwrap().is_empty());
    }
}
