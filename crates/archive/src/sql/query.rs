//! SQL text for archive tables.
//!
//! Table and schema names are lowercased and checked by
//! [`QueryBuilder::new`], so archive codes differing only in case share
//! tables. Values are bound as parameters, except channel
//! lists in `IN (...)` clauses, which are integers.

use crate::data::{ChannelNumber, ChannelValue};
use crate::error::{ArchiveError, Result};
use crate::lifecycle::{PartitionSize, PartitionSpan};
use chrono::NaiveDate;

/// Builds SQL statements for one archive.
///
/// # Examples
/// ```rust,ignore
/// let queries = QueryBuilder::new("arc", "Hour")?;
/// conn.execute_batch(&queries.create_schema())?;
/// conn.execute_batch(&queries.create_partition("hour_hist_202610"))?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    schema: String,
    code: String,
}

impl QueryBuilder {
    /// Creates a builder for the archive in the schema.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidConfig` unless both names are plain SQL
    /// identifiers: ASCII letters, digits and underscores, not starting with
    /// a digit.
    pub fn new(schema: &str, code: &str) -> Result<Self> {
        Ok(Self {
            schema: identifier("schema", schema)?,
            code: identifier("archive code", code)?,
        })
    }

    /// Schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    /// `CREATE SCHEMA` statement.
    pub fn create_schema(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema)
    }

    // ------------------------------------------------------------------
    // Current values
    // ------------------------------------------------------------------

    /// Name of the current-value table.
    pub fn current_table(&self) -> String {
        format!("{}_current", self.code)
    }

    /// `CREATE TABLE` statement of the current-value table.
    pub fn create_current_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             cnl_num INTEGER PRIMARY KEY, \
             time_stamp BIGINT NOT NULL, \
             val DOUBLE NOT NULL, \
             stat INTEGER NOT NULL)",
            self.qualified(&self.current_table())
        )
    }

    /// Upsert of one current value: `cnl_num, time_stamp, val, stat`.
    pub fn upsert_current(&self) -> String {
        format!(
            "INSERT INTO {} (cnl_num, time_stamp, val, stat) VALUES (?, ?, ?, ?) \
             ON CONFLICT (cnl_num) DO UPDATE SET \
             time_stamp = excluded.time_stamp, val = excluded.val, stat = excluded.stat",
            self.qualified(&self.current_table())
        )
    }

    /// Selects every current value.
    pub fn select_current(&self) -> String {
        format!(
            "SELECT cnl_num, time_stamp, val, stat FROM {} ORDER BY cnl_num",
            self.qualified(&self.current_table())
        )
    }

    /// Deletes current values of channels not in the list.
    pub fn delete_current_except(&self, channel_numbers: &[ChannelNumber]) -> String {
        let table = self.qualified(&self.current_table());
        if channel_numbers.is_empty() {
            format!("DELETE FROM {table}")
        } else {
            format!(
                "DELETE FROM {} WHERE cnl_num NOT IN ({})",
                table,
                channel_list(channel_numbers)
            )
        }
    }

    // ------------------------------------------------------------------
    // Historical partitions
    // ------------------------------------------------------------------

    /// Common prefix of partition table names.
    pub fn partition_prefix(&self) -> String {
        format!("{}_hist_", self.code)
    }

    /// Name of the partition table starting at `start`.
    pub fn partition_name(&self, size: PartitionSize, start: NaiveDate) -> String {
        format!("{}{}", self.partition_prefix(), size.name_suffix(start))
    }

    /// Recovers the span of a partition table name.
    pub fn parse_partition_name(&self, size: PartitionSize, name: &str) -> Option<PartitionSpan> {
        let suffix = name
            .to_ascii_lowercase()
            .strip_prefix(&self.partition_prefix())?
            .to_string();
        size.parse_suffix(&suffix)
    }

    /// `CREATE TABLE` statement of a partition.
    pub fn create_partition(&self, name: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             cnl_num INTEGER NOT NULL, \
             time_stamp BIGINT NOT NULL, \
             val DOUBLE NOT NULL, \
             stat INTEGER NOT NULL, \
             PRIMARY KEY (cnl_num, time_stamp))",
            self.qualified(name)
        )
    }

    /// `DROP TABLE` statement of a partition.
    pub fn drop_partition(&self, name: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified(name))
    }

    /// Lists candidate partition tables. Binds the schema and a `LIKE` pattern.
    pub fn list_partitions(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = ? AND table_name LIKE ? ORDER BY table_name"
    }

    /// `LIKE` pattern matching partition names.
    pub fn partition_pattern(&self) -> String {
        format!("{}%", self.partition_prefix())
    }

    /// Upsert of one point: `cnl_num, time_stamp, val, stat`.
    pub fn upsert_point(&self, name: &str) -> String {
        format!(
            "INSERT INTO {} (cnl_num, time_stamp, val, stat) VALUES (?, ?, ?, ?) \
             ON CONFLICT (cnl_num, time_stamp) DO UPDATE SET \
             val = excluded.val, stat = excluded.stat",
            self.qualified(name)
        )
    }

    /// Selects one channel over `[start, end)`: binds channel, start, end.
    pub fn select_trend(&self, name: &str) -> String {
        format!(
            "SELECT time_stamp, val, stat FROM {} \
             WHERE cnl_num = ? AND time_stamp >= ? AND time_stamp < ? \
             ORDER BY time_stamp",
            self.qualified(name)
        )
    }

    /// Selects distinct timestamps over `[start, end)`.
    pub fn select_timestamps(&self, name: &str) -> String {
        format!(
            "SELECT DISTINCT time_stamp FROM {} \
             WHERE time_stamp >= ? AND time_stamp < ? ORDER BY time_stamp",
            self.qualified(name)
        )
    }

    /// Selects channels at one timestamp: binds the timestamp.
    pub fn select_slice(&self, name: &str, channel_numbers: &[ChannelNumber]) -> String {
        format!(
            "SELECT cnl_num, val, stat FROM {} WHERE cnl_num IN ({}) AND time_stamp = ?",
            self.qualified(name),
            channel_list(channel_numbers)
        )
    }

    /// Selects one value: binds channel and timestamp.
    pub fn select_value(&self, name: &str) -> String {
        format!(
            "SELECT val, stat FROM {} WHERE cnl_num = ? AND time_stamp = ?",
            self.qualified(name)
        )
    }
}

fn identifier(what: &str, name: &str) -> Result<String> {
    let lowered = name.to_ascii_lowercase();
    let valid = lowered
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_lowercase() || b == b'_')
        && lowered
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if !valid {
        return Err(ArchiveError::InvalidConfig(format!(
            "{what} {name:?} is not a valid SQL identifier"
        )));
    }
    Ok(lowered)
}

fn channel_list(channel_numbers: &[ChannelNumber]) -> String {
    channel_numbers
        .iter()
        .map(|cnl| cnl.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds a channel value from stored columns.
pub fn value_from_row(val: f64, stat: i32) -> ChannelValue {
    ChannelValue::new(val, u8::try_from(stat).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_partition_names() {
        let queries = QueryBuilder::new("Arc", "Hour").unwrap();
        assert_eq!(queries.schema(), "arc");
        assert_eq!(
            queries.partition_name(PartitionSize::OneMonth, date(2026, 10, 1)),
            "hour_hist_202610"
        );
        assert_eq!(queries.partition_pattern(), "hour_hist_%");

        let span = queries
            .parse_partition_name(PartitionSize::OneMonth, "hour_hist_202610")
            .unwrap();
        assert_eq!(span.start, date(2026, 10, 1));
        assert_eq!(span.end, date(2026, 11, 1));
        assert!(queries
            .parse_partition_name(PartitionSize::OneMonth, "hour_hist_20261017")
            .is_none());
        assert!(queries
            .parse_partition_name(PartitionSize::OneMonth, "hourly_hist_202610")
            .is_none());
    }

    #[test]
    fn test_statements_are_qualified() {
        let queries = QueryBuilder::new("arc", "Min").unwrap();
        assert_eq!(
            queries.drop_partition("min_hist_2026"),
            "DROP TABLE IF EXISTS arc.min_hist_2026"
        );
        assert!(queries
            .select_slice("min_hist_2026", &[1, 5])
            .contains("arc.min_hist_2026 WHERE cnl_num IN (1, 5)"));
        assert_eq!(
            queries.delete_current_except(&[]),
            "DELETE FROM arc.min_current"
        );
        assert!(queries
            .delete_current_except(&[3, 4])
            .ends_with("NOT IN (3, 4)"));
    }

    #[test]
    fn test_identifiers_are_checked() {
        for (schema, code) in [("arc", "1min"), ("arc;drop", "Min"), ("", "Min"), ("arc", "Min-1")] {
            assert!(
                matches!(
                    QueryBuilder::new(schema, code),
                    Err(ArchiveError::InvalidConfig(_))
                ),
                "{schema}.{code}"
            );
        }
        let queries = QueryBuilder::new("_Arc", "MIN_2").unwrap();
        assert_eq!(queries.current_table(), "min_2_current");
        assert_eq!(queries.schema(), "_arc");
    }

    #[test]
    fn test_value_from_row() {
        assert_eq!(value_from_row(1.5, 1), ChannelValue::new(1.5, 1));
        assert_eq!(value_from_row(1.5, 300), ChannelValue::new(1.5, 0));
    }
}
