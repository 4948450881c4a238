//! Embedded database handle shared by SQL archives.

use crate::config::DbConnectionOptions;
use crate::error::Result;
use duckdb::Connection;
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

/// An open database.
///
/// Every archive, writer thread and read call gets its own connection cloned
/// from the base one; all of them see the same database, including an
/// in-memory one.
pub struct SqlStorage {
    options: DbConnectionOptions,
    base: Mutex<Connection>,
}

impl SqlStorage {
    /// Opens the database described by the options.
    pub fn open(options: DbConnectionOptions) -> Result<Self> {
        let conn = if options.is_in_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&options.database)?
        };
        debug!(
            "Opened database {} for connection {}",
            if options.is_in_memory() {
                "in memory"
            } else {
                options.database.as_str()
            },
            options.name
        );
        Ok(Self {
            options,
            base: Mutex::new(conn),
        })
    }

    /// Connection options.
    pub fn options(&self) -> &DbConnectionOptions {
        &self.options
    }

    /// Schema holding archive tables.
    pub fn schema(&self) -> &str {
        &self.options.schema
    }

    /// Opens another connection to the database.
    pub fn connect(&self) -> Result<Connection> {
        Ok(self.base.lock().try_clone()?)
    }
}

impl fmt::Debug for SqlStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStorage")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
