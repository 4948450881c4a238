//! Background writer draining a point queue into the database.
//!
//! Each queued SQL archive runs one writer thread. The thread owns its own
//! connection and a [`PointSink`] that knows the archive's tables. Stopping
//! the thread hands both back so the caller can flush what is left.

use crate::clock::Clock;
use crate::data::{from_millis, to_millis, ChannelNumber, ChannelValue, Point};
use crate::error::{ArchiveError, Result};
use crate::lifecycle::PartitionSize;
use crate::queue::{PointQueue, DEFAULT_BATCH_SIZE};
use crate::sql::query::QueryBuilder;
use chrono::NaiveDate;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use duckdb::{params, Connection};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Pause between writer iterations.
pub const THREAD_DELAY: Duration = Duration::from_millis(100);

/// Pause after a failed write or storage preparation before retrying.
pub const ERROR_DELAY: Duration = Duration::from_secs(1);

/// Destination of queued points.
pub trait PointSink: Send + 'static {
    /// Prepares storage for a date. Called once per date change.
    fn prepare(&mut self, _conn: &Connection, _date: NaiveDate) -> Result<()> {
        Ok(())
    }

    /// Persists a batch in one transaction.
    fn write_batch(&mut self, conn: &mut Connection, batch: &[Point]) -> Result<()>;
}

/// Writes points into calendar partitions, creating them on demand.
#[derive(Debug)]
pub struct HistoricalSink {
    queries: QueryBuilder,
    partition_size: PartitionSize,
    known: HashSet<String>,
}

impl HistoricalSink {
    /// Creates a sink.
    pub fn new(queries: QueryBuilder, partition_size: PartitionSize) -> Self {
        Self {
            queries,
            partition_size,
            known: HashSet::new(),
        }
    }

    /// Creates the partition containing the date unless already known.
    pub fn ensure_partition(&mut self, conn: &Connection, date: NaiveDate) -> Result<()> {
        let span = self.partition_size.span_of(date);
        let name = self.queries.partition_name(self.partition_size, span.start);
        if self.known.contains(&name) {
            return Ok(());
        }
        conn.execute_batch(&self.queries.create_partition(&name))?;
        debug!("Partition {}.{} is ready", self.queries.schema(), name);
        self.known.insert(name);
        Ok(())
    }

    fn upsert(&mut self, conn: &mut Connection, batch: &[Point]) -> Result<()> {
        // Last write of a key wins.
        let mut rows: BTreeMap<(i64, ChannelNumber), ChannelValue> = BTreeMap::new();
        for point in batch {
            rows.insert(
                (to_millis(point.timestamp), point.channel_number),
                point.value,
            );
        }

        let mut by_partition: BTreeMap<NaiveDate, Vec<(i64, ChannelNumber, ChannelValue)>> =
            BTreeMap::new();
        for (&(ts, cnl), value) in &rows {
            let date = from_millis(ts).date_naive();
            let start = self.partition_size.span_of(date).start;
            by_partition.entry(start).or_default().push((ts, cnl, *value));
        }
        for &start in by_partition.keys() {
            self.ensure_partition(conn, start)?;
        }

        let tx = conn.transaction()?;
        for (start, rows) in &by_partition {
            let name = self.queries.partition_name(self.partition_size, *start);
            let mut stmt = tx.prepare(&self.queries.upsert_point(&name))?;
            for (ts, cnl, value) in rows {
                stmt.execute(params![cnl, ts, value.value, i32::from(value.status)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl PointSink for HistoricalSink {
    fn prepare(&mut self, conn: &Connection, date: NaiveDate) -> Result<()> {
        for day in prepared_days(date) {
            self.ensure_partition(conn, day)?;
        }
        Ok(())
    }

    fn write_batch(&mut self, conn: &mut Connection, batch: &[Point]) -> Result<()> {
        let result = self.upsert(conn, batch);
        if result.is_err() {
            // Partitions may have been dropped behind our back.
            self.known.clear();
        }
        result
    }
}

/// Writes points into the one-row-per-channel current table.
#[derive(Debug)]
pub struct CurrentSink {
    queries: QueryBuilder,
}

impl CurrentSink {
    /// Creates a sink.
    pub fn new(queries: QueryBuilder) -> Self {
        Self { queries }
    }
}

impl PointSink for CurrentSink {
    fn write_batch(&mut self, conn: &mut Connection, batch: &[Point]) -> Result<()> {
        let mut rows: BTreeMap<ChannelNumber, &Point> = BTreeMap::new();
        for point in batch {
            rows.insert(point.channel_number, point);
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&self.queries.upsert_current())?;
            for (cnl, point) in &rows {
                stmt.execute(params![
                    cnl,
                    to_millis(point.timestamp),
                    point.value.value,
                    i32::from(point.value.status)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Handle of a running writer thread.
#[derive(Debug)]
pub struct WriterThread<S: PointSink> {
    stop_tx: Sender<()>,
    handle: JoinHandle<(Connection, S)>,
}

impl<S: PointSink> WriterThread<S> {
    /// Starts a writer draining `queue` through `sink`.
    ///
    /// `has_error` is shared with the owning archive. It is raised while
    /// storage preparation fails and lowered once it succeeds; batch failures
    /// are reported by the queue itself.
    pub fn spawn(
        name: String,
        conn: Connection,
        queue: Arc<PointQueue>,
        sink: S,
        clock: Arc<dyn Clock>,
        has_error: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut conn = conn;
                let mut sink = sink;
                let mut prev_date: Option<NaiveDate> = None;

                loop {
                    let mut delay = THREAD_DELAY;

                    let today = clock.now().date_naive();
                    if prev_date != Some(today) {
                        match sink.prepare(&conn, today) {
                            Ok(()) => {
                                prev_date = Some(today);
                                has_error.store(false, Ordering::Release);
                            }
                            Err(err) => {
                                has_error.store(true, Ordering::Release);
                                error!("{}: error preparing storage for {}: {}", name, today, err);
                                delay = ERROR_DELAY;
                            }
                        }
                    }

                    if let Err(err) = queue.flush_all(DEFAULT_BATCH_SIZE, |batch| {
                        sink.write_batch(&mut conn, batch)
                    }) {
                        error!(
                            "{}: error writing queued points, {} left: {}",
                            name,
                            queue.len(),
                            err
                        );
                        delay = ERROR_DELAY;
                    }

                    match stop_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }

                debug!("{}: writer stopped", name);
                (conn, sink)
            })?;

        Ok(Self { stop_tx, handle })
    }

    /// Signals the thread, waits for it and returns its connection and sink.
    pub fn stop(self) -> Result<(Connection, S)> {
        let _ = self.stop_tx.try_send(());
        drop(self.stop_tx);
        self.handle
            .join()
            .map_err(|_| ArchiveError::WriterThread("writer thread panicked".to_string()))
    }
}

/// Days a writer prepares ahead of the current date.
pub fn prepared_days(today: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    [Some(today), today.succ_opt()]
        .into_iter()
        .flatten()
}
