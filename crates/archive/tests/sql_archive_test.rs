//! Integration tests for the queued SQL archives.
//!
//! Writes go through the writer thread, so assertions on stored data poll
//! until the thread has caught up.

use alopex_archive::clock::{Clock, ManualClock};
use alopex_archive::config::{
    ArchiveOptions, DbConnectionOptions, SqlArchiveOptions, TimeUnit, WritingMode,
};
use alopex_archive::data::{ChannelNumber, ChannelValue, CurrentData, TimeRange, Timestamp};
use alopex_archive::lifecycle::PartitionSize;
use alopex_archive::logic::{ArchiveLogic, CurrentArchiveLogic};
use alopex_archive::sql::{SqlCurrentArchive, SqlHistoricalArchive, SqlStorage};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn ts(month: u32, day: u32, h: u32, m: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2026, month, day, h, m, 0).unwrap()
}

fn v(value: f64) -> ChannelValue {
    ChannelValue::new(value, 1)
}

fn sample(timestamp: Timestamp, values: &[(ChannelNumber, f64)]) -> CurrentData {
    let mut data = CurrentData::new(timestamp, values.iter().map(|(cnl, _)| *cnl).collect());
    for &(cnl, value) in values {
        data.set(cnl, v(value));
    }
    data
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn memory_storage() -> Arc<SqlStorage> {
    Arc::new(SqlStorage::open(DbConnectionOptions::default()).unwrap())
}

fn noon_clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 10).unwrap()))
}

fn historical(
    storage: Arc<SqlStorage>,
    options: ArchiveOptions,
    sql_options: SqlArchiveOptions,
    clock: Arc<dyn Clock>,
) -> SqlHistoricalArchive {
    SqlHistoricalArchive::new("Min", options, &sql_options, storage, vec![1, 2], clock).unwrap()
}

fn day_range() -> TimeRange {
    TimeRange::new(ts(10, 17, 0, 0), ts(10, 18, 0, 0))
}

// ============================================================================
// Historical archive
// ============================================================================

#[test]
fn test_periodic_slice_round_trip() {
    let archive = historical(
        memory_storage(),
        ArchiveOptions::default(),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    archive.make_ready().unwrap();

    assert!(archive
        .process_data(&sample(ts(10, 17, 12, 1), &[(1, 1.5), (2, 2.5)]))
        .unwrap());
    assert!(!archive
        .process_data(&sample(ts(10, 17, 12, 1), &[(1, 9.0), (2, 9.0)]))
        .unwrap());

    assert!(wait_until(|| archive.get_trend(&day_range(), 2).unwrap().len() == 1));

    let slice = archive.get_slice(ts(10, 17, 12, 1), &[2, 5, 1]).unwrap();
    assert_eq!(slice.values, vec![v(2.5), ChannelValue::EMPTY, v(1.5)]);
    assert_eq!(archive.get_cnl_data(ts(10, 17, 12, 1), 1).unwrap(), v(1.5));
    assert_eq!(
        archive.get_cnl_data(ts(10, 17, 12, 2), 1).unwrap(),
        ChannelValue::EMPTY
    );
    assert_eq!(
        archive.get_timestamps(&day_range()).unwrap(),
        vec![ts(10, 17, 12, 1)]
    );

    archive.close().unwrap();
    assert!(!archive.status().has_error);
}

#[test]
fn test_on_change_writes_one_point() {
    let archive = historical(
        memory_storage(),
        ArchiveOptions::default().with_writing_mode(WritingMode::AutoOnChange),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    archive.make_ready().unwrap();

    let written: Vec<bool> = [(1, 10.0), (2, 10.0), (3, 12.0)]
        .iter()
        .map(|&(minute, value)| {
            archive
                .process_data(&sample(ts(10, 17, 12, minute), &[(1, value)]))
                .unwrap()
        })
        .collect();
    assert_eq!(written, vec![false, false, true]);

    assert!(wait_until(|| !archive.get_trend(&day_range(), 1).unwrap().is_empty()));
    let trend = archive.get_trend(&day_range(), 1).unwrap();
    assert_eq!(trend.len(), 1);
    assert_eq!(trend.points[0].timestamp, ts(10, 17, 12, 3));
    assert_eq!(trend.points[0].value, v(12.0));
    assert!(archive.get_trend(&day_range(), 2).unwrap().is_empty());
}

#[test]
fn test_unscheduled_modes_keep_off_grid_timestamps() {
    let off_grid = ts(10, 17, 12, 0) + chrono::Duration::seconds(7);

    for mode in [WritingMode::AutoOnChange, WritingMode::OnDemand] {
        let archive = historical(
            memory_storage(),
            ArchiveOptions::default().with_writing_mode(mode),
            SqlArchiveOptions::default(),
            noon_clock(),
        );
        assert_eq!(archive.accept_data(off_grid), Some(off_grid));
        archive.make_ready().unwrap();

        archive.write_cnl_data(off_grid, 1, v(7.0)).unwrap();
        assert!(wait_until(|| archive.get_cnl_data(off_grid, 1).unwrap() == v(7.0)));
        assert_eq!(archive.get_timestamps(&day_range()).unwrap(), vec![off_grid]);
    }

    let periodic = historical(
        memory_storage(),
        ArchiveOptions::default(),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    assert_eq!(periodic.accept_data(off_grid), None);
}

#[test]
fn test_status_reports_partition_failure_and_recovers() {
    let storage = memory_storage();
    let clock = Arc::new(ManualClock::new(ts(10, 17, 12, 0)));
    let archive = historical(
        Arc::clone(&storage),
        ArchiveOptions::default().with_writing_mode(WritingMode::OnDemand),
        SqlArchiveOptions::default().with_partition_size(PartitionSize::OneDay),
        clock.clone(),
    );
    archive.make_ready().unwrap();
    assert_eq!(archive.status_text(), "Ready, queue 0 of 1000");

    // Without the schema the next day's partition cannot be created.
    let admin = storage.connect().unwrap();
    admin.execute_batch("DROP SCHEMA arc CASCADE").unwrap();
    clock.advance(chrono::Duration::days(1));
    assert!(wait_until(|| archive.status().has_error));
    assert!(archive.status_text().starts_with("Ready, error"));

    admin.execute_batch("CREATE SCHEMA arc").unwrap();
    assert!(wait_until(|| !archive.status().has_error));
    assert_eq!(archive.status_text(), "Ready, queue 0 of 1000");

    // The known partition of the day is gone too; writes recreate it.
    archive.write_cnl_data(ts(10, 18, 9, 0), 2, v(5.0)).unwrap();
    assert!(wait_until(|| archive.get_cnl_data(ts(10, 18, 9, 0), 2).unwrap() == v(5.0)));
    assert!(wait_until(|| !archive.status().has_error));
}

#[test]
fn test_trend_spans_partitions_in_order() {
    let archive = historical(
        memory_storage(),
        ArchiveOptions::default().with_writing_mode(WritingMode::OnDemand),
        SqlArchiveOptions::default().with_partition_size(PartitionSize::OneDay),
        noon_clock(),
    );
    archive.make_ready().unwrap();

    archive.write_cnl_data(ts(10, 17, 0, 5), 1, v(3.0)).unwrap();
    archive.write_cnl_data(ts(10, 16, 23, 55), 1, v(1.0)).unwrap();
    archive.write_cnl_data(ts(10, 16, 23, 58), 1, v(2.0)).unwrap();

    let range = TimeRange::new(ts(10, 16, 23, 0), ts(10, 17, 1, 0));
    assert!(wait_until(|| archive.get_trend(&range, 1).unwrap().len() == 3));

    let trend = archive.get_trend(&range, 1).unwrap();
    let values: Vec<f64> = trend.points.iter().map(|p| p.value.value).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
    assert_eq!(
        archive.get_timestamps(&range).unwrap(),
        vec![ts(10, 16, 23, 55), ts(10, 16, 23, 58), ts(10, 17, 0, 5)]
    );
}

#[test]
fn test_single_channel_fast_path_matches_bundle() {
    let archive = historical(
        memory_storage(),
        ArchiveOptions::default().with_writing_mode(WritingMode::OnDemand),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    archive.make_ready().unwrap();

    archive.write_cnl_data(ts(10, 17, 1, 0), 1, v(1.0)).unwrap();
    archive.write_cnl_data(ts(10, 17, 2, 0), 2, v(2.0)).unwrap();
    archive.write_cnl_data(ts(10, 17, 3, 0), 1, v(3.0)).unwrap();
    assert!(wait_until(|| archive.get_timestamps(&day_range()).unwrap().len() == 3));

    let single = archive.get_trends(&day_range(), &[1]).unwrap();
    let trend = archive.get_trend(&day_range(), 1).unwrap();
    assert_eq!(single.channel_numbers, vec![1]);
    assert_eq!(single.timestamps, trend.timestamps());
    assert_eq!(single.column(1).unwrap(), &[v(1.0), v(3.0)]);

    let bundle = archive.get_trends(&day_range(), &[1, 2]).unwrap();
    assert_eq!(bundle.len(), 3);
    assert_eq!(bundle.column(1).unwrap(), &[v(1.0), ChannelValue::EMPTY, v(3.0)]);
    assert_eq!(bundle.column(2).unwrap(), &[ChannelValue::EMPTY, v(2.0), ChannelValue::EMPTY]);
}

#[test]
fn test_retention_drops_whole_partitions() {
    let archive = historical(
        memory_storage(),
        ArchiveOptions::default()
            .with_writing_mode(WritingMode::OnDemand)
            .with_retention_days(30),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    archive.make_ready().unwrap();

    archive.write_cnl_data(ts(7, 15, 12, 0), 1, v(7.0)).unwrap();
    archive.write_cnl_data(ts(9, 20, 12, 0), 1, v(9.0)).unwrap();
    assert!(wait_until(|| archive.get_cnl_data(ts(9, 20, 12, 0), 1).unwrap() == v(9.0)));
    assert_eq!(archive.get_cnl_data(ts(7, 15, 12, 0), 1).unwrap(), v(7.0));

    assert_eq!(archive.delete_outdated_data().unwrap(), 1);
    assert_eq!(
        archive.get_cnl_data(ts(7, 15, 12, 0), 1).unwrap(),
        ChannelValue::EMPTY
    );
    assert_eq!(archive.get_cnl_data(ts(9, 20, 12, 0), 1).unwrap(), v(9.0));

    assert_eq!(archive.delete_outdated_data().unwrap(), 0);
}

#[test]
fn test_close_flushes_into_file_database() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("arc.duckdb");
    let options = DbConnectionOptions::new("Main", path.to_string_lossy());

    {
        let storage = Arc::new(SqlStorage::open(options.clone()).unwrap());
        let archive = historical(
            storage,
            ArchiveOptions::default().with_writing_mode(WritingMode::OnDemand),
            SqlArchiveOptions::default(),
            noon_clock(),
        );
        archive.make_ready().unwrap();
        for minute in 0..50 {
            archive
                .write_cnl_data(ts(10, 17, 11, minute), 2, v(f64::from(minute)))
                .unwrap();
        }
        archive.close().unwrap();
        assert_eq!(archive.status_text(), "Closed, queue 0 of 1000");
    }

    let storage = Arc::new(SqlStorage::open(options).unwrap());
    let archive = historical(
        storage,
        ArchiveOptions::default().with_writing_mode(WritingMode::OnDemand),
        SqlArchiveOptions::default(),
        noon_clock(),
    );
    archive.make_ready().unwrap();
    let trend = archive.get_trend(&day_range(), 2).unwrap();
    assert_eq!(trend.len(), 50);
    assert_eq!(trend.points[49].value, v(49.0));
}

// ============================================================================
// Current-value archive
// ============================================================================

#[test]
fn test_current_values_survive_restart() {
    let storage = memory_storage();
    let options = ArchiveOptions::default().with_writing_period(10, TimeUnit::Second);

    let before = SqlCurrentArchive::new(
        "Cur",
        options.clone(),
        Arc::clone(&storage),
        vec![1, 2, 3],
        noon_clock(),
    )
    .unwrap();
    before.make_ready().unwrap();
    let mut data = sample(ts(10, 17, 12, 0), &[(1, 1.0), (2, 2.0), (3, 3.0)]);
    data.set_at(2, ts(10, 17, 11, 30), v(2.0));
    before.write_data(&data).unwrap();
    before.close().unwrap();

    let after =
        SqlCurrentArchive::new("Cur", options, Arc::clone(&storage), vec![1, 2], noon_clock())
            .unwrap();
    after.make_ready().unwrap();

    let mut restored = CurrentData::new(ts(10, 17, 12, 5), vec![1, 2, 3]);
    assert_eq!(after.read_data(&mut restored).unwrap(), 2);
    assert_eq!(restored.get(1), Some(v(1.0)));
    assert_eq!(restored.get(2), Some(v(2.0)));
    assert_eq!(restored.get(3), Some(ChannelValue::EMPTY));
    assert_eq!(restored.timestamps()[1], ts(10, 17, 11, 30));

    let conn = storage.connect().unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM arc.cur_current", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);
}
