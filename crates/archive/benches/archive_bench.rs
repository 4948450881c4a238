//! Benchmarks for archive components.
//!
//! Run with: cargo bench --package alopex-archive
//!
//! ## Benchmark Categories
//!
//! - **Write Queue**: Batched enqueue and flush
//! - **Trend Merge**: Aligning per-channel trends
//! - **File Archive**: Slice writes and range reads

use alopex_archive::clock::ManualClock;
use alopex_archive::config::{ArchiveOptions, PathOptions};
use alopex_archive::data::{
    bundle_trends, ChannelValue, CurrentData, Point, TimeRange, Timestamp, Trend,
};
use alopex_archive::file::BasicArchive;
use alopex_archive::logic::ArchiveLogic;
use alopex_archive::queue::PointQueue;
use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

fn start() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap()
}

fn sample(timestamp: Timestamp, channels: i32) -> CurrentData {
    let mut data = CurrentData::new(timestamp, (1..=channels).collect());
    for cnl in 1..=channels {
        data.set(cnl, ChannelValue::new(f64::from(cnl) * 0.5, 1));
    }
    data
}

fn bench_queue_enqueue_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue_flush");
    for size in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let queue = PointQueue::new("bench", size);
            b.iter(|| {
                queue.enqueue_batch((0..size).map(|i| {
                    Point::new(
                        (i % 100) as i32,
                        start() + Duration::seconds(i as i64),
                        ChannelValue::new(i as f64, 1),
                    )
                }));
                black_box(queue.flush_all(1000, |batch| {
                    black_box(batch.len());
                    Ok(())
                }))
            })
        });
    }
    group.finish();
}

fn bench_bundle_trends(c: &mut Criterion) {
    let trends: Vec<Trend> = (0..10)
        .map(|cnl| {
            let mut trend = Trend::new(cnl);
            // Channels sampled with different strides.
            for i in (0..1440).step_by(cnl as usize + 1) {
                trend.push(
                    start() + Duration::minutes(i as i64),
                    ChannelValue::new(i as f64, 1),
                );
            }
            trend
        })
        .collect();

    c.bench_function("bundle_trends_10x1440", |b| {
        b.iter(|| bundle_trends(black_box(trends.clone())))
    });
}

fn bench_file_process_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_process_data");
    for channels in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*channels as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(channels),
            channels,
            |b, &channels| {
                let temp_dir = TempDir::new().unwrap();
                let paths = PathOptions::new(temp_dir.path(), temp_dir.path());
                let archive = BasicArchive::new(
                    "Bench",
                    ArchiveOptions::default(),
                    (1..=channels).collect(),
                    &paths,
                    Arc::new(ManualClock::new(start())),
                )
                .unwrap();
                archive.make_ready().unwrap();

                let mut data = sample(start(), channels);
                b.iter(|| {
                    data.timestamp += Duration::minutes(1);
                    black_box(archive.process_data(&data).unwrap())
                });
            },
        );
    }
    group.finish();
}

fn bench_file_read_trend(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let paths = PathOptions::new(temp_dir.path(), temp_dir.path());
    let archive = BasicArchive::new(
        "Bench",
        ArchiveOptions::default(),
        (1..=10).collect(),
        &paths,
        Arc::new(ManualClock::new(start())),
    )
    .unwrap();
    archive.make_ready().unwrap();
    let mut data = sample(start(), 10);
    for _ in 0..1439 {
        data.timestamp += Duration::minutes(1);
        archive.process_data(&data).unwrap();
    }

    let range = TimeRange::new(start(), start() + Duration::days(1));
    let mut group = c.benchmark_group("file_read");
    group.throughput(Throughput::Elements(1439));
    group.bench_function("trend_full_day", |b| {
        b.iter(|| black_box(archive.get_trend(&range, 5).unwrap()))
    });
    group.bench_function("trends_full_day_10", |b| {
        let channels: Vec<i32> = (1..=10).collect();
        b.iter(|| black_box(archive.get_trends(&range, &channels).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    // Write queue
    bench_queue_enqueue_flush,
    // Trend merge
    bench_bundle_trends,
    // File archive
    bench_file_process_data,
    bench_file_read_trend,
);
criterion_main!(benches);
