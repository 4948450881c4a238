//! Bounded write queue of pending points.
//!
//! The real-time path enqueues; a writer drains batches and persists them.
//! A single mutex covers enqueue, trim, dequeue and requeue, so the trim
//! decision always sees what was just added. When producers outrun the
//! writer, the oldest points are dropped: the queue never blocks producers.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_archive::queue::{PointQueue, queue_capacity};
//!
//! let queue = PointQueue::new("Hour", queue_capacity(1000, channels.len()));
//! queue.enqueue_batch(points);
//! queue.flush_with(DEFAULT_BATCH_SIZE, |batch| insert(batch))?;
//! ```

use crate::data::Point;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Lower bound of a queue's capacity.
pub const MIN_QUEUE_SIZE: usize = 1000;

/// Default number of points persisted per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Capacity for a queue serving `channel_count` channels.
///
/// The configured ceiling is raised to hold at least two full slices and never
/// falls below [`MIN_QUEUE_SIZE`].
pub fn queue_capacity(max_queue_size: usize, channel_count: usize) -> usize {
    max_queue_size.max((channel_count * 2).max(MIN_QUEUE_SIZE))
}

/// Bounded FIFO of points awaiting persistence.
#[derive(Debug)]
pub struct PointQueue {
    name: String,
    capacity: usize,
    points: Mutex<VecDeque<Point>>,
    has_error: AtomicBool,
    dropped: AtomicU64,
}

impl PointQueue {
    /// Creates a queue. The capacity is at least one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            points: Mutex::new(VecDeque::with_capacity(capacity.min(64 * 1024))),
            has_error: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Maximum number of queued points.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued points.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    /// Returns true if the last persistence attempt failed.
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// Total number of points dropped by overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues a point.
    pub fn enqueue(&self, point: Point) {
        let mut points = self.points.lock();
        points.push_back(point);
        self.remove_excess(&mut points);
    }

    /// Enqueues several points under one lock acquisition.
    ///
    /// Returns the number of points enqueued.
    pub fn enqueue_batch(&self, batch: impl IntoIterator<Item = Point>) -> usize {
        let mut points = self.points.lock();
        let before = points.len();
        points.extend(batch);
        let added = points.len() - before;
        self.remove_excess(&mut points);
        added
    }

    /// Removes up to `max` points from the head of the queue.
    pub fn drain(&self, max: usize) -> Vec<Point> {
        let mut points = self.points.lock();
        let count = max.min(points.len());
        points.drain(..count).collect()
    }

    /// Puts points that could not be persisted back at the head of the queue.
    pub fn requeue(&self, batch: Vec<Point>) {
        let mut points = self.points.lock();
        for point in batch.into_iter().rev() {
            points.push_front(point);
        }
        self.remove_excess(&mut points);
    }

    /// Drains one batch and hands it to `persist`.
    ///
    /// On success the error flag is cleared and the batch size returned. On
    /// failure the batch is requeued, the error flag raised and the error
    /// returned.
    pub fn flush_with<F>(&self, max_batch: usize, mut persist: F) -> Result<usize>
    where
        F: FnMut(&[Point]) -> Result<()>,
    {
        let batch = self.drain(max_batch);
        if batch.is_empty() {
            return Ok(0);
        }

        match persist(&batch) {
            Ok(()) => {
                self.has_error.store(false, Ordering::Release);
                Ok(batch.len())
            }
            Err(err) => {
                self.requeue(batch);
                self.has_error.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Flushes batches until the queue is empty or persisting fails.
    pub fn flush_all<F>(&self, max_batch: usize, mut persist: F) -> Result<usize>
    where
        F: FnMut(&[Point]) -> Result<()>,
    {
        let mut total = 0;
        loop {
            let flushed = self.flush_with(max_batch, &mut persist)?;
            if flushed == 0 {
                return Ok(total);
            }
            total += flushed;
        }
    }

    /// Returns a copy of the queued points, oldest first.
    pub fn snapshot(&self) -> Vec<Point> {
        self.points.lock().iter().copied().collect()
    }

    fn remove_excess(&self, points: &mut VecDeque<Point>) {
        let excess = points.len().saturating_sub(self.capacity);
        if excess > 0 {
            points.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            warn!(
                "Queue {} is full ({} of {}), {} oldest points removed",
                self.name,
                points.len(),
                self.capacity,
                excess
            );
        }
    }
}
