//! Execution memory accounting for spillable collections.
//!
//! Memory is tracked, not allocated: sorters estimate their own footprint and
//! ask the executor-wide [`MemoryPool`] for permission to grow past their
//! current threshold. When the pool cannot grant enough, the sorter spills.

use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Executor-wide pool of execution memory shared by all running tasks.
#[derive(Debug)]
pub struct MemoryPool {
    capacity: u64,
    used: AtomicU64,
    per_task: DashMap<u64, u64>,
}

impl MemoryPool {
    pub fn new(capacity: u64) -> Self {
        debug!("Created MemoryPool(capacity={capacity})");
        Self { capacity, used: AtomicU64::new(0), per_task: DashMap::new() }
    }

    /// A pool that grants every request.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Memory currently held by one task.
    pub fn task_memory(&self, task_attempt_id: u64) -> u64 {
        self.per_task.get(&task_attempt_id).map_or(0, |v| *v)
    }

    /// Grant up to `bytes` to a task; returns the amount granted (possibly 0).
    pub fn acquire(&self, task_attempt_id: u64, bytes: u64) -> u64 {
        let mut granted = 0;
        // fetch_update only fails when the closure returns None, which it never does.
        let _ = self.used.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
            granted = bytes.min(self.capacity.saturating_sub(used));
            Some(used + granted)
        });
        if granted > 0 {
            *self.per_task.entry(task_attempt_id).or_insert(0) += granted;
        }
        granted
    }

    /// Return memory previously granted to a task.
    pub fn release(&self, task_attempt_id: u64, bytes: u64) {
        let released = match self.per_task.get_mut(&task_attempt_id) {
            Some(mut held) => {
                let r = bytes.min(*held);
                *held -= r;
                r
            }
            None => 0,
        };
        self.used.fetch_sub(released, Ordering::Relaxed);
    }

    /// Return everything a task holds; called when the task ends.
    pub fn release_all(&self, task_attempt_id: u64) -> u64 {
        let released = self.per_task.remove(&task_attempt_id).map_or(0, |(_, v)| v);
        self.used.fetch_sub(released, Ordering::Relaxed);
        released
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Spill decision logic of one spillable collection.
#[derive(Debug)]
pub struct SpillTracker {
    pool: Arc<MemoryPool>,
    task_attempt_id: u64,
    initial_threshold: u64,
    threshold: u64,
    force_spill_after: usize,
    elements_read: usize,
    spill_count: usize,
}

impl SpillTracker {
    pub fn new(
        pool: Arc<MemoryPool>,
        task_attempt_id: u64,
        initial_threshold: u64,
        force_spill_after: usize,
    ) -> Self {
        Self {
            pool,
            task_attempt_id,
            initial_threshold,
            threshold: initial_threshold,
            force_spill_after,
            elements_read: 0,
            spill_count: 0,
        }
    }

    /// Count one inserted record.
    pub fn add_element_read(&mut self) {
        self.elements_read += 1;
    }

    pub fn elements_read(&self) -> usize {
        self.elements_read
    }

    pub fn spill_count(&self) -> usize {
        self.spill_count
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether the collection should spill now, given its estimated size.
    ///
    /// Every 32 records, if the estimate reached the threshold, the tracker
    /// asks the pool for enough memory to double the footprint. It spills
    /// when the grant leaves the collection over its threshold, or once more
    /// records than the force-spill limit arrived since the last spill.
    pub fn should_spill(&mut self, current_memory: u64) -> bool {
        let mut spill = false;
        if self.elements_read % 32 == 0 && current_memory >= self.threshold {
            let request = current_memory.saturating_mul(2).saturating_sub(self.threshold);
            let granted = self.pool.acquire(self.task_attempt_id, request);
            self.threshold += granted;
            spill = current_memory >= self.threshold;
        }
        spill || self.elements_read > self.force_spill_after
    }

    /// Record a completed spill and return the extra memory to the pool.
    pub fn spilled(&mut self) {
        self.spill_count += 1;
        self.elements_read = 0;
        self.release_memory();
    }

    /// Return memory above the initial threshold to the pool.
    pub fn release_memory(&mut self) {
        self.pool
            .release(self.task_attempt_id, self.threshold - self.initial_threshold);
        self.threshold = self.initial_threshold;
    }
}

impl Drop for SpillTracker {
    fn drop(&mut self) {
        self.release_memory();
    }
}

const SAMPLE_GROWTH_RATE: f64 = 1.1;

/// Sampled estimate of a growing collection's size.
///
/// The real size is measured at exponentially spaced updates and extrapolated
/// linearly in between.
#[derive(Debug)]
pub struct SizeTracker {
    num_updates: u64,
    next_sample_num: u64,
    last_sample: (u64, u64),
    bytes_per_update: f64,
}

impl Default for SizeTracker {
    fn default() -> Self {
        Self { num_updates: 0, next_sample_num: 1, last_sample: (0, 0), bytes_per_update: 0.0 }
    }
}

impl SizeTracker {
    /// Forget all samples; used after the collection is cleared.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record one update; `measure` is called only at sample points.
    pub fn after_update(&mut self, measure: impl FnOnce() -> u64) {
        self.num_updates += 1;
        if self.num_updates == self.next_sample_num {
            let size = measure();
            let (prev_size, prev_updates) = self.last_sample;
            if self.num_updates > prev_updates && prev_updates > 0 {
                #[allow(clippy::cast_precision_loss)]
                let rate = (size as f64 - prev_size as f64) / (self.num_updates - prev_updates) as f64;
                self.bytes_per_update = rate.max(0.0);
            }
            self.last_sample = (size, self.num_updates);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let next = (self.num_updates as f64 * SAMPLE_GROWTH_RATE).ceil() as u64;
            self.next_sample_num = next.max(self.num_updates + 1);
        }
    }

    pub fn estimate_size(&self) -> u64 {
        let (size, at) = self.last_sample;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let extra = (self.bytes_per_update * (self.num_updates - at) as f64) as u64;
        size + extra
    }
}

const MAX_SAMPLED_RECORDS: usize = 64;

/// Estimate the in-memory size of `len` entries from an evenly strided sample.
///
/// Each entry costs `entry_size` bytes of inline footprint plus its postcard
/// encoding, which stands in for heap data the entry owns.
pub fn estimate_records_size<T, I>(records: I, len: usize, entry_size: usize) -> u64
where
    T: Serialize,
    I: Iterator<Item = T>,
{
    if len == 0 {
        return 0;
    }
    let stride = (len / MAX_SAMPLED_RECORDS).max(1);
    let mut sampled = 0u64;
    let mut bytes = 0u64;
    for r in records.step_by(stride).take(MAX_SAMPLED_RECORDS) {
        bytes += postcard::to_allocvec(&r).map_or(0, |v| v.len() as u64);
        sampled += 1;
    }
    let per_entry = entry_size as u64 + bytes / sampled.max(1);
    per_entry * len as u64
}
