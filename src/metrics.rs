//! Task-scoped shuffle metrics.
//!
//! Every [`TaskContext`](crate::task::TaskContext) owns one [`TaskMetrics`].
//! Writers, sorters and the read pipeline update its counters while they run;
//! the counters are atomics so the fetch threads of a reduce task can report
//! without locking. After the task finishes, callers can print the metrics or
//! serialize them:
//!
//! ```
//! use ironshuffle::metrics::TaskMetrics;
//!
//! let metrics = TaskMetrics::default();
//! metrics.write.inc_records_written(3);
//! metrics.write.inc_bytes_written(120);
//! let json = metrics.to_json();
//! assert_eq!(json["shuffle_write"]["records_written"], 3);
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

fn add(counter: &AtomicU64, v: u64) {
    counter.fetch_add(v, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Map-side output counters.
#[derive(Debug, Default)]
pub struct ShuffleWriteMetrics {
    bytes_written: AtomicU64,
    records_written: AtomicU64,
    write_time_nanos: AtomicU64,
}

impl ShuffleWriteMetrics {
    pub fn inc_bytes_written(&self, v: u64) {
        add(&self.bytes_written, v);
    }

    pub fn dec_bytes_written(&self, v: u64) {
        self.bytes_written
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(v)))
            .ok();
    }

    pub fn inc_records_written(&self, v: u64) {
        add(&self.records_written, v);
    }

    pub fn inc_write_time(&self, nanos: u64) {
        add(&self.write_time_nanos, nanos);
    }

    pub fn bytes_written(&self) -> u64 {
        get(&self.bytes_written)
    }

    pub fn records_written(&self) -> u64 {
        get(&self.records_written)
    }

    pub fn write_time_nanos(&self) -> u64 {
        get(&self.write_time_nanos)
    }
}

/// Reduce-side fetch counters.
#[derive(Debug, Default)]
pub struct ShuffleReadMetrics {
    remote_blocks_fetched: AtomicU64,
    local_blocks_fetched: AtomicU64,
    remote_bytes_read: AtomicU64,
    remote_bytes_read_to_disk: AtomicU64,
    local_bytes_read: AtomicU64,
    fetch_wait_time_nanos: AtomicU64,
    records_read: AtomicU64,
    corrupt_blocks_refetched: AtomicU64,
}

impl ShuffleReadMetrics {
    pub fn inc_remote_blocks_fetched(&self, v: u64) {
        add(&self.remote_blocks_fetched, v);
    }

    pub fn inc_local_blocks_fetched(&self, v: u64) {
        add(&self.local_blocks_fetched, v);
    }

    pub fn inc_remote_bytes_read(&self, v: u64) {
        add(&self.remote_bytes_read, v);
    }

    pub fn inc_remote_bytes_read_to_disk(&self, v: u64) {
        add(&self.remote_bytes_read_to_disk, v);
    }

    pub fn inc_local_bytes_read(&self, v: u64) {
        add(&self.local_bytes_read, v);
    }

    pub fn inc_fetch_wait_time(&self, nanos: u64) {
        add(&self.fetch_wait_time_nanos, nanos);
    }

    pub fn inc_records_read(&self, v: u64) {
        add(&self.records_read, v);
    }

    pub fn inc_corrupt_blocks_refetched(&self, v: u64) {
        add(&self.corrupt_blocks_refetched, v);
    }

    pub fn remote_blocks_fetched(&self) -> u64 {
        get(&self.remote_blocks_fetched)
    }

    pub fn local_blocks_fetched(&self) -> u64 {
        get(&self.local_blocks_fetched)
    }

    pub fn remote_bytes_read(&self) -> u64 {
        get(&self.remote_bytes_read)
    }

    pub fn remote_bytes_read_to_disk(&self) -> u64 {
        get(&self.remote_bytes_read_to_disk)
    }

    pub fn local_bytes_read(&self) -> u64 {
        get(&self.local_bytes_read)
    }

    pub fn fetch_wait_time_nanos(&self) -> u64 {
        get(&self.fetch_wait_time_nanos)
    }

    pub fn records_read(&self) -> u64 {
        get(&self.records_read)
    }

    pub fn corrupt_blocks_refetched(&self) -> u64 {
        get(&self.corrupt_blocks_refetched)
    }
}

/// All metrics of one task.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    pub write: ShuffleWriteMetrics,
    pub read: ShuffleReadMetrics,
    memory_bytes_spilled: AtomicU64,
    disk_bytes_spilled: AtomicU64,
    peak_execution_memory: AtomicU64,
}

impl TaskMetrics {
    pub fn inc_memory_bytes_spilled(&self, v: u64) {
        add(&self.memory_bytes_spilled, v);
    }

    pub fn inc_disk_bytes_spilled(&self, v: u64) {
        add(&self.disk_bytes_spilled, v);
    }

    /// Raise the recorded peak if `v` exceeds it.
    pub fn update_peak_execution_memory(&self, v: u64) {
        self.peak_execution_memory.fetch_max(v, Ordering::Relaxed);
    }

    pub fn memory_bytes_spilled(&self) -> u64 {
        get(&self.memory_bytes_spilled)
    }

    pub fn disk_bytes_spilled(&self) -> u64 {
        get(&self.disk_bytes_spilled)
    }

    pub fn peak_execution_memory(&self) -> u64 {
        get(&self.peak_execution_memory)
    }

    /// All counters as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "shuffle_write": {
                "bytes_written": self.write.bytes_written(),
                "records_written": self.write.records_written(),
                "write_time_nanos": self.write.write_time_nanos(),
            },
            "shuffle_read": {
                "remote_blocks_fetched": self.read.remote_blocks_fetched(),
                "local_blocks_fetched": self.read.local_blocks_fetched(),
                "remote_bytes_read": self.read.remote_bytes_read(),
                "remote_bytes_read_to_disk": self.read.remote_bytes_read_to_disk(),
                "local_bytes_read": self.read.local_bytes_read(),
                "fetch_wait_time_nanos": self.read.fetch_wait_time_nanos(),
                "records_read": self.read.records_read(),
                "corrupt_blocks_refetched": self.read.corrupt_blocks_refetched(),
            },
            "memory_bytes_spilled": self.memory_bytes_spilled(),
            "disk_bytes_spilled": self.disk_bytes_spilled(),
            "peak_execution_memory": self.peak_execution_memory(),
        })
    }

    /// Print all metrics to stdout in a human-readable format.
    pub fn print(&self) {
        println!("\n========== Shuffle Metrics ==========");
        print_section("", &self.to_json());
        println!("=====================================\n");
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

fn print_section(prefix: &str, value: &Value) {
    if let Value::Object(map) = value {
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by_key(|(name, _)| *name);
        for (name, v) in entries {
            let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
            if v.is_object() {
                print_section(&key, v);
            } else {
                println!("{key}: {v}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_only_grows() {
        let m = TaskMetrics::default();
        m.update_peak_execution_memory(10);
        m.update_peak_execution_memory(4);
        assert_eq!(m.peak_execution_memory(), 10);
    }

    #[test]
    fn saves_json_snapshot() -> Result<()> {
        let m = TaskMetrics::default();
        m.read.inc_remote_bytes_read(64);
        m.inc_disk_bytes_spilled(7);
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metrics.json");
        m.save_to_file(&path)?;
        let back: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(back["shuffle_read"]["remote_bytes_read"], 64);
        assert_eq!(back["disk_bytes_spilled"], 7);
        Ok(())
    }

    #[test]
    fn bytes_written_never_underflows() {
        let m = ShuffleWriteMetrics::default();
        m.inc_bytes_written(5);
        m.dec_bytes_written(9);
        assert_eq!(m.bytes_written(), 0);
    }
}
