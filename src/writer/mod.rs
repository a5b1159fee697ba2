//! Map-side shuffle writers.
//!
//! Every writer consumes the records of one map task and commits one data
//! file, one index file and (when enabled) one checksum file through the
//! [`IndexShuffleBlockResolver`]. Nothing is visible to readers until the
//! index is committed, so a failed writer never leaves readable output.
//!
//! | Strategy | Writer |
//! |---|---|
//! | [`WriteStrategy::Bypass`](crate::dependency::WriteStrategy::Bypass) | [`BypassMergeSortShuffleWriter`] |
//! | [`WriteStrategy::SerializedSort`](crate::dependency::WriteStrategy::SerializedSort) | [`UnsafeShuffleWriter`] |
//! | [`WriteStrategy::DeserializedSort`](crate::dependency::WriteStrategy::DeserializedSort) | [`SortShuffleWriter`] |

mod bypass;
mod serialized;
mod sort;

pub use bypass::BypassMergeSortShuffleWriter;
pub use serialized::UnsafeShuffleWriter;
pub use sort::SortShuffleWriter;

use crate::block::BlockManagerId;
use crate::checksum::ChecksumWriter;
use crate::config::ShuffleConf;
use crate::dependency::MapStatus;
use crate::io::compression::{CompressionCodec, FinishWrite};
use crate::io::serializer::RecordSerializer;
use crate::metrics::ShuffleWriteMetrics;
use crate::resolver::IndexShuffleBlockResolver;
use crate::task::TaskContext;
use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

/// Writes the output of one map task.
///
/// Call [`write`](Self::write) once, then [`stop`](Self::stop) with whether
/// the task succeeded. `stop(false)` deletes every partial file.
pub trait ShuffleWriter<K, V>: Send {
    /// Consume and commit all records of the map task.
    ///
    /// # Errors
    ///
    /// Returns the first record error, serialization error or I/O failure.
    fn write(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()>;

    /// Finish the writer. Returns the map status after a successful write and
    /// `None` when stopping a failed task or stopping twice.
    ///
    /// # Errors
    ///
    /// Returns an error for `stop(true)` without a successful `write`.
    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>>;

    /// Committed length of each partition; empty before a successful write.
    fn partition_lengths(&self) -> &[u64];
}

/// What a writer needs from the task and executor it runs in.
#[derive(Clone)]
pub struct WriteContext {
    pub task: Arc<TaskContext>,
    pub resolver: Arc<IndexShuffleBlockResolver>,
    pub conf: Arc<ShuffleConf>,
    pub location: BlockManagerId,
    pub map_id: u64,
}

impl WriteContext {
    pub(crate) fn metrics(&self) -> &ShuffleWriteMetrics {
        &self.task.metrics().write
    }

    /// Checksums to commit, or `None` when checksum files are disabled.
    pub(crate) fn checksums<'a>(&self, checksums: &'a [u64]) -> Option<&'a [u64]> {
        self.conf.checksum_enabled.then_some(checksums)
    }
}

/// Shared `stop` logic: hand out the status once, and run `cleanup` on failure.
pub(crate) fn finish_stop(
    stopping: &mut bool,
    map_status: &mut Option<MapStatus>,
    success: bool,
    cleanup: impl FnOnce(),
) -> Result<Option<MapStatus>> {
    if std::mem::replace(stopping, true) {
        return Ok(None);
    }
    if success {
        map_status
            .take()
            .map(Some)
            .ok_or_else(|| anyhow!("cannot stop a writer successfully before it wrote its output"))
    } else {
        map_status.take();
        cleanup();
        Ok(None)
    }
}

/// Per-partition `(lengths, checksums)` of a data file.
pub(crate) type PartitionLayout = (Vec<u64>, Vec<u64>);

/// Write partition-sorted records as one compressed segment per non-empty
/// partition. Empty partitions take no bytes.
pub(crate) fn write_sorted_partitions<W, K, C>(
    records: impl Iterator<Item = Result<(usize, K, C)>>,
    out: &mut ChecksumWriter<W>,
    num_partitions: usize,
    codec: &dyn CompressionCodec,
    serializer: RecordSerializer,
    metrics: &ShuffleWriteMetrics,
) -> Result<PartitionLayout>
where
    W: Write + Send,
    K: Serialize,
    C: Serialize,
{
    let mut lengths = vec![0u64; num_partitions];
    let mut checksums = vec![crate::checksum::partition_checksum(&[]); num_partitions];
    let mut records = records.peekable();
    let mut previous = None;
    while let Some(first) = records.next() {
        let (partition, key, combiner) = first?;
        if partition >= num_partitions {
            bail!("partition {partition} out of range for {num_partitions} partitions");
        }
        if previous.is_some_and(|p| p >= partition) {
            bail!("records are not sorted by partition: {partition} after {previous:?}");
        }
        previous = Some(partition);
        {
            let mut w = serializer.writer(codec.compressed_output(Box::new(&mut *out))?);
            w.write(&(&key, &combiner))?;
            while matches!(records.peek(), Some(Ok((p, _, _))) if *p == partition) {
                if let Some(Ok((_, key, combiner))) = records.next() {
                    w.write(&(&key, &combiner))?;
                }
            }
            metrics.inc_records_written(w.records_written());
            w.into_inner()?
                .finish()
                .with_context(|| format!("finish partition {partition}"))?;
        }
        let (len, sum) = out.finish_segment();
        lengths[partition] = len;
        checksums[partition] = sum;
    }
    Ok((lengths, checksums))
}
