//! Sorter over typed records with optional map-side combining.

use super::KeyComparator;
use super::merge::{MergeCombiners, Merger, Run};
use crate::aggregator::Aggregator;
use crate::config::ShuffleConf;
use crate::dependency::{KeyOrdering, ShuffleData, ShuffleKey};
use crate::disk::DiskBlockManager;
use crate::io::buffer::CountingWriter;
use crate::io::compression::{CompressionCodec, FinishWrite, resolve_codec};
use crate::io::serializer::RecordSerializer;
use crate::memory::{SizeTracker, SpillTracker, estimate_records_size};
use crate::partitioner::Partitioner;
use crate::task::TaskContext;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;

/// How an inserted value becomes part of the in-memory collection.
pub enum Insertion<V, C> {
    /// Combine values of equal keys with the aggregator.
    Combine(Arc<dyn Aggregator<V, C>>),
    /// Keep every record, converting its value.
    Append(fn(V) -> C),
}

/// Spillable collection of `(key, value)` records, sorted by partition and
/// optionally by key.
///
/// ```
/// use ironshuffle::config::ShuffleConf;
/// use ironshuffle::disk::DiskBlockManager;
/// use ironshuffle::partitioner::HashPartitioner;
/// use ironshuffle::sort::ExternalSorter;
/// use ironshuffle::task::TaskContext;
/// use std::sync::Arc;
///
/// # fn main() -> anyhow::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let conf = ShuffleConf { local_dirs: vec![dir.path().to_path_buf()], ..Default::default() };
/// let disk = Arc::new(DiskBlockManager::new(&conf)?);
/// let mut sorter = ExternalSorter::<u32, String, String>::appending(
///     TaskContext::standalone(0), disk, &conf,
/// )?
/// .with_partitioner(Arc::new(HashPartitioner::new(4)));
/// let records = vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())];
/// sorter.insert_all(records.into_iter().map(Ok))?;
/// let partitions: Vec<usize> = sorter
///     .into_sorted()?
///     .map(|r| r.map(|(p, _, _)| p))
///     .collect::<anyhow::Result<_>>()?;
/// assert!(partitions.windows(2).all(|w| w[0] <= w[1]));
/// # Ok(())
/// # }
/// ```
pub struct ExternalSorter<K, V, C> {
    ctx: Arc<TaskContext>,
    disk: Arc<DiskBlockManager>,
    partitioner: Option<Arc<dyn Partitioner<K>>>,
    insertion: Insertion<V, C>,
    ordering: Option<KeyOrdering<K>>,
    serializer: RecordSerializer,
    spill_codec: Arc<dyn CompressionCodec>,
    file_buffer_size: usize,
    map: HashMap<(usize, K), C>,
    buffer: Vec<(usize, K, C)>,
    size: SizeTracker,
    tracker: SpillTracker,
    spills: Vec<TempPath>,
    memory_bytes_spilled: u64,
    disk_bytes_spilled: u64,
    peak_memory_used: u64,
}

impl<K: ShuffleKey, V: ShuffleData> ExternalSorter<K, V, V> {
    /// A sorter that keeps every record as is.
    ///
    /// # Errors
    ///
    /// Returns an error if the spill codec is unknown.
    pub fn appending(
        ctx: Arc<TaskContext>,
        disk: Arc<DiskBlockManager>,
        conf: &ShuffleConf,
    ) -> Result<Self> {
        Self::new(ctx, disk, conf, Insertion::Append(std::convert::identity))
    }
}

impl<K: ShuffleKey, V: ShuffleData, C: ShuffleData> ExternalSorter<K, V, C> {
    /// A sorter with a single partition, no key ordering and the default serializer.
    ///
    /// # Errors
    ///
    /// Returns an error if the spill codec is unknown.
    pub fn new(
        ctx: Arc<TaskContext>,
        disk: Arc<DiskBlockManager>,
        conf: &ShuffleConf,
        insertion: Insertion<V, C>,
    ) -> Result<Self> {
        let tracker = SpillTracker::new(
            Arc::clone(ctx.memory_pool()),
            ctx.task_attempt_id(),
            conf.initial_memory_threshold,
            conf.num_elements_force_spill_threshold,
        );
        Ok(Self {
            ctx,
            disk,
            partitioner: None,
            insertion,
            ordering: None,
            serializer: RecordSerializer::default(),
            spill_codec: resolve_codec(conf.spill_compress, &conf.codec)?,
            file_buffer_size: conf.file_buffer_size,
            map: HashMap::new(),
            buffer: Vec::new(),
            size: SizeTracker::default(),
            tracker,
            spills: Vec::new(),
            memory_bytes_spilled: 0,
            disk_bytes_spilled: 0,
            peak_memory_used: 0,
        })
    }

    #[must_use]
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner<K>>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    #[must_use]
    pub fn with_ordering(mut self, ordering: KeyOrdering<K>) -> Self {
        self.ordering = Some(ordering);
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: RecordSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn num_partitions(&self) -> usize {
        self.partitioner.as_ref().map_or(1, |p| p.num_partitions())
    }

    pub fn spill_count(&self) -> usize {
        self.tracker.spill_count()
    }

    pub fn memory_bytes_spilled(&self) -> u64 {
        self.memory_bytes_spilled
    }

    pub fn disk_bytes_spilled(&self) -> u64 {
        self.disk_bytes_spilled
    }

    pub fn peak_memory_used_bytes(&self) -> u64 {
        self.peak_memory_used
    }

    fn comparator(&self) -> KeyComparator<K> {
        match (&self.ordering, &self.insertion) {
            (Some(ordering), _) => KeyComparator::ByKey(Arc::clone(ordering)),
            (None, Insertion::Combine(_)) => KeyComparator::ByHash,
            (None, Insertion::Append(_)) => KeyComparator::ByPartition,
        }
    }

    /// Insert every record, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by `records`, or a spill failure.
    pub fn insert_all(&mut self, records: impl Iterator<Item = Result<(K, V)>>) -> Result<()> {
        for record in records {
            let (k, v) = record?;
            self.insert(k, v)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if a spill triggered by this insert fails.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.tracker.add_element_read();
        let partition = self.partitioner.as_ref().map_or(0, |p| p.partition(&key));
        match &self.insertion {
            Insertion::Combine(agg) => match self.map.entry((partition, key)) {
                Entry::Occupied(mut e) => agg.merge_value(e.get_mut(), value),
                Entry::Vacant(e) => {
                    e.insert(agg.create_combiner(value));
                }
            },
            Insertion::Append(convert) => self.buffer.push((partition, key, convert(value))),
        }
        let (map, buffer) = (&self.map, &self.buffer);
        self.size.after_update(|| {
            if map.is_empty() {
                estimate_records_size(buffer.iter(), buffer.len(), size_of::<(usize, K, C)>())
            } else {
                estimate_records_size(map.iter(), map.len(), size_of::<((usize, K), C)>())
            }
        });
        self.maybe_spill()
    }

    fn maybe_spill(&mut self) -> Result<()> {
        let current = self.size.estimate_size();
        if current > self.peak_memory_used {
            self.peak_memory_used = current;
            self.ctx.metrics().update_peak_execution_memory(current);
        }
        if self.tracker.should_spill(current) {
            self.spill(current)?;
            self.tracker.spilled();
        }
        Ok(())
    }

    fn take_in_memory(&mut self) -> Vec<(usize, K, C)> {
        if self.map.is_empty() {
            std::mem::take(&mut self.buffer)
        } else {
            self.map.drain().map(|((p, k), c)| (p, k, c)).collect()
        }
    }

    fn spill(&mut self, estimated_size: u64) -> Result<()> {
        let mut records = self.take_in_memory();
        self.comparator().sort(&mut records);
        let (path, bytes) = self.write_run(&records)?;
        debug!(
            "Task {} spilled {} records ({estimated_size} bytes in memory, {bytes} on disk) to {}; spill #{}",
            self.ctx.task_attempt_id(),
            records.len(),
            path.display(),
            self.spills.len() + 1
        );
        self.spills.push(path);
        self.memory_bytes_spilled += estimated_size;
        self.disk_bytes_spilled += bytes;
        self.ctx.metrics().inc_memory_bytes_spilled(estimated_size);
        self.ctx.metrics().inc_disk_bytes_spilled(bytes);
        self.size.reset();
        Ok(())
    }

    fn write_run(&self, records: &[(usize, K, C)]) -> Result<(TempPath, u64)> {
        let (file, path) = self.disk.create_temp_local_file()?.into_parts();
        let mut out = CountingWriter::new(BufWriter::with_capacity(self.file_buffer_size, file));
        {
            let compressed = self
                .spill_codec
                .compressed_output(Box::new(&mut out))
                .context("open spill stream")?;
            let mut w = self.serializer.writer(compressed);
            for (p, k, c) in records {
                #[allow(clippy::cast_possible_truncation)]
                w.write(&(*p as u32, k, c))?;
            }
            w.into_inner()?.finish().context("finish spill stream")?;
        }
        out.flush()
            .with_context(|| format!("write spill {}", path.display()))?;
        Ok((path, out.count()))
    }

    fn open_run(&self, path: &Path) -> Result<Run<K, C>> {
        let file = File::open(path).with_context(|| format!("open spill {}", path.display()))?;
        let input = self
            .spill_codec
            .compressed_input(Box::new(BufReader::with_capacity(self.file_buffer_size, file)))?;
        let reader = self.serializer.reader::<(u32, K, C), _>(input);
        Ok(Box::new(reader.map(|r| r.map(|(p, k, c)| (p as usize, k, c)))))
    }

    /// Merge spills and in-memory records into one sorted stream. Spill files
    /// live until the returned iterator is dropped or stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if a spill file cannot be opened.
    pub fn into_sorted(mut self) -> Result<SortedRecords<K, C>> {
        let cmp = self.comparator();
        let mut records = self.take_in_memory();
        cmp.sort(&mut records);
        let spills = std::mem::take(&mut self.spills);
        if spills.is_empty() {
            return Ok(SortedRecords { inner: Sorted::Memory(records.into_iter()), spills });
        }
        let mut runs = Vec::with_capacity(spills.len() + 1);
        for path in &spills {
            runs.push(self.open_run(path)?);
        }
        runs.push(Box::new(records.into_iter().map(Ok)) as Run<K, C>);
        let combine = match &self.insertion {
            Insertion::Combine(agg) => {
                let agg = Arc::clone(agg);
                Some(Arc::new(move |acc: &mut C, other: C| agg.merge_combiners(acc, other))
                    as MergeCombiners<C>)
            }
            Insertion::Append(_) => None,
        };
        debug!(
            "Task {} merging {} spill files with in-memory data",
            self.ctx.task_attempt_id(),
            spills.len()
        );
        let merger = Merger::new(runs, Arc::new(cmp), combine)?;
        Ok(SortedRecords { inner: Sorted::Merged(merger), spills })
    }

    /// Drop in-memory data and delete spill files. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.map.clear();
        self.buffer.clear();
        delete_spills(&mut self.spills);
        self.tracker.release_memory();
    }
}

fn delete_spills(spills: &mut Vec<TempPath>) {
    for path in spills.drain(..) {
        let display = path.to_path_buf();
        if let Err(e) = path.close() {
            warn!("Error deleting spill file {}: {e}", display.display());
        }
    }
}

enum Sorted<K, C> {
    Memory(std::vec::IntoIter<(usize, K, C)>),
    Merged(Merger<K, C>),
}

/// Sorted `(partition, key, combiner)` output of an [`ExternalSorter`].
pub struct SortedRecords<K, C> {
    inner: Sorted<K, C>,
    spills: Vec<TempPath>,
}

impl<K, C> SortedRecords<K, C> {
    /// Stop early and delete spill files now.
    pub fn stop(&mut self) {
        self.inner = Sorted::Memory(Vec::new().into_iter());
        delete_spills(&mut self.spills);
    }
}

impl<K: ShuffleKey, C> Iterator for SortedRecords<K, C> {
    type Item = Result<(usize, K, C)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Sorted::Memory(records) => records.next().map(Ok),
            Sorted::Merged(merger) => merger.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiners::Sum;
    use crate::dependency::natural_order;
    use crate::partitioner::HashPartitioner;

    fn setup(force_spill_after: usize) -> Result<(tempfile::TempDir, ShuffleConf, Arc<DiskBlockManager>)> {
        let dir = tempfile::tempdir()?;
        let conf = ShuffleConf {
            local_dirs: vec![dir.path().to_path_buf()],
            num_elements_force_spill_threshold: force_spill_after,
            ..Default::default()
        };
        let disk = Arc::new(DiskBlockManager::new(&conf)?);
        Ok((dir, conf, disk))
    }

    fn summed(force_spill_after: usize) -> Result<(Vec<(usize, u32, u64)>, usize)> {
        let (_dir, conf, disk) = setup(force_spill_after)?;
        let agg: Arc<dyn Aggregator<u64, u64>> = Arc::new(Sum::<u64>::new());
        let mut sorter = ExternalSorter::new(TaskContext::standalone(0), disk, &conf, Insertion::Combine(agg))?
            .with_partitioner(Arc::new(HashPartitioner::new(3)))
            .with_ordering(natural_order());
        sorter.insert_all((0..500u64).map(|i| Ok(((i % 37) as u32, i))))?;
        let spills = sorter.spill_count();
        let out = sorter.into_sorted()?.collect::<Result<Vec<_>>>()?;
        Ok((out, spills))
    }

    #[test]
    fn forced_spills_produce_the_same_result() -> Result<()> {
        let (in_memory, none) = summed(usize::MAX)?;
        let (spilled, some) = summed(40)?;
        assert_eq!(none, 0);
        assert!(some > 0);
        assert_eq!(in_memory, spilled);
        assert_eq!(in_memory.len(), 37);
        let total: u64 = spilled.iter().map(|(_, _, c)| c).sum();
        assert_eq!(total, (0..500u64).sum::<u64>());
        Ok(())
    }

    #[test]
    fn empty_input_yields_nothing_and_never_spills() -> Result<()> {
        let (_dir, conf, disk) = setup(1)?;
        let sorter = ExternalSorter::<u32, u32, u32>::appending(TaskContext::standalone(0), disk, &conf)?;
        assert_eq!(sorter.spill_count(), 0);
        assert_eq!(sorter.into_sorted()?.count(), 0);
        Ok(())
    }

    #[test]
    fn dropping_sorted_output_deletes_spills() -> Result<()> {
        let (_dir, conf, disk) = setup(10)?;
        let mut sorter =
            ExternalSorter::<u32, u32, u32>::appending(TaskContext::standalone(0), Arc::clone(&disk), &conf)?;
        sorter.insert_all((0..100u32).map(|i| Ok((i, i))))?;
        assert!(!disk.temp_files()?.is_empty());
        let mut sorted = sorter.into_sorted()?;
        assert!(sorted.next().is_some());
        sorted.stop();
        assert!(disk.temp_files()?.is_empty());
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let (_dir, conf, disk) = setup(5)?;
        let mut sorter =
            ExternalSorter::<u32, u32, u32>::appending(TaskContext::standalone(0), Arc::clone(&disk), &conf)?;
        sorter.insert_all((0..20u32).map(|i| Ok((i, i))))?;
        sorter.stop();
        sorter.stop();
        assert!(disk.temp_files()?.is_empty());
        Ok(())
    }
}
