//! Partition-only sorter over serialized records.

use crate::checksum::{ChecksumWriter, partition_checksum};
use crate::config::{MAX_SERIALIZED_MODE_PARTITIONS, ShuffleConf};
use crate::disk::DiskBlockManager;
use crate::io::compression::{CompressionCodec, FinishWrite, resolve_codec};
use crate::memory::SpillTracker;
use crate::task::TaskContext;
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tempfile::TempPath;

const OFFSET_BITS: u32 = 40;
const MAX_PAGE_OFFSET: u64 = (1 << OFFSET_BITS) - 1;
const LEN_PREFIX: usize = 4;

/// A record's partition id and page offset packed into one word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedRecordPointer(u64);

impl PackedRecordPointer {
    pub fn new(partition: usize, offset: u64) -> Self {
        debug_assert!(partition < MAX_SERIALIZED_MODE_PARTITIONS);
        debug_assert!(offset <= MAX_PAGE_OFFSET);
        Self(((partition as u64) << OFFSET_BITS) | (offset & MAX_PAGE_OFFSET))
    }

    pub fn partition(self) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let p = (self.0 >> OFFSET_BITS) as usize;
        p
    }

    pub fn offset(self) -> u64 {
        self.0 & MAX_PAGE_OFFSET
    }
}

/// One spill file: per-partition compressed segments laid out in partition order.
#[derive(Debug)]
pub struct SpillInfo {
    pub path: TempPath,
    pub partition_lengths: Vec<u64>,
    pub checksums: Vec<u64>,
}

/// Buffers framed records in a byte page and spills them sorted by partition.
///
/// Records are never decoded. Each spill writes one independently compressed
/// segment per non-empty partition with the shuffle codec, so spills can later
/// be merged by copying segments.
pub struct ShuffleExternalSorter {
    ctx: Arc<TaskContext>,
    disk: Arc<DiskBlockManager>,
    num_partitions: usize,
    codec: Arc<dyn CompressionCodec>,
    file_buffer_size: usize,
    page: Vec<u8>,
    pointers: Vec<PackedRecordPointer>,
    tracker: SpillTracker,
    spills: Vec<SpillInfo>,
    peak_memory_used: u64,
}

impl ShuffleExternalSorter {
    /// # Errors
    ///
    /// Returns an error if `num_partitions` exceeds what a packed pointer can
    /// address or the shuffle codec is unknown.
    pub fn new(
        ctx: Arc<TaskContext>,
        disk: Arc<DiskBlockManager>,
        conf: &ShuffleConf,
        num_partitions: usize,
    ) -> Result<Self> {
        if num_partitions > MAX_SERIALIZED_MODE_PARTITIONS {
            bail!(
                "serialized sort supports at most {MAX_SERIALIZED_MODE_PARTITIONS} partitions, got {num_partitions}"
            );
        }
        let tracker = SpillTracker::new(
            Arc::clone(ctx.memory_pool()),
            ctx.task_attempt_id(),
            conf.initial_memory_threshold,
            conf.num_elements_force_spill_threshold,
        );
        Ok(Self {
            ctx,
            disk,
            num_partitions,
            codec: resolve_codec(conf.compress, &conf.codec)?,
            file_buffer_size: conf.file_buffer_size,
            page: Vec::new(),
            pointers: Vec::new(),
            tracker,
            spills: Vec::new(),
            peak_memory_used: 0,
        })
    }

    fn memory_used(&self) -> u64 {
        (self.page.len() + self.pointers.len() * size_of::<PackedRecordPointer>()) as u64
    }

    pub fn peak_memory_used_bytes(&self) -> u64 {
        self.peak_memory_used
    }

    pub fn spill_count(&self) -> usize {
        self.spills.len()
    }

    /// Buffer one framed record for `partition`, spilling first if memory is short.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is out of range, the record is too
    /// large, or a spill fails.
    pub fn insert_record(&mut self, framed: &[u8], partition: usize) -> Result<()> {
        if partition >= self.num_partitions {
            bail!("partition {partition} out of range for {} partitions", self.num_partitions);
        }
        let len = u32::try_from(framed.len())
            .with_context(|| format!("record of {} bytes is too large", framed.len()))?;
        self.tracker.add_element_read();
        let current = self.memory_used();
        if self.tracker.should_spill(current) {
            self.spill()?;
            self.tracker.spilled();
        }
        if (self.page.len() + LEN_PREFIX + framed.len()) as u64 > MAX_PAGE_OFFSET {
            self.spill()?;
        }
        let offset = self.page.len() as u64;
        self.page.extend_from_slice(&len.to_le_bytes());
        self.page.extend_from_slice(framed);
        self.pointers.push(PackedRecordPointer::new(partition, offset));
        let used = self.memory_used();
        if used > self.peak_memory_used {
            self.peak_memory_used = used;
            self.ctx.metrics().update_peak_execution_memory(used);
        }
        Ok(())
    }

    fn record_at(page: &[u8], pointer: PackedRecordPointer) -> &[u8] {
        #[allow(clippy::cast_possible_truncation)]
        let at = pointer.offset() as usize;
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(&page[at..at + LEN_PREFIX]);
        let start = at + LEN_PREFIX;
        &page[start..start + u32::from_le_bytes(len) as usize]
    }

    /// Write buffered records to a new spill file.
    fn spill(&mut self) -> Result<()> {
        if self.pointers.is_empty() {
            return Ok(());
        }
        let memory = self.memory_used();
        // Stable, so records keep insertion order within a partition.
        self.pointers.sort_by_key(|p| p.partition());

        let (file, path) = self.disk.create_temp_shuffle_file()?.into_parts();
        let mut out = ChecksumWriter::new(BufWriter::with_capacity(self.file_buffer_size, file));
        let mut partition_lengths = vec![0u64; self.num_partitions];
        let mut checksums = vec![partition_checksum(&[]); self.num_partitions];
        let mut i = 0;
        while i < self.pointers.len() {
            let partition = self.pointers[i].partition();
            {
                let mut segment = self.codec.compressed_output(Box::new(&mut out))?;
                while i < self.pointers.len() && self.pointers[i].partition() == partition {
                    segment.write_all(Self::record_at(&self.page, self.pointers[i]))?;
                    i += 1;
                }
                segment
                    .finish()
                    .with_context(|| format!("finish partition {partition} of {}", path.display()))?;
            }
            let (len, sum) = out.finish_segment();
            partition_lengths[partition] = len;
            checksums[partition] = sum;
        }
        out.flush()
            .with_context(|| format!("write spill {}", path.display()))?;
        let bytes = out.total();

        debug!(
            "Task {} spilled {} serialized records ({memory} bytes in memory, {bytes} on disk) to {}",
            self.ctx.task_attempt_id(),
            self.pointers.len(),
            path.display()
        );
        self.ctx.metrics().inc_memory_bytes_spilled(memory);
        self.ctx.metrics().inc_disk_bytes_spilled(bytes);
        self.spills.push(SpillInfo { path, partition_lengths, checksums });
        self.page.clear();
        self.pointers.clear();
        Ok(())
    }

    /// Spill what is still buffered and hand over every spill file.
    ///
    /// # Errors
    ///
    /// Returns an error if the final spill fails.
    pub fn close_and_get_spills(mut self) -> Result<Vec<SpillInfo>> {
        self.spill()?;
        self.tracker.release_memory();
        Ok(std::mem::take(&mut self.spills))
    }

    /// Discard buffered records and delete spill files.
    pub fn cleanup(&mut self) {
        self.page = Vec::new();
        self.pointers = Vec::new();
        for spill in self.spills.drain(..) {
            let display = spill.path.to_path_buf();
            if let Err(e) = spill.path.close() {
                warn!("Error deleting spill file {}: {e}", display.display());
            }
        }
        self.tracker.release_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serializer::RecordSerializer;

    #[test]
    fn pointer_packs_partition_and_offset() {
        let p = PackedRecordPointer::new(MAX_SERIALIZED_MODE_PARTITIONS - 1, MAX_PAGE_OFFSET);
        assert_eq!(p.partition(), MAX_SERIALIZED_MODE_PARTITIONS - 1);
        assert_eq!(p.offset(), MAX_PAGE_OFFSET);
        let q = PackedRecordPointer::new(3, 12345);
        assert_eq!((q.partition(), q.offset()), (3, 12345));
    }

    #[test]
    fn spills_keep_partition_order_and_lengths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = ShuffleConf {
            local_dirs: vec![dir.path().to_path_buf()],
            compress: false,
            num_elements_force_spill_threshold: 10,
            ..Default::default()
        };
        let disk = Arc::new(DiskBlockManager::new(&conf)?);
        let mut sorter = ShuffleExternalSorter::new(TaskContext::standalone(0), disk, &conf, 4)?;
        let ser = RecordSerializer::Postcard;
        let mut expected = [0u64; 4];
        for i in 0..25u32 {
            let mut framed = Vec::new();
            ser.serialize_record(&(i, i), &mut framed)?;
            let partition = (i % 3) as usize;
            expected[partition] += framed.len() as u64;
            sorter.insert_record(&framed, partition)?;
        }
        let spills = sorter.close_and_get_spills()?;
        assert!(spills.len() > 1);
        let mut totals = [0u64; 4];
        for s in &spills {
            assert_eq!(s.partition_lengths[3], 0);
            assert_eq!(std::fs::metadata(&s.path)?.len(), s.partition_lengths.iter().sum::<u64>());
            for (t, l) in totals.iter_mut().zip(&s.partition_lengths) {
                *t += l;
            }
        }
        assert_eq!(totals, expected);
        Ok(())
    }

    #[test]
    fn rejects_too_many_partitions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = ShuffleConf { local_dirs: vec![dir.path().to_path_buf()], ..Default::default() };
        let disk = Arc::new(DiskBlockManager::new(&conf)?);
        let sorter = ShuffleExternalSorter::new(
            TaskContext::standalone(0),
            disk,
            &conf,
            MAX_SERIALIZED_MODE_PARTITIONS + 1,
        );
        assert!(sorter.is_err());
        Ok(())
    }
}
