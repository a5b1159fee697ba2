//! Writer for relocatable serializers: records are sorted as bytes.

use super::{ShuffleWriter, WriteContext, finish_stop};
use crate::checksum::{ChecksumWriter, partition_checksum};
use crate::dependency::{MapStatus, ShuffleData, ShuffleDependency, ShuffleKey};
use crate::io::compression::{CompressionCodec, FinishWrite, resolve_codec};
use crate::io::serializer::RecordSerializer;
use crate::partitioner::Partitioner;
use crate::sort::{ShuffleExternalSorter, SpillInfo};
use anyhow::{Context, Result, bail};
use log::debug;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;

/// Serializes every record on arrival and sorts the bytes by partition in a
/// [`ShuffleExternalSorter`]. Spills are merged into the data file by copying
/// compressed segments when the codec allows it.
pub struct UnsafeShuffleWriter<K, V> {
    env: WriteContext,
    shuffle_id: u32,
    partitioner: Arc<dyn Partitioner<K>>,
    serializer: RecordSerializer,
    partition_lengths: Vec<u64>,
    map_status: Option<MapStatus>,
    stopping: bool,
    _values: PhantomData<fn(V)>,
}

struct MergedOutput {
    data: Option<TempPath>,
    lengths: Vec<u64>,
    checksums: Vec<u64>,
}

impl<K: ShuffleKey, V: ShuffleData> UnsafeShuffleWriter<K, V> {
    /// # Errors
    ///
    /// Returns an error if the dependency's serializer cannot relocate records.
    pub fn new<C>(env: WriteContext, dependency: &ShuffleDependency<K, V, C>) -> Result<Self> {
        if !dependency.serializer().supports_relocation() {
            bail!(
                "serializer {} does not support relocation of serialized records",
                dependency.serializer().name()
            );
        }
        Ok(Self {
            env,
            shuffle_id: dependency.shuffle_id(),
            partitioner: Arc::clone(dependency.partitioner()),
            serializer: dependency.serializer(),
            partition_lengths: Vec::new(),
            map_status: None,
            stopping: false,
            _values: PhantomData,
        })
    }

    fn insert_records(
        &self,
        sorter: &mut ShuffleExternalSorter,
        records: &mut dyn Iterator<Item = Result<(K, V)>>,
    ) -> Result<()> {
        let mut scratch = Vec::new();
        let mut count = 0;
        for record in records {
            let (key, value) = record?;
            let partition = self.partitioner.partition(&key);
            scratch.clear();
            self.serializer.serialize_record(&(key, value), &mut scratch)?;
            sorter.insert_record(&scratch, partition)?;
            count += 1;
        }
        self.env.metrics().inc_records_written(count);
        Ok(())
    }

    fn merge_spills(&self, mut spills: Vec<SpillInfo>, num_partitions: usize) -> Result<MergedOutput> {
        match spills.len() {
            0 => Ok(MergedOutput {
                data: None,
                lengths: vec![0; num_partitions],
                checksums: vec![partition_checksum(&[]); num_partitions],
            }),
            1 => {
                let SpillInfo { path, partition_lengths, checksums } = spills.remove(0);
                debug!("Single spill becomes the data file of shuffle {} map {}", self.shuffle_id, self.env.map_id);
                Ok(MergedOutput { data: Some(path), lengths: partition_lengths, checksums })
            }
            n => {
                let codec = resolve_codec(self.env.conf.compress, &self.env.conf.codec)?;
                let (file, data) = self
                    .env
                    .resolver
                    .create_temp_data_file(self.shuffle_id, self.env.map_id)?
                    .into_parts();
                let mut out = ChecksumWriter::new(BufWriter::with_capacity(
                    self.env.conf.file_buffer_size,
                    file,
                ));
                let mut inputs = spills
                    .iter()
                    .map(|s| {
                        File::open(&s.path)
                            .map(|f| BufReader::with_capacity(self.env.conf.file_buffer_size, f))
                            .with_context(|| format!("open spill {}", s.path.display()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let (lengths, checksums) = if codec.supports_concatenation() {
                    debug!("Merging {n} spills of shuffle {} map {} by segment transfer", self.shuffle_id, self.env.map_id);
                    merge_by_transfer(&spills, &mut inputs, &mut out, num_partitions)?
                } else {
                    debug!("Merging {n} spills of shuffle {} map {} by decompressing streams", self.shuffle_id, self.env.map_id);
                    merge_by_streams(&spills, &mut inputs, &mut out, num_partitions, codec.as_ref())?
                };
                out.flush().with_context(|| format!("write {}", data.display()))?;
                Ok(MergedOutput { data: Some(data), lengths, checksums })
            }
        }
    }

    fn write_records(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()> {
        let num_partitions = self.partitioner.num_partitions();
        let started = Instant::now();
        let mut sorter = ShuffleExternalSorter::new(
            Arc::clone(&self.env.task),
            Arc::clone(self.env.resolver.disk()),
            &self.env.conf,
            num_partitions,
        )?;
        if let Err(e) = self.insert_records(&mut sorter, records) {
            sorter.cleanup();
            return Err(e);
        }
        let spills = sorter.close_and_get_spills()?;
        let merged = self.merge_spills(spills, num_partitions)?;
        let committed = self.env.resolver.write_metadata_and_commit(
            self.shuffle_id,
            self.env.map_id,
            &merged.lengths,
            self.env.checksums(&merged.checksums),
            merged.data,
        )?;
        let bytes: u64 = committed.iter().sum();
        self.env.metrics().inc_bytes_written(bytes);
        #[allow(clippy::cast_possible_truncation)]
        self.env.metrics().inc_write_time(started.elapsed().as_nanos() as u64);
        self.map_status = Some(MapStatus::new(self.env.location.clone(), &committed, self.env.map_id));
        self.partition_lengths = committed;
        Ok(())
    }
}

/// Copy each partition's raw segments from every spill, in spill order.
fn merge_by_transfer<W: Write>(
    spills: &[SpillInfo],
    inputs: &mut [BufReader<File>],
    out: &mut ChecksumWriter<W>,
    num_partitions: usize,
) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut lengths = Vec::with_capacity(num_partitions);
    let mut checksums = Vec::with_capacity(num_partitions);
    for partition in 0..num_partitions {
        for (spill, input) in spills.iter().zip(inputs.iter_mut()) {
            let len = spill.partition_lengths[partition];
            let copied = io::copy(&mut input.by_ref().take(len), out)?;
            if copied != len {
                bail!("spill {} is truncated in partition {partition}", spill.path.display());
            }
        }
        let (len, sum) = out.finish_segment();
        lengths.push(len);
        checksums.push(sum);
    }
    Ok((lengths, checksums))
}

/// Decompress each partition's segments and recompress them as one stream.
fn merge_by_streams<W: Write + Send>(
    spills: &[SpillInfo],
    inputs: &mut [BufReader<File>],
    out: &mut ChecksumWriter<W>,
    num_partitions: usize,
    codec: &dyn CompressionCodec,
) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut lengths = Vec::with_capacity(num_partitions);
    let mut checksums = Vec::with_capacity(num_partitions);
    for partition in 0..num_partitions {
        if spills.iter().any(|s| s.partition_lengths[partition] > 0) {
            let mut segment = codec.compressed_output(Box::new(&mut *out))?;
            for (spill, input) in spills.iter().zip(inputs.iter_mut()) {
                let len = spill.partition_lengths[partition];
                if len == 0 {
                    continue;
                }
                let mut raw = input.by_ref().take(len);
                {
                    let mut decoded = codec.compressed_input(Box::new(&mut raw))?;
                    io::copy(&mut decoded, &mut segment).with_context(|| {
                        format!("merge partition {partition} of {}", spill.path.display())
                    })?;
                }
                // Skip whatever the decoder left unread so the next segment lines up.
                io::copy(&mut raw, &mut io::sink())?;
            }
            segment
                .finish()
                .with_context(|| format!("finish merged partition {partition}"))?;
        }
        let (len, sum) = out.finish_segment();
        lengths.push(len);
        checksums.push(sum);
    }
    Ok((lengths, checksums))
}

impl<K: ShuffleKey, V: ShuffleData> ShuffleWriter<K, V> for UnsafeShuffleWriter<K, V> {
    fn write(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()> {
        self.write_records(records)
    }

    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        // Spill files and temp data files are deleted when write returns.
        finish_stop(&mut self.stopping, &mut self.map_status, success, || {})
    }

    fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }
}
