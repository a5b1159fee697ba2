//! Writer for small fan-out shuffles without map-side combine.

use super::{ShuffleWriter, WriteContext, finish_stop};
use crate::checksum::ChecksumWriter;
use crate::dependency::{MapStatus, ShuffleData, ShuffleDependency, ShuffleKey};
use crate::io::compression::{CompressionCodec, FinishWrite, resolve_codec};
use crate::io::serializer::{RecordSerializer, RecordWriter};
use crate::partitioner::Partitioner;
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;

enum Sink {
    /// Opened but nothing written yet; stays 0 bytes if no record arrives.
    Idle(File),
    Open(RecordWriter<Box<dyn FinishWrite>>),
    Closed,
}

struct PartitionFile {
    path: TempPath,
    sink: Sink,
}

impl PartitionFile {
    fn write<T: serde::Serialize>(
        &mut self,
        record: &T,
        codec: &dyn CompressionCodec,
        serializer: RecordSerializer,
        buffer_size: usize,
    ) -> Result<()> {
        self.sink = match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Idle(file) => Sink::Open(serializer.writer(
                codec.compressed_output(Box::new(BufWriter::with_capacity(buffer_size, file)))?,
            )),
            other => other,
        };
        match &mut self.sink {
            Sink::Open(w) => w.write(record),
            _ => bail!("partition file {} is already closed", self.path.display()),
        }
    }

    /// Finish the compressed stream and return the number of records written.
    fn close(&mut self) -> Result<u64> {
        match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Open(w) => {
                let records = w.records_written();
                w.into_inner()?
                    .finish()
                    .with_context(|| format!("finish partition file {}", self.path.display()))?;
                Ok(records)
            }
            Sink::Idle(_) | Sink::Closed => Ok(0),
        }
    }
}

/// Writes one temporary file per reduce partition and concatenates them.
///
/// No sorting and no spilling: the cost is one open file per partition, which
/// is why this writer is only chosen below the bypass-merge threshold.
pub struct BypassMergeSortShuffleWriter<K, V> {
    env: WriteContext,
    shuffle_id: u32,
    partitioner: Arc<dyn Partitioner<K>>,
    serializer: RecordSerializer,
    files: Vec<PartitionFile>,
    partition_lengths: Vec<u64>,
    map_status: Option<MapStatus>,
    stopping: bool,
    _values: PhantomData<fn(V)>,
}

impl<K: ShuffleKey, V: ShuffleData> BypassMergeSortShuffleWriter<K, V> {
    pub fn new<C>(env: WriteContext, dependency: &ShuffleDependency<K, V, C>) -> Self {
        Self {
            env,
            shuffle_id: dependency.shuffle_id(),
            partitioner: Arc::clone(dependency.partitioner()),
            serializer: dependency.serializer(),
            files: Vec::new(),
            partition_lengths: Vec::new(),
            map_status: None,
            stopping: false,
            _values: PhantomData,
        }
    }

    fn open_partition_files(&mut self, num_partitions: usize) -> Result<()> {
        let disk = self.env.resolver.disk();
        self.files = (0..num_partitions)
            .map(|_| {
                let (file, path) = disk.create_temp_shuffle_file()?.into_parts();
                Ok(PartitionFile { path, sink: Sink::Idle(file) })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Concatenate the closed partition files into a temp data file.
    fn concatenate(&mut self) -> Result<(TempPath, Vec<u64>, Vec<u64>)> {
        let (file, data_tmp) = self
            .env
            .resolver
            .create_temp_data_file(self.shuffle_id, self.env.map_id)?
            .into_parts();
        let mut out =
            ChecksumWriter::new(BufWriter::with_capacity(self.env.conf.file_buffer_size, file));
        let mut lengths = Vec::with_capacity(self.files.len());
        let mut checksums = Vec::with_capacity(self.files.len());
        for part in self.files.drain(..) {
            let input = File::open(&part.path)
                .with_context(|| format!("open partition file {}", part.path.display()))?;
            io::copy(&mut BufReader::new(input), &mut out)
                .with_context(|| format!("copy partition file {}", part.path.display()))?;
            let (len, sum) = out.finish_segment();
            lengths.push(len);
            checksums.push(sum);
            delete_quietly(part.path);
        }
        out.flush()
            .with_context(|| format!("write {}", data_tmp.display()))?;
        Ok((data_tmp, lengths, checksums))
    }

    fn write_records(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()> {
        let num_partitions = self.partitioner.num_partitions();
        let codec = resolve_codec(self.env.conf.compress, &self.env.conf.codec)?;
        self.open_partition_files(num_partitions)?;

        let started = Instant::now();
        for record in records {
            let (key, value) = record?;
            let partition = self.partitioner.partition(&key);
            let Some(part) = self.files.get_mut(partition) else {
                bail!("partitioner returned {partition} for {num_partitions} partitions");
            };
            part.write(&(key, value), codec.as_ref(), self.serializer, self.env.conf.file_buffer_size)?;
        }
        let mut records_written = 0;
        for part in &mut self.files {
            records_written += part.close()?;
        }
        self.env.metrics().inc_records_written(records_written);

        let (data_tmp, lengths, checksums) = self.concatenate()?;
        let committed = self.env.resolver.write_metadata_and_commit(
            self.shuffle_id,
            self.env.map_id,
            &lengths,
            self.env.checksums(&checksums),
            Some(data_tmp),
        )?;
        let bytes: u64 = committed.iter().sum();
        self.env.metrics().inc_bytes_written(bytes);
        #[allow(clippy::cast_possible_truncation)]
        self.env.metrics().inc_write_time(started.elapsed().as_nanos() as u64);
        debug!(
            "Bypass writer committed shuffle {} map {}: {num_partitions} partitions, {records_written} records, {bytes} bytes",
            self.shuffle_id, self.env.map_id
        );
        self.map_status = Some(MapStatus::new(self.env.location.clone(), &committed, self.env.map_id));
        self.partition_lengths = committed;
        Ok(())
    }

    fn cleanup(&mut self) {
        for part in self.files.drain(..) {
            delete_quietly(part.path);
        }
    }
}

fn delete_quietly(path: TempPath) {
    let display = path.to_path_buf();
    if let Err(e) = path.close() {
        warn!("Error deleting partition file {}: {e}", display.display());
    }
}

impl<K: ShuffleKey, V: ShuffleData> ShuffleWriter<K, V> for BypassMergeSortShuffleWriter<K, V> {
    fn write(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()> {
        let result = self.write_records(records);
        if result.is_err() {
            self.cleanup();
        }
        result
    }

    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        let files = &mut self.files;
        finish_stop(&mut self.stopping, &mut self.map_status, success, || {
            for part in files.drain(..) {
                delete_quietly(part.path);
            }
        })
    }

    fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }
}
