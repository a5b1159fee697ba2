//! General-purpose writer: typed records, optional map-side combine.

use super::{ShuffleWriter, WriteContext, finish_stop, write_sorted_partitions};
use crate::checksum::ChecksumWriter;
use crate::dependency::{MapStatus, ShuffleData, ShuffleDependency, ShuffleKey};
use crate::io::compression::resolve_codec;
use crate::sort::{ExternalSorter, Insertion, SortedRecords};
use anyhow::{Context, Result};
use log::debug;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;

/// With map-side combine the output carries combiners, otherwise raw values.
enum MapSorter<K, V, C> {
    Combining(ExternalSorter<K, V, C>),
    Plain(ExternalSorter<K, V, V>),
}

/// Sorts typed records by partition in an [`ExternalSorter`], combining
/// values per key first when the dependency asks for map-side combine.
pub struct SortShuffleWriter<K, V, C> {
    env: WriteContext,
    dependency: Arc<ShuffleDependency<K, V, C>>,
    partition_lengths: Vec<u64>,
    map_status: Option<MapStatus>,
    stopping: bool,
}

impl<K: ShuffleKey, V: ShuffleData, C: ShuffleData> SortShuffleWriter<K, V, C> {
    pub fn new(env: WriteContext, dependency: Arc<ShuffleDependency<K, V, C>>) -> Self {
        Self { env, dependency, partition_lengths: Vec::new(), map_status: None, stopping: false }
    }

    fn sorter(&self) -> Result<MapSorter<K, V, C>> {
        let dep = &self.dependency;
        let task = Arc::clone(&self.env.task);
        let disk = Arc::clone(self.env.resolver.disk());
        if dep.map_side_combine() {
            let aggregator = dep
                .aggregator()
                .context("map-side combine requires an aggregator")?;
            let mut sorter =
                ExternalSorter::new(task, disk, &self.env.conf, Insertion::Combine(Arc::clone(aggregator)))?
                    .with_partitioner(Arc::clone(dep.partitioner()))
                    .with_serializer(dep.serializer());
            if let Some(ordering) = dep.key_ordering() {
                sorter = sorter.with_ordering(Arc::clone(ordering));
            }
            Ok(MapSorter::Combining(sorter))
        } else {
            // Without combining, key order only matters to the reduce side.
            Ok(MapSorter::Plain(
                ExternalSorter::appending(task, disk, &self.env.conf)?
                    .with_partitioner(Arc::clone(dep.partitioner()))
                    .with_serializer(dep.serializer()),
            ))
        }
    }

    fn write_output<X: ShuffleData>(&mut self, sorted: SortedRecords<K, X>, started: Instant) -> Result<()> {
        let shuffle_id = self.dependency.shuffle_id();
        let num_partitions = self.dependency.num_partitions();
        let codec = resolve_codec(self.env.conf.compress, &self.env.conf.codec)?;
        let (file, data_tmp) = self
            .env
            .resolver
            .create_temp_data_file(shuffle_id, self.env.map_id)?
            .into_parts();
        let mut out =
            ChecksumWriter::new(BufWriter::with_capacity(self.env.conf.file_buffer_size, file));
        let (lengths, checksums) = write_sorted_partitions(
            sorted,
            &mut out,
            num_partitions,
            codec.as_ref(),
            self.dependency.serializer(),
            self.env.metrics(),
        )?;
        out.flush()
            .with_context(|| format!("write {}", data_tmp.display()))?;
        drop(out);

        let committed = self.env.resolver.write_metadata_and_commit(
            shuffle_id,
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
            "Sort writer committed shuffle {shuffle_id} map {}: {bytes} bytes in {num_partitions} partitions",
            self.env.map_id
        );
        self.map_status = Some(MapStatus::new(self.env.location.clone(), &committed, self.env.map_id));
        self.partition_lengths = committed;
        Ok(())
    }
}

impl<K: ShuffleKey, V: ShuffleData, C: ShuffleData> ShuffleWriter<K, V> for SortShuffleWriter<K, V, C> {
    fn write(&mut self, records: &mut dyn Iterator<Item = Result<(K, V)>>) -> Result<()> {
        let started = Instant::now();
        match self.sorter()? {
            MapSorter::Combining(mut sorter) => {
                if let Err(e) = sorter.insert_all(records) {
                    sorter.stop();
                    return Err(e);
                }
                let sorted = sorter.into_sorted()?;
                self.write_output(sorted, started)
            }
            MapSorter::Plain(mut sorter) => {
                if let Err(e) = sorter.insert_all(records) {
                    sorter.stop();
                    return Err(e);
                }
                let sorted = sorter.into_sorted()?;
                self.write_output(sorted, started)
            }
        }
    }

    fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        // The sorter's spill files are gone once write returns.
        finish_stop(&mut self.stopping, &mut self.map_status, success, || {})
    }

    fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }
}
