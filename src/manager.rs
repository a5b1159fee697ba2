//! Entry point of the shuffle engine on one executor.
//!
//! [`SortShuffleManager`] registers shuffles, picks the write strategy of each
//! one, and builds writers for map tasks and readers for reduce tasks.
//!
//! Strategy selection, first match wins:
//!
//! 1. [`WriteStrategy::Bypass`]: no map-side combine and at most
//!    `bypass_merge_threshold` reduce partitions.
//! 2. [`WriteStrategy::SerializedSort`]: relocatable serializer, no aggregator
//!    and at most 2^24 reduce partitions.
//! 3. [`WriteStrategy::DeserializedSort`]: everything else.

use crate::block::BlockManagerId;
use crate::config::{MAX_SERIALIZED_MODE_PARTITIONS, ShuffleConf};
use crate::dependency::{ShuffleData, ShuffleDependency, ShuffleHandle, ShuffleKey, WriteStrategy};
use crate::disk::DiskBlockManager;
use crate::fetch::{BlockTransport, FetchSources, MapOutputTracker};
use crate::reader::BlockStoreShuffleReader;
use crate::resolver::IndexShuffleBlockResolver;
use crate::task::TaskContext;
use crate::writer::{
    BypassMergeSortShuffleWriter, ShuffleWriter, SortShuffleWriter, UnsafeShuffleWriter, WriteContext,
};
use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

/// Shuffles this executor has written map output for.
///
/// The first writer of a shuffle records its map count; every writer records
/// its map id so that unregistering can delete exactly those outputs.
#[derive(Debug, Default)]
pub struct ShuffleRegistry {
    shuffles: DashMap<u32, RegisteredShuffle>,
}

#[derive(Debug, Clone)]
pub struct RegisteredShuffle {
    pub num_maps: usize,
    pub map_ids: Vec<u64>,
}

impl ShuffleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a map task of a shuffle; the map count of the first call sticks.
    pub fn register_map(&self, shuffle_id: u32, num_maps: usize, map_id: u64) {
        let mut entry = self
            .shuffles
            .entry(shuffle_id)
            .or_insert_with(|| RegisteredShuffle { num_maps, map_ids: Vec::new() });
        if !entry.map_ids.contains(&map_id) {
            entry.map_ids.push(map_id);
        }
    }

    pub fn num_maps(&self, shuffle_id: u32) -> Option<usize> {
        self.shuffles.get(&shuffle_id).map(|e| e.num_maps)
    }

    pub fn remove(&self, shuffle_id: u32) -> Option<RegisteredShuffle> {
        self.shuffles.remove(&shuffle_id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.shuffles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shuffles.is_empty()
    }

    pub fn clear(&self) {
        self.shuffles.clear();
    }
}

/// Whether map tasks can skip sorting and write one file per partition.
pub fn should_bypass_merge_sort<K, V, C>(dep: &ShuffleDependency<K, V, C>, conf: &ShuffleConf) -> bool {
    !dep.map_side_combine() && dep.num_partitions() <= conf.bypass_merge_threshold
}

/// Whether map tasks can sort serialized records without decoding them.
pub fn can_use_serialized_shuffle<K, V, C>(dep: &ShuffleDependency<K, V, C>) -> bool {
    dep.serializer().supports_relocation()
        && dep.aggregator().is_none()
        && dep.num_partitions() <= MAX_SERIALIZED_MODE_PARTITIONS
}

pub fn select_write_strategy<K, V, C>(dep: &ShuffleDependency<K, V, C>, conf: &ShuffleConf) -> WriteStrategy {
    if should_bypass_merge_sort(dep, conf) {
        WriteStrategy::Bypass
    } else if can_use_serialized_shuffle(dep) {
        WriteStrategy::SerializedSort
    } else {
        WriteStrategy::DeserializedSort
    }
}

/// Sort-based shuffle manager of one executor.
pub struct SortShuffleManager {
    conf: Arc<ShuffleConf>,
    location: BlockManagerId,
    resolver: Arc<IndexShuffleBlockResolver>,
    registry: ShuffleRegistry,
    transport: Arc<dyn BlockTransport>,
    tracker: Arc<dyn MapOutputTracker>,
    fetch_pool: Arc<rayon::ThreadPool>,
}

impl SortShuffleManager {
    /// # Errors
    ///
    /// Returns an error if no local directory can be created or the fetch
    /// thread pool cannot be started.
    pub fn new(
        conf: ShuffleConf,
        location: BlockManagerId,
        transport: Arc<dyn BlockTransport>,
        tracker: Arc<dyn MapOutputTracker>,
    ) -> Result<Self> {
        if conf.fetch_threads == 0 {
            bail!("fetch_threads must be greater than zero");
        }
        let disk = Arc::new(DiskBlockManager::new(&conf)?);
        let executor = location.executor_id.clone();
        let fetch_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(conf.fetch_threads)
            .thread_name(move |i| format!("shuffle-fetch-{executor}-{i}"))
            .build()
            .context("start shuffle fetch threads")?;
        Ok(Self {
            conf: Arc::new(conf),
            location,
            resolver: Arc::new(IndexShuffleBlockResolver::new(disk)),
            registry: ShuffleRegistry::new(),
            transport,
            tracker,
            fetch_pool: Arc::new(fetch_pool),
        })
    }

    pub fn conf(&self) -> &ShuffleConf {
        &self.conf
    }

    pub fn location(&self) -> &BlockManagerId {
        &self.location
    }

    pub fn block_resolver(&self) -> &Arc<IndexShuffleBlockResolver> {
        &self.resolver
    }

    pub fn registry(&self) -> &ShuffleRegistry {
        &self.registry
    }

    /// Register a shuffle with `num_maps` map tasks and pick its write strategy.
    pub fn register_shuffle<K, V, C>(
        &self,
        dependency: ShuffleDependency<K, V, C>,
        num_maps: usize,
    ) -> ShuffleHandle<K, V, C> {
        let strategy = select_write_strategy(&dependency, &self.conf);
        info!(
            "Registered shuffle {} ({num_maps} maps, {} partitions) with strategy {strategy:?}",
            dependency.shuffle_id(),
            dependency.num_partitions()
        );
        ShuffleHandle {
            shuffle_id: dependency.shuffle_id(),
            num_maps,
            dependency: Arc::new(dependency),
            strategy,
        }
    }

    /// A writer for map task `map_id` of the shuffle.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle's strategy cannot serve its dependency,
    /// such as a serialized-sort handle whose serializer cannot relocate records.
    pub fn get_writer<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        map_id: u64,
        ctx: Arc<TaskContext>,
    ) -> Result<Box<dyn ShuffleWriter<K, V>>> {
        self.registry.register_map(handle.shuffle_id, handle.num_maps, map_id);
        let env = WriteContext {
            task: ctx,
            resolver: Arc::clone(&self.resolver),
            conf: Arc::clone(&self.conf),
            location: self.location.clone(),
            map_id,
        };
        debug!("Writer for shuffle {} map {map_id} uses {:?}", handle.shuffle_id, handle.strategy);
        Ok(match handle.strategy {
            WriteStrategy::Bypass => Box::new(BypassMergeSortShuffleWriter::new(env, &*handle.dependency)),
            WriteStrategy::SerializedSort => Box::new(UnsafeShuffleWriter::new(env, &*handle.dependency)?),
            WriteStrategy::DeserializedSort => {
                Box::new(SortShuffleWriter::new(env, Arc::clone(&handle.dependency)))
            }
        })
    }

    /// A reader for reduce partitions `[start_partition, end_partition)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is empty or out of bounds.
    pub fn get_reader<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        start_partition: usize,
        end_partition: usize,
        ctx: Arc<TaskContext>,
    ) -> Result<BlockStoreShuffleReader<K, V, C>> {
        let num_partitions = handle.dependency.num_partitions();
        if start_partition >= end_partition || end_partition > num_partitions {
            bail!(
                "invalid reduce range [{start_partition}, {end_partition}) for shuffle {} with {num_partitions} partitions",
                handle.shuffle_id
            );
        }
        Ok(BlockStoreShuffleReader::new(
            handle.clone(),
            start_partition,
            end_partition,
            ctx,
            Arc::clone(&self.conf),
            FetchSources {
                local_address: self.location.clone(),
                resolver: Arc::clone(&self.resolver),
                transport: Arc::clone(&self.transport),
                pool: Arc::clone(&self.fetch_pool),
            },
            Arc::clone(&self.tracker),
        ))
    }

    /// Delete every map output of the shuffle written on this executor.
    /// Returns whether the shuffle was known; unknown shuffles are a no-op.
    pub fn unregister_shuffle(&self, shuffle_id: u32) -> bool {
        match self.registry.remove(shuffle_id) {
            Some(entry) => {
                for map_id in &entry.map_ids {
                    self.resolver.remove_data_by_map(shuffle_id, *map_id);
                }
                info!(
                    "Unregistered shuffle {shuffle_id}: removed {} of {} map outputs",
                    entry.map_ids.len(),
                    entry.num_maps
                );
                true
            }
            None => false,
        }
    }

    /// Forget all shuffles and drop cached index data. Files stay on disk.
    pub fn stop(&self) {
        self.registry.clear();
        self.resolver.stop();
        info!("Shuffle manager of {} stopped", self.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiners::Sum;
    use crate::io::serializer::RecordSerializer;
    use crate::partitioner::HashPartitioner;

    fn plain(partitions: usize) -> ShuffleDependency<u32, u64, u64> {
        ShuffleDependency::new(0, Arc::new(HashPartitioner::new(partitions)))
    }

    fn summing(partitions: usize, map_side_combine: bool) -> ShuffleDependency<u32, u64, u64> {
        ShuffleDependency::with_aggregator(
            0,
            Arc::new(HashPartitioner::new(partitions)),
            Arc::new(Sum::<u64>::new()),
            map_side_combine,
        )
    }

    #[test]
    fn small_plain_shuffles_bypass() {
        let conf = ShuffleConf::default();
        assert_eq!(select_write_strategy(&plain(1), &conf), WriteStrategy::Bypass);
        assert_eq!(select_write_strategy(&plain(200), &conf), WriteStrategy::Bypass);
        assert_eq!(select_write_strategy(&summing(50, false), &conf), WriteStrategy::Bypass);
    }

    #[test]
    fn large_plain_shuffles_sort_serialized_records() {
        let conf = ShuffleConf::default();
        assert_eq!(select_write_strategy(&plain(201), &conf), WriteStrategy::SerializedSort);
        let json = plain(500).with_serializer(RecordSerializer::Json);
        assert_eq!(select_write_strategy(&json, &conf), WriteStrategy::DeserializedSort);
        assert_eq!(
            select_write_strategy(&plain(MAX_SERIALIZED_MODE_PARTITIONS + 1), &conf),
            WriteStrategy::DeserializedSort
        );
    }

    #[test]
    fn aggregation_falls_back_to_deserialized_sort() {
        let conf = ShuffleConf::default();
        assert_eq!(select_write_strategy(&summing(10, true), &conf), WriteStrategy::DeserializedSort);
        assert_eq!(select_write_strategy(&summing(300, false), &conf), WriteStrategy::DeserializedSort);
    }

    #[test]
    fn registry_keeps_first_map_count() {
        let registry = ShuffleRegistry::new();
        registry.register_map(3, 4, 0);
        registry.register_map(3, 9, 1);
        registry.register_map(3, 9, 1);
        assert_eq!(registry.num_maps(3), Some(4));
        assert_eq!(registry.remove(3).map(|e| e.map_ids), Some(vec![0, 1]));
        assert!(registry.remove(3).is_none());
        assert!(registry.is_empty());
    }
}
