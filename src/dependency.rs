//! What a shuffle is: its dependency, its handle and the status of its map outputs.

use crate::aggregator::Aggregator;
use crate::block::BlockManagerId;
use crate::io::serializer::RecordSerializer;
use crate::partitioner::Partitioner;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Bound for every key, value and combiner type carried through a shuffle.
pub trait ShuffleData: 'static + Send + Sync + Clone + Serialize + DeserializeOwned {}
impl<T> ShuffleData for T where T: 'static + Send + Sync + Clone + Serialize + DeserializeOwned {}

/// Bound for shuffle keys.
pub trait ShuffleKey: ShuffleData + Eq + Hash {}
impl<T> ShuffleKey for T where T: ShuffleData + Eq + Hash {}

/// Total order over keys, used to sort each partition's records.
pub type KeyOrdering<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// The key type's own `Ord` as a [`KeyOrdering`].
pub fn natural_order<K: Ord + 'static>() -> KeyOrdering<K> {
    Arc::new(|a: &K, b: &K| a.cmp(b))
}

/// Everything the write and read sides of one shuffle must agree on.
///
/// Dependencies without an aggregator move `(K, V)` records and have `C = V`;
/// build them with [`ShuffleDependency::new`]. Aggregating dependencies are
/// built with [`ShuffleDependency::with_aggregator`] and produce `(K, C)`.
pub struct ShuffleDependency<K, V, C> {
    shuffle_id: u32,
    partitioner: Arc<dyn Partitioner<K>>,
    serializer: RecordSerializer,
    key_ordering: Option<KeyOrdering<K>>,
    aggregator: Option<Arc<dyn Aggregator<V, C>>>,
    map_side_combine: bool,
}

impl<K, V> ShuffleDependency<K, V, V> {
    pub fn new(shuffle_id: u32, partitioner: Arc<dyn Partitioner<K>>) -> Self {
        Self {
            shuffle_id,
            partitioner,
            serializer: RecordSerializer::default(),
            key_ordering: None,
            aggregator: None,
            map_side_combine: false,
        }
    }
}

impl<K, V, C> ShuffleDependency<K, V, C> {
    /// A dependency whose values are combined per key. With `map_side_combine`,
    /// map tasks combine before writing and reduce tasks merge the partial combiners.
    pub fn with_aggregator(
        shuffle_id: u32,
        partitioner: Arc<dyn Partitioner<K>>,
        aggregator: Arc<dyn Aggregator<V, C>>,
        map_side_combine: bool,
    ) -> Self {
        Self {
            shuffle_id,
            partitioner,
            serializer: RecordSerializer::default(),
            key_ordering: None,
            aggregator: Some(aggregator),
            map_side_combine,
        }
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: RecordSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sort each reduce task's output by key.
    #[must_use]
    pub fn with_key_ordering(mut self, ordering: KeyOrdering<K>) -> Self {
        self.key_ordering = Some(ordering);
        self
    }

    pub fn shuffle_id(&self) -> u32 {
        self.shuffle_id
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner<K>> {
        &self.partitioner
    }

    pub fn num_partitions(&self) -> usize {
        self.partitioner.num_partitions()
    }

    pub fn serializer(&self) -> RecordSerializer {
        self.serializer
    }

    pub fn key_ordering(&self) -> Option<&KeyOrdering<K>> {
        self.key_ordering.as_ref()
    }

    pub fn aggregator(&self) -> Option<&Arc<dyn Aggregator<V, C>>> {
        self.aggregator.as_ref()
    }

    pub fn map_side_combine(&self) -> bool {
        self.map_side_combine
    }
}

impl<K, V, C> fmt::Debug for ShuffleDependency<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleDependency")
            .field("shuffle_id", &self.shuffle_id)
            .field("num_partitions", &self.partitioner.num_partitions())
            .field("serializer", &self.serializer.name())
            .field("key_ordering", &self.key_ordering.is_some())
            .field("aggregator", &self.aggregator.is_some())
            .field("map_side_combine", &self.map_side_combine)
            .finish()
    }
}

/// How map tasks of a shuffle write their output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteStrategy {
    /// One file per reduce partition, concatenated; no sorting.
    Bypass,
    /// Records are serialized on arrival and sorted as bytes by partition.
    SerializedSort,
    /// Records are sorted (and optionally combined) as objects.
    DeserializedSort,
}

/// A registered shuffle, tagged with the write strategy its map tasks use.
pub struct ShuffleHandle<K, V, C> {
    pub shuffle_id: u32,
    pub num_maps: usize,
    pub dependency: Arc<ShuffleDependency<K, V, C>>,
    pub strategy: WriteStrategy,
}

impl<K, V, C> Clone for ShuffleHandle<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            shuffle_id: self.shuffle_id,
            num_maps: self.num_maps,
            dependency: Arc::clone(&self.dependency),
            strategy: self.strategy,
        }
    }
}

impl<K, V, C> fmt::Debug for ShuffleHandle<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleHandle")
            .field("shuffle_id", &self.shuffle_id)
            .field("num_maps", &self.num_maps)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

const LOG_BASE: f64 = 1.1;

/// Compress a block size into one byte, `1.1^n` granularity. Zero stays zero.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn compress_size(size: u64) -> u8 {
    match size {
        0 => 0,
        1 => 1,
        _ => ((size as f64).ln() / LOG_BASE.ln()).ceil().min(255.0) as u8,
    }
}

/// Approximate inverse of [`compress_size`].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decompress_size(compressed: u8) -> u64 {
    if compressed == 0 {
        0
    } else {
        LOG_BASE.powi(i32::from(compressed)) as u64
    }
}

/// Result of a successful map task: where its output lives and how large each
/// reduce partition is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStatus {
    location: BlockManagerId,
    compressed_sizes: Vec<u8>,
    map_id: u64,
}

impl MapStatus {
    pub fn new(location: BlockManagerId, partition_lengths: &[u64], map_id: u64) -> Self {
        Self {
            location,
            compressed_sizes: partition_lengths.iter().map(|&s| compress_size(s)).collect(),
            map_id,
        }
    }

    pub fn location(&self) -> &BlockManagerId {
        &self.location
    }

    pub fn map_id(&self) -> u64 {
        self.map_id
    }

    pub fn num_partitions(&self) -> usize {
        self.compressed_sizes.len()
    }

    /// Estimated size of one reduce partition; exactly 0 for empty partitions.
    pub fn size_for_block(&self, reduce_id: usize) -> u64 {
        self.compressed_sizes
            .get(reduce_id)
            .map_or(0, |&c| decompress_size(c))
    }
}
