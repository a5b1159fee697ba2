//! # Ironshuffle
//!
//! A **sort-based shuffle engine** for batch data processing. Map tasks write
//! their keyed output as one data file per task, partitioned and indexed; reduce
//! tasks fetch their partition of every map output, with bounded concurrency and
//! corruption detection, and optionally aggregate and sort what they read.
//!
//! ## Key Features
//!
//! - **Three write strategies** - bypass (file per partition), serialized sort
//!   and deserialized sort, chosen per shuffle
//! - **Spillable sorters** - memory-bounded, with scratch files cleaned up on
//!   every exit path
//! - **Map-side combine** - built-in aggregators: Sum, Min, Max, Count, CollectList
//! - **Pipelined fetching** - byte, request and per-executor limits; large blocks
//!   streamed to disk; contiguous partitions fetched as one block
//! - **Integrity** - per-partition checksums, corrupt blocks re-fetched once
//! - **Pluggable compression** - gzip, zstd, bzip2 and xz (optional via feature flags)
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironshuffle::*;
//! use ironshuffle::testing::LocalCluster;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let cluster = LocalCluster::new(2, ShuffleConf::default())?;
//!
//! // Word count with map-side combine over 3 reduce partitions
//! let dep = ShuffleDependency::with_aggregator(
//!     0,
//!     Arc::new(HashPartitioner::new(3)),
//!     Arc::new(Sum::<u64>::new()),
//!     true,
//! )
//! .with_key_ordering(natural_order::<String>());
//! let handle = cluster.register_shuffle(dep, 2);
//!
//! cluster.run_map(&handle, 0, 0, vec![("a".to_string(), 1), ("b".to_string(), 1)])?;
//! cluster.run_map(&handle, 1, 1, vec![("a".to_string(), 1)])?;
//!
//! for p in 0..3 {
//!     for (word, count) in cluster.read(&handle, 0, p, p + 1)? {
//!         println!("{word}: {count}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Shuffle dependency
//!
//! A [`ShuffleDependency`] is what both sides of a shuffle agree on: the
//! [`Partitioner`], the [`RecordSerializer`], an optional [`Aggregator`] with
//! its map-side combine flag, and an optional key ordering.
//!
//! ### Manager
//!
//! Each executor runs one [`SortShuffleManager`]. Registering a dependency
//! returns a [`ShuffleHandle`] tagged with the [`WriteStrategy`] map tasks use;
//! the manager then hands out [`ShuffleWriter`]s and [`BlockStoreShuffleReader`]s.
//!
//! ### Map output
//!
//! Every successful map task commits a data file, an index of partition offsets
//! and a checksum file through the [`IndexShuffleBlockResolver`], then reports a
//! [`MapStatus`] to the [`MapOutputTracker`](fetch::MapOutputTracker).
//!
//! ### Cancellation
//!
//! A [`TaskContext`] can be killed from any thread. Readers observe it on
//! their next step and report [`ShuffleError::TaskKilled`] once; every scratch
//! file owned by the task is deleted as its owners are dropped.
//!
//! ## Configuration
//!
//! [`ShuffleConf`] holds every tunable; [`ShuffleConf::from_pairs`] builds one
//! from string key/value pairs (see [`config::keys`]).
//!
//! ## Feature Flags
//!
//! - `compression-gzip`, `compression-zstd`, `compression-bzip2`, `compression-xz`:
//!   enable the codec (all enabled by default)
//!
//! ## Testing
//!
//! The [`testing`] module provides an in-process [`LocalCluster`](testing::LocalCluster)
//! and order-insensitive assertions for shuffle outputs.

pub mod aggregator;
pub mod block;
pub mod checksum;
pub mod combiners;
pub mod config;
pub mod dependency;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod io;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod partitioner;
pub mod reader;
pub mod resolver;
pub mod sort;
pub mod task;
pub mod testing;
pub mod writer;

// General re-exports
pub use aggregator::{Aggregator, FnAggregator};
pub use block::{BlockId, BlockManagerId};
pub use combiners::{CollectList, Count, Max, Min, Sum};
pub use config::ShuffleConf;
pub use dependency::{MapStatus, ShuffleDependency, ShuffleHandle, WriteStrategy, natural_order};
pub use error::{ShuffleError, is_fetch_failure, is_task_killed};
pub use io::RecordSerializer;
pub use manager::SortShuffleManager;
pub use memory::MemoryPool;
pub use partitioner::{FnPartitioner, HashPartitioner, Partitioner};
pub use reader::{BlockStoreShuffleReader, InterruptibleIterator};
pub use resolver::IndexShuffleBlockResolver;
pub use task::TaskContext;
pub use writer::ShuffleWriter;
