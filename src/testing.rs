//! Testing utilities for shuffle users and for this crate's own tests.
//!
//! - **Assertions**: compare shuffle outputs ignoring order, check key order
//! - **Fixtures**: deterministic keyed input data
//! - **Local cluster**: several executors in one process, sharing a map-output
//!   tracker and a block transport, with optional fault injection
//!
//! # Quick Start
//!
//! ```no_run
//! use ironshuffle::*;
//! use ironshuffle::testing::*;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let cluster = LocalCluster::new(2, ShuffleConf::default())?;
//! let dep = ShuffleDependency::<u32, u64, u64>::new(0, Arc::new(HashPartitioner::new(4)));
//! let handle = cluster.register_shuffle(dep, 2);
//!
//! let input = keyed_records(1_000, 50);
//! for (map, records) in split_round_robin(&input, 2).into_iter().enumerate() {
//!     cluster.run_map(&handle, map, map, records)?;
//! }
//!
//! let mut output = Vec::new();
//! for p in 0..4 {
//!     output.extend(cluster.read(&handle, 1, p, p + 1)?);
//! }
//! assert_same_multiset(&output, &input);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod cluster;
pub mod fixtures;

pub use assertions::*;
pub use cluster::*;
pub use fixtures::*;
