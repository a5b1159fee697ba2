//! Read-side plumbing: finding map outputs and fetching their blocks.
//!
//! - [`MapOutputTracker`] answers where the blocks of a reduce range live.
//! - [`BlockTransport`] moves a block's bytes from the executor that serves it.
//! - [`ShuffleBlockFetcherIterator`] drives both for one reduce task, with
//!   bounded concurrency and corruption detection.
//!
//! [`LocalMapOutputTracker`] and [`LocalClusterTransport`] implement the two
//! protocols for executors living in one process.

mod fetcher;
mod tracker;
mod transport;

pub use fetcher::{FetchLimits, FetchSources, FetchedBlock, ShuffleBlockFetcherIterator};
pub use tracker::{BlockInfo, BlocksByAddress, LocalMapOutputTracker, MapOutputTracker};
pub use transport::{BlockStream, BlockTransport, LocalClusterTransport};
