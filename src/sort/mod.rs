//! Spillable sorters.
//!
//! - [`ExternalSorter`] holds typed records, optionally combining values per
//!   key on insertion, and sorts them by partition (and key, when ordered).
//! - [`ShuffleExternalSorter`] holds already serialized records and sorts only
//!   by partition, never decoding a record.
//!
//! Both bound their memory through a [`SpillTracker`](crate::memory::SpillTracker)
//! and write sorted runs to scratch files that are deleted when the sorter or
//! its merged output is dropped.

mod external_sorter;
mod merge;
mod serialized_sorter;

pub use external_sorter::{ExternalSorter, Insertion, SortedRecords};
pub use serialized_sorter::{PackedRecordPointer, ShuffleExternalSorter, SpillInfo};

use crate::dependency::KeyOrdering;
use crate::partitioner::hash_key;
use std::cmp::Ordering;
use std::hash::Hash;

/// Order of records inside a sorter: always by partition first.
pub enum KeyComparator<K> {
    /// Partition only; record order within a partition is unspecified.
    ByPartition,
    /// Partition, then the given key ordering.
    ByKey(KeyOrdering<K>),
    /// Partition, then key hash. Groups equal keys without a total order.
    ByHash,
}

impl<K: Hash> KeyComparator<K> {
    pub fn compare(&self, p1: usize, k1: &K, p2: usize, k2: &K) -> Ordering {
        p1.cmp(&p2).then_with(|| match self {
            KeyComparator::ByPartition => Ordering::Equal,
            KeyComparator::ByKey(ordering) => ordering(k1, k2),
            KeyComparator::ByHash => hash_key(k1).cmp(&hash_key(k2)),
        })
    }

    /// Sort records in place.
    pub fn sort<C>(&self, records: &mut [(usize, K, C)]) {
        match self {
            KeyComparator::ByPartition => records.sort_by_key(|r| r.0),
            KeyComparator::ByKey(ordering) => {
                records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| ordering(&a.1, &b.1)));
            }
            KeyComparator::ByHash => records.sort_by_cached_key(|r| (r.0, hash_key(&r.1))),
        }
    }
}
