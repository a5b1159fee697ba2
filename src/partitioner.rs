//! Mapping keys to reduce partitions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Assigns every key a reduce partition in `[0, num_partitions())`.
pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> usize;
    fn partition(&self, key: &K) -> usize;
}

/// Hash of a key with the std `DefaultHasher` (stable within one build).
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// `hash(key) mod num_partitions`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashPartitioner {
    partitions: usize,
}

impl HashPartitioner {
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "HashPartitioner needs at least one partition");
        Self { partitions }
    }
}

impl<K: Hash> Partitioner<K> for HashPartitioner {
    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> usize {
        (hash_key(key) % self.partitions as u64) as usize
    }
}

/// Partitioner backed by a closure. Results are reduced modulo the partition count.
pub struct FnPartitioner<K, F> {
    partitions: usize,
    f: F,
    _k: PhantomData<fn(&K)>,
}

impl<K, F> FnPartitioner<K, F>
where
    F: Fn(&K) -> usize + Send + Sync,
{
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    pub fn new(partitions: usize, f: F) -> Self {
        assert!(partitions > 0, "FnPartitioner needs at least one partition");
        Self { partitions, f, _k: PhantomData }
    }
}

impl<K, F> Partitioner<K> for FnPartitioner<K, F>
where
    F: Fn(&K) -> usize + Send + Sync,
{
    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> usize {
        (self.f)(key) % self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_partitions_are_in_range_and_stable() {
        let p = HashPartitioner::new(3);
        for k in 0..1000u64 {
            let id = p.partition(&k);
            assert!(id < 3);
            assert_eq!(id, p.partition(&k));
        }
    }

    #[test]
    fn fn_partitioner_wraps_out_of_range_results() {
        let p = FnPartitioner::new(4, |k: &usize| *k);
        assert_eq!(p.partition(&6), 2);
        assert_eq!(Partitioner::<usize>::num_partitions(&p), 4);
    }
}
