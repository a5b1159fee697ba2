//! Counting and grouping aggregators.

use crate::aggregator::Aggregator;
use std::marker::PhantomData;

/// Number of values per key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Count;

impl<V: 'static> Aggregator<V, u64> for Count {
    fn create_combiner(&self, _v: V) -> u64 {
        1
    }

    fn merge_value(&self, acc: &mut u64, _v: V) {
        *acc += 1;
    }

    fn merge_combiners(&self, acc: &mut u64, other: u64) {
        *acc += other;
    }
}

/// All values of a key, in arrival order (which the shuffle does not fix).
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectList<T>(pub PhantomData<T>);
impl<T> CollectList<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + Sync + 'static> Aggregator<T, Vec<T>> for CollectList<T> {
    fn create_combiner(&self, v: T) -> Vec<T> {
        vec![v]
    }

    fn merge_value(&self, acc: &mut Vec<T>, v: T) {
        acc.push(v);
    }

    fn merge_combiners(&self, acc: &mut Vec<T>, mut other: Vec<T>) {
        acc.append(&mut other);
    }
}
