//! Key-wise combination of values.
//!
//! An [`Aggregator`] folds the values of one key into a combiner `C` in three
//! steps: the first value creates the combiner, later values are merged into
//! it, and combiners built on different map tasks (or different spills) are
//! merged with each other. Merging must be associative and commutative; the
//! shuffle makes no promise about the order values or combiners arrive in.

use std::marker::PhantomData;
use std::sync::Arc;

/// Associative per-key combination of values `V` into combiners `C`.
pub trait Aggregator<V, C>: Send + Sync + 'static {
    fn create_combiner(&self, v: V) -> C;
    fn merge_value(&self, acc: &mut C, v: V);
    fn merge_combiners(&self, acc: &mut C, other: C);
}

/// Aggregator built from three closures.
///
/// ```
/// use ironshuffle::aggregator::{Aggregator, FnAggregator};
///
/// let avg_parts = FnAggregator::new(
///     |v: u32| (u64::from(v), 1u64),
///     |acc: &mut (u64, u64), v: u32| { acc.0 += u64::from(v); acc.1 += 1; },
///     |acc: &mut (u64, u64), other: (u64, u64)| { acc.0 += other.0; acc.1 += other.1; },
/// );
/// let mut acc = avg_parts.create_combiner(4);
/// avg_parts.merge_value(&mut acc, 6);
/// assert_eq!(acc, (10, 2));
/// ```
pub struct FnAggregator<V, C, F1, F2, F3> {
    create: F1,
    merge_value: F2,
    merge_combiners: F3,
    _t: PhantomData<fn(V) -> C>,
}

impl<V, C, F1, F2, F3> FnAggregator<V, C, F1, F2, F3>
where
    F1: Fn(V) -> C,
    F2: Fn(&mut C, V),
    F3: Fn(&mut C, C),
{
    pub fn new(create: F1, merge_value: F2, merge_combiners: F3) -> Self {
        Self { create, merge_value, merge_combiners, _t: PhantomData }
    }
}

impl<V, C, F1, F2, F3> Aggregator<V, C> for FnAggregator<V, C, F1, F2, F3>
where
    V: 'static,
    C: 'static,
    F1: Fn(V) -> C + Send + Sync + 'static,
    F2: Fn(&mut C, V) + Send + Sync + 'static,
    F3: Fn(&mut C, C) + Send + Sync + 'static,
{
    fn create_combiner(&self, v: V) -> C {
        (self.create)(v)
    }

    fn merge_value(&self, acc: &mut C, v: V) {
        (self.merge_value)(acc, v);
    }

    fn merge_combiners(&self, acc: &mut C, other: C) {
        (self.merge_combiners)(acc, other);
    }
}

/// Treats already combined values as input; every step is `merge_combiners`.
///
/// The read path uses it when map tasks combined their output before writing.
pub struct CombinerAggregator<V, C> {
    inner: Arc<dyn Aggregator<V, C>>,
}

impl<V, C> CombinerAggregator<V, C> {
    pub fn new(inner: Arc<dyn Aggregator<V, C>>) -> Self {
        Self { inner }
    }
}

impl<V: 'static, C: 'static> Aggregator<C, C> for CombinerAggregator<V, C> {
    fn create_combiner(&self, v: C) -> C {
        v
    }

    fn merge_value(&self, acc: &mut C, v: C) {
        self.inner.merge_combiners(acc, v);
    }

    fn merge_combiners(&self, acc: &mut C, other: C) {
        self.inner.merge_combiners(acc, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiners::Sum;

    #[test]
    fn combiner_adapter_merges_partials() {
        let sum: Arc<dyn Aggregator<u64, u64>> = Arc::new(Sum::<u64>::new());
        let partials = CombinerAggregator::new(sum);
        let mut acc = partials.create_combiner(3);
        partials.merge_value(&mut acc, 5);
        partials.merge_combiners(&mut acc, 2);
        assert_eq!(acc, 10);
    }
}
