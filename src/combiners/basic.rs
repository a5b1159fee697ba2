//! Basic arithmetic aggregators: Sum, Min, Max

use crate::aggregator::Aggregator;
use std::marker::PhantomData;
use std::mem::take;
use std::ops::Add;

/* ===================== Sum<T> ===================== */

/// Sum of values per key.
///
/// - Combiner: `T`
///
/// Requires `T: Add<Output=T> + Default`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum<T>(pub PhantomData<T>);
impl<T> Sum<T> {
    /// Convenience constructor (same as `Default`).
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Aggregator<T, T> for Sum<T>
where
    T: Add<Output = T> + Default + Send + Sync + 'static,
{
    fn create_combiner(&self, v: T) -> T {
        v
    }

    fn merge_value(&self, acc: &mut T, v: T) {
        *acc = take(acc) + v;
    }

    fn merge_combiners(&self, acc: &mut T, other: T) {
        *acc = take(acc) + other;
    }
}

/* ===================== Min<T> ===================== */

/// Minimum value per key (requires `Ord`).
#[derive(Clone, Copy, Debug, Default)]
pub struct Min<T>(pub PhantomData<T>);
impl<T> Min<T> {
    /// Convenience constructor (same as `Default`).
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Aggregator<T, T> for Min<T>
where
    T: Ord + Send + Sync + 'static,
{
    fn create_combiner(&self, v: T) -> T {
        v
    }

    fn merge_value(&self, acc: &mut T, v: T) {
        if v < *acc {
            *acc = v;
        }
    }

    fn merge_combiners(&self, acc: &mut T, other: T) {
        self.merge_value(acc, other);
    }
}

/* ===================== Max<T> ===================== */

/// Maximum value per key (requires `Ord`).
#[derive(Clone, Copy, Debug, Default)]
pub struct Max<T>(pub PhantomData<T>);
impl<T> Max<T> {
    /// Convenience constructor (same as `Default`).
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Aggregator<T, T> for Max<T>
where
    T: Ord + Send + Sync + 'static,
{
    fn create_combiner(&self, v: T) -> T {
        v
    }

    fn merge_value(&self, acc: &mut T, v: T) {
        if v > *acc {
            *acc = v;
        }
    }

    fn merge_combiners(&self, acc: &mut T, other: T) {
        self.merge_value(acc, other);
    }
}
