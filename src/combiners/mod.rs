//! Built-in aggregators for shuffle dependencies.
//!
//! These are reusable implementations of [`Aggregator`](crate::aggregator::Aggregator):
//!
//! - [`Sum<T>`] -- sum of values.
//! - [`Min<T>`] -- minimum value.
//! - [`Max<T>`] -- maximum value.
//! - [`Count`] -- number of values.
//! - [`CollectList<T>`] -- every value, grouped per key.
//!
//! # Examples
//! ```
//! use ironshuffle::aggregator::Aggregator;
//! use ironshuffle::combiners::{CollectList, Count, Max, Sum};
//!
//! let sum = Sum::<u64>::new();
//! let mut acc = sum.create_combiner(1);
//! sum.merge_value(&mut acc, 2);
//! sum.merge_combiners(&mut acc, 10);
//! assert_eq!(acc, 13);
//!
//! let mut n = Aggregator::<&str, u64>::create_combiner(&Count, "a");
//! Aggregator::<&str, u64>::merge_value(&Count, &mut n, "b");
//! assert_eq!(n, 2);
//!
//! let max = Max::<i32>::new();
//! let mut m = max.create_combiner(-4);
//! max.merge_value(&mut m, 9);
//! assert_eq!(m, 9);
//!
//! let list = CollectList::<char>::new();
//! let mut l = list.create_combiner('x');
//! list.merge_combiners(&mut l, vec!['y', 'z']);
//! assert_eq!(l, vec!['x', 'y', 'z']);
//! ```

mod basic;
mod collect;

pub use basic::{Max, Min, Sum};
pub use collect::{CollectList, Count};
