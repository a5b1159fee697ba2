//! Assertions for comparing shuffle outputs with expected records.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

fn counts<T: Eq + Hash>(items: &[T]) -> HashMap<&T, usize> {
    let mut out = HashMap::new();
    for item in items {
        *out.entry(item).or_insert(0) += 1;
    }
    out
}

/// Assert that two collections hold the same elements with the same
/// multiplicities, ignoring order.
///
/// # Panics
///
/// Panics if the collections differ.
///
/// # Example
///
/// ```
/// use ironshuffle::testing::assert_same_multiset;
///
/// assert_same_multiset(&[("b", 1), ("a", 2), ("a", 2)], &[("a", 2), ("b", 1), ("a", 2)]);
/// ```
pub fn assert_same_multiset<T: Debug + Eq + Hash>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Record count mismatch:\n  Expected: {}\n  Actual: {}",
        expected.len(),
        actual.len()
    );

    let actual_counts = counts(actual);
    let expected_counts = counts(expected);
    if actual_counts != expected_counts {
        let missing: Vec<_> = expected_counts
            .iter()
            .filter(|(k, n)| actual_counts.get(*k).copied().unwrap_or(0) < **n)
            .map(|(k, _)| *k)
            .collect();
        let extra: Vec<_> = actual_counts
            .iter()
            .filter(|(k, n)| expected_counts.get(*k).copied().unwrap_or(0) < **n)
            .map(|(k, _)| *k)
            .collect();
        panic!("Record multiset mismatch:\n  Missing or too few: {missing:?}\n  Unexpected or too many: {extra:?}");
    }
}

/// Assert that the keys of a record sequence never decrease.
///
/// # Panics
///
/// Panics at the first pair of adjacent records whose keys are out of order.
///
/// # Example
///
/// ```
/// use ironshuffle::testing::assert_keys_non_decreasing;
///
/// assert_keys_non_decreasing(&[(1, "x"), (1, "y"), (4, "z")]);
/// ```
pub fn assert_keys_non_decreasing<K: Debug + Ord, V>(records: &[(K, V)]) {
    for (i, pair) in records.windows(2).enumerate() {
        assert!(
            pair[0].0 <= pair[1].0,
            "Keys out of order at index {}: {:?} > {:?}",
            i + 1,
            pair[0].0,
            pair[1].0
        );
    }
}

/// Expected `(key, sum)` pairs for a set of `(key, value)` records, sorted by key.
pub fn expected_sums<K: Clone + Ord + Hash>(records: &[(K, u64)]) -> Vec<(K, u64)> {
    let mut sums: HashMap<K, u64> = HashMap::new();
    for (k, v) in records {
        *sums.entry(k.clone()).or_insert(0) += v;
    }
    let mut out: Vec<_> = sums.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
