//! Deterministic input data for shuffle tests.

/// `n` records over `distinct_keys` keys, with values `0..n`.
///
/// Keys are spread with a multiplicative hash so consecutive records rarely
/// share a key or a partition.
///
/// # Example
///
/// ```
/// use ironshuffle::testing::keyed_records;
///
/// let records = keyed_records(10, 3);
/// assert_eq!(records.len(), 10);
/// assert!(records.iter().all(|(k, _)| *k < 3));
/// ```
pub fn keyed_records(n: u64, distinct_keys: u32) -> Vec<(u32, u64)> {
    let keys = u64::from(distinct_keys.max(1));
    (0..n)
        .map(|i| {
            let key = (i.wrapping_mul(2_654_435_761) >> 7) % keys;
            (u32::try_from(key).unwrap_or(u32::MAX), i)
        })
        .collect()
}

/// `(word, 1)` pairs from a few short lines, for word counts.
pub fn word_pairs() -> Vec<(String, u64)> {
    [
        "the quick brown fox jumps over the lazy dog",
        "the dog barks",
        "a fox is quick and the dog is lazy",
    ]
    .iter()
    .flat_map(|line| line.split_whitespace())
    .map(|w| (w.to_string(), 1))
    .collect()
}

/// Split `records` round-robin into `maps` inputs.
pub fn split_round_robin<T: Clone>(records: &[T], maps: usize) -> Vec<Vec<T>> {
    let mut out = vec![Vec::new(); maps.max(1)];
    let len = out.len();
    for (i, r) in records.iter().enumerate() {
        out[i % len].push(r.clone());
    }
    out
}
