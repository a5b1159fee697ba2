//! K-way merge of sorted runs.

use super::KeyComparator;
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

/// A sorted run of `(partition, key, combiner)` records.
pub(crate) type Run<K, C> = Box<dyn Iterator<Item = Result<(usize, K, C)>> + Send>;

/// Merges two combiners of the same key.
pub(crate) type MergeCombiners<C> = Arc<dyn Fn(&mut C, C) + Send + Sync>;

struct Head<K, C> {
    record: (usize, K, C),
    run: usize,
    comparator: Arc<KeyComparator<K>>,
}

impl<K: Hash, C> Head<K, C> {
    fn order(&self, other: &Self) -> Ordering {
        self.comparator
            .compare(self.record.0, &self.record.1, other.record.0, &other.record.1)
    }
}

impl<K: Hash, C> PartialEq for Head<K, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Hash, C> Eq for Head<K, C> {}

impl<K: Hash, C> PartialOrd for Head<K, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Hash, C> Ord for Head<K, C> {
    // Reversed: BinaryHeap is a max-heap and the smallest record must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.order(other)
            .then_with(|| self.run.cmp(&other.run))
            .reverse()
    }
}

/// Merges runs that are each sorted by `cmp`. With `combine`, records whose
/// keys are equal are merged into one.
pub(crate) struct Merger<K, C> {
    runs: Vec<Run<K, C>>,
    heap: BinaryHeap<Head<K, C>>,
    cmp: Arc<KeyComparator<K>>,
    combine: Option<MergeCombiners<C>>,
    pending: VecDeque<(usize, K, C)>,
    deferred_error: Option<anyhow::Error>,
    failed: bool,
}

impl<K: Eq + Hash, C> Merger<K, C> {
    pub(crate) fn new(
        mut runs: Vec<Run<K, C>>,
        cmp: Arc<KeyComparator<K>>,
        combine: Option<MergeCombiners<C>>,
    ) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for (i, run) in runs.iter_mut().enumerate() {
            if let Some(record) = run.next().transpose()? {
                heap.push(Head { record, run: i, comparator: Arc::clone(&cmp) });
            }
        }
        Ok(Self {
            runs,
            heap,
            cmp,
            combine,
            pending: VecDeque::new(),
            deferred_error: None,
            failed: false,
        })
    }

    /// The smallest record. A read error on its run is reported on the next call.
    fn pop(&mut self) -> Option<(usize, K, C)> {
        let head = self.heap.pop()?;
        match self.runs[head.run].next() {
            Some(Ok(next)) => self.heap.push(Head {
                record: next,
                run: head.run,
                comparator: Arc::clone(&self.cmp),
            }),
            Some(Err(e)) => self.deferred_error = Some(e),
            None => {}
        }
        Some(head.record)
    }

    /// Pop every record comparing equal to the smallest one and combine equal keys.
    fn next_combined(&mut self, combine: &MergeCombiners<C>) {
        let Some(first) = self.pop() else {
            return;
        };
        let mut group = vec![first];
        while let Some(top) = self.heap.peek() {
            let (p, k, _) = &group[0];
            if self.cmp.compare(top.record.0, &top.record.1, *p, k) != Ordering::Equal {
                break;
            }
            if self.deferred_error.is_some() {
                break;
            }
            if let Some(record) = self.pop() {
                match group.iter_mut().find(|(_, key, _)| *key == record.1) {
                    Some(existing) => combine(&mut existing.2, record.2),
                    None => group.push(record),
                }
            }
        }
        self.pending.extend(group);
    }

    fn advance(&mut self) -> Result<Option<(usize, K, C)>> {
        if let Some(record) = self.pending.pop_front() {
            return Ok(Some(record));
        }
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }
        match self.combine.clone() {
            Some(combine) => {
                self.next_combined(&combine);
                Ok(self.pending.pop_front())
            }
            None => Ok(self.pop()),
        }
    }
}

impl<K: Eq + Hash, C> Iterator for Merger<K, C> {
    type Item = Result<(usize, K, C)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(r) => r.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
