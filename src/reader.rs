//! Reduce-side read pipeline.
//!
//! ```text
//! map-output tracker ─▶ block fetcher ─▶ decompress + deserialize ─▶ cancellation check
//!     ─▶ [aggregate] ─▶ [sort by key] ─▶ cancellation check ─▶ caller
//! ```
//!
//! Aggregation and sorting go through [`ExternalSorter`]s owned by the returned
//! iterator, so their spill files are deleted however the iterator ends:
//! exhausted, failed, cancelled or dropped.

use crate::aggregator::{Aggregator, CombinerAggregator};
use crate::config::ShuffleConf;
use crate::dependency::{ShuffleData, ShuffleHandle, ShuffleKey};
use crate::error::ShuffleError;
use crate::fetch::{FetchLimits, FetchSources, MapOutputTracker, ShuffleBlockFetcherIterator};
use crate::io::compression::{CompressionCodec, resolve_codec};
use crate::io::serializer::{RecordReader, RecordSerializer};
use crate::sort::{ExternalSorter, Insertion};
use crate::task::TaskContext;
use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::Arc;

/// A boxed stream of shuffle records.
pub type RecordStream<K, C> = Box<dyn Iterator<Item = Result<(K, C)>> + Send>;

/// Stops at the next step once the owning task is cancelled or completed.
///
/// Cancellation is reported once as [`ShuffleError::TaskKilled`]; completion
/// ends iteration quietly. Either way the wrapped iterator is dropped right
/// away, releasing whatever it holds.
pub struct InterruptibleIterator<I> {
    ctx: Arc<TaskContext>,
    inner: Option<I>,
}

impl<I> InterruptibleIterator<I> {
    pub fn new(ctx: Arc<TaskContext>, inner: I) -> Self {
        Self { ctx, inner: Some(inner) }
    }
}

impl<T, I: Iterator<Item = Result<T>>> Iterator for InterruptibleIterator<I> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        if self.ctx.is_interrupted() {
            self.inner = None;
            let reason = self
                .ctx
                .kill_reason()
                .unwrap_or_else(|| "cancelled".to_string());
            return Some(Err(ShuffleError::TaskKilled { reason }.into()));
        }
        if self.ctx.is_completed() {
            self.inner = None;
            return None;
        }
        match inner.next() {
            Some(Ok(record)) => Some(Ok(record)),
            Some(Err(e)) => {
                self.inner = None;
                Some(Err(e))
            }
            None => {
                self.inner = None;
                None
            }
        }
    }
}

/// Records of every fetched block, in block completion order.
struct BlockRecords<T> {
    ctx: Arc<TaskContext>,
    blocks: ShuffleBlockFetcherIterator,
    codec: Arc<dyn CompressionCodec>,
    serializer: RecordSerializer,
    current: Option<(String, RecordReader<T, Box<dyn Read + Send>>)>,
}

impl<T: DeserializeOwned> BlockRecords<T> {
    fn open_next(&mut self) -> Option<Result<()>> {
        let block = match self.blocks.next()? {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        let name = format!("{} from {}", block.block_id, block.address);
        let opened = block
            .buffer
            .into_reader()
            .and_then(|raw| Ok(self.codec.compressed_input(raw)?))
            .with_context(|| format!("open {name}"));
        Some(opened.map(|input| self.current = Some((name, self.serializer.reader(input)))))
    }
}

impl<T: DeserializeOwned> Iterator for BlockRecords<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((name, reader)) = &mut self.current {
                match reader.next() {
                    Some(Ok(record)) => {
                        self.ctx.metrics().read.inc_records_read(1);
                        return Some(Ok(record));
                    }
                    Some(Err(e)) => {
                        let e = e.context(format!("deserialize {name}"));
                        self.current = None;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            if let Err(e) = self.open_next()? {
                return Some(Err(e));
            }
        }
    }
}

/// Reads reduce partitions `[start_partition, end_partition)` of a shuffle.
pub struct BlockStoreShuffleReader<K, V, C> {
    handle: ShuffleHandle<K, V, C>,
    start_partition: usize,
    end_partition: usize,
    ctx: Arc<TaskContext>,
    conf: Arc<ShuffleConf>,
    sources: FetchSources,
    tracker: Arc<dyn MapOutputTracker>,
}

impl<K: ShuffleKey, V: ShuffleData, C: ShuffleData> BlockStoreShuffleReader<K, V, C> {
    pub fn new(
        handle: ShuffleHandle<K, V, C>,
        start_partition: usize,
        end_partition: usize,
        ctx: Arc<TaskContext>,
        conf: Arc<ShuffleConf>,
        sources: FetchSources,
        tracker: Arc<dyn MapOutputTracker>,
    ) -> Self {
        Self { handle, start_partition, end_partition, ctx, conf, sources, tracker }
    }

    /// Fetching several partitions of a map output as one block needs
    /// relocatable records and a codec whose streams concatenate.
    fn batch_fetch(&self, codec: &dyn CompressionCodec) -> bool {
        self.conf.batch_fetch_enabled
            && self.end_partition - self.start_partition > 1
            && self.handle.dependency.serializer().supports_relocation()
            && codec.supports_concatenation()
    }

    fn block_records<T: DeserializeOwned>(&self) -> Result<InterruptibleIterator<BlockRecords<T>>> {
        let codec = resolve_codec(self.conf.compress, &self.conf.codec)?;
        let blocks = self.tracker.get_map_sizes_by_executor_id(
            self.handle.shuffle_id,
            self.start_partition,
            self.end_partition,
        )?;
        let batch = self.batch_fetch(codec.as_ref());
        let fetcher = ShuffleBlockFetcherIterator::new(
            Arc::clone(&self.ctx),
            self.sources.clone(),
            blocks,
            FetchLimits::from_conf(&self.conf),
            batch,
        );
        Ok(InterruptibleIterator::new(
            Arc::clone(&self.ctx),
            BlockRecords {
                ctx: Arc::clone(&self.ctx),
                blocks: fetcher,
                codec,
                serializer: self.handle.dependency.serializer(),
                current: None,
            },
        ))
    }

    /// Combine records per key in a single-partition sorter.
    fn aggregate<X: ShuffleData>(
        &self,
        records: impl Iterator<Item = Result<(K, X)>>,
        aggregator: Arc<dyn Aggregator<X, C>>,
    ) -> Result<RecordStream<K, C>> {
        let mut sorter = ExternalSorter::new(
            Arc::clone(&self.ctx),
            Arc::clone(self.sources.resolver.disk()),
            &self.conf,
            Insertion::Combine(aggregator),
        )?
        .with_serializer(self.handle.dependency.serializer());
        if let Err(e) = sorter.insert_all(records) {
            sorter.stop();
            return Err(e);
        }
        let combined = sorter.into_sorted()?;
        Ok(Box::new(combined.map(|r| r.map(|(_, k, c)| (k, c)))))
    }

    /// Build the pipeline. Records are fetched lazily unless aggregation or
    /// sorting has to see all of them first.
    ///
    /// # Errors
    ///
    /// Returns [`ShuffleError::MetadataFetchFailed`] if a map output has no
    /// location, and any error raised while aggregating or sorting, including
    /// fetch failures and [`ShuffleError::TaskKilled`].
    pub fn read(self) -> Result<InterruptibleIterator<RecordStream<K, C>>> {
        let dep = Arc::clone(&self.handle.dependency);
        let aggregated: RecordStream<K, C> = match dep.aggregator() {
            Some(agg) if dep.map_side_combine() => {
                let partials: Arc<dyn Aggregator<C, C>> =
                    Arc::new(CombinerAggregator::new(Arc::clone(agg)));
                self.aggregate(self.block_records::<(K, C)>()?, partials)?
            }
            Some(agg) => self.aggregate(self.block_records::<(K, V)>()?, Arc::clone(agg))?,
            None => Box::new(self.block_records::<(K, C)>()?),
        };

        let output: RecordStream<K, C> = match dep.key_ordering() {
            Some(ordering) => {
                let mut sorter = ExternalSorter::<K, C, C>::appending(
                    Arc::clone(&self.ctx),
                    Arc::clone(self.sources.resolver.disk()),
                    &self.conf,
                )?
                .with_ordering(Arc::clone(ordering))
                .with_serializer(dep.serializer());
                if let Err(e) = sorter.insert_all(aggregated) {
                    sorter.stop();
                    return Err(e);
                }
                debug!(
                    "Task {} sorted reduce partitions [{}, {}) of shuffle {} with {} spills",
                    self.ctx.task_attempt_id(),
                    self.start_partition,
                    self.end_partition,
                    self.handle.shuffle_id,
                    sorter.spill_count()
                );
                Box::new(sorter.into_sorted()?.map(|r| r.map(|(_, k, c)| (k, c))))
            }
            None => aggregated,
        };
        Ok(InterruptibleIterator::new(self.ctx, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_task_killed;

    #[test]
    fn reports_cancellation_once_then_ends() {
        let ctx = TaskContext::standalone(0);
        let mut it = InterruptibleIterator::new(Arc::clone(&ctx), (0..10).map(Ok::<_, anyhow::Error>));
        assert_eq!(it.next().and_then(Result::ok), Some(0));
        ctx.kill("speculative attempt won");
        assert!(it.next().is_some_and(|r| r.is_err_and(|e| is_task_killed(&e))));
        assert!(it.next().is_none());
    }

    #[test]
    fn completion_ends_iteration_quietly() {
        let ctx = TaskContext::standalone(0);
        let mut it = InterruptibleIterator::new(Arc::clone(&ctx), (0..10).map(Ok::<_, anyhow::Error>));
        assert!(it.next().is_some());
        ctx.mark_completed();
        assert!(it.next().is_none());
    }
}
