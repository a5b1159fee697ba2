//! An in-process cluster of executors for end-to-end shuffle tests.
//!
//! Every executor has its own [`SortShuffleManager`] and local directory. All
//! of them share one [`LocalMapOutputTracker`] and one [`LocalClusterTransport`],
//! so a reduce task on one executor fetches remote blocks from the others
//! through the same code path a networked deployment would use.

use crate::block::{BlockId, BlockManagerId};
use crate::config::ShuffleConf;
use crate::dependency::{MapStatus, ShuffleData, ShuffleDependency, ShuffleHandle, ShuffleKey};
use crate::error::{BlockFetchError, FetchErrorKind};
use crate::fetch::{BlockStream, BlockTransport, LocalClusterTransport, LocalMapOutputTracker, MapOutputTracker};
use crate::manager::SortShuffleManager;
use crate::memory::MemoryPool;
use crate::task::TaskContext;
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Transport wrapper that flips one byte in each of the first `n` non-empty
/// blocks it serves.
pub struct CorruptingTransport {
    inner: Arc<dyn BlockTransport>,
    remaining: AtomicUsize,
    corrupted: AtomicUsize,
}

impl CorruptingTransport {
    pub fn new(inner: Arc<dyn BlockTransport>, blocks_to_corrupt: usize) -> Self {
        Self { inner, remaining: AtomicUsize::new(blocks_to_corrupt), corrupted: AtomicUsize::new(0) }
    }

    /// Blocks corrupted so far.
    pub fn corrupted(&self) -> usize {
        self.corrupted.load(Ordering::Relaxed)
    }

    fn take_one(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BlockTransport for CorruptingTransport {
    fn fetch_block(&self, address: &BlockManagerId, block_id: &BlockId) -> Result<BlockStream, BlockFetchError> {
        let stream = self.inner.fetch_block(address, block_id)?;
        if stream.length == 0 || !self.take_one() {
            return Ok(stream);
        }
        let BlockStream { mut reader, length, integrity } = stream;
        let mut bytes = Vec::new();
        if let Err(e) = reader.read_to_end(&mut bytes) {
            warn!("Could not read {block_id} to corrupt it: {e}");
            return Err(BlockFetchError::new(FetchErrorKind::Unreachable, *block_id, e.to_string()));
        }
        let mid = bytes.len() / 2;
        if let Some(byte) = bytes.get_mut(mid) {
            *byte ^= 0xff;
            self.corrupted.fetch_add(1, Ordering::Relaxed);
            debug!("Corrupted {block_id} served by {address}");
        }
        Ok(BlockStream { reader: Box::new(Cursor::new(bytes)), length, integrity })
    }
}

struct Executor {
    address: BlockManagerId,
    manager: SortShuffleManager,
}

/// A set of executors sharing a map-output tracker and a transport.
pub struct LocalCluster {
    conf: ShuffleConf,
    tracker: Arc<LocalMapOutputTracker>,
    local: Arc<LocalClusterTransport>,
    executors: Vec<Executor>,
    task_memory: Option<u64>,
    root: TempDir,
}

impl LocalCluster {
    /// # Errors
    ///
    /// Returns an error if a local directory or an executor cannot be created.
    pub fn new(num_executors: usize, conf: ShuffleConf) -> Result<Self> {
        Self::with_transport(num_executors, conf, |local| local)
    }

    /// A cluster whose executors fetch through `wrap(local transport)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a local directory or an executor cannot be created.
    pub fn with_transport(
        num_executors: usize,
        conf: ShuffleConf,
        wrap: impl FnOnce(Arc<dyn BlockTransport>) -> Arc<dyn BlockTransport>,
    ) -> Result<Self> {
        if num_executors == 0 {
            bail!("a cluster needs at least one executor");
        }
        let root = tempfile::Builder::new().prefix("ironshuffle-cluster-").tempdir()?;
        let tracker = Arc::new(LocalMapOutputTracker::new());
        let local = Arc::new(LocalClusterTransport::new());
        let transport = wrap(Arc::clone(&local) as Arc<dyn BlockTransport>);
        let mut executors = Vec::with_capacity(num_executors);
        for i in 0..num_executors {
            let dir = root.path().join(format!("exec-{i}"));
            let exec_conf = ShuffleConf { local_dirs: vec![dir], ..conf.clone() };
            let address = BlockManagerId::new(format!("exec-{i}"), "localhost", 7000 + i as u16);
            let manager = SortShuffleManager::new(
                exec_conf,
                address.clone(),
                Arc::clone(&transport),
                Arc::clone(&tracker) as Arc<dyn MapOutputTracker>,
            )
            .with_context(|| format!("start executor {i}"))?;
            local.register_executor(address.clone(), Arc::clone(manager.block_resolver()));
            executors.push(Executor { address, manager });
        }
        Ok(Self { conf, tracker, local, executors, task_memory: None, root })
    }

    /// Give every task created from now on its own pool of `bytes`.
    pub fn with_task_memory(mut self, bytes: u64) -> Self {
        self.task_memory = Some(bytes);
        self
    }

    pub fn conf(&self) -> &ShuffleConf {
        &self.conf
    }

    pub fn num_executors(&self) -> usize {
        self.executors.len()
    }

    pub fn tracker(&self) -> &Arc<LocalMapOutputTracker> {
        &self.tracker
    }

    pub fn root_dir(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    fn executor(&self, index: usize) -> Result<&Executor> {
        self.executors
            .get(index)
            .ok_or_else(|| anyhow!("no executor {index} in a cluster of {}", self.executors.len()))
    }

    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    pub fn manager(&self, index: usize) -> Result<&SortShuffleManager> {
        Ok(&self.executor(index)?.manager)
    }

    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    pub fn address(&self, index: usize) -> Result<&BlockManagerId> {
        Ok(&self.executor(index)?.address)
    }

    /// A fresh task context, bounded by [`with_task_memory`](Self::with_task_memory).
    pub fn task_context(&self, partition_id: usize) -> Arc<TaskContext> {
        let pool = match self.task_memory {
            Some(bytes) => MemoryPool::new(bytes),
            None => MemoryPool::unbounded(),
        };
        TaskContext::new(0, partition_id, 0, Arc::new(pool))
    }

    /// Register a shuffle with the tracker and every executor.
    pub fn register_shuffle<K, V, C>(
        &self,
        dependency: ShuffleDependency<K, V, C>,
        num_maps: usize,
    ) -> ShuffleHandle<K, V, C> {
        self.tracker.register_shuffle(dependency.shuffle_id(), num_maps);
        self.executors[0].manager.register_shuffle(dependency, num_maps)
    }

    /// Run map task `map_index` on `executor` and publish its output.
    ///
    /// # Errors
    ///
    /// Returns the writer's error after stopping it as failed.
    pub fn run_map<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        executor: usize,
        map_index: usize,
        records: Vec<(K, V)>,
    ) -> Result<MapStatus> {
        self.run_map_with(handle, executor, map_index, records.into_iter().map(Ok))
    }

    /// Like [`run_map`](Self::run_map), over a fallible record stream.
    ///
    /// # Errors
    ///
    /// Returns the first record or writer error after stopping the writer as failed.
    pub fn run_map_with<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        executor: usize,
        map_index: usize,
        mut records: impl Iterator<Item = Result<(K, V)>>,
    ) -> Result<MapStatus> {
        let exec = self.executor(executor)?;
        let ctx = self.task_context(map_index);
        let map_id = ctx.task_attempt_id();
        let mut writer = exec.manager.get_writer(handle, map_id, ctx)?;
        if let Err(e) = writer.write(&mut records) {
            writer.stop(false)?;
            return Err(e);
        }
        let status = writer
            .stop(true)?
            .ok_or_else(|| anyhow!("map {map_index} of shuffle {} produced no status", handle.shuffle_id))?;
        self.tracker.register_map_output(handle.shuffle_id, map_index, status.clone())?;
        Ok(status)
    }

    /// Read reduce partitions `[start, end)` on `executor` into memory.
    ///
    /// # Errors
    ///
    /// Returns the first error of the read pipeline.
    pub fn read<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        executor: usize,
        start: usize,
        end: usize,
    ) -> Result<Vec<(K, C)>> {
        let ctx = self.task_context(start);
        self.read_with(handle, executor, start, end, ctx)
    }

    /// Like [`read`](Self::read), within a caller-provided task context.
    ///
    /// # Errors
    ///
    /// Returns the first error of the read pipeline.
    pub fn read_with<K: ShuffleKey, V: ShuffleData, C: ShuffleData>(
        &self,
        handle: &ShuffleHandle<K, V, C>,
        executor: usize,
        start: usize,
        end: usize,
        ctx: Arc<TaskContext>,
    ) -> Result<Vec<(K, C)>> {
        let reader = self.manager(executor)?.get_reader(handle, start, end, ctx)?;
        reader.read()?.collect()
    }

    /// Make an executor unreachable while the tracker still lists its outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    pub fn disconnect_executor(&self, index: usize) -> Result<()> {
        self.local.remove_executor(&self.executor(index)?.address);
        Ok(())
    }

    /// Take an executor down: its blocks become unreachable, its map outputs
    /// are forgotten and its local directory is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    pub fn kill_executor(&self, index: usize) -> Result<()> {
        let exec = self.executor(index)?;
        self.local.remove_executor(&exec.address);
        self.tracker.remove_outputs_on_executor(&exec.address.executor_id);
        exec.manager.stop();
        exec.manager.block_resolver().disk().stop();
        Ok(())
    }

    /// Drop a shuffle from the tracker and delete its map outputs everywhere.
    pub fn unregister_shuffle(&self, shuffle_id: u32) {
        self.tracker.unregister_shuffle(shuffle_id);
        for exec in &self.executors {
            exec.manager.unregister_shuffle(shuffle_id);
        }
    }

    /// Scratch files left in every executor's local directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for exec in &self.executors {
            out.extend(exec.manager.block_resolver().disk().temp_files()?);
        }
        Ok(out)
    }
}
