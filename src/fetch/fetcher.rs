//! Bounded, pipelined fetching of the blocks of one reduce task.

use super::tracker::{BlockInfo, BlocksByAddress};
use super::transport::BlockTransport;
use crate::block::{BlockId, BlockManagerId};
use crate::checksum::{BlockIntegrity, ChecksumVerifier};
use crate::config::ShuffleConf;
use crate::disk::DiskBlockManager;
use crate::error::{BlockFetchError, FetchErrorKind, ShuffleError};
use crate::io::buffer::{FileSegment, ManagedBuffer};
use crate::metrics::ShuffleReadMetrics;
use crate::resolver::IndexShuffleBlockResolver;
use crate::task::TaskContext;
use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use rayon::ThreadPool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Instant;

/// A fetched block, ready to be decompressed and deserialized.
#[derive(Debug)]
pub struct FetchedBlock {
    pub block_id: BlockId,
    pub address: BlockManagerId,
    pub map_index: usize,
    pub buffer: ManagedBuffer,
}

/// Limits on outstanding remote fetches of one reduce task.
#[derive(Clone, Copy, Debug)]
pub struct FetchLimits {
    pub max_bytes_in_flight: u64,
    pub max_reqs_in_flight: usize,
    pub max_blocks_in_flight_per_address: usize,
    pub max_remote_block_size_fetch_to_mem: u64,
    pub detect_corrupt: bool,
}

impl FetchLimits {
    pub fn from_conf(conf: &ShuffleConf) -> Self {
        Self {
            max_bytes_in_flight: conf.max_bytes_in_flight,
            max_reqs_in_flight: conf.max_reqs_in_flight,
            max_blocks_in_flight_per_address: conf.max_blocks_in_flight_per_address,
            max_remote_block_size_fetch_to_mem: conf.max_remote_block_size_fetch_to_mem,
            detect_corrupt: conf.detect_corrupt,
        }
    }

    /// Requests are cut at a fifth of the byte budget so that several can be
    /// in flight at once.
    fn target_request_size(&self) -> u64 {
        (self.max_bytes_in_flight / 5).max(1)
    }
}

#[derive(Debug)]
struct FetchRequest {
    address: BlockManagerId,
    blocks: Vec<BlockInfo>,
    size: u64,
}

impl FetchRequest {
    fn new(address: BlockManagerId, blocks: Vec<BlockInfo>) -> Self {
        let size = blocks.iter().map(|b| b.size).sum();
        Self { address, blocks, size }
    }
}

enum FetchResult {
    Success {
        info: BlockInfo,
        address: BlockManagerId,
        buffer: ManagedBuffer,
        last_in_request: bool,
    },
    Failure {
        info: BlockInfo,
        address: BlockManagerId,
        error: BlockFetchError,
        last_in_request: bool,
    },
}

/// Where the fetcher gets local and remote blocks from.
#[derive(Clone)]
pub struct FetchSources {
    pub local_address: BlockManagerId,
    pub resolver: Arc<IndexShuffleBlockResolver>,
    pub transport: Arc<dyn BlockTransport>,
    pub pool: Arc<ThreadPool>,
}

/// Iterator over the blocks of a reduce task.
///
/// Remote blocks are grouped into requests that worker threads serve while the
/// caller consumes earlier blocks. Outstanding requests are bounded by bytes,
/// request count and blocks per executor; requests that would exceed the
/// per-executor limit are deferred until that executor's earlier blocks arrive.
/// Local blocks are read straight from this executor's files, after checking
/// them against their checksums when corruption detection is on.
///
/// Blocks come out in completion order. A block whose checksum does not match
/// is fetched once more; any other failure ends iteration with a
/// [`ShuffleError::FetchFailed`].
pub struct ShuffleBlockFetcherIterator {
    ctx: Arc<TaskContext>,
    sources: FetchSources,
    disk: Arc<DiskBlockManager>,
    limits: FetchLimits,
    sender: Sender<FetchResult>,
    results: Receiver<FetchResult>,
    local_blocks: VecDeque<BlockInfo>,
    fetch_requests: VecDeque<FetchRequest>,
    deferred: HashMap<BlockManagerId, VecDeque<FetchRequest>>,
    blocks_in_flight_per_address: HashMap<BlockManagerId, usize>,
    bytes_in_flight: u64,
    reqs_in_flight: usize,
    num_blocks_to_fetch: usize,
    num_blocks_processed: usize,
    refetched: HashSet<BlockId>,
    failed: bool,
}

impl ShuffleBlockFetcherIterator {
    /// Split `blocks` into local and remote work and start the first remote requests.
    ///
    /// With `batch_fetch`, consecutive reduce partitions of one map output are
    /// fetched as a single `ShuffleBatch` block.
    pub fn new(
        ctx: Arc<TaskContext>,
        sources: FetchSources,
        blocks: BlocksByAddress,
        limits: FetchLimits,
        batch_fetch: bool,
    ) -> Self {
        let (sender, results) = channel();
        let disk = Arc::clone(sources.resolver.disk());
        let mut it = Self {
            ctx,
            sources,
            disk,
            limits,
            sender,
            results,
            local_blocks: VecDeque::new(),
            fetch_requests: VecDeque::new(),
            deferred: HashMap::new(),
            blocks_in_flight_per_address: HashMap::new(),
            bytes_in_flight: 0,
            reqs_in_flight: 0,
            num_blocks_to_fetch: 0,
            num_blocks_processed: 0,
            refetched: HashSet::new(),
            failed: false,
        };
        it.partition_blocks(blocks, batch_fetch);
        it.fetch_up_to_max_bytes();
        it
    }

    fn partition_blocks(&mut self, blocks: BlocksByAddress, batch_fetch: bool) {
        let target = self.limits.target_request_size();
        let max_blocks = self.limits.max_blocks_in_flight_per_address;
        let (mut local_bytes, mut remote_bytes, mut remote_blocks) = (0u64, 0u64, 0usize);
        for (address, infos) in blocks {
            let infos = if batch_fetch { merge_continuous_blocks(infos) } else { infos };
            self.num_blocks_to_fetch += infos.len();
            if address == self.sources.local_address {
                local_bytes += infos.iter().map(|b| b.size).sum::<u64>();
                self.local_blocks.extend(infos);
                continue;
            }
            remote_blocks += infos.len();
            let mut current = Vec::new();
            let mut current_size = 0;
            for info in infos {
                current_size += info.size;
                remote_bytes += info.size;
                current.push(info);
                if current_size >= target || current.len() >= max_blocks {
                    self.fetch_requests
                        .push_back(FetchRequest::new(address.clone(), std::mem::take(&mut current)));
                    current_size = 0;
                }
            }
            if !current.is_empty() {
                self.fetch_requests.push_back(FetchRequest::new(address, current));
            }
        }
        debug!(
            "Task {}: fetching {} blocks ({} local, {local_bytes} bytes; {remote_blocks} remote, {remote_bytes} bytes in {} requests)",
            self.ctx.task_attempt_id(),
            self.num_blocks_to_fetch,
            self.local_blocks.len(),
            self.fetch_requests.len()
        );
    }

    fn is_fetchable(&self, request: &FetchRequest) -> bool {
        self.bytes_in_flight == 0
            || (self.reqs_in_flight < self.limits.max_reqs_in_flight
                && self.bytes_in_flight + request.size <= self.limits.max_bytes_in_flight)
    }

    fn exceeds_address_limit(&self, request: &FetchRequest) -> bool {
        let in_flight = self
            .blocks_in_flight_per_address
            .get(&request.address)
            .copied()
            .unwrap_or(0);
        in_flight + request.blocks.len() > self.limits.max_blocks_in_flight_per_address
    }

    fn fetch_up_to_max_bytes(&mut self) {
        // Deferred requests first, for executors that have room again.
        let addresses: Vec<BlockManagerId> = self.deferred.keys().cloned().collect();
        for address in addresses {
            while let Some(request) = self.deferred.get_mut(&address).and_then(VecDeque::pop_front) {
                if self.is_fetchable(&request) && !self.exceeds_address_limit(&request) {
                    self.send_request(request);
                } else {
                    if let Some(queue) = self.deferred.get_mut(&address) {
                        queue.push_front(request);
                    }
                    break;
                }
            }
            if self.deferred.get(&address).is_some_and(VecDeque::is_empty) {
                self.deferred.remove(&address);
            }
        }
        while let Some(request) = self.fetch_requests.pop_front() {
            if !self.is_fetchable(&request) {
                self.fetch_requests.push_front(request);
                break;
            }
            if self.exceeds_address_limit(&request) {
                debug!(
                    "Deferring request of {} blocks to {}: too many blocks in flight",
                    request.blocks.len(),
                    request.address
                );
                self.deferred.entry(request.address.clone()).or_default().push_back(request);
            } else {
                self.send_request(request);
            }
        }
    }

    fn send_request(&mut self, request: FetchRequest) {
        debug!(
            "Sending request for {} blocks ({} bytes) to {}",
            request.blocks.len(),
            request.size,
            request.address
        );
        self.bytes_in_flight += request.size;
        self.reqs_in_flight += 1;
        *self
            .blocks_in_flight_per_address
            .entry(request.address.clone())
            .or_insert(0) += request.blocks.len();

        let to_disk = request.size > self.limits.max_remote_block_size_fetch_to_mem;
        let transport = Arc::clone(&self.sources.transport);
        let disk = Arc::clone(&self.disk);
        let sender = self.sender.clone();
        let verify = self.limits.detect_corrupt;
        self.sources
            .pool
            .spawn(move || serve_request(transport.as_ref(), &disk, &sender, request, to_disk, verify));
    }

    /// Account for a remote block that is no longer in flight.
    fn release(&mut self, info: &BlockInfo, address: &BlockManagerId, last_in_request: bool) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(info.size);
        if last_in_request {
            self.reqs_in_flight = self.reqs_in_flight.saturating_sub(1);
        }
        if let Some(n) = self.blocks_in_flight_per_address.get_mut(address) {
            *n = n.saturating_sub(1);
        }
    }

    fn metrics(&self) -> &ShuffleReadMetrics {
        &self.ctx.metrics().read
    }

    fn fail(&mut self, address: &BlockManagerId, info: &BlockInfo, message: String) -> anyhow::Error {
        self.failed = true;
        ShuffleError::fetch_failed(address, &info.block_id, info.map_index, message).into()
    }

    fn next_local(&mut self, info: BlockInfo) -> Result<FetchedBlock> {
        let address = self.sources.local_address.clone();
        match self.sources.resolver.get_block_data(&info.block_id) {
            Ok((segment, integrity)) => {
                if let (true, Some(integrity)) = (self.limits.detect_corrupt, integrity) {
                    if let Err(e) = verify_segment(&segment, integrity) {
                        return Err(self.fail(&address, &info, format!("local block is corrupt: {e:#}")));
                    }
                }
                self.metrics().inc_local_blocks_fetched(1);
                self.metrics().inc_local_bytes_read(segment.length);
                Ok(FetchedBlock {
                    block_id: info.block_id,
                    address,
                    map_index: info.map_index,
                    buffer: ManagedBuffer::Segment(segment),
                })
            }
            Err(e) => Err(self.fail(&address, &info, format!("error reading local block: {e:#}"))),
        }
    }

    fn next_remote(&mut self) -> Result<FetchedBlock> {
        loop {
            let waited = Instant::now();
            let result = self
                .results
                .recv()
                .map_err(|_| anyhow!("fetch workers stopped without a result"))?;
            #[allow(clippy::cast_possible_truncation)]
            self.metrics().inc_fetch_wait_time(waited.elapsed().as_nanos() as u64);
            match result {
                FetchResult::Success { info, address, buffer, last_in_request } => {
                    self.release(&info, &address, last_in_request);
                    self.metrics().inc_remote_blocks_fetched(1);
                    self.metrics().inc_remote_bytes_read(buffer.size()?);
                    if let ManagedBuffer::File(_) = buffer {
                        self.metrics().inc_remote_bytes_read_to_disk(buffer.size()?);
                    }
                    self.fetch_up_to_max_bytes();
                    return Ok(FetchedBlock { block_id: info.block_id, address, map_index: info.map_index, buffer });
                }
                FetchResult::Failure { info, address, error, last_in_request } => {
                    self.release(&info, &address, last_in_request);
                    if error.kind == FetchErrorKind::Corrupt && self.refetched.insert(info.block_id) {
                        warn!("Block {} from {address} is corrupt, fetching it again: {}", info.block_id, error.message);
                        self.metrics().inc_corrupt_blocks_refetched(1);
                        self.fetch_requests.push_front(FetchRequest::new(address, vec![info]));
                        self.fetch_up_to_max_bytes();
                        continue;
                    }
                    return Err(self.fail(&address, &info, error.to_string()));
                }
            }
        }
    }
}

impl Iterator for ShuffleBlockFetcherIterator {
    type Item = Result<FetchedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.num_blocks_processed >= self.num_blocks_to_fetch {
            return None;
        }
        self.num_blocks_processed += 1;
        let block = match self.local_blocks.pop_front() {
            Some(info) => self.next_local(info),
            None => self.next_remote(),
        };
        if block.is_err() {
            self.failed = true;
        }
        Some(block)
    }
}

/// Read a local segment through its checksums without keeping the bytes.
fn verify_segment(segment: &FileSegment, integrity: BlockIntegrity) -> Result<()> {
    let mut verified = ChecksumVerifier::new(segment.open()?, integrity);
    io::copy(&mut verified, &mut io::sink())
        .with_context(|| format!("verify {}", segment.path.display()))?;
    Ok(())
}

/// Merge runs of consecutive reduce partitions of one map output into batch blocks.
fn merge_continuous_blocks(blocks: Vec<BlockInfo>) -> Vec<BlockInfo> {
    let mut merged: Vec<BlockInfo> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(last) = merged.last_mut() {
            if let Some(batch) = extend_batch(&last.block_id, &block.block_id) {
                last.block_id = batch;
                last.size += block.size;
                continue;
            }
        }
        merged.push(block);
    }
    merged
}

fn extend_batch(current: &BlockId, next: &BlockId) -> Option<BlockId> {
    let BlockId::Shuffle { shuffle_id, map_id, reduce_id } = *next else {
        return None;
    };
    let (start, end) = current.reduce_range()?;
    (current.shuffle_id() == shuffle_id && current.map_id() == map_id && end == reduce_id).then_some(
        BlockId::ShuffleBatch { shuffle_id, map_id, start_reduce_id: start, end_reduce_id: reduce_id + 1 },
    )
}

fn classify(block_id: BlockId, e: &io::Error) -> BlockFetchError {
    let kind = if e.kind() == ErrorKind::InvalidData {
        FetchErrorKind::Corrupt
    } else {
        FetchErrorKind::Unreachable
    };
    BlockFetchError::new(kind, block_id, e.to_string())
}

fn receive_block(
    transport: &dyn BlockTransport,
    disk: &DiskBlockManager,
    address: &BlockManagerId,
    block_id: BlockId,
    to_disk: bool,
    verify: bool,
) -> Result<ManagedBuffer, BlockFetchError> {
    let stream = transport.fetch_block(address, &block_id)?;
    let mut reader: Box<dyn Read + Send> = match stream.integrity {
        Some(integrity) if verify => Box::new(ChecksumVerifier::new(stream.reader, integrity)),
        _ => stream.reader,
    };
    if to_disk {
        let (file, path) = disk
            .create_temp_local_file()
            .map_err(|e| BlockFetchError::new(FetchErrorKind::Unreachable, block_id, format!("{e:#}")))?
            .into_parts();
        let mut out = BufWriter::new(file);
        io::copy(&mut reader, &mut out).map_err(|e| classify(block_id, &e))?;
        out.flush().map_err(|e| classify(block_id, &e))?;
        Ok(ManagedBuffer::File(path))
    } else {
        let mut bytes = Vec::with_capacity(usize::try_from(stream.length).unwrap_or(0));
        reader.read_to_end(&mut bytes).map_err(|e| classify(block_id, &e))?;
        Ok(ManagedBuffer::Memory(bytes))
    }
}

/// Runs on a fetch worker; stops early once the iterator is gone.
fn serve_request(
    transport: &dyn BlockTransport,
    disk: &DiskBlockManager,
    sender: &Sender<FetchResult>,
    request: FetchRequest,
    to_disk: bool,
    verify: bool,
) {
    let FetchRequest { address, blocks, .. } = request;
    let count = blocks.len();
    for (i, info) in blocks.into_iter().enumerate() {
        let last_in_request = i + 1 == count;
        let result = match receive_block(transport, disk, &address, info.block_id, to_disk, verify) {
            Ok(buffer) => FetchResult::Success { info, address: address.clone(), buffer, last_in_request },
            Err(error) => FetchResult::Failure { info, address: address.clone(), error, last_in_request },
        };
        if sender.send(result).is_err() {
            return;
        }
    }
}
