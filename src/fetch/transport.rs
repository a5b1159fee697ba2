//! Block transport: how a reduce task obtains bytes from another executor.

use crate::block::{BlockId, BlockManagerId};
use crate::checksum::BlockIntegrity;
use crate::error::{BlockFetchError, FetchErrorKind};
use crate::resolver::IndexShuffleBlockResolver;
use dashmap::DashMap;
use log::info;
use std::io::Read;
use std::sync::Arc;

/// A block response: its bytes and, when recorded, their checksums.
pub struct BlockStream {
    pub reader: Box<dyn Read + Send>,
    pub length: u64,
    pub integrity: Option<BlockIntegrity>,
}

/// Fetch protocol between executors.
pub trait BlockTransport: Send + Sync {
    /// Open a stream over one `Shuffle` or `ShuffleBatch` block.
    ///
    /// # Errors
    ///
    /// Returns [`FetchErrorKind::Unreachable`] if the executor is gone and
    /// [`FetchErrorKind::NotFound`] if it does not have the block.
    fn fetch_block(&self, address: &BlockManagerId, block_id: &BlockId) -> Result<BlockStream, BlockFetchError>;
}

/// Transport between executors living in one process: a fetch reads the
/// serving executor's committed files through its resolver.
#[derive(Default)]
pub struct LocalClusterTransport {
    executors: DashMap<BlockManagerId, Arc<IndexShuffleBlockResolver>>,
}

impl LocalClusterTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_executor(&self, address: BlockManagerId, resolver: Arc<IndexShuffleBlockResolver>) {
        info!("Registered executor {address} with the local transport");
        self.executors.insert(address, resolver);
    }

    /// Make an executor unreachable.
    pub fn remove_executor(&self, address: &BlockManagerId) {
        if self.executors.remove(address).is_some() {
            info!("Removed executor {address} from the local transport");
        }
    }
}

impl BlockTransport for LocalClusterTransport {
    fn fetch_block(&self, address: &BlockManagerId, block_id: &BlockId) -> Result<BlockStream, BlockFetchError> {
        let resolver = self
            .executors
            .get(address)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| BlockFetchError::new(FetchErrorKind::Unreachable, *block_id, format!("{address} is not reachable")))?;
        let not_found = |e: anyhow::Error| BlockFetchError::new(FetchErrorKind::NotFound, *block_id, format!("{e:#}"));
        let (segment, integrity) = resolver.get_block_data(block_id).map_err(not_found)?;
        let reader = segment.open().map_err(not_found)?;
        Ok(BlockStream { reader: Box::new(reader), length: segment.length, integrity })
    }
}
