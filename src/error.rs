//! Shuffle error taxonomy.
//!
//! Every fallible operation in the crate returns [`anyhow::Result`]. Failures the
//! caller must tell apart from an ordinary task failure are [`ShuffleError`]
//! values carried inside the `anyhow::Error`; use [`is_fetch_failure`] and
//! [`is_task_killed`] to classify them.

use crate::block::{BlockId, BlockManagerId};
use std::fmt;
use std::path::PathBuf;

/// Shuffle failures that callers act on individually.
#[derive(Debug, Clone)]
pub enum ShuffleError {
    /// A map output block could not be fetched. The scheduler is expected to
    /// recompute the map output instead of only retrying the reduce task.
    FetchFailed {
        address: BlockManagerId,
        shuffle_id: u32,
        map_id: u64,
        map_index: usize,
        reduce_id: u32,
        message: String,
    },
    /// The map-output directory has no location for a map output.
    MetadataFetchFailed {
        shuffle_id: u32,
        reduce_id: u32,
        message: String,
    },
    /// The owning task was cancelled while the pipeline was being consumed.
    TaskKilled { reason: String },
    /// An index file violates the layout invariants.
    InvalidIndex { path: PathBuf, message: String },
}

impl ShuffleError {
    pub(crate) fn fetch_failed(
        address: &BlockManagerId,
        block_id: &BlockId,
        map_index: usize,
        message: impl Into<String>,
    ) -> Self {
        let (shuffle_id, map_id, reduce_id) = match *block_id {
            BlockId::Shuffle { shuffle_id, map_id, reduce_id } => (shuffle_id, map_id, reduce_id),
            BlockId::ShuffleBatch { shuffle_id, map_id, start_reduce_id, .. } => {
                (shuffle_id, map_id, start_reduce_id)
            }
            BlockId::ShuffleData { shuffle_id, map_id }
            | BlockId::ShuffleIndex { shuffle_id, map_id }
            | BlockId::ShuffleChecksum { shuffle_id, map_id } => (shuffle_id, map_id, 0),
        };
        ShuffleError::FetchFailed {
            address: address.clone(),
            shuffle_id,
            map_id,
            map_index,
            reduce_id,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShuffleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShuffleError::FetchFailed {
                address,
                shuffle_id,
                map_id,
                map_index,
                reduce_id,
                message,
            } => write!(
                f,
                "fetch failed from {address} (shuffle {shuffle_id}, map {map_id} [index {map_index}], reduce {reduce_id}): {message}"
            ),
            ShuffleError::MetadataFetchFailed { shuffle_id, reduce_id, message } => write!(
                f,
                "missing map output location for shuffle {shuffle_id}, reduce {reduce_id}: {message}"
            ),
            ShuffleError::TaskKilled { reason } => write!(f, "task killed: {reason}"),
            ShuffleError::InvalidIndex { path, message } => {
                write!(f, "invalid shuffle index {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ShuffleError {}

/// Failure modes of the block fetch protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The serving executor has no such block.
    NotFound,
    /// The bytes did not match their integrity check.
    Corrupt,
    /// The serving executor could not be reached.
    Unreachable,
}

/// Error returned by a [`BlockTransport`](crate::fetch::BlockTransport).
#[derive(Debug, Clone)]
pub struct BlockFetchError {
    pub kind: FetchErrorKind,
    pub block_id: BlockId,
    pub message: String,
}

impl BlockFetchError {
    pub fn new(kind: FetchErrorKind, block_id: BlockId, message: impl Into<String>) -> Self {
        Self { kind, block_id, message: message.into() }
    }
}

impl fmt::Display for BlockFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} fetching {}: {}", self.kind, self.block_id, self.message)
    }
}

impl std::error::Error for BlockFetchError {}

/// True if the error (or any error in its chain) is a fetch failure that should
/// trigger recomputation of map output.
pub fn is_fetch_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(
            e.downcast_ref::<ShuffleError>(),
            Some(ShuffleError::FetchFailed { .. } | ShuffleError::MetadataFetchFailed { .. })
        )
    })
}

/// True if the error reports that the owning task was cancelled.
pub fn is_task_killed(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<ShuffleError>(), Some(ShuffleError::TaskKilled { .. })))
}
