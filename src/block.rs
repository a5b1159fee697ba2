//! Block identifiers and executor locations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a block manager (one per executor).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockManagerId {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
}

impl BlockManagerId {
    pub fn new(executor_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { executor_id: executor_id.into(), host: host.into(), port }
    }
}

impl fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockManagerId({}, {}, {})", self.executor_id, self.host, self.port)
    }
}

/// Identifies a unit of shuffle data.
///
/// `Shuffle` and `ShuffleBatch` are fetchable; the others name the files a map
/// task commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockId {
    /// One reduce partition of one map output.
    Shuffle { shuffle_id: u32, map_id: u64, reduce_id: u32 },
    /// Contiguous reduce partitions `[start_reduce_id, end_reduce_id)` of one map output.
    ShuffleBatch { shuffle_id: u32, map_id: u64, start_reduce_id: u32, end_reduce_id: u32 },
    ShuffleData { shuffle_id: u32, map_id: u64 },
    ShuffleIndex { shuffle_id: u32, map_id: u64 },
    ShuffleChecksum { shuffle_id: u32, map_id: u64 },
}

impl BlockId {
    pub fn shuffle_id(&self) -> u32 {
        match *self {
            BlockId::Shuffle { shuffle_id, .. }
            | BlockId::ShuffleBatch { shuffle_id, .. }
            | BlockId::ShuffleData { shuffle_id, .. }
            | BlockId::ShuffleIndex { shuffle_id, .. }
            | BlockId::ShuffleChecksum { shuffle_id, .. } => shuffle_id,
        }
    }

    pub fn map_id(&self) -> u64 {
        match *self {
            BlockId::Shuffle { map_id, .. }
            | BlockId::ShuffleBatch { map_id, .. }
            | BlockId::ShuffleData { map_id, .. }
            | BlockId::ShuffleIndex { map_id, .. }
            | BlockId::ShuffleChecksum { map_id, .. } => map_id,
        }
    }

    /// Reduce partitions covered by a fetchable block, `None` for file blocks.
    pub fn reduce_range(&self) -> Option<(u32, u32)> {
        match *self {
            BlockId::Shuffle { reduce_id, .. } => Some((reduce_id, reduce_id + 1)),
            BlockId::ShuffleBatch { start_reduce_id, end_reduce_id, .. } => {
                Some((start_reduce_id, end_reduce_id))
            }
            _ => None,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Shuffle { shuffle_id, map_id, reduce_id } => {
                write!(f, "shuffle_{shuffle_id}_{map_id}_{reduce_id}")
            }
            BlockId::ShuffleBatch { shuffle_id, map_id, start_reduce_id, end_reduce_id } => {
                write!(f, "shuffle_{shuffle_id}_{map_id}_{start_reduce_id}_{end_reduce_id}")
            }
            BlockId::ShuffleData { shuffle_id, map_id } => {
                write!(f, "shuffle_{shuffle_id}_{map_id}_0.data")
            }
            BlockId::ShuffleIndex { shuffle_id, map_id } => {
                write!(f, "shuffle_{shuffle_id}_{map_id}_0.index")
            }
            BlockId::ShuffleChecksum { shuffle_id, map_id } => {
                write!(f, "shuffle_{shuffle_id}_{map_id}_0.checksum")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_file_layout() {
        let data = BlockId::ShuffleData { shuffle_id: 1, map_id: 7 };
        assert_eq!(data.to_string(), "shuffle_1_7_0.data");
        let batch = BlockId::ShuffleBatch { shuffle_id: 1, map_id: 7, start_reduce_id: 2, end_reduce_id: 5 };
        assert_eq!(batch.to_string(), "shuffle_1_7_2_5");
        assert_eq!(batch.reduce_range(), Some((2, 5)));
        assert_eq!(data.reduce_range(), None);
    }
}
