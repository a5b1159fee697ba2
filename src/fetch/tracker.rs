//! Map-output directory: where each map output lives and how large it is.

use crate::block::{BlockId, BlockManagerId};
use crate::dependency::MapStatus;
use crate::error::ShuffleError;
use anyhow::{Result, bail};
use dashmap::DashMap;
use log::{debug, info};
use std::collections::HashMap;

/// One non-empty block a reduce task must fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    /// Estimated size from the map status; never 0.
    pub size: u64,
    /// Index of the map task within its stage.
    pub map_index: usize,
}

/// Blocks of one reduce range grouped by the executor serving them.
pub type BlocksByAddress = Vec<(BlockManagerId, Vec<BlockInfo>)>;

/// Lookup side of the map-output directory.
pub trait MapOutputTracker: Send + Sync {
    /// Non-empty blocks of reduce partitions `[start_partition, end_partition)`
    /// of every map output, grouped by location.
    ///
    /// # Errors
    ///
    /// Returns [`ShuffleError::MetadataFetchFailed`] if the shuffle is unknown
    /// or some map output has no location.
    fn get_map_sizes_by_executor_id(
        &self,
        shuffle_id: u32,
        start_partition: usize,
        end_partition: usize,
    ) -> Result<BlocksByAddress>;
}

/// In-process map-output directory shared by every executor of a local cluster.
#[derive(Debug, Default)]
pub struct LocalMapOutputTracker {
    shuffles: DashMap<u32, Vec<Option<MapStatus>>>,
}

impl LocalMapOutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a shuffle with `num_maps` map tasks. Re-registering keeps
    /// the outputs already known.
    pub fn register_shuffle(&self, shuffle_id: u32, num_maps: usize) {
        self.shuffles
            .entry(shuffle_id)
            .or_insert_with(|| vec![None; num_maps]);
    }

    /// Record the output of map task `map_index`, replacing an earlier attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the shuffle is unknown or `map_index` is out of range.
    pub fn register_map_output(&self, shuffle_id: u32, map_index: usize, status: MapStatus) -> Result<()> {
        let Some(mut outputs) = self.shuffles.get_mut(&shuffle_id) else {
            bail!("shuffle {shuffle_id} is not registered");
        };
        let num_maps = outputs.len();
        let Some(slot) = outputs.get_mut(map_index) else {
            bail!("map index {map_index} out of range for shuffle {shuffle_id} with {num_maps} maps");
        };
        debug!("Registered map output {map_index} of shuffle {shuffle_id} at {}", status.location());
        *slot = Some(status);
        Ok(())
    }

    /// Forget one map output if it still lives at `location`.
    pub fn unregister_map_output(&self, shuffle_id: u32, map_index: usize, location: &BlockManagerId) {
        if let Some(mut outputs) = self.shuffles.get_mut(&shuffle_id) {
            if let Some(slot) = outputs.get_mut(map_index) {
                if slot.as_ref().is_some_and(|s| s.location() == location) {
                    *slot = None;
                }
            }
        }
    }

    /// Forget every map output stored on a lost executor.
    pub fn remove_outputs_on_executor(&self, executor_id: &str) {
        let mut removed = 0;
        for mut outputs in self.shuffles.iter_mut() {
            for slot in outputs.iter_mut() {
                if slot.as_ref().is_some_and(|s| s.location().executor_id == executor_id) {
                    *slot = None;
                    removed += 1;
                }
            }
        }
        info!("Removed {removed} map outputs on lost executor {executor_id}");
    }

    pub fn unregister_shuffle(&self, shuffle_id: u32) {
        self.shuffles.remove(&shuffle_id);
    }

    pub fn contains_shuffle(&self, shuffle_id: u32) -> bool {
        self.shuffles.contains_key(&shuffle_id)
    }

    /// Number of map outputs with a known location.
    pub fn num_available_outputs(&self, shuffle_id: u32) -> usize {
        self.shuffles
            .get(&shuffle_id)
            .map_or(0, |outputs| outputs.iter().flatten().count())
    }
}

impl MapOutputTracker for LocalMapOutputTracker {
    fn get_map_sizes_by_executor_id(
        &self,
        shuffle_id: u32,
        start_partition: usize,
        end_partition: usize,
    ) -> Result<BlocksByAddress> {
        let reduce_id = u32::try_from(start_partition).unwrap_or(u32::MAX);
        let Some(outputs) = self.shuffles.get(&shuffle_id) else {
            return Err(ShuffleError::MetadataFetchFailed {
                shuffle_id,
                reduce_id,
                message: format!("shuffle {shuffle_id} is not registered"),
            }
            .into());
        };
        let mut grouped: BlocksByAddress = Vec::new();
        let mut slots: HashMap<BlockManagerId, usize> = HashMap::new();
        for (map_index, output) in outputs.iter().enumerate() {
            let Some(status) = output else {
                return Err(ShuffleError::MetadataFetchFailed {
                    shuffle_id,
                    reduce_id,
                    message: format!("missing an output location for map index {map_index}"),
                }
                .into());
            };
            let slot = *slots.entry(status.location().clone()).or_insert_with(|| {
                grouped.push((status.location().clone(), Vec::new()));
                grouped.len() - 1
            });
            for reduce in start_partition..end_partition {
                let size = status.size_for_block(reduce);
                if size == 0 {
                    continue;
                }
                grouped[slot].1.push(BlockInfo {
                    block_id: BlockId::Shuffle {
                        shuffle_id,
                        map_id: status.map_id(),
                        reduce_id: u32::try_from(reduce)?,
                    },
                    size,
                    map_index,
                });
            }
        }
        grouped.retain(|(_, blocks)| !blocks.is_empty());
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fetch_failure;

    fn loc(id: &str) -> BlockManagerId {
        BlockManagerId::new(id, "localhost", 7000)
    }

    #[test]
    fn groups_non_empty_blocks_by_location() -> Result<()> {
        let tracker = LocalMapOutputTracker::new();
        tracker.register_shuffle(0, 3);
        tracker.register_map_output(0, 0, MapStatus::new(loc("a"), &[10, 0, 5], 100))?;
        tracker.register_map_output(0, 1, MapStatus::new(loc("b"), &[0, 0, 0], 101))?;
        tracker.register_map_output(0, 2, MapStatus::new(loc("a"), &[1, 2, 3], 102))?;
        let blocks = tracker.get_map_sizes_by_executor_id(0, 0, 2)?;
        assert_eq!(blocks.len(), 1);
        let (address, infos) = &blocks[0];
        assert_eq!(address, &loc("a"));
        let ids: Vec<_> = infos.iter().map(|b| (b.map_index, b.block_id.reduce_range())).collect();
        assert_eq!(ids, vec![(0, Some((0, 1))), (2, Some((0, 1))), (2, Some((1, 2)))]);
        Ok(())
    }

    #[test]
    fn missing_outputs_are_metadata_failures() -> Result<()> {
        let tracker = LocalMapOutputTracker::new();
        let unknown = tracker.get_map_sizes_by_executor_id(9, 0, 1);
        assert!(unknown.is_err_and(|e| is_fetch_failure(&e)));

        tracker.register_shuffle(1, 2);
        tracker.register_map_output(1, 0, MapStatus::new(loc("a"), &[1], 1))?;
        assert!(tracker.get_map_sizes_by_executor_id(1, 0, 1).is_err());

        tracker.register_map_output(1, 1, MapStatus::new(loc("b"), &[1], 2))?;
        assert_eq!(tracker.num_available_outputs(1), 2);
        tracker.remove_outputs_on_executor("b");
        assert_eq!(tracker.num_available_outputs(1), 1);
        Ok(())
    }
}
