//! Committed map output on local disk.
//!
//! Each successful map task leaves three files:
//!
//! ```text
//! shuffle_<s>_<m>_0.data      partitions concatenated in partition order
//! shuffle_<s>_<m>_0.index     [u64 LE offset_0 = 0][offset_1]...[offset_n]
//! shuffle_<s>_<m>_0.checksum  [u64 LE checksum_0]...[checksum_{n-1}]
//! ```
//!
//! Partition `i` spans `[offset_i, offset_{i+1})` of the data file. Files are
//! written under temporary names and renamed into place, so a reader never sees
//! a partially written output.

use crate::block::BlockId;
use crate::checksum::{BlockIntegrity, read_checksum_file, write_checksum_file};
use crate::disk::DiskBlockManager;
use crate::error::ShuffleError;
use crate::io::buffer::FileSegment;
use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::{NamedTempFile, TempPath};

/// Offsets and checksums of one committed map output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleIndex {
    offsets: Vec<u64>,
    checksums: Option<Vec<u64>>,
}

impl ShuffleIndex {
    pub fn num_partitions(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn partition_lengths(&self) -> Vec<u64> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn checksums(&self) -> Option<&[u64]> {
        self.checksums.as_deref()
    }
}

/// Parse and validate index bytes.
fn parse_offsets(path: &Path, bytes: &[u8]) -> std::result::Result<Vec<u64>, ShuffleError> {
    let invalid = |message: String| ShuffleError::InvalidIndex { path: path.to_path_buf(), message };
    if bytes.len() % 8 != 0 {
        return Err(invalid(format!("size {} is not a multiple of 8", bytes.len())));
    }
    if bytes.len() < 8 {
        return Err(invalid("index has no entries".into()));
    }
    let offsets: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
        .collect();
    if offsets[0] != 0 {
        return Err(invalid(format!("first offset is {}, expected 0", offsets[0])));
    }
    if let Some(i) = offsets.windows(2).position(|w| w[1] < w[0]) {
        return Err(invalid(format!("offset {} decreases", i + 1)));
    }
    Ok(offsets)
}

fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to delete {}: {e}", path.display());
            false
        }
    }
}

/// Locates and commits map output files of the executor it belongs to.
#[derive(Debug)]
pub struct IndexShuffleBlockResolver {
    disk: Arc<DiskBlockManager>,
    index_cache: DashMap<(u32, u64), Arc<ShuffleIndex>>,
    commit_lock: Mutex<()>,
}

impl IndexShuffleBlockResolver {
    pub fn new(disk: Arc<DiskBlockManager>) -> Self {
        Self { disk, index_cache: DashMap::new(), commit_lock: Mutex::new(()) }
    }

    pub fn disk(&self) -> &Arc<DiskBlockManager> {
        &self.disk
    }

    /// # Errors
    ///
    /// Returns an error if the directory for the file cannot be created.
    pub fn data_file(&self, shuffle_id: u32, map_id: u64) -> Result<PathBuf> {
        self.disk.file_for_block(&BlockId::ShuffleData { shuffle_id, map_id })
    }

    /// # Errors
    ///
    /// Returns an error if the directory for the file cannot be created.
    pub fn index_file(&self, shuffle_id: u32, map_id: u64) -> Result<PathBuf> {
        self.disk.file_for_block(&BlockId::ShuffleIndex { shuffle_id, map_id })
    }

    /// # Errors
    ///
    /// Returns an error if the directory for the file cannot be created.
    pub fn checksum_file(&self, shuffle_id: u32, map_id: u64) -> Result<PathBuf> {
        self.disk.file_for_block(&BlockId::ShuffleChecksum { shuffle_id, map_id })
    }

    /// A temporary file next to the final data file, so that committing is a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_temp_data_file(&self, shuffle_id: u32, map_id: u64) -> Result<NamedTempFile> {
        let data = self.data_file(shuffle_id, map_id)?;
        temp_next_to(&data)
    }

    /// Atomically commit a map output.
    ///
    /// `lengths` are the partition lengths of `data_tmp`; a `data_tmp` of
    /// `None` commits an empty data file. If another attempt of the same map task already
    /// committed a consistent output, the new files are discarded and the
    /// committed lengths are returned instead; otherwise `lengths` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the index or checksum file cannot be written or a
    /// file cannot be moved into place.
    pub fn write_metadata_and_commit(
        &self,
        shuffle_id: u32,
        map_id: u64,
        lengths: &[u64],
        checksums: Option<&[u64]>,
        data_tmp: Option<TempPath>,
    ) -> Result<Vec<u64>> {
        let index_path = self.index_file(shuffle_id, map_id)?;
        let data_path = self.data_file(shuffle_id, map_id)?;
        let checksum_path = self.checksum_file(shuffle_id, map_id)?;

        let index_tmp = temp_next_to(&index_path)?;
        {
            let mut w = BufWriter::new(index_tmp.as_file());
            let mut offset = 0u64;
            w.write_all(&offset.to_le_bytes())?;
            for len in lengths {
                offset += len;
                w.write_all(&offset.to_le_bytes())?;
            }
            w.flush()
                .with_context(|| format!("write index for {}", index_path.display()))?;
        }
        let index_tmp = index_tmp.into_temp_path();
        let checksum_tmp = match checksums {
            Some(sums) => {
                let tmp = temp_next_to(&checksum_path)?.into_temp_path();
                write_checksum_file(&tmp, sums)?;
                Some(tmp)
            }
            None => None,
        };

        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = check_index_and_data(&index_path, &data_path, lengths.len()) {
            warn!(
                "Map output shuffle_{shuffle_id}_{map_id} was already committed by another attempt; discarding this one"
            );
            // Temp paths delete themselves on drop.
            drop(index_tmp);
            drop(data_tmp);
            drop(checksum_tmp);
            return Ok(existing);
        }

        self.index_cache.remove(&(shuffle_id, map_id));
        remove_if_exists(&index_path);
        remove_if_exists(&data_path);
        remove_if_exists(&checksum_path);
        match data_tmp {
            Some(tmp) => persist_data(tmp, &data_path)
                .with_context(|| format!("commit {}", data_path.display()))?,
            None => {
                File::create(&data_path)
                    .with_context(|| format!("create {}", data_path.display()))?;
            }
        }
        if let Some(tmp) = checksum_tmp {
            tmp.persist(&checksum_path)
                .with_context(|| format!("commit {}", checksum_path.display()))?;
        }
        // Index last: its presence marks the output as committed.
        index_tmp
            .persist(&index_path)
            .with_context(|| format!("commit {}", index_path.display()))?;
        debug!(
            "Committed shuffle_{shuffle_id}_{map_id} ({} partitions, {} bytes)",
            lengths.len(),
            lengths.iter().sum::<u64>()
        );
        Ok(lengths.to_vec())
    }

    /// Read and validate the index of a committed map output.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is missing or fails validation
    /// ([`ShuffleError::InvalidIndex`]).
    pub fn read_index(&self, shuffle_id: u32, map_id: u64) -> Result<Arc<ShuffleIndex>> {
        if let Some(cached) = self.index_cache.get(&(shuffle_id, map_id)) {
            return Ok(Arc::clone(&cached));
        }
        let index_path = self.index_file(shuffle_id, map_id)?;
        let bytes =
            fs::read(&index_path).with_context(|| format!("read {}", index_path.display()))?;
        let offsets = parse_offsets(&index_path, &bytes)?;
        let checksum_path = self.checksum_file(shuffle_id, map_id)?;
        let checksums = if checksum_path.exists() {
            let sums = read_checksum_file(&checksum_path)?;
            if sums.len() + 1 != offsets.len() {
                bail!(
                    "{} has {} entries for {} partitions",
                    checksum_path.display(),
                    sums.len(),
                    offsets.len() - 1
                );
            }
            Some(sums)
        } else {
            None
        };
        let index = Arc::new(ShuffleIndex { offsets, checksums });
        self.index_cache.insert((shuffle_id, map_id), Arc::clone(&index));
        Ok(index)
    }

    /// The bytes of a `Shuffle` or `ShuffleBatch` block, with their checksums if recorded.
    ///
    /// # Errors
    ///
    /// Returns an error for non-fetchable block ids, out-of-range partitions or
    /// a missing/invalid index.
    pub fn get_block_data(&self, block_id: &BlockId) -> Result<(FileSegment, Option<BlockIntegrity>)> {
        let Some((start, end)) = block_id.reduce_range() else {
            bail!("{block_id} is not a fetchable shuffle block");
        };
        let (start, end) = (start as usize, end as usize);
        let index = self.read_index(block_id.shuffle_id(), block_id.map_id())?;
        if start >= end || end > index.num_partitions() {
            bail!(
                "{block_id} is out of range for a map output with {} partitions",
                index.num_partitions()
            );
        }
        let offsets = index.offsets();
        let segment = FileSegment {
            path: self.data_file(block_id.shuffle_id(), block_id.map_id())?,
            offset: offsets[start],
            length: offsets[end] - offsets[start],
        };
        let integrity = index.checksums().map(|sums| BlockIntegrity {
            segments: (start..end)
                .map(|p| (offsets[p + 1] - offsets[p], sums[p]))
                .collect(),
        });
        Ok((segment, integrity))
    }

    /// Delete the files of one map output. Missing files are not an error.
    pub fn remove_data_by_map(&self, shuffle_id: u32, map_id: u64) {
        self.index_cache.remove(&(shuffle_id, map_id));
        for block in [
            BlockId::ShuffleData { shuffle_id, map_id },
            BlockId::ShuffleIndex { shuffle_id, map_id },
            BlockId::ShuffleChecksum { shuffle_id, map_id },
        ] {
            match self.disk.file_for_block(&block) {
                Ok(path) => {
                    remove_if_exists(&path);
                }
                Err(e) => warn!("Cannot locate {block} for removal: {e:#}"),
            }
        }
    }

    /// Drop cached metadata.
    pub fn stop(&self) {
        self.index_cache.clear();
    }
}

/// Move a finished data file into place. A file written under another local
/// dir may sit on a different filesystem, where renaming fails; it is copied
/// next to the target first.
fn persist_data(tmp: TempPath, dest: &Path) -> Result<()> {
    let tmp = match tmp.persist(dest) {
        Ok(()) => return Ok(()),
        Err(e) if e.error.kind() == ErrorKind::CrossesDevices => e.path,
        Err(e) => return Err(e.into()),
    };
    debug!("{} is on another filesystem than {}; copying it", tmp.display(), dest.display());
    let staged = temp_next_to(dest)?;
    {
        let mut input = File::open(&tmp).with_context(|| format!("open {}", tmp.display()))?;
        let mut out = BufWriter::new(staged.as_file());
        io::copy(&mut input, &mut out).with_context(|| format!("copy {}", tmp.display()))?;
        out.flush()?;
    }
    staged.into_temp_path().persist(dest)?;
    Ok(())
}

fn temp_next_to(path: &Path) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("shuffle");
    tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))
}

/// Lengths of an existing output if its index and data file agree.
fn check_index_and_data(index: &Path, data: &Path, blocks: usize) -> Option<Vec<u64>> {
    let bytes = fs::read(index).ok()?;
    if bytes.len() != (blocks + 1) * 8 {
        return None;
    }
    let offsets = parse_offsets(index, &bytes).ok()?;
    let lengths: Vec<u64> = offsets.windows(2).map(|w| w[1] - w[0]).collect();
    let data_len = fs::metadata(data).ok()?.len();
    (data_len == lengths.iter().sum::<u64>()).then_some(lengths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::partition_checksum;
    use crate::config::ShuffleConf;
    use crate::error::ShuffleError;

    fn resolver(dir: &Path) -> Result<IndexShuffleBlockResolver> {
        let disk = DiskBlockManager::new(&ShuffleConf {
            local_dirs: vec![dir.to_path_buf()],
            ..Default::default()
        })?;
        Ok(IndexShuffleBlockResolver::new(Arc::new(disk)))
    }

    fn data_tmp(r: &IndexShuffleBlockResolver, bytes: &[u8]) -> Result<TempPath> {
        let mut tmp = r.create_temp_data_file(0, 1)?;
        tmp.write_all(bytes)?;
        Ok(tmp.into_temp_path())
    }

    #[test]
    fn commit_then_fetch_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = resolver(dir.path())?;
        let sums = [partition_checksum(b"aaa"), partition_checksum(b""), partition_checksum(b"bb")];
        let lengths =
            r.write_metadata_and_commit(0, 1, &[3, 0, 2], Some(&sums), Some(data_tmp(&r, b"aaabb")?))?;
        assert_eq!(lengths, vec![3, 0, 2]);

        let (seg, integrity) = r.get_block_data(&BlockId::Shuffle { shuffle_id: 0, map_id: 1, reduce_id: 2 })?;
        assert_eq!(seg.read_all()?, b"bb");
        assert_eq!(integrity.map(|i| i.segments), Some(vec![(2, sums[2])]));

        let batch = BlockId::ShuffleBatch { shuffle_id: 0, map_id: 1, start_reduce_id: 0, end_reduce_id: 3 };
        let (seg, integrity) = r.get_block_data(&batch)?;
        assert_eq!(seg.read_all()?, b"aaabb");
        assert_eq!(integrity.map(|i| i.segments.len()), Some(3));

        let bad = BlockId::Shuffle { shuffle_id: 0, map_id: 1, reduce_id: 3 };
        assert!(r.get_block_data(&bad).is_err());
        Ok(())
    }

    #[test]
    fn second_attempt_keeps_first_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = resolver(dir.path())?;
        r.write_metadata_and_commit(0, 1, &[1, 2], None, Some(data_tmp(&r, b"xyy")?))?;
        let second = data_tmp(&r, b"zzzz")?;
        let second_path = second.to_path_buf();
        let lengths = r.write_metadata_and_commit(0, 1, &[4, 0], None, Some(second))?;
        assert_eq!(lengths, vec![1, 2]);
        assert!(!second_path.exists());
        assert_eq!(fs::read(r.data_file(0, 1)?)?, b"xyy");
        Ok(())
    }

    #[test]
    fn empty_output_commits_empty_data_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = resolver(dir.path())?;
        r.write_metadata_and_commit(0, 1, &[0, 0, 0], None, None)?;
        assert_eq!(fs::metadata(r.data_file(0, 1)?)?.len(), 0);
        assert_eq!(r.read_index(0, 1)?.partition_lengths(), vec![0, 0, 0]);
        Ok(())
    }

    #[test]
    fn corrupt_index_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = resolver(dir.path())?;
        let mut bytes = Vec::new();
        for off in [0u64, 10, 5] {
            bytes.extend_from_slice(&off.to_le_bytes());
        }
        fs::write(r.index_file(0, 9)?, bytes)?;
        let err = r.read_index(0, 9).unwrap_err();
        assert!(matches!(err.downcast_ref::<ShuffleError>(), Some(ShuffleError::InvalidIndex { .. })));
        Ok(())
    }

    #[test]
    fn remove_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let r = resolver(dir.path())?;
        r.write_metadata_and_commit(0, 1, &[3], None, Some(data_tmp(&r, b"abc")?))?;
        r.read_index(0, 1)?;
        r.remove_data_by_map(0, 1);
        assert!(!r.data_file(0, 1)?.exists());
        assert!(r.read_index(0, 1).is_err());
        r.remove_data_by_map(0, 1);
        Ok(())
    }
}
