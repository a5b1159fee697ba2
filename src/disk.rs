//! Local directories for shuffle output, spills and fetched blocks.
//!
//! Every configured local directory gets a private `blockmgr-*` root. Files are
//! spread over hashed sub-directories of those roots so no single directory
//! grows too large. Roots are removed when the manager stops or is dropped.

use crate::block::BlockId;
use crate::config::ShuffleConf;
use crate::partitioner::hash_key;
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tempfile::{Builder, NamedTempFile, TempDir};

const SUB_DIRS_PER_LOCAL_DIR: usize = 64;

/// Prefix of temporary map output files.
pub const TEMP_SHUFFLE_PREFIX: &str = "temp_shuffle_";
/// Prefix of spill files and fetched-to-disk blocks.
pub const TEMP_LOCAL_PREFIX: &str = "temp_local_";

#[derive(Debug)]
pub struct DiskBlockManager {
    roots: Vec<PathBuf>,
    guards: Mutex<Vec<TempDir>>,
    next_temp_dir: AtomicUsize,
}

impl DiskBlockManager {
    /// Create one root per configured local directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no root could be created.
    pub fn new(conf: &ShuffleConf) -> Result<Self> {
        let mut guards = Vec::new();
        for dir in &conf.local_dirs {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!("Skipping local dir {}: {e}", dir.display());
                continue;
            }
            match Builder::new().prefix("blockmgr-").tempdir_in(dir) {
                Ok(root) => {
                    debug!("Created local directory at {}", root.path().display());
                    guards.push(root);
                }
                Err(e) => warn!("Failed to create local dir in {}: {e}", dir.display()),
            }
        }
        if guards.is_empty() {
            bail!("failed to create any local dir under {:?}", conf.local_dirs);
        }
        Ok(Self {
            roots: guards.iter().map(|g| g.path().to_path_buf()).collect(),
            guards: Mutex::new(guards),
            next_temp_dir: AtomicUsize::new(0),
        })
    }

    pub fn local_dirs(&self) -> &[PathBuf] {
        &self.roots
    }

    fn sub_dir(&self, hash: u64) -> Result<PathBuf> {
        let n = self.roots.len() as u64;
        let root = &self.roots[(hash % n) as usize];
        let sub = root.join(format!("{:02x}", (hash / n) % SUB_DIRS_PER_LOCAL_DIR as u64));
        fs::create_dir_all(&sub).with_context(|| format!("create {}", sub.display()))?;
        Ok(sub)
    }

    /// Path of a named file; its directory is created on demand.
    ///
    /// # Errors
    ///
    /// Returns an error if the sub-directory cannot be created.
    pub fn get_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.sub_dir(hash_key(name))?.join(name))
    }

    /// Path of the file that stores a block.
    ///
    /// # Errors
    ///
    /// Returns an error if the sub-directory cannot be created.
    pub fn file_for_block(&self, block: &BlockId) -> Result<PathBuf> {
        self.get_file(&block.to_string())
    }

    fn temp_file(&self, prefix: &str) -> Result<NamedTempFile> {
        let slot = self.next_temp_dir.fetch_add(1, Ordering::Relaxed) as u64;
        let dir = self.sub_dir(slot)?;
        Builder::new()
            .prefix(prefix)
            .tempfile_in(&dir)
            .with_context(|| format!("create temp file in {}", dir.display()))
    }

    /// A scratch file for one partition of a bypass writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_temp_shuffle_file(&self) -> Result<NamedTempFile> {
        self.temp_file(TEMP_SHUFFLE_PREFIX)
    }

    /// A scratch file for a spill or a block fetched to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_temp_local_file(&self) -> Result<NamedTempFile> {
        self.temp_file(TEMP_LOCAL_PREFIX)
    }

    /// Every scratch file currently on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for root in &self.roots {
            collect_temp_files(root, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    /// Delete all local directories.
    pub fn stop(&self) {
        let guards = std::mem::take(
            &mut *self.guards.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for dir in guards {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to delete local dir {}: {e}", path.display());
            }
        }
    }
}

fn collect_temp_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("list {}", dir.display())),
    };
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            collect_temp_files(&path, out)?;
        } else if entry.file_name().to_str().is_some_and(|name| {
            name.starts_with(TEMP_SHUFFLE_PREFIX) || name.starts_with(TEMP_LOCAL_PREFIX)
        }) {
            out.push(path);
        }
    }
    Ok(())
}
