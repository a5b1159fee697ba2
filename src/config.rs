//! Shuffle configuration.
//!
//! [`ShuffleConf`] is a plain struct with sensible defaults. Most callers build
//! it with struct-update syntax:
//!
//! ```
//! use ironshuffle::config::ShuffleConf;
//!
//! let conf = ShuffleConf {
//!     bypass_merge_threshold: 50,
//!     max_bytes_in_flight: 8 * 1024 * 1024,
//!     ..Default::default()
//! };
//! assert!(conf.detect_corrupt);
//! ```
//!
//! Deployments that carry configuration as strings can use [`ShuffleConf::set`]
//! or [`ShuffleConf::from_pairs`] with the keys listed in [`keys`].

use anyhow::{Context, Result, anyhow, bail};
use std::path::PathBuf;

/// Recognized string configuration keys.
pub mod keys {
    pub const BYPASS_MERGE_THRESHOLD: &str = "shuffle.sort.bypassMergeThreshold";
    pub const MAX_SIZE_IN_FLIGHT: &str = "reducer.maxSizeInFlight";
    pub const MAX_REQS_IN_FLIGHT: &str = "reducer.maxReqsInFlight";
    pub const MAX_BLOCKS_IN_FLIGHT_PER_ADDRESS: &str = "reducer.maxBlocksInFlightPerAddress";
    pub const MAX_REMOTE_BLOCK_SIZE_FETCH_TO_MEM: &str = "network.maxRemoteBlockSizeFetchToMem";
    pub const DETECT_CORRUPT: &str = "shuffle.detectCorrupt";
    pub const COMPRESS: &str = "shuffle.compress";
    pub const SPILL_COMPRESS: &str = "shuffle.spill.compress";
    pub const CODEC: &str = "io.compression.codec";
    pub const FILE_BUFFER: &str = "shuffle.file.buffer";
    pub const INITIAL_MEMORY_THRESHOLD: &str = "shuffle.spill.initialMemoryThreshold";
    pub const FORCE_SPILL_THRESHOLD: &str = "shuffle.spill.numElementsForceSpillThreshold";
    pub const CHECKSUM_ENABLED: &str = "shuffle.checksum.enabled";
    pub const BATCH_FETCH: &str = "shuffle.fetchContinuousBlocksInBatch";
    pub const CLIENT_THREADS: &str = "shuffle.io.clientThreads";
    pub const LOCAL_DIRS: &str = "local.dirs";
}

/// Upper bound on the number of reduce partitions the serialized write path can
/// address (partition ids are packed into 24 bits).
pub const MAX_SERIALIZED_MODE_PARTITIONS: usize = 1 << 24;

/// Configuration for the shuffle write and read paths.
#[derive(Clone, Debug)]
pub struct ShuffleConf {
    /// Directories used for shuffle output, spill files and fetched blocks.
    pub local_dirs: Vec<PathBuf>,
    /// Shuffles without map-side combine and with at most this many reduce
    /// partitions are written by the bypass writer.
    pub bypass_merge_threshold: usize,
    /// Maximum bytes of remote blocks in flight for one reduce task.
    pub max_bytes_in_flight: u64,
    /// Maximum number of outstanding remote fetch requests.
    pub max_reqs_in_flight: usize,
    /// Maximum number of blocks being fetched from a single executor.
    pub max_blocks_in_flight_per_address: usize,
    /// Remote requests larger than this are streamed to disk instead of memory.
    pub max_remote_block_size_fetch_to_mem: u64,
    /// Verify checksums of fetched blocks and re-fetch corrupt ones once.
    pub detect_corrupt: bool,
    /// Compress map output partitions.
    pub compress: bool,
    /// Compress spill files.
    pub spill_compress: bool,
    /// Name of the registered compression codec.
    pub codec: String,
    /// Buffer size for file output streams.
    pub file_buffer_size: usize,
    /// Memory a sorter may use before it asks the pool for more.
    pub initial_memory_threshold: u64,
    /// Spill unconditionally after this many records since the last spill.
    pub num_elements_force_spill_threshold: usize,
    /// Write a checksum file next to every map output.
    pub checksum_enabled: bool,
    /// Fetch contiguous reduce partitions of one map output as a single block.
    pub batch_fetch_enabled: bool,
    /// Threads serving remote fetch requests.
    pub fetch_threads: usize,
}

impl Default for ShuffleConf {
    fn default() -> Self {
        Self {
            local_dirs: vec![std::env::temp_dir()],
            bypass_merge_threshold: 200,
            max_bytes_in_flight: 48 * 1024 * 1024,
            max_reqs_in_flight: usize::MAX,
            max_blocks_in_flight_per_address: usize::MAX,
            max_remote_block_size_fetch_to_mem: 200 * 1024 * 1024,
            detect_corrupt: true,
            compress: true,
            spill_compress: true,
            codec: "zstd".to_string(),
            file_buffer_size: 32 * 1024,
            initial_memory_threshold: 5 * 1024 * 1024,
            num_elements_force_spill_threshold: usize::MAX,
            checksum_enabled: true,
            batch_fetch_enabled: true,
            fetch_threads: num_cpus::get().max(1),
        }
    }
}

impl ShuffleConf {
    /// Build a configuration from string key/value pairs applied over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys or values that fail to parse.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut conf = Self::default();
        for (k, v) in pairs {
            conf.set(k.as_ref(), v.as_ref())?;
        }
        Ok(conf)
    }

    /// Set a single option from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys or values that fail to parse.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            keys::BYPASS_MERGE_THRESHOLD => {
                self.bypass_merge_threshold = parse_count(key, value)?;
            }
            keys::MAX_SIZE_IN_FLIGHT => {
                self.max_bytes_in_flight = positive(key, parse_bytes(value)?)?;
            }
            keys::MAX_REQS_IN_FLIGHT => {
                self.max_reqs_in_flight = positive(key, parse_count(key, value)?)?;
            }
            keys::MAX_BLOCKS_IN_FLIGHT_PER_ADDRESS => {
                self.max_blocks_in_flight_per_address = positive(key, parse_count(key, value)?)?;
            }
            keys::MAX_REMOTE_BLOCK_SIZE_FETCH_TO_MEM => {
                self.max_remote_block_size_fetch_to_mem = parse_bytes(value)?;
            }
            keys::DETECT_CORRUPT => self.detect_corrupt = parse_bool(key, value)?,
            keys::COMPRESS => self.compress = parse_bool(key, value)?,
            keys::SPILL_COMPRESS => self.spill_compress = parse_bool(key, value)?,
            keys::CODEC => self.codec = value.to_ascii_lowercase(),
            keys::FILE_BUFFER => {
                self.file_buffer_size = usize::try_from(positive(key, parse_bytes(value)?)?)
                    .with_context(|| format!("{key} does not fit in memory"))?;
            }
            keys::INITIAL_MEMORY_THRESHOLD => {
                self.initial_memory_threshold = parse_bytes(value)?;
            }
            keys::FORCE_SPILL_THRESHOLD => {
                self.num_elements_force_spill_threshold = positive(key, parse_count(key, value)?)?;
            }
            keys::CHECKSUM_ENABLED => self.checksum_enabled = parse_bool(key, value)?,
            keys::BATCH_FETCH => self.batch_fetch_enabled = parse_bool(key, value)?,
            keys::CLIENT_THREADS => {
                self.fetch_threads = positive(key, parse_count(key, value)?)?;
            }
            keys::LOCAL_DIRS => {
                let dirs: Vec<PathBuf> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
                if dirs.is_empty() {
                    bail!("{key} must name at least one directory");
                }
                self.local_dirs = dirs;
            }
            other => bail!("unknown shuffle configuration key: {other}"),
        }
        Ok(())
    }
}

/// Parse a byte size such as `"48m"`, `"32k"`, `"1g"` or `"512"`.
///
/// # Errors
///
/// Returns an error if the number or the unit suffix is malformed.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m') => (&s[..s.len() - 1], 1u64 << 20),
        Some('g') => (&s[..s.len() - 1], 1u64 << 30),
        Some('t') => (&s[..s.len() - 1], 1u64 << 40),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => bail!("invalid byte size: {s:?}"),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid byte size: {s:?}"))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| anyhow!("byte size overflows: {s:?}"))
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    if value.eq_ignore_ascii_case("unbounded") || value.eq_ignore_ascii_case("max") {
        return Ok(usize::MAX);
    }
    value
        .parse()
        .with_context(|| format!("{key} expects a non-negative integer, got {value:?}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => bail!("{key} expects a boolean, got {value:?}"),
    }
}

fn positive<T: PartialEq + Default>(key: &str, v: T) -> Result<T> {
    if v == T::default() {
        bail!("{key} must be greater than zero");
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let conf = ShuffleConf::default();
        assert_eq!(conf.bypass_merge_threshold, 200);
        assert_eq!(conf.max_bytes_in_flight, 48 * 1024 * 1024);
        assert_eq!(conf.max_reqs_in_flight, usize::MAX);
        assert_eq!(conf.max_blocks_in_flight_per_address, usize::MAX);
        assert!(conf.detect_corrupt);
        assert!(conf.checksum_enabled);
    }

    #[test]
    fn parses_byte_sizes() -> Result<()> {
        assert_eq!(parse_bytes("512")?, 512);
        assert_eq!(parse_bytes("32k")?, 32 * 1024);
        assert_eq!(parse_bytes("48m")?, 48 * 1024 * 1024);
        assert_eq!(parse_bytes("1g")?, 1 << 30);
        assert_eq!(parse_bytes("2MB")?, 2 * 1024 * 1024);
        assert!(parse_bytes("abc").is_err());
        assert!(parse_bytes("").is_err());
        Ok(())
    }

    #[test]
    fn applies_string_pairs() -> Result<()> {
        let conf = ShuffleConf::from_pairs([
            (keys::BYPASS_MERGE_THRESHOLD, "10"),
            (keys::MAX_SIZE_IN_FLIGHT, "1m"),
            (keys::MAX_REQS_IN_FLIGHT, "4"),
            (keys::DETECT_CORRUPT, "false"),
            (keys::CODEC, "GZIP"),
            (keys::LOCAL_DIRS, "/tmp/a, /tmp/b"),
        ])?;
        assert_eq!(conf.bypass_merge_threshold, 10);
        assert_eq!(conf.max_bytes_in_flight, 1024 * 1024);
        assert_eq!(conf.max_reqs_in_flight, 4);
        assert!(!conf.detect_corrupt);
        assert_eq!(conf.codec, "gzip");
        assert_eq!(conf.local_dirs.len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_unknown_keys_and_zero_limits() {
        let mut conf = ShuffleConf::default();
        assert!(conf.set("shuffle.nope", "1").is_err());
        assert!(conf.set(keys::MAX_REQS_IN_FLIGHT, "0").is_err());
        assert!(conf.set(keys::DETECT_CORRUPT, "maybe").is_err());
    }
}
