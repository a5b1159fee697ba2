//! Partition checksums.
//!
//! A committed map output carries one 64-bit checksum per reduce partition,
//! taken from the first eight bytes of the SHA-256 digest of the partition's
//! bytes exactly as stored in the data file. Fetch responses carry the
//! checksums of the partitions they cover as a [`BlockIntegrity`], and the
//! fetcher verifies them while receiving with a [`ChecksumVerifier`].

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

fn digest_to_u64(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Checksum of one partition's stored bytes.
pub fn partition_checksum(bytes: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    digest_to_u64(hasher)
}

/// Integrity information for a fetched block: one `(length, checksum)` pair per
/// partition segment, in stream order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIntegrity {
    pub segments: Vec<(u64, u64)>,
}

impl BlockIntegrity {
    pub fn total_length(&self) -> u64 {
        self.segments.iter().map(|(len, _)| len).sum()
    }
}

/// Writer that checksums and counts bytes, one partition segment at a time.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    segment_len: u64,
    total: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new(), segment_len: 0, total: 0 }
    }

    /// Close the current segment and return its `(length, checksum)`.
    pub fn finish_segment(&mut self) -> (u64, u64) {
        let hasher = std::mem::take(&mut self.hasher);
        let len = std::mem::take(&mut self.segment_len);
        (len, digest_to_u64(hasher))
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.segment_len += n as u64;
        self.total += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write a checksum file: one little-endian `u64` per partition.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_checksum_file(path: &Path, checksums: &[u64]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for c in checksums {
        w.write_all(&c.to_le_bytes())?;
    }
    w.flush().with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Read a checksum file written by [`write_checksum_file`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or has a partial entry.
pub fn read_checksum_file(path: &Path) -> Result<Vec<u64>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.len() % 8 != 0 {
        bail!("{} has a partial checksum entry", path.display());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
        .collect())
}

/// Reader that verifies a stream against a [`BlockIntegrity`] as it is read.
///
/// A checksum mismatch, a short stream or trailing bytes surface as an
/// [`ErrorKind::InvalidData`] error.
pub struct ChecksumVerifier<R: Read> {
    inner: R,
    segments: std::vec::IntoIter<(u64, u64)>,
    current: Option<(u64, u64)>,
    remaining: u64,
    hasher: Sha256,
}

impl<R: Read> ChecksumVerifier<R> {
    pub fn new(inner: R, integrity: BlockIntegrity) -> Self {
        let mut v = Self {
            inner,
            segments: integrity.segments.into_iter(),
            current: None,
            remaining: 0,
            hasher: Sha256::new(),
        };
        v.advance();
        v
    }

    fn advance(&mut self) {
        self.current = self.segments.next();
        self.remaining = self.current.map_or(0, |(len, _)| len);
        self.hasher = Sha256::new();
    }

    /// Close every segment whose bytes have all been seen.
    fn settle(&mut self) -> io::Result<()> {
        while let Some((len, expected)) = self.current {
            if self.remaining > 0 {
                break;
            }
            let actual = digest_to_u64(std::mem::take(&mut self.hasher));
            if actual != expected {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("checksum mismatch on a {len} byte segment: expected {expected:#x}, got {actual:#x}"),
                ));
            }
            self.advance();
        }
        Ok(())
    }
}

impl<R: Read> Read for ChecksumVerifier<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.settle()?;
        if self.current.is_none() {
            let mut extra = [0u8; 1];
            return match self.inner.read(&mut extra)? {
                0 => Ok(0),
                _ => Err(io::Error::new(ErrorKind::InvalidData, "block is longer than expected")),
            };
        }
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("block ended {} bytes early", self.remaining),
            ));
        }
        self.hasher.update(&buf[..n]);
        self.remaining -= n as u64;
        self.settle()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrity(parts: &[&[u8]]) -> BlockIntegrity {
        BlockIntegrity {
            segments: parts.iter().map(|p| (p.len() as u64, partition_checksum(p))).collect(),
        }
    }

    #[test]
    fn verifier_accepts_intact_block() -> io::Result<()> {
        let parts: [&[u8]; 3] = [b"alpha", b"", b"gamma"];
        let mut v = ChecksumVerifier::new(&b"alphagamma"[..], integrity(&parts));
        let mut out = Vec::new();
        v.read_to_end(&mut out)?;
        assert_eq!(out, b"alphagamma");
        Ok(())
    }

    #[test]
    fn verifier_rejects_flipped_byte_and_truncation() {
        let parts: [&[u8]; 2] = [b"alpha", b"gamma"];
        let mut out = Vec::new();
        let err = ChecksumVerifier::new(&b"alphaGamma"[..], integrity(&parts))
            .read_to_end(&mut out)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = ChecksumVerifier::new(&b"alphagam"[..], integrity(&parts))
            .read_to_end(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = ChecksumVerifier::new(&b"alphagamma!"[..], integrity(&parts))
            .read_to_end(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn writer_segments_match_direct_checksums() -> Result<()> {
        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(b"one")?;
        let first = w.finish_segment();
        let empty = w.finish_segment();
        w.write_all(b"three")?;
        let third = w.finish_segment();
        assert_eq!(first, (3, partition_checksum(b"one")));
        assert_eq!(empty, (0, partition_checksum(b"")));
        assert_eq!(third, (5, partition_checksum(b"three")));
        assert_eq!(w.total(), 8);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.checksum");
        write_checksum_file(&path, &[first.1, empty.1, third.1])?;
        assert_eq!(read_checksum_file(&path)?, vec![first.1, empty.1, third.1]);
        Ok(())
    }
}
