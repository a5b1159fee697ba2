//! Byte containers handed between the resolver, the fetcher and the reader.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::TempPath;

/// A byte range of a file on local disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSegment {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl FileSegment {
    /// Open the file positioned at `offset`, limited to `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or seeked.
    pub fn open(&self) -> Result<io::Take<File>> {
        let mut file =
            File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("seek {} to {}", self.path.display(), self.offset))?;
        Ok(file.take(self.length))
    }

    /// Read the whole segment into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read in full.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.length).unwrap_or(0));
        self.open()?.read_to_end(&mut out)?;
        if out.len() as u64 != self.length {
            anyhow::bail!(
                "{} is truncated: expected {} bytes at offset {}, got {}",
                self.path.display(),
                self.length,
                self.offset,
                out.len()
            );
        }
        Ok(out)
    }
}

/// The bytes of one fetched block.
#[derive(Debug)]
pub enum ManagedBuffer {
    /// Held in memory.
    Memory(Vec<u8>),
    /// Streamed into a temp file; the file is deleted when the buffer is dropped.
    File(TempPath),
    /// A range of a committed shuffle data file on this executor.
    Segment(FileSegment),
}

impl ManagedBuffer {
    /// # Errors
    ///
    /// Returns an error if a file-backed buffer cannot be inspected.
    pub fn size(&self) -> Result<u64> {
        Ok(match self {
            ManagedBuffer::Memory(bytes) => bytes.len() as u64,
            ManagedBuffer::File(path) => std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?
                .len(),
            ManagedBuffer::Segment(seg) => seg.length,
        })
    }

    /// A reader over the bytes. A temp file stays alive until the reader is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file-backed buffer cannot be opened.
    pub fn into_reader(self) -> Result<Box<dyn Read + Send>> {
        match self {
            ManagedBuffer::Memory(bytes) => Ok(Box::new(Cursor::new(bytes))),
            ManagedBuffer::File(path) => {
                let file =
                    File::open(&path).with_context(|| format!("open {}", path.display()))?;
                Ok(Box::new(TempFileReader { file, _path: path }))
            }
            ManagedBuffer::Segment(seg) => Ok(Box::new(seg.open()?)),
        }
    }
}

struct TempFileReader {
    file: File,
    _path: TempPath,
}

impl Read for TempFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// A writer that counts the bytes passed through it.
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_reads_exact_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789")?;
        let seg = FileSegment { path, offset: 3, length: 4 };
        assert_eq!(seg.read_all()?, b"3456");
        let mut out = String::new();
        ManagedBuffer::Segment(seg).into_reader()?.read_to_string(&mut out)?;
        assert_eq!(out, "3456");
        Ok(())
    }

    #[test]
    fn temp_file_buffer_is_deleted_after_reading() -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"fetched")?;
        let path = tmp.into_temp_path();
        let on_disk = path.to_path_buf();
        let buffer = ManagedBuffer::File(path);
        assert_eq!(buffer.size()?, 7);
        let mut reader = buffer.into_reader()?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        assert!(on_disk.exists());
        drop(reader);
        assert!(!on_disk.exists());
        Ok(())
    }

    #[test]
    fn counting_writer_counts() -> Result<()> {
        let mut w = CountingWriter::new(Vec::new());
        w.write_all(b"abc")?;
        w.write_all(b"de")?;
        assert_eq!(w.count(), 5);
        assert_eq!(w.into_inner(), b"abcde");
        Ok(())
    }
}
