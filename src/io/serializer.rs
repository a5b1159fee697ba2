//! Record serializers.
//!
//! A [`RecordSerializer`] turns typed records into framed byte sequences and back.
//! Framing is part of the serializer: a reader needs nothing but the bytes.
//!
//! - [`RecordSerializer::Postcard`] writes a little-endian `u32` length followed by
//!   the postcard encoding. Every record is self-contained, so serialized records
//!   may be reordered or concatenated without decoding them ("relocatable"),
//!   which is what the serialized sort write path relies on.
//! - [`RecordSerializer::Json`] writes one compact JSON value per line. It is
//!   meant for debugging and interop and does not promise relocation, so
//!   shuffles using it never take the serialized write path.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::marker::PhantomData;

const FRAME_HEADER: usize = 4;

/// Encoding used for records in map output, spill files and fetched blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordSerializer {
    #[default]
    Postcard,
    Json,
}

impl RecordSerializer {
    pub fn name(&self) -> &'static str {
        match self {
            RecordSerializer::Postcard => "postcard",
            RecordSerializer::Json => "json",
        }
    }

    /// Whether serialized records can be moved around as opaque bytes.
    pub fn supports_relocation(&self) -> bool {
        matches!(self, RecordSerializer::Postcard)
    }

    /// Append one framed record to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded.
    pub fn serialize_record<T: Serialize>(&self, record: &T, out: &mut Vec<u8>) -> Result<()> {
        match self {
            RecordSerializer::Postcard => {
                let bytes = postcard::to_allocvec(record).context("postcard encode record")?;
                let len = u32::try_from(bytes.len())
                    .with_context(|| format!("record of {} bytes is too large", bytes.len()))?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            RecordSerializer::Json => {
                serde_json::to_writer(&mut *out, record).context("json encode record")?;
                out.push(b'\n');
            }
        }
        Ok(())
    }

    /// Wrap `out` in a record stream writer.
    pub fn writer<W: Write>(&self, out: W) -> RecordWriter<W> {
        RecordWriter {
            serializer: *self,
            out,
            scratch: Vec::new(),
            records: 0,
        }
    }

    /// Read records of type `T` from `input` until end of stream.
    pub fn reader<T: DeserializeOwned, R: Read>(&self, input: R) -> RecordReader<T, R> {
        RecordReader {
            serializer: *self,
            input: BufReader::new(input),
            buf: Vec::new(),
            done: false,
            _t: PhantomData,
        }
    }
}

/// Writes framed records to an underlying stream.
pub struct RecordWriter<W: Write> {
    serializer: RecordSerializer,
    out: W,
    scratch: Vec<u8>,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    /// # Errors
    ///
    /// Returns an error if encoding or the underlying write fails.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.scratch.clear();
        self.serializer.serialize_record(record, &mut self.scratch)?;
        self.out.write_all(&self.scratch).context("write record")?;
        self.records += 1;
        Ok(())
    }

    /// Copy an already framed record produced by the same serializer.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    pub fn write_raw(&mut self, framed: &[u8]) -> Result<()> {
        self.out.write_all(framed).context("write serialized record")?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flush and hand back the underlying stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn into_inner(mut self) -> Result<W> {
        self.out.flush().context("flush record stream")?;
        Ok(self.out)
    }
}

/// Iterator over the records of a stream.
pub struct RecordReader<T, R: Read> {
    serializer: RecordSerializer,
    input: BufReader<R>,
    buf: Vec<u8>,
    done: bool,
    _t: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, R: Read> RecordReader<T, R> {
    fn read_postcard(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; FRAME_HEADER];
        let mut filled = 0;
        while filled < FRAME_HEADER {
            let n = match self.input.read(&mut header[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read record header"),
            };
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside a record header");
            }
            filled += n;
        }
        let len = u32::from_le_bytes(header) as usize;
        self.buf.resize(len, 0);
        self.input
            .read_exact(&mut self.buf)
            .context("stream ended inside a record")?;
        let record = postcard::from_bytes(&self.buf).context("postcard decode record")?;
        Ok(Some(record))
    }

    fn read_json(&mut self) -> Result<Option<T>> {
        loop {
            self.buf.clear();
            let n = self
                .input
                .read_until(b'\n', &mut self.buf)
                .context("read json record")?;
            if n == 0 {
                return Ok(None);
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record = serde_json::from_slice(&self.buf).context("json decode record")?;
            return Ok(Some(record));
        }
    }
}

impl<T: DeserializeOwned, R: Read> Iterator for RecordReader<T, R> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match self.serializer {
            RecordSerializer::Postcard => self.read_postcard(),
            RecordSerializer::Json => self.read_json(),
        };
        match next {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<(String, u64)> {
        vec![("a".into(), 1), ("bb".into(), 22), ("".into(), 0)]
    }

    #[test]
    fn postcard_frames_are_relocatable() -> Result<()> {
        let ser = RecordSerializer::Postcard;
        let mut first = Vec::new();
        let mut second = Vec::new();
        ser.serialize_record(&records()[0], &mut first)?;
        ser.serialize_record(&records()[1], &mut second)?;
        let mut swapped = second.clone();
        swapped.extend_from_slice(&first);
        let back: Vec<(String, u64)> = ser.reader(swapped.as_slice()).collect::<Result<_>>()?;
        assert_eq!(back, vec![records()[1].clone(), records()[0].clone()]);
        Ok(())
    }

    #[test]
    fn json_stream_round_trips() -> Result<()> {
        let ser = RecordSerializer::Json;
        let mut w = ser.writer(Vec::new());
        for r in records() {
            w.write(&r)?;
        }
        assert_eq!(w.records_written(), 3);
        let bytes = w.into_inner()?;
        let back: Vec<(String, u64)> = ser.reader(bytes.as_slice()).collect::<Result<_>>()?;
        assert_eq!(back, records());
        assert!(!ser.supports_relocation());
        Ok(())
    }

    #[test]
    fn truncated_postcard_stream_is_an_error() -> Result<()> {
        let ser = RecordSerializer::Postcard;
        let mut bytes = Vec::new();
        ser.serialize_record(&("key".to_string(), 9u64), &mut bytes)?;
        bytes.truncate(bytes.len() - 1);
        let mut reader = ser.reader::<(String, u64), _>(bytes.as_slice());
        assert!(reader.next().is_some_and(|r| r.is_err()));
        assert!(reader.next().is_none());
        Ok(())
    }
}
