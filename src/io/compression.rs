//! Pluggable compression for shuffle and spill streams.
//!
//! Every map output partition and every spill segment is written as an
//! independent compressed stream. Codecs that can decode a concatenation of
//! streams as one stream report [`CompressionCodec::supports_concatenation`];
//! the serialized write path then merges spill files by copying raw compressed
//! bytes instead of decompressing and recompressing them, and the read path
//! may fetch several contiguous partitions as one block.
//!
//! ## Built-in codecs
//!
//! When enabled via feature flags, the following codecs are registered:
//! - **gzip** via `flate2` (feature: `compression-gzip`)
//! - **zstd** via `zstd` (feature: `compression-zstd`)
//! - **bzip2** via `bzip2` (feature: `compression-bzip2`)
//! - **xz** via `xz2` (feature: `compression-xz`)
//!
//! Disabling compression (`ShuffleConf::compress = false`) selects a pass-through
//! codec named `none`.
//!
//! ## Custom codecs
//!
//! ```
//! use ironshuffle::io::compression::{
//!     CompressionCodec, FinishWrite, Uncompressed, codec_by_name, register_codec,
//! };
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//!
//! struct Passthrough;
//!
//! impl CompressionCodec for Passthrough {
//!     fn name(&self) -> &str { "passthrough" }
//!
//!     fn compressed_output<'a>(
//!         &self,
//!         out: Box<dyn Write + Send + 'a>,
//!     ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
//!         Ok(Box::new(Uncompressed(out)))
//!     }
//!
//!     fn compressed_input<'a>(
//!         &self,
//!         input: Box<dyn Read + Send + 'a>,
//!     ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
//!         Ok(input)
//!     }
//! }
//!
//! register_codec(Arc::new(Passthrough));
//! assert!(codec_by_name("passthrough").is_ok());
//! ```

use anyhow::{Result, anyhow};
use std::io::{self, Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

/// Global codec registry.
static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn CompressionCodec>>>> = RwLock::new(None);

fn init_registry() -> Vec<Arc<dyn CompressionCodec>> {
    vec![
        Arc::new(NoCompression),
        #[cfg(feature = "compression-gzip")]
        Arc::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Arc::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Arc::new(XzCodec),
    ]
}

fn get_registry() -> Vec<Arc<dyn CompressionCodec>> {
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(init_registry).clone()
}

/// Register a custom codec. A codec registered under an existing name shadows it.
pub fn register_codec(codec: Arc<dyn CompressionCodec>) {
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(init_registry).push(codec);
}

/// Look up a registered codec by name (case-insensitive).
///
/// # Errors
///
/// Returns an error if no codec with that name is registered, for example when
/// its feature flag is disabled.
pub fn codec_by_name(name: &str) -> Result<Arc<dyn CompressionCodec>> {
    get_registry()
        .into_iter()
        .rev()
        .find(|c| c.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("compression codec {name:?} is not registered"))
}

/// The codec to use given the `compress` flag and configured codec name.
///
/// # Errors
///
/// Returns an error if compression is enabled and the codec is unknown.
pub fn resolve_codec(enabled: bool, name: &str) -> Result<Arc<dyn CompressionCodec>> {
    if enabled {
        codec_by_name(name)
    } else {
        Ok(Arc::new(NoCompression))
    }
}

/// A compressing writer whose stream is completed explicitly.
///
/// `finish` writes whatever trailer the format needs and flushes the
/// underlying writer, reporting any error on the way. A writer dropped without
/// `finish` may leave a truncated stream behind.
pub trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Pass-through [`FinishWrite`] for formats without a trailer.
pub struct Uncompressed<W>(pub W);

impl<W: Write> Write for Uncompressed<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> FinishWrite for Uncompressed<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

/// Pluggable compression codec.
///
/// The shuffle writers measure a segment's length right after finishing its
/// compressed stream.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g. "gzip", "zstd").
    fn name(&self) -> &str;

    /// Whether decoding the concatenation of two compressed streams yields the
    /// concatenation of their contents.
    fn supports_concatenation(&self) -> bool {
        false
    }

    /// Wrap a writer with compression.
    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>>;

    /// Wrap a reader with decompression.
    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>>;
}

struct NoCompression;

impl CompressionCodec for NoCompression {
    fn name(&self) -> &str {
        "none"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
        Ok(Box::new(Uncompressed(out)))
    }

    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
        Ok(input)
    }
}

// ============================================================================
// Built-in Codec Implementations
// ============================================================================

#[cfg(feature = "compression-gzip")]
impl<W: Write + Send> FinishWrite for flate2::write::GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        flate2::write::GzEncoder::finish(*self)?.flush()
    }
}

#[cfg(feature = "compression-zstd")]
impl<W: Write + Send> FinishWrite for zstd::stream::write::Encoder<'_, W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        zstd::stream::write::Encoder::finish(*self)?.flush()
    }
}

#[cfg(feature = "compression-bzip2")]
impl<W: Write + Send> FinishWrite for bzip2::write::BzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        bzip2::write::BzEncoder::finish(*self)?.flush()
    }
}

#[cfg(feature = "compression-xz")]
impl<W: Write + Send> FinishWrite for xz2::write::XzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        xz2::write::XzEncoder::finish(*self)?.flush()
    }
}

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        Ok(Box::new(GzEncoder::new(out, Compression::fast())))
    }

    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(input)))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
        zstd::stream::write::Encoder::new(out, 1).map(|e| Box::new(e) as Box<dyn FinishWrite + 'a>)
    }

    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
        zstd::stream::read::Decoder::new(input).map(|d| Box::new(d) as Box<dyn Read + Send + 'a>)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
        use bzip2::Compression;
        use bzip2::write::BzEncoder;
        Ok(Box::new(BzEncoder::new(out, Compression::fast())))
    }

    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
        use bzip2::read::MultiBzDecoder;
        Ok(Box::new(MultiBzDecoder::new(input)))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn supports_concatenation(&self) -> bool {
        true
    }

    fn compressed_output<'a>(
        &self,
        out: Box<dyn Write + Send + 'a>,
    ) -> std::io::Result<Box<dyn FinishWrite + 'a>> {
        use xz2::write::XzEncoder;
        Ok(Box::new(XzEncoder::new(out, 1)))
    }

    fn compressed_input<'a>(
        &self,
        input: Box<dyn Read + Send + 'a>,
    ) -> std::io::Result<Box<dyn Read + Send + 'a>> {
        use xz2::read::XzDecoder;
        Ok(Box::new(XzDecoder::new_multi_decoder(input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(codec: &dyn CompressionCodec, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = codec.compressed_output(Box::new(&mut out)).unwrap();
            w.write_all(data).unwrap();
            w.finish().unwrap();
        }
        out
    }

    fn decompress(codec: &dyn CompressionCodec, data: &[u8]) -> Vec<u8> {
        let mut r = codec.compressed_input(Box::new(data)).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn builtin_codecs_decode_concatenated_streams() {
        for codec in get_registry() {
            if !codec.supports_concatenation() {
                continue;
            }
            let mut joined = compress(codec.as_ref(), b"hello ");
            joined.extend(compress(codec.as_ref(), b"world"));
            assert_eq!(decompress(codec.as_ref(), &joined), b"hello world", "{}", codec.name());
        }
    }

    #[test]
    fn disabled_compression_is_passthrough() -> Result<()> {
        let codec = resolve_codec(false, "does-not-matter")?;
        assert_eq!(codec.name(), "none");
        assert_eq!(compress(codec.as_ref(), b"raw"), b"raw");
        assert!(resolve_codec(true, "no-such-codec").is_err());
        Ok(())
    }

    struct Unwritable;

    impl Write for Unwritable {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn finishing_reports_write_errors_of_every_codec() {
        for codec in get_registry() {
            let mut w = codec.compressed_output(Box::new(Unwritable)).unwrap();
            let result = w.write_all(b"some bytes").and_then(|()| w.finish());
            assert!(result.is_err(), "{} swallowed a write error", codec.name());
        }
    }
}
