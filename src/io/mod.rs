//! Record encoding, compression and byte buffers shared by the write and read paths.

pub mod buffer;
pub mod compression;
pub mod serializer;

pub use buffer::{CountingWriter, FileSegment, ManagedBuffer};
pub use compression::{CompressionCodec, codec_by_name, register_codec, resolve_codec};
pub use serializer::{RecordReader, RecordSerializer, RecordWriter};
