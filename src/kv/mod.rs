//! KV frame codec: the on-disk format for cached per-sequence KV state.
//!
//! A frame is a fixed 256-byte header followed by the serialized payload,
//! optionally compressed as a whole behind a 16-byte sub-header.

mod codec;
mod compress;

pub use codec::{
    CodecError, FrameHeader, KvDtype, KvFrame, FRAME_HEADER_SIZE, FRAME_MAGIC,
};
pub use compress::{
    compressor_for, CompressError, CompressionType, Compressor, Lz4Compressor, ZstdCompressor,
};
