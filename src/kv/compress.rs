//! Payload compression behind a small capability trait.
//!
//! The codec applies a compressor to the whole uncompressed payload; which
//! one is a configuration choice, not a type the rest of the system sees.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Compression failed: {0}")]
    Compress(String),

    #[error("Decompression failed: {0}")]
    Decompress(String),
}

/// Wire identifier of the compressor, recorded in the sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn code(&self) -> u8 {
        match self {
            CompressionType::Lz4 => 1,
            CompressionType::Zstd => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CompressionType::Lz4),
            2 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// The capability the codec needs from a compressor.
pub trait Compressor: Send + Sync {
    fn kind(&self) -> CompressionType;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// `original_size` comes from the sub-header and bounds the output.
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>, CompressError>;

    /// Worst-case compressed size for an input of `len` bytes.
    fn max_bound(&self, len: usize) -> usize;
}

/// LZ4 block compression.
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn kind(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        Ok(lz4_flex::compress(data))
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>, CompressError> {
        lz4_flex::decompress(data, original_size)
            .map_err(|e| CompressError::Decompress(e.to_string()))
    }

    fn max_bound(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len)
    }
}

/// Zstd at a configured level.
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn kind(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::encode_all(data, self.level).map_err(|e| CompressError::Compress(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _original_size: usize) -> Result<Vec<u8>, CompressError> {
        zstd::decode_all(data).map_err(|e| CompressError::Decompress(e.to_string()))
    }

    fn max_bound(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }
}

/// Construct the compressor named by a wire code.
pub fn compressor_for(kind: CompressionType, zstd_level: i32) -> Box<dyn Compressor> {
    match kind {
        CompressionType::Lz4 => Box::new(Lz4Compressor),
        CompressionType::Zstd => Box::new(ZstdCompressor::new(zstd_level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_roundtrip() {
        let data = vec![7u8; 8192];
        let c = Lz4Compressor;
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let back = c.decompress(&compressed, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 7) as u8).collect();
        let c = ZstdCompressor::new(3);
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let back = c.decompress(&compressed, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(CompressionType::from_code(1), Some(CompressionType::Lz4));
        assert_eq!(CompressionType::from_code(2), Some(CompressionType::Zstd));
        assert_eq!(CompressionType::from_code(0), None);
    }

    #[test]
    fn test_bound_covers_worst_case() {
        let c = Lz4Compressor;
        let incompressible: Vec<u8> = (0..1024u32)
            .flat_map(|i| (i.wrapping_mul(2654435761)).to_le_bytes())
            .collect();
        let out = c.compress(&incompressible).unwrap();
        assert!(out.len() <= c.max_bound(incompressible.len()));
    }
}
