//! The `.kvc` frame format.
//!
//! One frame per cached context: a fixed 256-byte header, then the payload
//! (per layer, K tensor bytes followed by V tensor bytes). A compressed
//! payload is prefixed by a 16-byte "SCMP" sub-header and `data_crc32`
//! always covers the uncompressed bytes so integrity survives decompression.

use bytes::Bytes;
use thiserror::Error;

use super::compress::{compressor_for, CompressError, CompressionType, Compressor};

/// Frame magic: `S K V C`.
pub const FRAME_MAGIC: [u8; 4] = *b"SKVC";

/// Fixed header size.
pub const FRAME_HEADER_SIZE: usize = 256;

/// Compression sub-header magic.
const SCMP_MAGIC: [u8; 4] = *b"SCMP";

/// Compression sub-header size.
const SCMP_SIZE: usize = 16;

const FRAME_VERSION: u32 = 1;

const FLAG_COMPRESSED: u32 = 1 << 0;
const FLAG_QUANTIZED: u32 = 1 << 1;

/// Field offsets within the fixed header.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_CONTEXT_ID: usize = 12;
const OFF_FINGERPRINT: usize = 76;
const OFF_CREATED_AT: usize = 140;
const OFF_NUM_LAYERS: usize = 148;
const OFF_NUM_KV_HEADS: usize = 152;
const OFF_HEAD_DIM: usize = 156;
const OFF_SEQ_LEN: usize = 160;
const OFF_DTYPE: usize = 164;
const OFF_DATA_SIZE: usize = 168;
const OFF_HEADER_CRC: usize = 176;
const OFF_DATA_CRC: usize = 180;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported frame version {0}")]
    BadVersion(u32),

    #[error("Header CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderCrc { stored: u32, computed: u32 },

    #[error("Payload CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    DataCrc { stored: u32, computed: u32 },

    #[error("Frame truncated: {actual} bytes, need {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("Bad compression sub-header")]
    BadSubHeader,

    #[error("Unknown dtype code {0}")]
    UnknownDtype(u32),

    #[error("Unknown compression code {0}")]
    UnknownCompression(u8),

    #[error("Identifier {0:?} exceeds 64 bytes")]
    IdTooLong(String),

    #[error(transparent)]
    Compress(#[from] CompressError),
}

/// Element type of the cached K/V tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvDtype {
    Fp32,
    Fp16,
    Bf16,
    Int8,
    /// Two values per byte.
    Int4,
}

impl KvDtype {
    pub fn code(&self) -> u32 {
        match self {
            KvDtype::Fp32 => 0,
            KvDtype::Fp16 => 1,
            KvDtype::Bf16 => 2,
            KvDtype::Int8 => 3,
            KvDtype::Int4 => 4,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(KvDtype::Fp32),
            1 => Ok(KvDtype::Fp16),
            2 => Ok(KvDtype::Bf16),
            3 => Ok(KvDtype::Int8),
            4 => Ok(KvDtype::Int4),
            other => Err(CodecError::UnknownDtype(other)),
        }
    }

    /// Stored bytes for `n` elements.
    pub fn bytes_for(&self, n: usize) -> usize {
        match self {
            KvDtype::Fp32 => n * 4,
            KvDtype::Fp16 | KvDtype::Bf16 => n * 2,
            KvDtype::Int8 => n,
            KvDtype::Int4 => n.div_ceil(2),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u32,
    pub flags: u32,
    pub context_id: String,
    pub model_fingerprint: String,
    pub created_at: u64,
    pub num_layers: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub sequence_length: u32,
    pub dtype: KvDtype,
    /// Uncompressed payload size.
    pub data_size: u64,
    pub data_crc32: u32,
}

impl FrameHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_quantized(&self) -> bool {
        self.flags & FLAG_QUANTIZED != 0
    }

    /// Expected on-disk file size for an uncompressed frame.
    pub fn expected_file_size(&self) -> Option<u64> {
        if self.is_compressed() {
            None
        } else {
            Some(FRAME_HEADER_SIZE as u64 + self.data_size)
        }
    }

    /// Serialize to the fixed 256-byte layout, computing `header_crc32`.
    pub fn encode(&self) -> Result<[u8; FRAME_HEADER_SIZE], CodecError> {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&FRAME_MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        write_padded(&mut buf[OFF_CONTEXT_ID..OFF_CONTEXT_ID + 64], &self.context_id)?;
        write_padded(
            &mut buf[OFF_FINGERPRINT..OFF_FINGERPRINT + 64],
            &self.model_fingerprint,
        )?;
        buf[OFF_CREATED_AT..OFF_CREATED_AT + 8].copy_from_slice(&self.created_at.to_le_bytes());
        buf[OFF_NUM_LAYERS..OFF_NUM_LAYERS + 4].copy_from_slice(&self.num_layers.to_le_bytes());
        buf[OFF_NUM_KV_HEADS..OFF_NUM_KV_HEADS + 4]
            .copy_from_slice(&self.num_kv_heads.to_le_bytes());
        buf[OFF_HEAD_DIM..OFF_HEAD_DIM + 4].copy_from_slice(&self.head_dim.to_le_bytes());
        buf[OFF_SEQ_LEN..OFF_SEQ_LEN + 4].copy_from_slice(&self.sequence_length.to_le_bytes());
        buf[OFF_DTYPE..OFF_DTYPE + 4].copy_from_slice(&self.dtype.code().to_le_bytes());
        buf[OFF_DATA_SIZE..OFF_DATA_SIZE + 8].copy_from_slice(&self.data_size.to_le_bytes());
        buf[OFF_DATA_CRC..OFF_DATA_CRC + 4].copy_from_slice(&self.data_crc32.to_le_bytes());

        // header_crc32 covers the header with its own field zeroed.
        let crc = crc32fast::hash(&buf);
        buf[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode and verify the fixed header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CodecError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[OFF_MAGIC..OFF_MAGIC + 4]);
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = read_u32(bytes, OFF_VERSION);
        if version != FRAME_VERSION {
            return Err(CodecError::BadVersion(version));
        }

        let stored_crc = read_u32(bytes, OFF_HEADER_CRC);
        let mut scratch = [0u8; FRAME_HEADER_SIZE];
        scratch.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
        scratch[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].fill(0);
        let computed = crc32fast::hash(&scratch);
        if computed != stored_crc {
            return Err(CodecError::HeaderCrc {
                stored: stored_crc,
                computed,
            });
        }

        Ok(Self {
            version,
            flags: read_u32(bytes, OFF_FLAGS),
            context_id: read_padded(&bytes[OFF_CONTEXT_ID..OFF_CONTEXT_ID + 64]),
            model_fingerprint: read_padded(&bytes[OFF_FINGERPRINT..OFF_FINGERPRINT + 64]),
            created_at: read_u64(bytes, OFF_CREATED_AT),
            num_layers: read_u32(bytes, OFF_NUM_LAYERS),
            num_kv_heads: read_u32(bytes, OFF_NUM_KV_HEADS),
            head_dim: read_u32(bytes, OFF_HEAD_DIM),
            sequence_length: read_u32(bytes, OFF_SEQ_LEN),
            dtype: KvDtype::from_code(read_u32(bytes, OFF_DTYPE))?,
            data_size: read_u64(bytes, OFF_DATA_SIZE),
            data_crc32: read_u32(bytes, OFF_DATA_CRC),
        })
    }
}

/// A decoded frame: verified header plus the uncompressed payload.
#[derive(Debug, Clone)]
pub struct KvFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl KvFrame {
    /// Build a frame around a raw payload and serialize it, compressing when
    /// a compressor is supplied and the payload shrinks.
    pub fn encode(
        context_id: &str,
        model_fingerprint: &str,
        created_at: u64,
        num_layers: u32,
        num_kv_heads: u32,
        head_dim: u32,
        sequence_length: u32,
        dtype: KvDtype,
        payload: &[u8],
        compressor: Option<&dyn Compressor>,
    ) -> Result<Vec<u8>, CodecError> {
        let data_crc32 = crc32fast::hash(payload);

        let mut flags = 0u32;
        let body: Vec<u8> = match compressor {
            Some(c) => {
                let compressed = c.compress(payload)?;
                if compressed.len() + SCMP_SIZE < payload.len() {
                    flags |= FLAG_COMPRESSED;
                    let mut body = Vec::with_capacity(SCMP_SIZE + compressed.len());
                    body.extend_from_slice(&SCMP_MAGIC);
                    body.push(c.kind().code());
                    body.push(1); // sub-header version
                    body.extend_from_slice(&0u16.to_le_bytes()); // sub-header flags
                    body.extend_from_slice(&(payload.len() as u64).to_le_bytes());
                    body.extend_from_slice(&compressed);
                    body
                } else {
                    payload.to_vec()
                }
            }
            None => payload.to_vec(),
        };

        let header = FrameHeader {
            version: FRAME_VERSION,
            flags,
            context_id: context_id.to_string(),
            model_fingerprint: model_fingerprint.to_string(),
            created_at,
            num_layers,
            num_kv_heads,
            head_dim,
            sequence_length,
            dtype,
            data_size: payload.len() as u64,
            data_crc32,
        };

        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        out.extend_from_slice(&header.encode()?);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a serialized frame, decompressing and verifying the payload CRC.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let header = FrameHeader::decode(bytes)?;
        let body = &bytes[FRAME_HEADER_SIZE..];

        let payload: Vec<u8> = if header.is_compressed() {
            if body.len() < SCMP_SIZE {
                return Err(CodecError::Truncated {
                    expected: FRAME_HEADER_SIZE + SCMP_SIZE,
                    actual: bytes.len(),
                });
            }
            if body[..4] != SCMP_MAGIC {
                return Err(CodecError::BadSubHeader);
            }
            let kind = CompressionType::from_code(body[4])
                .ok_or(CodecError::UnknownCompression(body[4]))?;
            let original_size = read_u64(body, 8) as usize;
            if original_size != header.data_size as usize {
                return Err(CodecError::BadSubHeader);
            }
            let compressor = compressor_for(kind, 3);
            compressor.decompress(&body[SCMP_SIZE..], original_size)?
        } else {
            if body.len() < header.data_size as usize {
                return Err(CodecError::Truncated {
                    expected: FRAME_HEADER_SIZE + header.data_size as usize,
                    actual: bytes.len(),
                });
            }
            body[..header.data_size as usize].to_vec()
        };

        let computed = crc32fast::hash(&payload);
        if computed != header.data_crc32 {
            return Err(CodecError::DataCrc {
                stored: header.data_crc32,
                computed,
            });
        }

        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }
}

fn write_padded(dst: &mut [u8], value: &str) -> Result<(), CodecError> {
    let bytes = value.as_bytes();
    if bytes.len() > dst.len() {
        return Err(CodecError::IdTooLong(value.to_string()));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::compress::Lz4Compressor;

    fn sample_payload() -> Vec<u8> {
        // Repetitive enough to compress.
        (0..16384u32).map(|i| (i % 13) as u8).collect()
    }

    fn encode_sample(compressor: Option<&dyn Compressor>) -> Vec<u8> {
        KvFrame::encode(
            "ctx-abc",
            "fp-123",
            1_700_000_000,
            32,
            8,
            128,
            2048,
            KvDtype::Fp16,
            &sample_payload(),
            compressor,
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let bytes = encode_sample(None);
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + sample_payload().len());

        let frame = KvFrame::decode(&bytes).unwrap();
        assert_eq!(frame.header.context_id, "ctx-abc");
        assert_eq!(frame.header.model_fingerprint, "fp-123");
        assert_eq!(frame.header.num_layers, 32);
        assert_eq!(frame.header.sequence_length, 2048);
        assert!(!frame.header.is_compressed());
        assert_eq!(frame.payload.as_ref(), sample_payload().as_slice());
    }

    #[test]
    fn test_roundtrip_compressed() {
        let bytes = encode_sample(Some(&Lz4Compressor));
        assert!(bytes.len() < FRAME_HEADER_SIZE + sample_payload().len());

        let frame = KvFrame::decode(&bytes).unwrap();
        assert!(frame.header.is_compressed());
        // data_size always records the uncompressed size.
        assert_eq!(frame.header.data_size as usize, sample_payload().len());
        assert_eq!(frame.payload.as_ref(), sample_payload().as_slice());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = encode_sample(None);
        bytes[0] = b'X';
        assert!(matches!(
            KvFrame::decode(&bytes).unwrap_err(),
            CodecError::BadMagic(_)
        ));
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut bytes = encode_sample(None);
        // Flip a byte inside the shape fields.
        bytes[OFF_NUM_LAYERS] ^= 0xFF;
        assert!(matches!(
            KvFrame::decode(&bytes).unwrap_err(),
            CodecError::HeaderCrc { .. }
        ));
    }

    #[test]
    fn test_payload_corruption_detected() {
        let mut bytes = encode_sample(None);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            KvFrame::decode(&bytes).unwrap_err(),
            CodecError::DataCrc { .. }
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = encode_sample(None);
        let cut = &bytes[..bytes.len() - 100];
        assert!(matches!(
            KvFrame::decode(cut).unwrap_err(),
            CodecError::Truncated { .. }
        ));
    }

    #[test]
    fn test_crc_survives_decompression() {
        // Corrupt one byte of the compressed body: either decompression fails
        // or the data CRC (computed over uncompressed bytes) catches it.
        let mut bytes = encode_sample(Some(&Lz4Compressor));
        let mid = FRAME_HEADER_SIZE + SCMP_SIZE + 10;
        bytes[mid] ^= 0x55;
        assert!(KvFrame::decode(&bytes).is_err());
    }

    #[test]
    fn test_header_only_read() {
        let bytes = encode_sample(None);
        let header = FrameHeader::decode(&bytes[..FRAME_HEADER_SIZE]).unwrap();
        assert_eq!(header.dtype, KvDtype::Fp16);
        assert_eq!(
            header.expected_file_size().unwrap(),
            (FRAME_HEADER_SIZE + sample_payload().len()) as u64
        );
    }

    #[test]
    fn test_int4_packs_two_per_byte() {
        assert_eq!(KvDtype::Int4.bytes_for(10), 5);
        assert_eq!(KvDtype::Int4.bytes_for(11), 6);
        assert_eq!(KvDtype::Fp32.bytes_for(10), 40);
    }

    #[test]
    fn test_long_id_rejected() {
        let long_id = "x".repeat(65);
        let err = KvFrame::encode(
            &long_id,
            "fp",
            0,
            1,
            1,
            1,
            1,
            KvDtype::Fp16,
            &[0u8; 16],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::IdTooLong(_)));
    }
}
