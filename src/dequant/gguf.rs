//! GGUF container reading.
//!
//! Parses the metadata key/value section and the tensor table of a GGUF v3
//! file, enough to drive dequantization and KV-cache sizing. Tensor data is
//! read lazily by offset; only the header is consumed here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";
const DEFAULT_ALIGNMENT: u64 = 32;

#[derive(Error, Debug)]
pub enum GgufError {
    #[error("Model file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported tensor dtype code {0}")]
    UnsupportedDtype(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quantization formats the dequantizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GgmlDtype {
    F32,
    F16,
    Q4_0,
    Q5_0,
    Q8_0,
    Q5K,
}

impl GgmlDtype {
    pub fn from_code(code: u32) -> Result<Self, GgufError> {
        match code {
            0 => Ok(GgmlDtype::F32),
            1 => Ok(GgmlDtype::F16),
            2 => Ok(GgmlDtype::Q4_0),
            6 => Ok(GgmlDtype::Q5_0),
            8 => Ok(GgmlDtype::Q8_0),
            13 => Ok(GgmlDtype::Q5K),
            other => Err(GgufError::UnsupportedDtype(other)),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            GgmlDtype::F32 => 0,
            GgmlDtype::F16 => 1,
            GgmlDtype::Q4_0 => 2,
            GgmlDtype::Q5_0 => 6,
            GgmlDtype::Q8_0 => 8,
            GgmlDtype::Q5K => 13,
        }
    }

    /// Elements per quantization block.
    pub fn block_elems(&self) -> usize {
        match self {
            GgmlDtype::F32 | GgmlDtype::F16 => 1,
            GgmlDtype::Q4_0 | GgmlDtype::Q5_0 | GgmlDtype::Q8_0 => 32,
            GgmlDtype::Q5K => 256,
        }
    }

    /// Bytes per quantization block.
    pub fn block_bytes(&self) -> usize {
        match self {
            GgmlDtype::F32 => 4,
            GgmlDtype::F16 => 2,
            GgmlDtype::Q4_0 => 18,  // f16 scale + 16 nibble bytes
            GgmlDtype::Q5_0 => 22,  // f16 scale + 4 high bits + 16 nibble bytes
            GgmlDtype::Q8_0 => 34,  // f16 scale + 32 int8
            GgmlDtype::Q5K => 176,  // d + dmin + 12 scale bytes + 32 qh + 128 qs
        }
    }

    /// Stored byte size of a row of `n` elements.
    pub fn row_bytes(&self, n: usize) -> usize {
        n / self.block_elems() * self.block_bytes()
    }

    pub fn name(&self) -> &'static str {
        match self {
            GgmlDtype::F32 => "F32",
            GgmlDtype::F16 => "F16",
            GgmlDtype::Q4_0 => "Q4_0",
            GgmlDtype::Q5_0 => "Q5_0",
            GgmlDtype::Q8_0 => "Q8_0",
            GgmlDtype::Q5K => "Q5_K",
        }
    }
}

/// A metadata value from the GGUF key/value section.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U32(u32),
    U64(u64),
    F32(f32),
    Bool(bool),
    Str(String),
    /// Arrays are skipped wholesale; only the element count is kept.
    ArrayLen(u64),
}

impl GgufValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::U32(v) => Some(*v as u64),
            GgufValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One entry of the tensor table.
#[derive(Debug, Clone)]
pub struct GgufTensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub dtype: GgmlDtype,
    /// Offset relative to the start of the data section.
    pub offset: u64,
}

impl GgufTensorInfo {
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product::<u64>() as usize
    }

    pub fn byte_size(&self) -> usize {
        self.dtype.row_bytes(self.elem_count())
    }
}

/// The model-shape descriptor consumed by KV sizing and compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub architecture: String,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub head_dim: u32,
    pub vocab_size: u32,
    pub context_length: u32,
}

impl ModelShape {
    /// KV bytes per token at fp16 (K+V across all layers).
    pub fn kv_bytes_per_token(&self) -> usize {
        2 * self.n_kv_heads as usize * self.head_dim as usize * 2 * self.n_layers as usize
    }

    /// Whether a cached KV frame produced under `other` can be injected here.
    pub fn kv_compatible(&self, other: &ModelShape) -> bool {
        self.architecture == other.architecture
            && self.n_layers == other.n_layers
            && self.n_kv_heads == other.n_kv_heads
            && self.head_dim == other.head_dim
    }
}

/// Parsed GGUF header: metadata plus tensor table.
#[derive(Debug)]
pub struct GgufModel {
    pub path: PathBuf,
    pub metadata: HashMap<String, GgufValue>,
    pub tensors: Vec<GgufTensorInfo>,
    /// Absolute file offset of the aligned data section.
    pub data_offset: u64,
    pub file_size: u64,
    pub alignment: u64,
}

impl GgufModel {
    /// Parse the header of a GGUF file.
    pub fn parse(path: &Path) -> Result<Self, GgufError> {
        if !path.exists() {
            return Err(GgufError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidFormat(format!(
                "bad magic {magic:02x?}"
            )));
        }
        let version = read_u32(&mut r)?;
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = read_u64(&mut r)?;
        let kv_count = read_u64(&mut r)?;
        if tensor_count > 1 << 20 || kv_count > 1 << 20 {
            return Err(GgufError::InvalidFormat(
                "implausible tensor/kv count".into(),
            ));
        }

        let mut metadata = HashMap::new();
        for _ in 0..kv_count {
            let key = read_string(&mut r)?;
            let value = read_value(&mut r)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = read_string(&mut r)?;
            let n_dims = read_u32(&mut r)?;
            if n_dims > 4 {
                return Err(GgufError::InvalidFormat(format!(
                    "tensor {name} has {n_dims} dims"
                )));
            }
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(read_u64(&mut r)?);
            }
            let dtype = GgmlDtype::from_code(read_u32(&mut r)?)?;
            let offset = read_u64(&mut r)?;
            tensors.push(GgufTensorInfo {
                name,
                dims,
                dtype,
                offset,
            });
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_ALIGNMENT);
        let header_end = r.stream_position()?;
        let data_offset = header_end.next_multiple_of(alignment);

        let model = Self {
            path: path.to_path_buf(),
            metadata,
            tensors,
            data_offset,
            file_size,
            alignment,
        };

        info!(
            path = %path.display(),
            tensors = model.tensors.len(),
            arch = model.architecture(),
            "Parsed GGUF header"
        );
        Ok(model)
    }

    pub fn architecture(&self) -> &str {
        self.metadata
            .get("general.architecture")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }

    fn arch_key(&self, suffix: &str) -> Option<u64> {
        let arch = self.architecture().to_string();
        self.metadata
            .get(&format!("{arch}.{suffix}"))
            .and_then(|v| v.as_u64())
    }

    /// Extract the shape descriptor. Head dim falls back to
    /// `embedding_length / head_count` when not stated explicitly.
    pub fn shape(&self) -> Result<ModelShape, GgufError> {
        let n_layers = self
            .arch_key("block_count")
            .ok_or_else(|| GgufError::InvalidFormat("missing block_count".into()))?;
        let n_heads = self
            .arch_key("attention.head_count")
            .ok_or_else(|| GgufError::InvalidFormat("missing attention.head_count".into()))?;
        let n_kv_heads = self.arch_key("attention.head_count_kv").unwrap_or(n_heads);
        let head_dim = match self.arch_key("attention.key_length") {
            Some(d) => d,
            None => {
                let embed = self.arch_key("embedding_length").ok_or_else(|| {
                    GgufError::InvalidFormat("missing embedding_length".into())
                })?;
                embed / n_heads.max(1)
            }
        };
        let vocab_size = self.arch_key("vocab_size").unwrap_or(0);
        let context_length = self.arch_key("context_length").unwrap_or(0);

        Ok(ModelShape {
            architecture: self.architecture().to_string(),
            n_layers: n_layers as u32,
            n_heads: n_heads as u32,
            n_kv_heads: n_kv_heads as u32,
            head_dim: head_dim as u32,
            vocab_size: vocab_size as u32,
            context_length: context_length as u32,
        })
    }

    /// Dominant quantization of the tensor table, by stored bytes.
    pub fn dominant_quant(&self) -> &'static str {
        let mut by_type: HashMap<GgmlDtype, usize> = HashMap::new();
        for t in &self.tensors {
            *by_type.entry(t.dtype).or_default() += t.byte_size();
        }
        by_type
            .into_iter()
            .max_by_key(|(_, bytes)| *bytes)
            .map(|(dtype, _)| dtype.name())
            .unwrap_or("F32")
    }

    /// Read one tensor's raw (still quantized) bytes from the file.
    pub fn read_tensor_data(&self, info: &GgufTensorInfo) -> Result<Vec<u8>, GgufError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.data_offset + info.offset))?;
        let mut buf = vec![0u8; info.byte_size()];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> Result<String, GgufError> {
    let len = read_u64(r)?;
    if len > 1 << 20 {
        return Err(GgufError::InvalidFormat("implausible string length".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| GgufError::InvalidFormat("non-utf8 string".into()))
}

/// Value type tags from the GGUF spec.
const T_U8: u32 = 0;
const T_I8: u32 = 1;
const T_U16: u32 = 2;
const T_I16: u32 = 3;
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;
const T_U64: u32 = 10;
const T_I64: u32 = 11;
const T_F64: u32 = 12;

fn read_value(r: &mut (impl Read + Seek)) -> Result<GgufValue, GgufError> {
    let tag = read_u32(r)?;
    read_value_tagged(r, tag)
}

fn read_value_tagged(r: &mut (impl Read + Seek), tag: u32) -> Result<GgufValue, GgufError> {
    match tag {
        T_U8 | T_I8 | T_BOOL => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            if tag == T_BOOL {
                Ok(GgufValue::Bool(b[0] != 0))
            } else {
                Ok(GgufValue::U32(b[0] as u32))
            }
        }
        T_U16 | T_I16 => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            Ok(GgufValue::U32(u16::from_le_bytes(b) as u32))
        }
        T_U32 | T_I32 => Ok(GgufValue::U32(read_u32(r)?)),
        T_F32 => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Ok(GgufValue::F32(f32::from_le_bytes(b)))
        }
        T_STRING => Ok(GgufValue::Str(read_string(r)?)),
        T_U64 | T_I64 => Ok(GgufValue::U64(read_u64(r)?)),
        T_F64 => {
            let mut b = [0u8; 8];
            r.read_exact(&mut b)?;
            Ok(GgufValue::F32(f64::from_le_bytes(b) as f32))
        }
        T_ARRAY => {
            let elem_tag = read_u32(r)?;
            let count = read_u64(r)?;
            // Skip the payload; callers only care about scalar metadata.
            for _ in 0..count {
                read_value_tagged(r, elem_tag)?;
            }
            Ok(GgufValue::ArrayLen(count))
        }
        other => Err(GgufError::InvalidFormat(format!(
            "unknown metadata value tag {other}"
        ))),
    }
}
