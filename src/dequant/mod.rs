//! Dequantization cache: quantized model files are expanded to float32 once,
//! into a persistent workspace store, and reused on every later load.

mod cache;
mod gguf;
mod kernels;

pub use cache::{
    DequantCache, DequantError, DequantStats, DequantizedModel, TensorCatalog, TensorInfo,
};
pub use gguf::{GgmlDtype, GgufError, GgufModel, GgufTensorInfo, GgufValue, ModelShape};
pub use kernels::{dequantize, KernelError};

#[cfg(test)]
pub(crate) use gguf::testutil;
