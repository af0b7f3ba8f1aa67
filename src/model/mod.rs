//! Model management: the L1 resource layer over loaded models.
//!
//! A bounded set of models is held resident; switching the active model is a
//! designator flip, never a tensor copy.

mod manager;

pub use manager::{ModelManager, ModelManagerStats};

use serde::{Deserialize, Serialize};

use crate::dequant::ModelShape;

/// Recognized model kinds. Diffusion and vision models are accepted as
/// opaque loads; only text models participate in KV extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Text,
    Diffusion,
    Vision,
}

/// Lifecycle state of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loading,
    Active,
    Resident,
    Evicted,
}

/// Caller-visible description of a loaded model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub source_path: std::path::PathBuf,
    pub fingerprint: String,
    pub quant: String,
    pub shape: ModelShape,
    pub kind: ModelKind,
    pub state: ModelState,
    /// Dequantized float32 bytes resident for this model.
    pub byte_size: usize,
    /// Whether the binding landed on the GPU budget or fell back to CPU.
    pub gpu_resident: bool,
    pub loaded_at: u64,
    pub last_used: u64,
}
