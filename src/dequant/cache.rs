//! The dequantization cache.
//!
//! A quantized model file is expanded to float32 exactly once, into a
//! workspace store under `models/<model_id>/<quant>/`. A fingerprint index
//! makes later loads of the same file reuse the store directly, skipping
//! dequantization entirely.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{HomeLayout, WorkspaceConfig};
use crate::fsutil;
use crate::workspace::{StoreError, WorkspaceStore};

use super::gguf::{GgufError, GgufModel, ModelShape};
use super::kernels::{dequantize, KernelError};

#[derive(Error, Debug)]
pub enum DequantError {
    #[error("Model file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("No cached workspace for model {0} and the source file is gone")]
    NoWorkspace(String),

    #[error("Workspace corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Gguf(#[from] GgufError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One tensor's location inside the workspace store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<u64>,
    pub offset: usize,
    pub byte_size: usize,
    #[serde(default)]
    pub access_count: u64,
}

/// The persisted tensor catalog (`tensors.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorCatalog {
    pub model_fingerprint: String,
    pub shape: ModelShape,
    pub tensors: BTreeMap<String, TensorInfo>,
}

impl TensorCatalog {
    pub fn total_bytes(&self) -> usize {
        self.tensors.values().map(|t| t.byte_size).sum()
    }

    /// Highest byte claimed by any tensor; used to validate the store file.
    fn end_offset(&self) -> usize {
        self.tensors
            .values()
            .map(|t| t.offset + t.byte_size)
            .max()
            .unwrap_or(0)
    }
}

/// One entry of the workspace index (`models/registry.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceRecord {
    model_fingerprint: String,
    model_id: String,
    quant: String,
    workspace_path: PathBuf,
    catalog_path: PathBuf,
    created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkspaceIndex {
    workspaces: Vec<WorkspaceRecord>,
}

/// A ready-to-bind dequantized model.
pub struct DequantizedModel {
    pub model_id: String,
    pub fingerprint: String,
    pub quant: String,
    pub shape: ModelShape,
    pub catalog: TensorCatalog,
    pub store: Arc<WorkspaceStore>,
    /// Total float32 bytes across all tensors.
    pub byte_size: usize,
}

impl DequantizedModel {
    /// One tensor's float32 data, read through the store's mapped region or
    /// its RAM cache.
    pub fn tensor_f32(&self, name: &str) -> Result<Vec<f32>, DequantError> {
        let info = self
            .catalog
            .tensors
            .get(name)
            .ok_or_else(|| DequantError::Corrupt(format!("tensor {name} not in catalog")))?;
        let slice = self.store.read(info.offset, info.byte_size, name)?;
        Ok(slice.to_f32_vec())
    }
}

/// Counters observable by tests and stats endpoints.
#[derive(Debug, Default)]
pub struct DequantStats {
    pub builds: AtomicU64,
    pub reuses: AtomicU64,
    pub tensors_dequantized: AtomicU64,
}

/// The dequantization cache.
pub struct DequantCache {
    layout: HomeLayout,
    config: WorkspaceConfig,
    stats: DequantStats,
}

impl DequantCache {
    pub fn new(layout: HomeLayout, config: WorkspaceConfig) -> Self {
        Self {
            layout,
            config,
            stats: DequantStats::default(),
        }
    }

    pub fn stats(&self) -> &DequantStats {
        &self.stats
    }

    /// SHA-256 over the file contents combined with the architecture shape.
    pub fn fingerprint(path: &Path, shape: &ModelShape) -> Result<String, DequantError> {
        let mut hasher = Sha256::new();
        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        hasher.update(shape.architecture.as_bytes());
        hasher.update(shape.n_layers.to_le_bytes());
        hasher.update(shape.n_heads.to_le_bytes());
        hasher.update(shape.n_kv_heads.to_le_bytes());
        hasher.update(shape.head_dim.to_le_bytes());
        Ok(hex(&hasher.finalize()))
    }

    /// Acquire the dequantized workspace for a model, building it on miss.
    ///
    /// When the source file no longer exists, a previously built workspace
    /// for `(model_id, quant)` is still served; the source is not consulted
    /// at inference time.
    pub fn acquire(
        &self,
        model_id: &str,
        source_path: &Path,
    ) -> Result<DequantizedModel, DequantError> {
        if !source_path.exists() {
            return self.open_without_source(model_id);
        }

        let gguf = GgufModel::parse(source_path)?;
        let shape = gguf.shape()?;
        let fingerprint = Self::fingerprint(source_path, &shape)?;
        let quant = gguf.dominant_quant().to_string();

        if let Some(record) = self.lookup(&fingerprint)? {
            match self.open_record(&record) {
                Ok(model) => {
                    self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                    info!(model_id, fingerprint = %short(&fingerprint), "Workspace cache hit");
                    return Ok(model);
                }
                Err(e) => {
                    warn!(model_id, error = %e, "Cached workspace invalid, rebuilding");
                }
            }
        }

        self.build(model_id, &gguf, &shape, &fingerprint, &quant)
    }

    fn open_without_source(&self, model_id: &str) -> Result<DequantizedModel, DequantError> {
        let index = self.load_index()?;
        let record = index
            .workspaces
            .iter()
            .find(|r| r.model_id == model_id)
            .cloned()
            .ok_or_else(|| DequantError::NoWorkspace(model_id.to_string()))?;
        let model = self.open_record(&record)?;
        self.stats.reuses.fetch_add(1, Ordering::Relaxed);
        Ok(model)
    }

    fn lookup(&self, fingerprint: &str) -> Result<Option<WorkspaceRecord>, DequantError> {
        let index = self.load_index()?;
        Ok(index
            .workspaces
            .iter()
            .find(|r| r.model_fingerprint == fingerprint)
            .cloned())
    }

    fn load_index(&self) -> Result<WorkspaceIndex, DequantError> {
        let path = self.layout.model_registry_path();
        if !path.exists() {
            return Ok(WorkspaceIndex::default());
        }
        let data = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&data) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(error = %e, "Workspace index unreadable, starting empty");
                Ok(WorkspaceIndex::default())
            }
        }
    }

    fn save_index(&self, index: &WorkspaceIndex) -> Result<(), DequantError> {
        fsutil::atomic_write_json(&self.layout.model_registry_path(), index)?;
        Ok(())
    }

    /// Open a workspace from its index record, validating the catalog against
    /// the store file. Any disagreement is treated as a miss by the caller.
    fn open_record(&self, record: &WorkspaceRecord) -> Result<DequantizedModel, DequantError> {
        let catalog_data = std::fs::read_to_string(&record.catalog_path)
            .map_err(|e| DequantError::Corrupt(format!("catalog unreadable: {e}")))?;
        let catalog: TensorCatalog = serde_json::from_str(&catalog_data)
            .map_err(|e| DequantError::Corrupt(format!("catalog parse: {e}")))?;

        let store_size = std::fs::metadata(&record.workspace_path)
            .map_err(|e| DequantError::Corrupt(format!("workspace missing: {e}")))?
            .len() as usize;
        if store_size < catalog.end_offset() {
            return Err(DequantError::Corrupt(format!(
                "workspace file is {store_size} bytes but catalog claims {}",
                catalog.end_offset()
            )));
        }

        let store = WorkspaceStore::open(
            &record.workspace_path,
            self.config.io_mode,
            self.config.alignment,
            self.config.ram_cache_bytes,
        )?;

        let byte_size = catalog.total_bytes();
        Ok(DequantizedModel {
            model_id: record.model_id.clone(),
            fingerprint: record.model_fingerprint.clone(),
            quant: record.quant.clone(),
            shape: catalog.shape.clone(),
            catalog,
            store: Arc::new(store),
            byte_size,
        })
    }

    /// First-time build: dequantize every tensor into a fresh store and
    /// persist the catalog plus the index record.
    fn build(
        &self,
        model_id: &str,
        gguf: &GgufModel,
        shape: &ModelShape,
        fingerprint: &str,
        quant: &str,
    ) -> Result<DequantizedModel, DequantError> {
        let dir = self.layout.model_workspace_dir(model_id, quant);
        std::fs::create_dir_all(&dir)?;
        let workspace_path = dir.join("workspace.bin");
        let catalog_path = dir.join("tensors.json");

        let total_size = (gguf.file_size as f64 * self.config.overhead_factor) as usize;
        let mut store = WorkspaceStore::create(
            &workspace_path,
            total_size,
            self.config.io_mode,
            self.config.alignment,
            self.config.ram_cache_bytes,
        )?;

        info!(
            model_id,
            tensors = gguf.tensors.len(),
            workspace = %workspace_path.display(),
            total_size,
            "Dequantizing model into workspace"
        );

        let start = std::time::Instant::now();
        let mut tensors = BTreeMap::new();
        for t in &gguf.tensors {
            let raw = gguf.read_tensor_data(t)?;
            let values = dequantize(t.dtype, &raw, t.elem_count())?;
            let bytes: &[u8] = bytemuck::cast_slice(&values);

            let region = store.allocate(bytes.len(), &t.name)?;
            store.write(region.offset, bytes)?;
            self.stats.tensors_dequantized.fetch_add(1, Ordering::Relaxed);

            tensors.insert(
                t.name.clone(),
                TensorInfo {
                    name: t.name.clone(),
                    shape: t.dims.clone(),
                    offset: region.offset,
                    byte_size: bytes.len(),
                    access_count: 0,
                },
            );
        }
        store.sync(0, store.total_size())?;

        let catalog = TensorCatalog {
            model_fingerprint: fingerprint.to_string(),
            shape: shape.clone(),
            tensors,
        };
        fsutil::atomic_write_json(&catalog_path, &catalog)?;

        let mut index = self.load_index()?;
        index.workspaces.retain(|r| r.model_fingerprint != fingerprint);
        index.workspaces.push(WorkspaceRecord {
            model_fingerprint: fingerprint.to_string(),
            model_id: model_id.to_string(),
            quant: quant.to_string(),
            workspace_path: workspace_path.clone(),
            catalog_path,
            created_at: unix_now(),
        });
        self.save_index(&index)?;
        self.stats.builds.fetch_add(1, Ordering::Relaxed);

        info!(
            model_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            bytes = catalog.total_bytes(),
            "Dequantization complete"
        );

        // Reopen read-only: the build phase is the only writer.
        let store = WorkspaceStore::open(
            &workspace_path,
            self.config.io_mode,
            self.config.alignment,
            self.config.ram_cache_bytes,
        )?;

        let byte_size = catalog.total_bytes();
        Ok(DequantizedModel {
            model_id: model_id.to_string(),
            fingerprint: fingerprint.to_string(),
            quant: quant.to_string(),
            shape: shape.clone(),
            catalog,
            store: Arc::new(store),
            byte_size,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
