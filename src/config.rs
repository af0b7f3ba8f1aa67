//! Runtime configuration for snapllm-core.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (capacities, thresholds, eviction weights) live here,
//! together with the resolution of the `SNAPLLM_HOME` workspace root and the
//! directory layout beneath it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::alloc::Tier;

/// Resolve the workspace root directory.
///
/// `SNAPLLM_HOME` wins when set; otherwise the platform data directory is used
/// (`$XDG_DATA_HOME/snapllm` or `~/.local/share/snapllm` on Linux,
/// `~/Library/Application Support/SnapLLM` on macOS, `%LOCALAPPDATA%\SnapLLM`
/// on Windows).
pub fn resolve_home() -> PathBuf {
    if let Some(home) = std::env::var_os("SNAPLLM_HOME") {
        return PathBuf::from(home);
    }
    default_home()
}

#[cfg(target_os = "macos")]
fn default_home() -> PathBuf {
    let base = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    base.join("Library/Application Support/SnapLLM")
}

#[cfg(target_os = "windows")]
fn default_home() -> PathBuf {
    let base = std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_default();
    base.join("SnapLLM")
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn default_home() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("snapllm");
    }
    let base = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    base.join(".local/share/snapllm")
}

/// Directory layout under the workspace root.
///
/// ```text
/// SNAPLLM_HOME/
/// ├── models/                 L1 workspaces
/// │   ├── registry.json
/// │   └── <model_id>/<quant>/workspace.bin + tensors.json
/// ├── contexts/               L2 artifacts
/// │   ├── registry.json
/// │   ├── hot/ warm/ cold/    *.kvc frames
/// │   └── metadata/<context_id>.json
/// ├── runtime/vpid_state.json
/// └── config/snapllm.json
/// ```
#[derive(Debug, Clone)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn model_registry_path(&self) -> PathBuf {
        self.models_dir().join("registry.json")
    }

    /// Workspace directory for one (model, quantization) pair.
    pub fn model_workspace_dir(&self, model_id: &str, quant: &str) -> PathBuf {
        self.models_dir().join(model_id).join(quant)
    }

    pub fn contexts_dir(&self) -> PathBuf {
        self.root.join("contexts")
    }

    pub fn context_registry_path(&self) -> PathBuf {
        self.contexts_dir().join("registry.json")
    }

    /// Frame directory for a storage tier.
    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.contexts_dir().join(tier.dir_name())
    }

    /// Frame file path for a context in a given tier.
    pub fn frame_path(&self, tier: Tier, context_id: &str) -> PathBuf {
        self.tier_dir(tier).join(format!("{context_id}.kvc"))
    }

    pub fn context_metadata_dir(&self) -> PathBuf {
        self.contexts_dir().join("metadata")
    }

    pub fn context_metadata_path(&self, context_id: &str) -> PathBuf {
        self.context_metadata_dir().join(format!("{context_id}.json"))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn runtime_state_path(&self) -> PathBuf {
        self.runtime_dir().join("vpid_state.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config").join("snapllm.json")
    }

    /// Create every directory in the layout.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.models_dir())?;
        for tier in Tier::ALL {
            std::fs::create_dir_all(self.tier_dir(tier))?;
        }
        std::fs::create_dir_all(self.context_metadata_dir())?;
        std::fs::create_dir_all(self.runtime_dir())?;
        std::fs::create_dir_all(self.root.join("config"))?;
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapConfig {
    /// Tier capacities and eviction.
    pub tiers: TierConfig,

    /// Workspace store settings.
    pub workspace: WorkspaceConfig,

    /// KV frame compression settings.
    pub compression: CompressionConfig,

    /// Auto-tiering controller tuning.
    pub tiering: TieringConfig,

    /// Model manager settings.
    pub models: ModelConfig,

    /// Context ingest settings.
    pub ingest: IngestConfig,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            tiers: TierConfig::default(),
            workspace: WorkspaceConfig::default(),
            compression: CompressionConfig::default(),
            tiering: TieringConfig::default(),
            models: ModelConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

/// Eviction victim-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicyKind {
    /// Least recently used (default).
    Lru,
    /// Least frequently used.
    Lfu,
    /// First in, first out.
    Fifo,
    /// LRU weighted by block size (prefer evicting large idle blocks).
    SizeWeightedLru,
}

/// Tier capacity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Hot tier (GPU HBM) budget in bytes.
    pub hot_capacity: usize,

    /// Warm tier (host RAM) budget in bytes.
    pub warm_capacity: usize,

    /// Cold tier (disk region) budget in bytes.
    pub cold_capacity: usize,

    /// Victim-selection policy.
    pub eviction_policy: EvictionPolicyKind,

    /// Eviction stops once a tier's usage drops below this fraction.
    pub eviction_target_utilization: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 8 * 1024 * 1024 * 1024,   // 8 GB
            warm_capacity: 16 * 1024 * 1024 * 1024, // 16 GB
            cold_capacity: 64 * 1024 * 1024 * 1024, // 64 GB
            eviction_policy: EvictionPolicyKind::Lru,
            eviction_target_utilization: 0.80,
        }
    }
}

/// I/O mode for the workspace store read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoMode {
    /// Memory-map the backing file; reads are zero-copy views.
    Mapped,
    /// Aligned positioned reads with a bounded RAM LRU of hot sub-ranges.
    DirectIo,
}

/// Workspace store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Alignment for bump-allocated regions.
    pub alignment: usize,

    /// Budget for the direct-IO RAM cache in bytes.
    pub ram_cache_bytes: usize,

    /// Read path mode.
    pub io_mode: IoMode,

    /// Workspace file size as a multiple of the source model file
    /// (float32 expansion overhead).
    pub overhead_factor: f64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            alignment: 256,
            ram_cache_bytes: 512 * 1024 * 1024, // 512 MB
            io_mode: IoMode::Mapped,
            overhead_factor: 2.0,
        }
    }
}

/// Compression codec selection for KV frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

/// KV frame compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compress frame payloads at ingest time.
    pub enabled: bool,

    /// Which compressor to use.
    pub codec: CompressionKind,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Payloads smaller than this are stored uncompressed.
    pub min_compress_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: CompressionKind::Lz4,
            zstd_level: 3,
            min_compress_bytes: 4096,
        }
    }
}

/// Auto-tiering policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieringPolicy {
    /// Promote by access count within the sampling window.
    AccessFrequency,
    /// Promote by recency of last access.
    Recency,
    /// Blend of frequency and recency.
    Adaptive,
}

/// Auto-tiering controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieringConfig {
    /// Which policy drives promotion/demotion decisions.
    pub policy: TieringPolicy,

    /// Seconds between controller cycles.
    pub check_interval_secs: u64,

    /// Accesses within the window required to recommend the hot tier.
    pub hot_access_count: u64,

    /// Length of the access-counting window in seconds.
    pub hot_window_secs: u64,

    /// Idle seconds after which a hot context is recommended warm.
    pub warm_threshold_secs: u64,

    /// Idle seconds after which a warm context is recommended cold.
    pub cold_threshold_secs: u64,

    /// Hot-tier utilization fraction that triggers emergency demotion.
    pub gpu_pressure_threshold: f64,

    /// Warm-tier utilization fraction that triggers emergency demotion.
    pub cpu_pressure_threshold: f64,

    /// Utilization fraction to reach after emergency demotion.
    pub target_utilization: f64,

    /// Maximum number of contexts resident in the hot tier.
    pub max_hot_contexts: usize,

    /// Maximum number of contexts resident in the warm tier.
    pub max_warm_contexts: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            policy: TieringPolicy::Adaptive,
            check_interval_secs: 60,
            hot_access_count: 3,
            hot_window_secs: 300,
            warm_threshold_secs: 600,
            cold_threshold_secs: 3600,
            gpu_pressure_threshold: 0.90,
            cpu_pressure_threshold: 0.90,
            target_utilization: 0.75,
            max_hot_contexts: 16,
            max_warm_contexts: 64,
        }
    }
}

/// Model manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// VRAM budget for resident models in bytes.
    pub vram_budget: usize,

    /// Maximum number of models held resident simultaneously.
    pub max_loaded_models: usize,

    /// Engine context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prefill submission.
    pub n_batch: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vram_budget: 24 * 1024 * 1024 * 1024, // 24 GB
            max_loaded_models: 4,
            n_ctx: 32768,
            n_batch: 512,
        }
    }
}

/// Context ingest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Tokens per prefill batch.
    pub batch_size: usize,

    /// Bound on concurrently running ingest jobs.
    pub max_concurrent_ingests: usize,

    /// Default TTL for new contexts in seconds (0 = no expiry).
    pub default_ttl_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            max_concurrent_ingests: 2,
            default_ttl_secs: 0,
        }
    }
}

impl SnapConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: SnapConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(SnapConfig::default())
        }
    }

    /// Capacity of a tier under this configuration.
    pub fn tier_capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.tiers.hot_capacity,
            Tier::Warm => self.tiers.warm_capacity,
            Tier::Cold => self.tiers.cold_capacity,
        }
    }
}
