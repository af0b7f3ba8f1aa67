//! The model manager.
//!
//! Load goes through the dequant cache (workspace reuse makes warm loads
//! cheap), binds the engine zero-copy over the workspace, and registers the
//! model. Under VRAM pressure, least-recently-used models are evicted first,
//! skipping the active one; eviction keeps the on-disk workspace and a
//! lightweight ram-cache entry so the next load is a flash reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{HomeLayout, ModelConfig};
use crate::dequant::{DequantCache, DequantizedModel};
use crate::engine::{EngineFactory, EngineParams, InferenceEngine};
use crate::error::{SnapError, SnapResult};
use crate::fsutil;

use super::{ModelInfo, ModelKind, ModelState};

/// A model held resident: workspace, engine binding, and bookkeeping.
struct LoadedModel {
    info: ModelInfo,
    /// LRU clock, updated on every engine hand-out.
    last_used: std::sync::atomic::AtomicU64,
    dequant: Arc<DequantizedModel>,
    engine: Arc<dyn InferenceEngine>,
}

impl LoadedModel {
    fn last_used(&self) -> u64 {
        self.last_used.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Flash-reload entry kept after eviction: enough to reload from the
/// persisted workspace without touching the source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RamCacheEntry {
    model_id: String,
    source_path: PathBuf,
    quant: String,
    byte_size: usize,
    fingerprint: String,
}

/// Persisted runtime state (`runtime/vpid_state.json`).
#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimeState {
    active_model: Option<String>,
    loaded: Vec<RamCacheEntry>,
}

#[derive(Default)]
struct ModelMap {
    loaded: HashMap<String, Arc<LoadedModel>>,
    active: Option<String>,
    ram_cache: HashMap<String, RamCacheEntry>,
}

/// Counters for cache observability.
#[derive(Debug, Clone, Default)]
pub struct ModelManagerStats {
    pub loads: u64,
    pub flash_reloads: u64,
    pub evictions: u64,
    pub switches: u64,
}

/// The model manager.
pub struct ModelManager {
    config: ModelConfig,
    layout: HomeLayout,
    dequant: Arc<DequantCache>,
    factory: Arc<dyn EngineFactory>,
    inner: RwLock<ModelMap>,
    stats: std::sync::Mutex<ModelManagerStats>,
}

impl ModelManager {
    pub fn new(
        config: ModelConfig,
        layout: HomeLayout,
        dequant: Arc<DequantCache>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            config,
            layout,
            dequant,
            factory,
            inner: RwLock::new(ModelMap::default()),
            stats: std::sync::Mutex::new(ModelManagerStats::default()),
        }
    }

    /// Load a model, reusing the dequantized workspace when one matches.
    pub async fn load(&self, model_id: &str, source_path: &Path) -> SnapResult<ModelInfo> {
        {
            let map = self.inner.read().await;
            if let Some(existing) = map.loaded.get(model_id) {
                debug!(model_id, "Model already loaded");
                return Ok(existing.info.clone());
            }
        }

        let start = std::time::Instant::now();

        // Budget check first: free VRAM before the expensive part.
        let estimate = self.estimate_bytes(model_id, source_path).await;
        let gpu_resident = self.make_room(model_id, estimate).await;

        // Acquire the workspace (dequantizes on first load only). The
        // dequant cache blocks on file IO; run it off the async thread.
        let dequant = {
            let cache = self.dequant.clone();
            let model_id = model_id.to_string();
            let path = source_path.to_path_buf();
            tokio::task::spawn_blocking(move || cache.acquire(&model_id, &path))
                .await
                .map_err(|e| SnapError::EngineFailure(format!("dequant task panicked: {e}")))??
        };
        let dequant = Arc::new(dequant);

        let params = EngineParams {
            n_ctx: self.config.n_ctx,
            n_batch: self.config.n_batch,
        };
        let engine = self.factory.bind(&dequant, &params)?;

        let now = unix_now();
        let info = ModelInfo {
            model_id: model_id.to_string(),
            source_path: source_path.to_path_buf(),
            fingerprint: dequant.fingerprint.clone(),
            quant: dequant.quant.clone(),
            shape: dequant.shape.clone(),
            kind: ModelKind::Text,
            state: ModelState::Resident,
            byte_size: dequant.byte_size,
            gpu_resident,
            loaded_at: now,
            last_used: now,
        };

        let was_flash = {
            let mut map = self.inner.write().await;
            let was_flash = map.ram_cache.remove(model_id).is_some();
            map.loaded.insert(
                model_id.to_string(),
                Arc::new(LoadedModel {
                    info: info.clone(),
                    last_used: std::sync::atomic::AtomicU64::new(now),
                    dequant,
                    engine,
                }),
            );
            self.persist_state(&map)?;
            was_flash
        };

        {
            let mut stats = self.stats.lock().unwrap();
            stats.loads += 1;
            if was_flash {
                stats.flash_reloads += 1;
            }
        }

        info!(
            model_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            gpu_resident,
            flash_reload = was_flash,
            "Model loaded"
        );
        Ok(info)
    }

    async fn estimate_bytes(&self, model_id: &str, source_path: &Path) -> usize {
        {
            let map = self.inner.read().await;
            if let Some(entry) = map.ram_cache.get(model_id) {
                return entry.byte_size;
            }
        }
        // Float32 expansion of a quantized file is roughly a doubling.
        std::fs::metadata(source_path)
            .map(|m| (m.len() * 2) as usize)
            .unwrap_or(0)
    }

    /// Evict LRU models (never the active one) until `incoming` fits the
    /// VRAM budget. Returns false when it cannot fit: the caller binds
    /// CPU-only instead.
    async fn make_room(&self, incoming_id: &str, incoming: usize) -> bool {
        let mut map = self.inner.write().await;
        loop {
            let used: usize = map
                .loaded
                .values()
                .filter(|m| m.info.gpu_resident)
                .map(|m| m.info.byte_size)
                .sum();
            if used + incoming <= self.config.vram_budget
                && map.loaded.len() < self.config.max_loaded_models
            {
                return true;
            }

            let victim = map
                .loaded
                .values()
                .filter(|m| Some(&m.info.model_id) != map.active.as_ref())
                .filter(|m| m.info.model_id != incoming_id)
                .min_by_key(|m| m.last_used())
                .map(|m| m.info.model_id.clone());

            match victim {
                Some(id) => {
                    self.evict_locked(&mut map, &id);
                }
                None => {
                    warn!(
                        incoming_id,
                        incoming, "VRAM budget exhausted, falling back to CPU binding"
                    );
                    return false;
                }
            }
        }
    }

    fn evict_locked(&self, map: &mut ModelMap, model_id: &str) {
        if let Some(model) = map.loaded.remove(model_id) {
            map.ram_cache.insert(
                model_id.to_string(),
                RamCacheEntry {
                    model_id: model_id.to_string(),
                    source_path: model.info.source_path.clone(),
                    quant: model.info.quant.clone(),
                    byte_size: model.info.byte_size,
                    fingerprint: model.info.fingerprint.clone(),
                },
            );
            self.stats.lock().unwrap().evictions += 1;
            info!(model_id, "Evicted model (workspace retained for flash reload)");
        }
    }

    /// Flip the active-model designator. No GPU work; sub-millisecond
    /// regardless of model size.
    pub async fn switch(&self, model_id: &str) -> SnapResult<()> {
        let mut map = self.inner.write().await;
        if !map.loaded.contains_key(model_id) {
            return Err(SnapError::NotFound(format!("model {model_id}")));
        }
        map.active = Some(model_id.to_string());
        self.persist_state(&map)?;
        self.stats.lock().unwrap().switches += 1;
        debug!(model_id, "Active model switched");
        Ok(())
    }

    /// Unload a model entirely. The on-disk workspace survives; the next
    /// load of the same file skips dequantization.
    pub async fn unload(&self, model_id: &str) -> SnapResult<()> {
        let mut map = self.inner.write().await;
        if map.loaded.remove(model_id).is_none() {
            return Err(SnapError::NotFound(format!("model {model_id}")));
        }
        if map.active.as_deref() == Some(model_id) {
            map.active = None;
        }
        map.ram_cache.remove(model_id);
        self.persist_state(&map)?;
        info!(model_id, "Model unloaded");
        Ok(())
    }

    pub async fn list(&self) -> Vec<ModelInfo> {
        let map = self.inner.read().await;
        let mut infos: Vec<ModelInfo> = map
            .loaded
            .values()
            .map(|m| {
                let mut info = m.info.clone();
                info.last_used = m.last_used();
                info.state = if map.active.as_deref() == Some(info.model_id.as_str()) {
                    ModelState::Active
                } else {
                    ModelState::Resident
                };
                info
            })
            .collect();
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        infos
    }

    pub async fn get_active(&self) -> Option<ModelInfo> {
        let map = self.inner.read().await;
        let id = map.active.clone()?;
        map.loaded.get(&id).map(|m| {
            let mut info = m.info.clone();
            info.state = ModelState::Active;
            info
        })
    }

    pub async fn get_info(&self, model_id: &str) -> SnapResult<ModelInfo> {
        let map = self.inner.read().await;
        map.loaded
            .get(model_id)
            .map(|m| {
                let mut info = m.info.clone();
                info.last_used = m.last_used();
                info.state = if map.active.as_deref() == Some(model_id) {
                    ModelState::Active
                } else {
                    ModelState::Resident
                };
                info
            })
            .ok_or_else(|| SnapError::NotFound(format!("model {model_id}")))
    }

    /// The engine bound to a loaded model; marks it recently used.
    pub async fn engine_for(&self, model_id: &str) -> SnapResult<Arc<dyn InferenceEngine>> {
        let map = self.inner.read().await;
        match map.loaded.get(model_id) {
            Some(model) => {
                model
                    .last_used
                    .store(unix_now(), std::sync::atomic::Ordering::Relaxed);
                Ok(model.engine.clone())
            }
            None => Err(SnapError::NotFound(format!("model {model_id}"))),
        }
    }

    /// The dequantized workspace backing a loaded model.
    pub async fn dequant_for(&self, model_id: &str) -> SnapResult<Arc<DequantizedModel>> {
        let map = self.inner.read().await;
        map.loaded
            .get(model_id)
            .map(|m| m.dequant.clone())
            .ok_or_else(|| SnapError::NotFound(format!("model {model_id}")))
    }

    /// The content fingerprint of a loaded model.
    pub async fn fingerprint_of(&self, model_id: &str) -> SnapResult<String> {
        let map = self.inner.read().await;
        map.loaded
            .get(model_id)
            .map(|m| m.info.fingerprint.clone())
            .ok_or_else(|| SnapError::NotFound(format!("model {model_id}")))
    }

    pub async fn stats(&self) -> ModelManagerStats {
        self.stats.lock().unwrap().clone()
    }

    fn persist_state(&self, map: &ModelMap) -> SnapResult<()> {
        let state = RuntimeState {
            active_model: map.active.clone(),
            loaded: map
                .loaded
                .values()
                .map(|m| RamCacheEntry {
                    model_id: m.info.model_id.clone(),
                    source_path: m.info.source_path.clone(),
                    quant: m.info.quant.clone(),
                    byte_size: m.info.byte_size,
                    fingerprint: m.info.fingerprint.clone(),
                })
                .collect(),
        };
        fsutil::atomic_write_json(&self.layout.runtime_state_path(), &state)?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::dequant::testutil::TestGguf;
    use crate::dequant::GgmlDtype;
    use crate::engine::StubEngineFactory;
    use tempfile::TempDir;

    fn write_model(path: &Path, layers: u32) {
        let weights: Vec<u8> = (0..64u32)
            .flat_map(|i| (i as f32).to_le_bytes())
            .collect();
        TestGguf::new()
            .kv_str("general.architecture", "llama")
            .kv_u32("llama.block_count", layers)
            .kv_u32("llama.attention.head_count", 4)
            .kv_u32("llama.attention.head_count_kv", 2)
            .kv_u32("llama.embedding_length", 64)
            .kv_u32("llama.context_length", 512)
            .kv_u32("llama.vocab_size", 128)
            .tensor("tok.weight", &[64], GgmlDtype::F32, weights)
            .write_to(path);
    }

    fn manager(tmp: &TempDir, vram_budget: usize) -> ModelManager {
        let layout = HomeLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        let dequant = Arc::new(DequantCache::new(
            layout.clone(),
            WorkspaceConfig {
                overhead_factor: 4.0,
                ..WorkspaceConfig::default()
            },
        ));
        ModelManager::new(
            ModelConfig {
                vram_budget,
                max_loaded_models: 4,
                ..ModelConfig::default()
            },
            layout,
            dequant,
            Arc::new(StubEngineFactory::new()),
        )
    }

    #[tokio::test]
    async fn test_load_switch_unload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.gguf");
        write_model(&path, 2);

        let mgr = manager(&tmp, usize::MAX);
        let info = mgr.load("a", &path).await.unwrap();
        assert_eq!(info.shape.n_layers, 2);

        mgr.switch("a").await.unwrap();
        assert_eq!(mgr.get_active().await.unwrap().model_id, "a");
        assert_eq!(mgr.get_active().await.unwrap().state, ModelState::Active);

        mgr.unload("a").await.unwrap();
        assert!(mgr.get_active().await.is_none());
        assert!(mgr.get_info("a").await.is_err());
    }

    #[tokio::test]
    async fn test_double_load_is_noop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.gguf");
        write_model(&path, 2);

        let mgr = manager(&tmp, usize::MAX);
        mgr.load("a", &path).await.unwrap();
        mgr.load("a", &path).await.unwrap();
        assert_eq!(mgr.stats().await.loads, 1);
    }

    #[tokio::test]
    async fn test_switch_unknown_fails() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, usize::MAX);
        let err = mgr.switch("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_eviction_skips_active() {
        let tmp = TempDir::new().unwrap();
        let path_a = tmp.path().join("a.gguf");
        let path_b = tmp.path().join("b.gguf");
        write_model(&path_a, 2);
        write_model(&path_b, 2);

        // Budget fits one model only.
        let mgr = manager(&tmp, 300);
        mgr.load("a", &path_a).await.unwrap();
        mgr.switch("a").await.unwrap();

        // Loading b must not evict the active a; b binds CPU-only instead.
        let info_b = mgr.load("b", &path_b).await.unwrap();
        assert!(!info_b.gpu_resident);
        assert!(mgr.get_info("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_flash_entry() {
        let tmp = TempDir::new().unwrap();
        let path_a = tmp.path().join("a.gguf");
        let path_b = tmp.path().join("b.gguf");
        write_model(&path_a, 2);
        write_model(&path_b, 2);

        let mgr = manager(&tmp, 300);
        mgr.load("a", &path_a).await.unwrap();
        // No active model: a is evictable when b arrives.
        mgr.load("b", &path_b).await.unwrap();

        assert!(mgr.get_info("a").await.is_err());
        assert_eq!(mgr.stats().await.evictions, 1);

        // Reloading a is a flash reload from the retained workspace.
        mgr.load("a", &path_a).await.unwrap();
        assert_eq!(mgr.stats().await.flash_reloads, 1);
    }
}
