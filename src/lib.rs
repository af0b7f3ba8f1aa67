//! snapllm-core: two-level inference-acceleration substrate for a local
//! multi-model LLM serving system.
//!
//! Level 1 dequantizes a model file once into a persistent memory-mapped
//! workspace, so warm loads skip dequantization entirely. Level 2 extracts
//! the KV state produced by a prefill pass, frames it on disk indexed by
//! content hash, tiers it across GPU / host RAM / disk, and re-injects it
//! into a fresh sequence slot so follow-up queries skip the O(n²) prefill.
//!
//! The [`SnapCore`] facade wires the pieces together for embedders; every
//! component is also usable on its own with explicitly injected
//! collaborators.

pub mod alloc;
pub mod config;
pub mod context;
pub mod dequant;
pub mod engine;
pub mod error;
mod fsutil;
pub mod kv;
pub mod model;
pub mod registry;
pub mod tiering;
pub mod workspace;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alloc::TieredAllocator;
use crate::config::{HomeLayout, SnapConfig};
use crate::context::ContextManager;
use crate::dequant::DequantCache;
use crate::engine::EngineFactory;
use crate::model::ModelManager;
use crate::registry::Registry;
use crate::tiering::AutoTieringController;

pub use crate::error::{SnapError, SnapResult};

/// The assembled core: allocator, caches, managers, and the background
/// tiering loop, sharing one home layout and configuration.
pub struct SnapCore {
    pub config: SnapConfig,
    pub layout: HomeLayout,
    pub allocator: Arc<TieredAllocator>,
    pub registry: Arc<Registry>,
    pub dequant: Arc<DequantCache>,
    pub models: Arc<ModelManager>,
    pub contexts: Arc<ContextManager>,
    pub tiering: Arc<AutoTieringController>,
    tiering_cancel: CancellationToken,
}

impl SnapCore {
    /// Assemble the core under `home`, discovering persisted workspaces and
    /// contexts. The auto-tiering loop is not started; call
    /// [`SnapCore::start_tiering`] for that.
    pub async fn open(
        home: impl Into<std::path::PathBuf>,
        config: SnapConfig,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> SnapResult<Self> {
        let layout = HomeLayout::new(home);
        layout.ensure_dirs()?;

        let allocator = Arc::new(TieredAllocator::new(&config.tiers));
        let registry = Arc::new(Registry::new(layout.clone()));
        let dequant = Arc::new(DequantCache::new(layout.clone(), config.workspace.clone()));
        let models = Arc::new(ModelManager::new(
            config.models.clone(),
            layout.clone(),
            dequant.clone(),
            engine_factory,
        ));
        let contexts = ContextManager::new(
            layout.clone(),
            config.ingest.clone(),
            config.compression.clone(),
            allocator.clone(),
            registry.clone(),
            models.clone(),
        );
        let restored = contexts.bootstrap().await?;

        let tiering = Arc::new(AutoTieringController::new(
            config.tiering.clone(),
            allocator.clone(),
            contexts.clone(),
        ));

        info!(
            home = %layout.root().display(),
            restored_contexts = restored,
            "snapllm core ready"
        );

        Ok(Self {
            config,
            layout,
            allocator,
            registry,
            dequant,
            models,
            contexts,
            tiering,
            tiering_cancel: CancellationToken::new(),
        })
    }

    /// Open under the resolved `SNAPLLM_HOME` with configuration loaded from
    /// `config/snapllm.json` when present.
    pub async fn open_default(engine_factory: Arc<dyn EngineFactory>) -> SnapResult<Self> {
        let home = config::resolve_home();
        let layout = HomeLayout::new(&home);
        let config = SnapConfig::load(&layout.config_path())
            .map_err(|e| SnapError::InvalidArgument(e.to_string()))?;
        Self::open(home, config, engine_factory).await
    }

    /// Start the background auto-tiering loop.
    pub fn start_tiering(&self) -> tokio::task::JoinHandle<()> {
        self.tiering.clone().spawn(self.tiering_cancel.child_token())
    }

    /// Stop the background loop; in-flight operations finish normally.
    pub fn shutdown(&self) {
        self.tiering_cancel.cancel();
    }
}

impl Drop for SnapCore {
    fn drop(&mut self) {
        self.tiering_cancel.cancel();
    }
}
