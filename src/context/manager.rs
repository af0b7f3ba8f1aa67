//! The context manager: L2 resource manager over cached KV artifacts.
//!
//! Owns every context's metadata and lifecycle, coordinates the tiered
//! allocator for placement, the registry for discovery, and the extractor
//! for the engine-facing work. Ingest is deduplicated by content hash with
//! at-most-one concurrent extraction per `(model_id, content_hash)`; query,
//! tier moves, and delete are mutually exclusive per context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::alloc::{EvictionSubscriber, Tier, TieredAllocator, VictimDisposition};
use crate::config::{CompressionConfig, CompressionKind, HomeLayout, IngestConfig};
use crate::engine::{EngineContext, InferenceEngine, SeqId, TokenId};
use crate::error::{SnapError, SnapResult};
use crate::fsutil;
use crate::kv::{compressor_for, CompressionType, FrameHeader, KvDtype, KvFrame};
use crate::model::ModelManager;
use crate::registry::{ContextIndexEntry, Registry};

use super::extractor::KvExtractor;
use super::{
    ContextHandle, ContextMeta, ContextState, IngestOptions, MergeStrategy, QueryConfig,
    QueryResponse, Usage,
};

/// Result of an ingest: the handle plus whether dedup short-circuited.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub handle: ContextHandle,
    /// True when an existing artifact was returned without any engine work.
    pub deduplicated: bool,
    pub ingest_ms: u64,
}

/// Aggregate statistics.
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    pub contexts: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub ingests: u64,
    pub dedup_hits: u64,
    pub queries: u64,
}

/// One engine session per model; operations that touch it are serialized.
struct EngineSession {
    ctx: Box<dyn EngineContext>,
}

/// The context manager.
pub struct ContextManager {
    layout: HomeLayout,
    ingest_config: IngestConfig,
    compression: CompressionConfig,
    allocator: Arc<TieredAllocator>,
    registry: Arc<Registry>,
    models: Arc<ModelManager>,
    extractor: KvExtractor,

    contexts: RwLock<HashMap<String, ContextMeta>>,
    /// Serializes duplicate ingests of the same `(model_id, content_hash)`.
    ingest_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    /// Per-context exclusivity for query / tier moves / delete.
    ctx_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Per-model engine sessions.
    sessions: Mutex<HashMap<String, Arc<Mutex<EngineSession>>>>,
    /// Bounds concurrently running extraction jobs.
    ingest_permits: Arc<Semaphore>,
    next_seq: AtomicU64,

    ingests: AtomicU64,
    dedup_hits: AtomicU64,
    queries: AtomicU64,
}

impl ContextManager {
    pub fn new(
        layout: HomeLayout,
        ingest_config: IngestConfig,
        compression: CompressionConfig,
        allocator: Arc<TieredAllocator>,
        registry: Arc<Registry>,
        models: Arc<ModelManager>,
    ) -> Arc<Self> {
        let extractor = KvExtractor::new(ingest_config.batch_size);
        let permits = ingest_config.max_concurrent_ingests.max(1);
        let manager = Arc::new(Self {
            layout,
            ingest_config,
            compression,
            allocator: allocator.clone(),
            registry,
            models,
            extractor,
            contexts: RwLock::new(HashMap::new()),
            ingest_locks: Mutex::new(HashMap::new()),
            ctx_locks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            ingest_permits: Arc::new(Semaphore::new(permits)),
            next_seq: AtomicU64::new(1),
            ingests: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        });

        let subscriber: Arc<dyn EvictionSubscriber> = manager.clone();
        allocator.subscribe(Arc::downgrade(&subscriber));
        manager
    }

    /// Discover persisted contexts on startup. Memory tiers are empty after
    /// a restart, so every discovered context is settled into the cold tier
    /// (its frame is moved under `contexts/cold/` if it was recorded hotter).
    pub async fn bootstrap(&self) -> SnapResult<usize> {
        self.registry.load_index()?;

        let mut restored = 0usize;
        for (_model_id, entry) in self.registry.all_entries() {
            let meta_path = self.layout.context_metadata_path(&entry.context_id);
            let Ok(data) = std::fs::read_to_string(&meta_path) else {
                warn!(context_id = entry.context_id, "Metadata record missing, skipping");
                continue;
            };
            let Ok(mut meta) = serde_json::from_str::<ContextMeta>(&data) else {
                warn!(context_id = entry.context_id, "Metadata record unreadable, skipping");
                continue;
            };

            let recorded_path = entry.file_path.clone();
            let cold_path = self.layout.frame_path(Tier::Cold, &meta.context_id);
            if meta.tier != Tier::Cold {
                if recorded_path.exists() && recorded_path != cold_path {
                    std::fs::rename(&recorded_path, &cold_path)?;
                    self.registry.update_location(&meta.context_id, &cold_path)?;
                }
                meta.tier = Tier::Cold;
                meta.state = ContextState::Ready;
                self.persist_meta(&meta)?;
            }

            // Account the frame in the cold tier and register its file.
            let block = self
                .allocator
                .allocate(meta.storage_size as usize, Tier::Cold, &meta.context_id)
                .await?;
            debug_assert_eq!(block.tier, Tier::Cold);
            self.allocator
                .set_spill_path(&meta.context_id, cold_path.clone());

            self.contexts
                .write()
                .await
                .insert(meta.context_id.clone(), meta);
            restored += 1;
        }

        info!(restored, "Context manager bootstrapped");
        Ok(restored)
    }

    /// SHA-256 content hash, hex encoded.
    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Ingest content for a model, deduplicating on `(model_id, content_hash)`.
    ///
    /// Concurrent duplicate ingests coalesce: exactly one extraction runs and
    /// every caller receives the same handle.
    pub async fn ingest(
        &self,
        model_id: &str,
        content: &str,
        opts: IngestOptions,
    ) -> SnapResult<IngestOutcome> {
        let start = Instant::now();
        let content_hash = Self::content_hash(content);

        // Fast path: O(1) dedup against the hash index.
        if let Some(handle) = self.dedup_lookup(model_id, &content_hash).await {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IngestOutcome {
                handle,
                deduplicated: true,
                ingest_ms: start.elapsed().as_millis() as u64,
            });
        }

        // At-most-one extraction per key: later arrivals queue on the key
        // lock, then re-check the index and attach to the finished result.
        let key = (model_id.to_string(), content_hash.clone());
        let key_lock = {
            let mut locks = self.ingest_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let _key_guard = key_lock.lock().await;

        if let Some(handle) = self.dedup_lookup(model_id, &content_hash).await {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IngestOutcome {
                handle,
                deduplicated: true,
                ingest_ms: start.elapsed().as_millis() as u64,
            });
        }

        let _permit = self
            .ingest_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SnapError::Cancelled)?;

        let context_id = uuid::Uuid::new_v4().to_string();
        let result = match opts.deadline {
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    self.ingest_inner(model_id, content, &content_hash, &context_id, &opts),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(SnapError::Timeout),
                }
            }
            None => {
                self.ingest_inner(model_id, content, &content_hash, &context_id, &opts)
                    .await
            }
        };

        {
            let mut locks = self.ingest_locks.lock().await;
            locks.remove(&key);
        }

        match result {
            Ok(handle) => {
                self.ingests.fetch_add(1, Ordering::Relaxed);
                Ok(IngestOutcome {
                    handle,
                    deduplicated: false,
                    ingest_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                // Cancellation, timeout, or engine failure: no partial
                // artifact survives, so re-issuing the call is safe.
                self.cleanup_partial(&context_id).await;
                Err(e)
            }
        }
    }

    /// Primary conversational-reuse path: identical to ingest, which already
    /// guarantees dedup on identical prior-turn history.
    pub async fn find_or_create(
        &self,
        model_id: &str,
        content: &str,
        opts: IngestOptions,
    ) -> SnapResult<IngestOutcome> {
        self.ingest(model_id, content, opts).await
    }

    /// Future-returning ingest on the bounded worker pool.
    pub fn ingest_async(
        self: &Arc<Self>,
        model_id: String,
        content: String,
        opts: IngestOptions,
    ) -> tokio::task::JoinHandle<SnapResult<IngestOutcome>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.ingest(&model_id, &content, opts).await })
    }

    async fn dedup_lookup(&self, model_id: &str, content_hash: &str) -> Option<ContextHandle> {
        let context_id = self.registry.lookup_hash(model_id, content_hash)?;
        let contexts = self.contexts.read().await;
        let meta = contexts.get(&context_id)?;
        if meta.state != ContextState::Ready {
            return None;
        }
        Some(handle_of(meta))
    }

    async fn ingest_inner(
        &self,
        model_id: &str,
        content: &str,
        content_hash: &str,
        context_id: &str,
        opts: &IngestOptions,
    ) -> SnapResult<ContextHandle> {
        let engine = self.models.engine_for(model_id).await?;
        let fingerprint = self.models.fingerprint_of(model_id).await?;
        let shape = engine.shape().clone();

        // Mark the context as ingesting before the long engine work.
        let now = unix_now();
        let mut meta = ContextMeta {
            context_id: context_id.to_string(),
            name: opts.name.clone().unwrap_or_else(|| context_id.to_string()),
            model_id: model_id.to_string(),
            model_fingerprint: fingerprint.clone(),
            content_hash: content_hash.to_string(),
            shape: shape.clone(),
            token_count: 0,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            tier: opts.preferred_tier,
            storage_size: 0,
            compressed: false,
            ttl_secs: opts.ttl_secs.unwrap_or(self.ingest_config.default_ttl_secs),
            state: ContextState::Ingesting,
        };
        self.contexts
            .write()
            .await
            .insert(context_id.to_string(), meta.clone());

        // Extraction holds the model's engine session for its duration.
        let session = self.session_for(model_id).await?;
        let seq_id = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let extract = {
            let mut session = session.lock().await;
            let out = self
                .extractor
                .extract(
                    engine.as_ref(),
                    session.ctx.as_mut(),
                    seq_id,
                    content,
                    &opts.cancel,
                )
                .await;
            session.ctx.clear_sequence(seq_id);
            out?
        };

        if opts.cancel.is_cancelled() {
            return Err(SnapError::Cancelled);
        }

        // Frame the payload.
        let compressor = if self.compression.enabled
            && extract.payload.len() >= self.compression.min_compress_bytes
        {
            Some(compressor_for(
                match self.compression.codec {
                    CompressionKind::Lz4 => CompressionType::Lz4,
                    CompressionKind::Zstd => CompressionType::Zstd,
                },
                self.compression.zstd_level,
            ))
        } else {
            None
        };
        let frame = KvFrame::encode(
            context_id,
            &fingerprint,
            now,
            shape.n_layers,
            shape.n_kv_heads,
            shape.head_dim,
            extract.token_count,
            KvDtype::Fp16,
            &extract.payload,
            compressor.as_deref(),
        )?;
        let compressed = frame.len() < crate::kv::FRAME_HEADER_SIZE + extract.payload.len();

        // Place the frame bytes in the preferred tier (the allocator may
        // fall through to a slower one).
        let block = self
            .allocator
            .allocate(frame.len(), opts.preferred_tier, context_id)
            .await?;
        let tier = block.tier;

        // The frame is always persisted, whatever tier backs the bytes.
        let frame_path = self.layout.frame_path(tier, context_id);
        fsutil::atomic_write(&frame_path, &frame)?;
        self.allocator.set_spill_path(context_id, frame_path.clone());
        if tier.is_memory() {
            self.allocator
                .write_block(block.id, Bytes::from(frame.clone()))?;
        }

        meta.token_count = extract.token_count;
        meta.tier = tier;
        meta.storage_size = frame.len() as u64;
        meta.compressed = compressed;
        meta.state = ContextState::Ready;
        self.persist_meta(&meta)?;

        let entry = ContextIndexEntry {
            context_id: context_id.to_string(),
            name: meta.name.clone(),
            file_path: frame_path.clone(),
            token_count: meta.token_count,
            storage_size: meta.storage_size,
            created_at: meta.created_at,
            last_accessed: meta.last_accessed,
            content_hash: content_hash.to_string(),
            file_size: frame.len() as u64,
            file_mtime: file_mtime(&frame_path),
        };
        self.registry.insert(model_id, entry)?;

        self.contexts
            .write()
            .await
            .insert(context_id.to_string(), meta.clone());

        info!(
            context_id,
            model_id,
            tokens = meta.token_count,
            bytes = meta.storage_size,
            %tier,
            compressed,
            prefill_ms = extract.timings.prefill_ms,
            "Context ingested"
        );
        Ok(handle_of(&meta))
    }

    /// Remove whatever a failed ingest left behind.
    async fn cleanup_partial(&self, context_id: &str) {
        self.contexts.write().await.remove(context_id);
        self.allocator.deallocate_owner(context_id);
        let _ = self.registry.remove(context_id);
        for tier in Tier::ALL {
            let path = self.layout.frame_path(tier, context_id);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }
        let meta_path = self.layout.context_metadata_path(context_id);
        if meta_path.exists() {
            let _ = std::fs::remove_file(&meta_path);
        }
    }

    /// Query a cached context: load, verify, inject, decode, generate.
    pub async fn query(
        &self,
        context_id: &str,
        text: &str,
        config: &QueryConfig,
    ) -> SnapResult<QueryResponse> {
        let _guard = self.lock_context(context_id).await;
        match config.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.query_inner(context_id, text, config))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(SnapError::Timeout),
                }
            }
            None => self.query_inner(context_id, text, config).await,
        }
    }

    async fn query_inner(
        &self,
        context_id: &str,
        text: &str,
        config: &QueryConfig,
    ) -> SnapResult<QueryResponse> {
        let start = Instant::now();
        let meta = self
            .meta_of(context_id)
            .await
            .ok_or_else(|| SnapError::NotFound(format!("context {context_id}")))?;

        let frame = self.load_frame(&meta).await?;
        self.verify_compatibility(&meta, &frame.header).await?;

        let engine = self.models.engine_for(&meta.model_id).await?;
        let session = self.session_for(&meta.model_id).await?;
        let seq_id = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let query_tokens = engine.tokenize(text, false)?;

        let (generated, context_tokens) = {
            let mut session = session.lock().await;
            let ctx = session.ctx.as_mut();

            let context_tokens = self.extractor.inject(ctx, seq_id, &frame.payload)?;
            let decode =
                self.decode_over_slot(engine.as_ref(), ctx, seq_id, &query_tokens, config);

            ctx.clear_sequence(seq_id);
            (decode?, context_tokens)
        };

        self.touch_access(context_id).await;
        self.allocator.record_access(context_id);
        self.queries.fetch_add(1, Ordering::Relaxed);

        let response_text = engine.detokenize(&generated)?;
        Ok(QueryResponse {
            response_text,
            usage: Usage {
                context_tokens,
                query_tokens: query_tokens.len() as u32,
                generated_tokens: generated.len() as u32,
            },
            cache_hit: true,
            latency_ms: start.elapsed().as_millis() as u64,
            tokens: generated,
        })
    }

    /// Query over several contexts at once. Every handle's KV state lands
    /// in the single sequence slot the decode loop reads, combined per the
    /// configured merge strategy (concatenation in the order given).
    pub async fn query_multi(
        &self,
        context_ids: &[String],
        text: &str,
        config: &QueryConfig,
    ) -> SnapResult<QueryResponse> {
        match config.deadline {
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    self.query_multi_inner(context_ids, text, config),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(SnapError::Timeout),
                }
            }
            None => self.query_multi_inner(context_ids, text, config).await,
        }
    }

    async fn query_multi_inner(
        &self,
        context_ids: &[String],
        text: &str,
        config: &QueryConfig,
    ) -> SnapResult<QueryResponse> {
        let start = Instant::now();
        if context_ids.is_empty() {
            return Err(SnapError::InvalidArgument("no contexts given".into()));
        }

        // Lock in sorted order so overlapping multi queries cannot deadlock;
        // injection still follows the order the caller gave.
        let mut to_lock: Vec<&String> = context_ids.iter().collect();
        to_lock.sort();
        to_lock.dedup();
        let mut guards = Vec::with_capacity(to_lock.len());
        for id in to_lock {
            guards.push(self.lock_context(id).await);
        }

        // Every handle must exist, share one model, and verify against it.
        let mut metas = Vec::with_capacity(context_ids.len());
        for id in context_ids {
            let meta = self
                .meta_of(id)
                .await
                .ok_or_else(|| SnapError::NotFound(format!("context {id}")))?;
            metas.push(meta);
        }
        let model_id = metas[0].model_id.clone();
        for meta in &metas[1..] {
            if meta.model_id != model_id {
                return Err(SnapError::InvalidArgument(format!(
                    "context {} belongs to model {}, not {model_id}",
                    meta.context_id, meta.model_id
                )));
            }
        }

        let mut frames = Vec::with_capacity(metas.len());
        for meta in &metas {
            let frame = self.load_frame(meta).await?;
            self.verify_compatibility(meta, &frame.header).await?;
            frames.push(frame);
        }

        let engine = self.models.engine_for(&model_id).await?;
        let session = self.session_for(&model_id).await?;
        let seq_id = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let query_tokens = engine.tokenize(text, false)?;

        let (generated, context_tokens) = {
            let mut session = session.lock().await;
            let ctx = session.ctx.as_mut();

            let result = (|| -> SnapResult<(Vec<TokenId>, u32)> {
                // All contexts land in the one slot generation reads from.
                let mut context_tokens =
                    self.extractor.inject(ctx, seq_id, &frames[0].payload)?;
                match config.merge {
                    MergeStrategy::Concatenate => {
                        for frame in &frames[1..] {
                            context_tokens +=
                                self.extractor.append(ctx, seq_id, &frame.payload)?;
                        }
                    }
                }
                let generated = self.decode_over_slot(
                    engine.as_ref(),
                    ctx,
                    seq_id,
                    &query_tokens,
                    config,
                )?;
                Ok((generated, context_tokens))
            })();

            ctx.clear_sequence(seq_id);
            result?
        };

        for id in context_ids {
            self.touch_access(id).await;
            self.allocator.record_access(id);
        }
        self.queries.fetch_add(1, Ordering::Relaxed);

        let response_text = engine.detokenize(&generated)?;
        Ok(QueryResponse {
            response_text,
            usage: Usage {
                context_tokens,
                query_tokens: query_tokens.len() as u32,
                generated_tokens: generated.len() as u32,
            },
            cache_hit: true,
            latency_ms: start.elapsed().as_millis() as u64,
            tokens: generated,
        })
    }

    /// Delete a context everywhere. Unknown ids are a no-op returning false.
    pub async fn delete(&self, context_id: &str) -> SnapResult<bool> {
        let _guard = self.lock_context(context_id).await;

        let known = {
            let mut contexts = self.contexts.write().await;
            contexts.remove(context_id).is_some()
        };
        let removed = self.registry.remove(context_id)?.is_some();
        if !known && !removed {
            debug!(context_id, "Delete of unknown context is a no-op");
            return Ok(false);
        }

        self.allocator.deallocate_owner(context_id);
        for tier in Tier::ALL {
            let path = self.layout.frame_path(tier, context_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        let meta_path = self.layout.context_metadata_path(context_id);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)?;
        }

        info!(context_id, "Context deleted");
        Ok(true)
    }

    /// Move a context to a faster tier.
    pub async fn promote(&self, context_id: &str, target: Tier) -> SnapResult<()> {
        let _guard = self.lock_context(context_id).await;
        self.promote_locked(context_id, target).await
    }

    async fn promote_locked(&self, context_id: &str, target: Tier) -> SnapResult<()> {
        let meta = self
            .meta_of(context_id)
            .await
            .ok_or_else(|| SnapError::NotFound(format!("context {context_id}")))?;
        if meta.tier == target || target.level() > meta.tier.level() {
            return Ok(());
        }

        self.set_state(context_id, ContextState::Loading).await;
        let result = self.allocator.promote(context_id, target).await;
        match result {
            Ok(()) => {
                self.move_frame(context_id, meta.tier, target).await?;
                self.set_tier(context_id, target, ContextState::Ready).await?;
                Ok(())
            }
            Err(e) => {
                self.set_state(context_id, ContextState::Ready).await;
                Err(e.into())
            }
        }
    }

    /// Move a context to a slower tier. The frame file moves first so the
    /// spill path is valid before memory is released.
    pub async fn demote(&self, context_id: &str, target: Tier) -> SnapResult<()> {
        let _guard = self.lock_context(context_id).await;

        let meta = self
            .meta_of(context_id)
            .await
            .ok_or_else(|| SnapError::NotFound(format!("context {context_id}")))?;
        if meta.tier == target || target.level() < meta.tier.level() {
            return Ok(());
        }

        self.set_state(context_id, ContextState::Loading).await;
        self.move_frame(context_id, meta.tier, target).await?;
        match self.allocator.demote(context_id, target).await {
            Ok(()) => {
                self.set_tier(context_id, target, ContextState::Ready).await?;
                Ok(())
            }
            Err(e) => {
                // Roll the file back; the bytes never left the source tier.
                self.move_frame(context_id, target, meta.tier).await?;
                self.set_state(context_id, ContextState::Ready).await;
                Err(e.into())
            }
        }
    }

    /// Drop every context whose TTL has elapsed. Returns how many were
    /// removed. Cadence is the caller's choice.
    pub async fn sweep_expired(&self) -> SnapResult<usize> {
        let now = unix_now();
        let expired: Vec<String> = {
            let contexts = self.contexts.read().await;
            contexts
                .values()
                .filter(|m| m.expired_at(now))
                .map(|m| m.context_id.clone())
                .collect()
        };

        let mut removed = 0;
        for id in expired {
            if self.delete(&id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "TTL sweep removed expired contexts");
        }
        Ok(removed)
    }

    /// Metadata snapshot for one context.
    pub async fn get(&self, context_id: &str) -> Option<ContextMeta> {
        self.meta_of(context_id).await
    }

    /// Handles for every context of a model.
    pub async fn list(&self, model_id: Option<&str>) -> Vec<ContextHandle> {
        let contexts = self.contexts.read().await;
        contexts
            .values()
            .filter(|m| model_id.map_or(true, |id| m.model_id == id))
            .filter(|m| m.state == ContextState::Ready)
            .map(handle_of)
            .collect()
    }

    pub async fn stats(&self) -> ContextStats {
        let contexts = self.contexts.read().await;
        let mut stats = ContextStats {
            contexts: contexts.len(),
            ingests: self.ingests.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            ..Default::default()
        };
        for meta in contexts.values() {
            match meta.tier {
                Tier::Hot => stats.hot += 1,
                Tier::Warm => stats.warm += 1,
                Tier::Cold => stats.cold += 1,
            }
        }
        stats
    }

    /// Access statistics the auto-tiering controller samples.
    pub async fn tiering_snapshot(&self) -> Vec<(String, Tier, u64, u64)> {
        let contexts = self.contexts.read().await;
        contexts
            .values()
            .filter(|m| m.state == ContextState::Ready)
            .map(|m| (m.context_id.clone(), m.tier, m.last_accessed, m.access_count))
            .collect()
    }

    // ---- internals ----

    async fn lock_context(&self, context_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.ctx_locks.lock().await;
            locks.entry(context_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn meta_of(&self, context_id: &str) -> Option<ContextMeta> {
        self.contexts.read().await.get(context_id).cloned()
    }

    async fn set_state(&self, context_id: &str, state: ContextState) {
        let mut contexts = self.contexts.write().await;
        if let Some(meta) = contexts.get_mut(context_id) {
            meta.state = state;
        }
    }

    async fn set_tier(
        &self,
        context_id: &str,
        tier: Tier,
        state: ContextState,
    ) -> SnapResult<()> {
        let meta = {
            let mut contexts = self.contexts.write().await;
            let Some(meta) = contexts.get_mut(context_id) else {
                return Ok(());
            };
            meta.tier = tier;
            meta.state = state;
            meta.clone()
        };
        self.persist_meta(&meta)?;
        Ok(())
    }

    async fn touch_access(&self, context_id: &str) {
        let now = unix_now();
        let meta = {
            let mut contexts = self.contexts.write().await;
            let Some(meta) = contexts.get_mut(context_id) else {
                return;
            };
            meta.last_accessed = now;
            meta.access_count += 1;
            meta.clone()
        };
        self.registry.touch(context_id, now);
        // Advisory: losing the last unsynced increment on crash is fine.
        let _ = self.persist_meta(&meta);
    }

    fn persist_meta(&self, meta: &ContextMeta) -> SnapResult<()> {
        fsutil::atomic_write_json(
            &self.layout.context_metadata_path(&meta.context_id),
            meta,
        )?;
        Ok(())
    }

    /// Rename the frame between tier directories and update every record of
    /// its location.
    async fn move_frame(&self, context_id: &str, from: Tier, to: Tier) -> SnapResult<()> {
        let from_path = self.layout.frame_path(from, context_id);
        let to_path = self.layout.frame_path(to, context_id);
        if from_path.exists() {
            std::fs::rename(&from_path, &to_path)?;
        } else if !to_path.exists() {
            return Err(SnapError::CorruptArtifact(format!(
                "frame for {context_id} missing from {from} and {to}"
            )));
        }
        self.allocator.set_spill_path(context_id, to_path.clone());
        self.registry.update_location(context_id, &to_path)?;
        Ok(())
    }

    /// Fetch and decode the frame, applying on-access promotion: cold
    /// artifacts are loaded to warm before injection, warm ones drift back
    /// to hot. Promotion failures never fail the read; the bytes are still
    /// reachable where they are.
    async fn load_frame(&self, meta: &ContextMeta) -> SnapResult<KvFrame> {
        if self.allocator.get_tier(&meta.context_id).is_none() {
            self.register_cold(meta).await?;
        }
        if let Some(target) = meta.tier.faster() {
            if let Err(e) = self.promote_locked(&meta.context_id, target).await {
                debug!(context_id = meta.context_id, error = %e, "On-access promotion failed");
            }
        }

        let bytes = self.allocator.read_owner(&meta.context_id).await?;
        let frame = KvFrame::decode(&bytes).map_err(|e| {
            self.quarantine_blocking(meta);
            SnapError::CorruptArtifact(e.to_string())
        })?;
        Ok(frame)
    }

    /// Register a discovered context's frame with the allocator.
    async fn register_cold(&self, meta: &ContextMeta) -> SnapResult<()> {
        let path = self.layout.frame_path(meta.tier, &meta.context_id);
        if !path.exists() {
            return Err(SnapError::CorruptArtifact(format!(
                "frame missing for {}",
                meta.context_id
            )));
        }
        self.allocator
            .allocate(meta.storage_size as usize, Tier::Cold, &meta.context_id)
            .await?;
        self.allocator.set_spill_path(&meta.context_id, path);
        Ok(())
    }

    /// Quarantine a corrupt frame: drop the index entry and rename the file.
    fn quarantine_blocking(&self, meta: &ContextMeta) {
        warn!(context_id = meta.context_id, "Quarantining corrupt frame");
        let _ = self.registry.remove(&meta.context_id);
        self.allocator.deallocate_owner(&meta.context_id);
        for tier in Tier::ALL {
            let path = self.layout.frame_path(tier, &meta.context_id);
            if path.exists() {
                let mut target = path.as_os_str().to_owned();
                target.push(".broken");
                let _ = std::fs::rename(&path, std::path::PathBuf::from(&target));
            }
        }
    }

    /// A frame must match the model it is injected into, exactly.
    async fn verify_compatibility(
        &self,
        meta: &ContextMeta,
        header: &FrameHeader,
    ) -> SnapResult<()> {
        let fingerprint = self.models.fingerprint_of(&meta.model_id).await?;
        if header.model_fingerprint != fingerprint {
            return Err(SnapError::IncompatibleShape {
                reason: format!(
                    "frame fingerprint {} does not match model {}",
                    header.model_fingerprint, meta.model_id
                ),
            });
        }

        let engine = self.models.engine_for(&meta.model_id).await?;
        let shape = engine.shape();
        if header.num_layers != shape.n_layers
            || header.num_kv_heads != shape.n_kv_heads
            || header.head_dim != shape.head_dim
        {
            return Err(SnapError::IncompatibleShape {
                reason: format!(
                    "frame shape {}x{}x{} vs model {}x{}x{}",
                    header.num_layers,
                    header.num_kv_heads,
                    header.head_dim,
                    shape.n_layers,
                    shape.n_kv_heads,
                    shape.head_dim
                ),
            });
        }
        Ok(())
    }

    /// The generation loop: prefill the query tokens into the slot, then
    /// sample and decode until max tokens, a stop token, or cancellation.
    fn decode_over_slot(
        &self,
        engine: &dyn InferenceEngine,
        ctx: &mut dyn EngineContext,
        seq_id: SeqId,
        query_tokens: &[TokenId],
        config: &QueryConfig,
    ) -> SnapResult<Vec<TokenId>> {
        let sampler = &config.sampler;
        let mut logits = match query_tokens.split_last() {
            Some((last, rest)) => {
                if !rest.is_empty() {
                    ctx.prefill(seq_id, rest)?;
                }
                ctx.decode_step(seq_id, *last)?
            }
            None => return Err(SnapError::InvalidArgument("empty query text".into())),
        };

        let mut generated: Vec<TokenId> = Vec::new();
        let mut history = query_tokens.to_vec();
        while generated.len() < sampler.max_tokens {
            if config.cancel.is_cancelled() {
                // Stop at the token boundary; what was produced so far is
                // surfaced to the caller.
                break;
            }
            let token = engine.sample(&logits, sampler, &history);
            if sampler.stop_tokens.contains(&token) {
                break;
            }
            generated.push(token);
            history.push(token);
            logits = ctx.decode_step(seq_id, token)?;
        }
        Ok(generated)
    }

    async fn session_for(&self, model_id: &str) -> SnapResult<Arc<Mutex<EngineSession>>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(model_id) {
            return Ok(session.clone());
        }
        let engine = self.models.engine_for(model_id).await?;
        let ctx = engine.new_context(&crate::engine::EngineParams::default())?;
        let session = Arc::new(Mutex::new(EngineSession { ctx }));
        sessions.insert(model_id.to_string(), session.clone());
        Ok(session)
    }
}

/// Pre-eviction callback: preserve the victim instead of losing it.
#[async_trait]
impl EvictionSubscriber for ContextManager {
    async fn on_evict(&self, owner: &str, tier: Tier, _size: usize) -> VictimDisposition {
        let Some(meta) = self.meta_of(owner).await else {
            return VictimDisposition::Release;
        };
        if meta.tier != tier {
            return VictimDisposition::Release;
        }

        // Try the next-lower memory tier first (no nested eviction).
        if tier == Tier::Hot {
            if self.allocator.try_demote(owner, Tier::Warm).await.is_ok() {
                if self.move_frame(owner, Tier::Hot, Tier::Warm).await.is_ok() {
                    let _ = self.set_tier(owner, Tier::Warm, ContextState::Ready).await;
                    debug!(owner, "Eviction victim demoted hot -> warm");
                    return VictimDisposition::TookOwnership;
                }
            }
        }

        // Otherwise the frame on disk is the surviving copy.
        if self.move_frame(owner, tier, Tier::Cold).await.is_ok() {
            let _ = self.set_tier(owner, Tier::Cold, ContextState::Ready).await;
            debug!(owner, %tier, "Eviction victim settled to cold");
        }
        VictimDisposition::Release
    }
}

fn handle_of(meta: &ContextMeta) -> ContextHandle {
    ContextHandle {
        context_id: meta.context_id.clone(),
        model_id: meta.model_id.clone(),
        token_count: meta.token_count,
        tier: meta.tier,
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_mtime(path: &std::path::Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Unit tests for the manager live in tests/context_tests.rs where a full
// home layout and model manager are assembled; the pieces above are covered
// individually in their own modules.
