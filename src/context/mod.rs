//! Context management: the L2 resource layer over cached KV artifacts.
//!
//! A context is one ingested document/prompt whose KV state has been
//! extracted, framed, and placed in a tier. The manager owns the set of
//! contexts; the extractor drives the engine on ingest and query paths.

mod extractor;
mod manager;

pub use extractor::{ExtractOutput, ExtractTimings, KvExtractor};
pub use manager::{ContextManager, ContextStats, IngestOutcome};

use serde::{Deserialize, Serialize};

use crate::alloc::Tier;
use crate::dequant::ModelShape;
use crate::engine::TokenId;

/// Lifecycle state of a context.
///
/// `Ingesting` and `Loading` are exclusive: at most one such transition is
/// in flight for a given context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Ingesting,
    Ready,
    Loading,
    Deleted,
}

/// The persisted per-context metadata record
/// (`contexts/metadata/<context_id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMeta {
    pub context_id: String,
    /// Display name; defaults to the context id.
    #[serde(default)]
    pub name: String,
    pub model_id: String,
    pub model_fingerprint: String,
    pub content_hash: String,
    pub shape: ModelShape,
    pub token_count: u32,
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub tier: Tier,
    /// On-disk frame size in bytes.
    pub storage_size: u64,
    pub compressed: bool,
    /// Seconds until expiry; 0 = no TTL.
    pub ttl_secs: u64,
    pub state: ContextState,
}

impl ContextMeta {
    /// Whether the TTL has elapsed at `now` (unix seconds).
    pub fn expired_at(&self, now: u64) -> bool {
        self.ttl_secs > 0 && now >= self.created_at + self.ttl_secs
    }
}

/// A caller-facing handle to an ingested context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle {
    pub context_id: String,
    pub model_id: String,
    pub token_count: u32,
    pub tier: Tier,
}

/// Options for ingest.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Preferred placement tier for the fresh artifact.
    pub preferred_tier: Tier,

    /// TTL override in seconds; None uses the configured default.
    pub ttl_secs: Option<u64>,

    /// Display name recorded in the registry.
    pub name: Option<String>,

    /// Wall-clock deadline; exceeding it removes any partial artifact.
    pub deadline: Option<std::time::Duration>,

    /// Cooperative cancellation; honored at prefill batch boundaries.
    pub cancel: tokio_util::sync::CancellationToken,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            preferred_tier: Tier::Hot,
            ttl_secs: None,
            name: None,
            deadline: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

/// Options for query.
#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    /// Sampling parameters for the generation loop.
    pub sampler: crate::engine::SamplerConfig,

    /// How `query_multi` combines several contexts in the decode slot.
    pub merge: MergeStrategy,

    /// Wall-clock deadline for the whole query.
    pub deadline: Option<std::time::Duration>,

    /// Cooperative cancellation; honored at token boundaries.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Token accounting for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    /// Tokens restored from the cached context.
    pub context_tokens: u32,
    /// Tokens in the query text.
    pub query_tokens: u32,
    /// Tokens generated.
    pub generated_tokens: u32,
}

/// Result of a query over a cached context.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub response_text: String,
    pub usage: Usage,
    pub cache_hit: bool,
    pub latency_ms: u64,
    /// Tokens produced before a mid-stream failure, surfaced with the error
    /// by the manager when decode fails part-way.
    pub tokens: Vec<TokenId>,
}

/// How `query_multi` combines several injected contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Concatenate contexts in the order given.
    #[default]
    Concatenate,
}
