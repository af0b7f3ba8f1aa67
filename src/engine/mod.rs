//! The inference-engine capability surface the core consumes.
//!
//! The core never links an engine directly; it drives whatever implements
//! these traits: tokenize, prefill, decode, sample, and per-sequence state
//! serialization. A deterministic in-process engine lives in [`stub`] for
//! tests and CPU-only operation.

mod stub;

pub use stub::{StubEngine, StubEngineFactory};

use std::sync::Arc;

use thiserror::Error;

use crate::dequant::{DequantizedModel, ModelShape};

/// Token identifier.
pub type TokenId = i32;

/// Per-request sequence slot inside an engine context.
pub type SeqId = u64;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Sequence state invalid: {0}")]
    BadSequenceState(String),

    #[error("Engine binding failed: {0}")]
    BindFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),
}

/// Engine context creation parameters.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            n_ctx: 32768,
            n_batch: 512,
        }
    }
}

/// Sampling parameters for the decode loop.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// 0.0 = greedy.
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub max_tokens: usize,
    pub stop_tokens: Vec<TokenId>,
    /// Seed for deterministic sampling.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 512,
            stop_tokens: Vec::new(),
            seed: 42,
        }
    }
}

/// A bound model: tokenizer plus shape, shared across contexts.
pub trait InferenceEngine: Send + Sync {
    /// Tokenize text, inserting BOS per the model's tokenizer policy.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Decode token ids back to text.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError>;

    /// The model's shape descriptor.
    fn shape(&self) -> &ModelShape;

    /// Create a new engine context with its own KV state.
    fn new_context(&self, params: &EngineParams) -> Result<Box<dyn EngineContext>, EngineError>;

    /// Apply sampling parameters to logits and pick the next token.
    fn sample(&self, logits: &[f32], config: &SamplerConfig, history: &[TokenId]) -> TokenId;
}

/// A single engine context holding KV state for one or more sequence slots.
///
/// Logically single-threaded: callers serialize access per context.
pub trait EngineContext: Send {
    /// Process a batch of prompt tokens, appending K/V into the slot.
    fn prefill(&mut self, seq_id: SeqId, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Decode one token and return logits over the vocabulary.
    fn decode_step(&mut self, seq_id: SeqId, token: TokenId) -> Result<Vec<f32>, EngineError>;

    /// Drop all KV state for a sequence slot.
    fn clear_sequence(&mut self, seq_id: SeqId);

    /// Size in bytes of the serialized state for a slot.
    fn sequence_state_size(&self, seq_id: SeqId) -> usize;

    /// Serialize a slot's KV state to bytes.
    fn serialize_sequence(&self, seq_id: SeqId) -> Result<Vec<u8>, EngineError>;

    /// Restore a slot's KV state from bytes. On failure the slot is left
    /// cleared.
    fn deserialize_sequence(&mut self, seq_id: SeqId, bytes: &[u8]) -> Result<(), EngineError>;

    /// Concatenate a serialized KV state onto the end of a slot (sequence
    /// axis). A slot that does not exist yet is created; on failure the
    /// slot keeps its prior state.
    fn append_sequence(&mut self, seq_id: SeqId, bytes: &[u8]) -> Result<(), EngineError>;

    /// Number of tokens currently held in a slot.
    fn sequence_len(&self, seq_id: SeqId) -> usize;
}

/// Builds an engine from a dequantized workspace (zero-copy tensor binding).
pub trait EngineFactory: Send + Sync {
    fn bind(
        &self,
        model: &DequantizedModel,
        params: &EngineParams,
    ) -> Result<Arc<dyn InferenceEngine>, EngineError>;
}
