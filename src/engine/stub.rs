//! Deterministic in-process engine.
//!
//! Stands in for a real transformer backend: tokenization is content-hash
//! based (roughly one token per four characters), logits are a pure function
//! of the sequence state, and per-sequence state serializes to a stable
//! little-endian layout. Restoring serialized state reproduces the exact
//! next-token logits, which is what the KV-cache round-trip tests rely on.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dequant::{DequantizedModel, ModelShape};

use super::{
    EngineContext, EngineError, EngineFactory, EngineParams, InferenceEngine, SamplerConfig,
    SeqId, TokenId,
};

const STATE_MAGIC: [u8; 4] = *b"SSEQ";

/// Stub vocabulary size when the model does not declare one.
const FALLBACK_VOCAB: u32 = 256;

fn hash_of(data: impl Hash) -> u64 {
    let mut h = DefaultHasher::new();
    data.hash(&mut h);
    h.finish()
}

/// The stub engine: one per bound model.
pub struct StubEngine {
    shape: ModelShape,
    vocab_size: u32,
    /// Counts prefill batches across all contexts, observable by tests.
    prefill_calls: Arc<AtomicU64>,
}

impl StubEngine {
    pub fn new(shape: ModelShape) -> Self {
        let vocab_size = if shape.vocab_size == 0 {
            FALLBACK_VOCAB
        } else {
            shape.vocab_size.min(4096)
        };
        Self {
            shape,
            vocab_size,
            prefill_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of prefill batches processed so far.
    pub fn prefill_count(&self) -> u64 {
        self.prefill_calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for StubEngine {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let bytes = text.as_bytes();
        let n_tokens = bytes.len().div_ceil(4).max(1);
        let mut tokens = Vec::with_capacity(n_tokens + 1);
        if add_bos {
            tokens.push(1);
        }
        for chunk in bytes.chunks(4) {
            // Reserve 0..2 for special tokens.
            let id = 2 + (hash_of(chunk) % (self.vocab_size as u64 - 2)) as TokenId;
            tokens.push(id);
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        Ok(tokens
            .iter()
            .map(|t| format!("w{t}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn shape(&self) -> &ModelShape {
        &self.shape
    }

    fn new_context(&self, params: &EngineParams) -> Result<Box<dyn EngineContext>, EngineError> {
        Ok(Box::new(StubContext {
            n_ctx: params.n_ctx as usize,
            vocab_size: self.vocab_size,
            sequences: HashMap::new(),
            prefill_calls: self.prefill_calls.clone(),
        }))
    }

    fn sample(&self, logits: &[f32], config: &SamplerConfig, history: &[TokenId]) -> TokenId {
        sample_logits(logits, config, history)
    }
}

/// One stub engine context: a map of sequence slots to token state.
pub(crate) struct StubContext {
    n_ctx: usize,
    vocab_size: u32,
    sequences: HashMap<SeqId, Vec<TokenId>>,
    prefill_calls: Arc<AtomicU64>,
}

impl StubContext {
    fn logits_for(&self, state: &[TokenId]) -> Vec<f32> {
        // Logits are a pure function of the slot contents: the same state
        // always yields bit-identical logits.
        let seed = hash_of(state);
        let mut x = seed | 1;
        (0..self.vocab_size)
            .map(|_| {
                // xorshift64
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                ((x >> 11) as f64 / (1u64 << 53) as f64) as f32
            })
            .collect()
    }
}

impl EngineContext for StubContext {
    fn prefill(&mut self, seq_id: SeqId, tokens: &[TokenId]) -> Result<(), EngineError> {
        let state = self.sequences.entry(seq_id).or_default();
        if state.len() + tokens.len() > self.n_ctx {
            return Err(EngineError::DecodeFailed(format!(
                "sequence {seq_id} would exceed n_ctx {}",
                self.n_ctx
            )));
        }
        state.extend_from_slice(tokens);
        self.prefill_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn decode_step(&mut self, seq_id: SeqId, token: TokenId) -> Result<Vec<f32>, EngineError> {
        let state = self.sequences.entry(seq_id).or_default();
        if state.len() + 1 > self.n_ctx {
            return Err(EngineError::DecodeFailed(format!(
                "sequence {seq_id} is full"
            )));
        }
        state.push(token);
        let logits = self.logits_for(self.sequences.get(&seq_id).unwrap());
        Ok(logits)
    }

    fn clear_sequence(&mut self, seq_id: SeqId) {
        self.sequences.remove(&seq_id);
    }

    fn sequence_state_size(&self, seq_id: SeqId) -> usize {
        let len = self.sequences.get(&seq_id).map(|s| s.len()).unwrap_or(0);
        STATE_MAGIC.len() + 4 + len * 4
    }

    fn serialize_sequence(&self, seq_id: SeqId) -> Result<Vec<u8>, EngineError> {
        let state = self
            .sequences
            .get(&seq_id)
            .ok_or_else(|| EngineError::BadSequenceState(format!("empty slot {seq_id}")))?;
        let mut out = Vec::with_capacity(self.sequence_state_size(seq_id));
        out.extend_from_slice(&STATE_MAGIC);
        out.extend_from_slice(&(state.len() as u32).to_le_bytes());
        for t in state {
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn deserialize_sequence(&mut self, seq_id: SeqId, bytes: &[u8]) -> Result<(), EngineError> {
        self.sequences.remove(&seq_id);
        match parse_state(bytes) {
            Some(tokens) => {
                self.sequences.insert(seq_id, tokens);
                Ok(())
            }
            // The slot stays cleared on failure.
            None => Err(EngineError::BadSequenceState(
                "malformed sequence state".into(),
            )),
        }
    }

    fn append_sequence(&mut self, seq_id: SeqId, bytes: &[u8]) -> Result<(), EngineError> {
        let tokens = parse_state(bytes).ok_or_else(|| {
            EngineError::BadSequenceState("malformed sequence state".into())
        })?;
        let state = self.sequences.entry(seq_id).or_default();
        if state.len() + tokens.len() > self.n_ctx {
            return Err(EngineError::DecodeFailed(format!(
                "sequence {seq_id} would exceed n_ctx {}",
                self.n_ctx
            )));
        }
        state.extend_from_slice(&tokens);
        Ok(())
    }

    fn sequence_len(&self, seq_id: SeqId) -> usize {
        self.sequences.get(&seq_id).map(|s| s.len()).unwrap_or(0)
    }
}

/// Decode the serialized slot layout; None on any malformation.
fn parse_state(bytes: &[u8]) -> Option<Vec<TokenId>> {
    if bytes.len() < 8 || bytes[..4] != STATE_MAGIC {
        return None;
    }
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if bytes.len() != 8 + count * 4 {
        return None;
    }
    let mut tokens = Vec::with_capacity(count);
    for chunk in bytes[8..].chunks_exact(4) {
        tokens.push(TokenId::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3],
        ]));
    }
    Some(tokens)
}

/// Deterministic sampling over logits.
fn sample_logits(logits: &[f32], config: &SamplerConfig, history: &[TokenId]) -> TokenId {
    let mut scored: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();

    // Repeat penalty over the recent history.
    if config.repeat_penalty > 1.0 {
        for &t in history.iter().rev().take(64) {
            if let Some(entry) = scored.get_mut(t as usize) {
                entry.1 /= config.repeat_penalty;
            }
        }
    }

    if config.temperature <= 0.0 {
        return scored
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| *i as TokenId)
            .unwrap_or(0);
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if config.top_k > 0 {
        scored.truncate(config.top_k);
    }

    // Softmax with temperature, then nucleus cut.
    let max_logit = scored.first().map(|(_, v)| *v).unwrap_or(0.0);
    let mut weights: Vec<f64> = scored
        .iter()
        .map(|(_, v)| (((v - max_logit) / config.temperature) as f64).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        for w in &mut weights {
            *w /= total;
        }
    }
    if config.top_p < 1.0 {
        let mut cum = 0.0;
        let mut cut = weights.len();
        for (i, w) in weights.iter().enumerate() {
            cum += w;
            if cum >= config.top_p as f64 {
                cut = i + 1;
                break;
            }
        }
        scored.truncate(cut);
        weights.truncate(cut);
    }

    // Deterministic draw: seed mixed with the logits so the same state and
    // seed always pick the same token.
    let mix = hash_of((config.seed, history.len(), scored.first().map(|(i, _)| *i)));
    let mut x = mix | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let draw = (x >> 11) as f64 / (1u64 << 53) as f64;

    let total: f64 = weights.iter().sum();
    let mut cum = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cum += w / total.max(f64::MIN_POSITIVE);
        if draw <= cum {
            return scored[i].0 as TokenId;
        }
    }
    scored.last().map(|(i, _)| *i as TokenId).unwrap_or(0)
}

/// Binds stub engines to dequantized workspaces.
pub struct StubEngineFactory {
    /// Engines handed out, for test introspection.
    bound: Mutex<Vec<Arc<StubEngine>>>,
}

impl StubEngineFactory {
    pub fn new() -> Self {
        Self {
            bound: Mutex::new(Vec::new()),
        }
    }

    /// The most recently bound engine, if any.
    pub fn last_bound(&self) -> Option<Arc<StubEngine>> {
        self.bound.lock().unwrap().last().cloned()
    }
}

impl Default for StubEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for StubEngineFactory {
    fn bind(
        &self,
        model: &DequantizedModel,
        _params: &EngineParams,
    ) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        let engine = Arc::new(StubEngine::new(model.shape.clone()));
        self.bound.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}
