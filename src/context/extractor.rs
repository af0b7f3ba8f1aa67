//! KV extraction and injection.
//!
//! Extraction drives a prefill over the content in batches and captures the
//! engine's raw per-sequence state; injection restores that state into a
//! fresh sequence slot. The raw bytes are exactly what the KV codec wraps
//! with a frame header.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{EngineContext, InferenceEngine, SeqId};
use crate::error::{SnapError, SnapResult};

/// Timings for the extract path, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractTimings {
    pub tokenize_ms: u64,
    pub prefill_ms: u64,
    pub extract_ms: u64,
}

/// Result of a successful extraction.
#[derive(Debug)]
pub struct ExtractOutput {
    /// The engine's raw serialized sequence state.
    pub payload: Vec<u8>,
    pub token_count: u32,
    pub timings: ExtractTimings,
}

/// Drives prefill/serialize and deserialize against an engine context.
pub struct KvExtractor {
    batch_size: usize,
}

impl KvExtractor {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Prefill `content` into `seq_id` and capture the serialized state.
    ///
    /// Cancellation is honored at batch boundaries: the slot is cleared and
    /// `cancelled` returned, leaving the context reusable.
    pub async fn extract(
        &self,
        engine: &dyn InferenceEngine,
        ctx: &mut dyn EngineContext,
        seq_id: SeqId,
        content: &str,
        cancel: &CancellationToken,
    ) -> SnapResult<ExtractOutput> {
        let t0 = Instant::now();
        let tokens = engine.tokenize(content, true)?;
        let tokenize_ms = t0.elapsed().as_millis() as u64;

        ctx.clear_sequence(seq_id);

        let t1 = Instant::now();
        for batch in tokens.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                ctx.clear_sequence(seq_id);
                debug!(seq_id, "Extraction cancelled mid-prefill");
                return Err(SnapError::Cancelled);
            }
            ctx.prefill(seq_id, batch).map_err(|e| {
                ctx.clear_sequence(seq_id);
                SnapError::from(e)
            })?;
            // Let cancellation and peers make progress between batches.
            tokio::task::yield_now().await;
        }
        let prefill_ms = t1.elapsed().as_millis() as u64;

        let t2 = Instant::now();
        let expected = ctx.sequence_state_size(seq_id);
        let payload = ctx.serialize_sequence(seq_id)?;
        if payload.len() != expected {
            warn!(
                seq_id,
                expected,
                actual = payload.len(),
                "Engine reported state size disagrees with serialization"
            );
        }
        let extract_ms = t2.elapsed().as_millis() as u64;

        debug!(
            seq_id,
            tokens = tokens.len(),
            bytes = payload.len(),
            tokenize_ms,
            prefill_ms,
            extract_ms,
            "KV state extracted"
        );

        Ok(ExtractOutput {
            payload,
            token_count: tokens.len() as u32,
            timings: ExtractTimings {
                tokenize_ms,
                prefill_ms,
                extract_ms,
            },
        })
    }

    /// Restore a serialized state into `seq_id`. On failure the slot is left
    /// cleared.
    pub fn inject(
        &self,
        ctx: &mut dyn EngineContext,
        seq_id: SeqId,
        payload: &[u8],
    ) -> SnapResult<u32> {
        ctx.clear_sequence(seq_id);
        ctx.deserialize_sequence(seq_id, payload)
            .map_err(SnapError::from)?;
        Ok(ctx.sequence_len(seq_id) as u32)
    }

    /// Concatenate a serialized state onto the end of `seq_id`. Returns the
    /// number of tokens appended; on failure the slot keeps its prior state.
    pub fn append(
        &self,
        ctx: &mut dyn EngineContext,
        seq_id: SeqId,
        payload: &[u8],
    ) -> SnapResult<u32> {
        let before = ctx.sequence_len(seq_id);
        ctx.append_sequence(seq_id, payload)
            .map_err(SnapError::from)?;
        Ok((ctx.sequence_len(seq_id) - before) as u32)
    }
}
