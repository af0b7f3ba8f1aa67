//! Integration tests for the context manager: ingest dedup, concurrent
//! coalescing, query behavior, cross-model rejection, and cancellation.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use snapllm_core::alloc::Tier;
use snapllm_core::context::{IngestOptions, QueryConfig};
use snapllm_core::engine::SamplerConfig;

use common::{open_core, small_config, write_tiny_gguf};

const DOC: &str = "The tiered cache keeps prefill work around so follow-up \
    questions over the same document cost only the query tokens.";

#[tokio::test]
async fn test_ingest_then_query_hits_cache() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let out = core
        .contexts
        .ingest("m", DOC, IngestOptions::default())
        .await
        .unwrap();
    assert!(!out.deduplicated);
    assert!(out.handle.token_count > 0);

    let config = QueryConfig {
        sampler: SamplerConfig {
            max_tokens: 8,
            ..SamplerConfig::default()
        },
        ..QueryConfig::default()
    };
    let response = core
        .contexts
        .query(&out.handle.context_id, "what does the cache do?", &config)
        .await
        .unwrap();

    assert!(response.cache_hit);
    assert_eq!(response.usage.context_tokens, out.handle.token_count);
    assert!(response.usage.query_tokens > 0);
    assert!(response.usage.generated_tokens > 0);
    assert!(!response.response_text.is_empty());
}

#[tokio::test]
async fn test_second_ingest_deduplicates() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let first = core
        .contexts
        .ingest("m", DOC, IngestOptions::default())
        .await
        .unwrap();
    let second = core
        .contexts
        .ingest("m", DOC, IngestOptions::default())
        .await
        .unwrap();

    assert!(second.deduplicated);
    assert_eq!(first.handle.context_id, second.handle.context_id);

    let stats = core.contexts.stats().await;
    assert_eq!(stats.ingests, 1);
    assert_eq!(stats.dedup_hits, 1);
}

#[tokio::test]
async fn test_concurrent_dedup_runs_one_prefill() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, factory) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();
    let engine = factory.last_bound().unwrap();
    let baseline = engine.prefill_count();

    let contexts = core.contexts.clone();
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let contexts = contexts.clone();
            tokio::spawn(async move {
                contexts
                    .find_or_create("m", DOC, IngestOptions::default())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        let out = task.await.unwrap();
        ids.insert(out.handle.context_id);
    }

    // All sixteen callers got the same handle.
    assert_eq!(ids.len(), 1);
    // Exactly one extraction ran: one batch's worth of prefill calls, not 16.
    let batches = DOC.len().div_ceil(4).div_ceil(512) as u64 + 1;
    assert!(engine.prefill_count() - baseline <= batches);
    assert_eq!(core.contexts.stats().await.ingests, 1);
}

#[tokio::test]
async fn test_cross_model_injection_rejected() {
    let tmp = TempDir::new().unwrap();
    let path_a = tmp.path().join("a.gguf");
    let path_b = tmp.path().join("b.gguf");
    write_tiny_gguf(&path_a, 4, 1);
    write_tiny_gguf(&path_b, 4, 2); // same shape, different content fingerprint

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("a", &path_a).await.unwrap();
    core.models.load("b", &path_b).await.unwrap();

    let out = core
        .contexts
        .ingest("a", DOC, IngestOptions::default())
        .await
        .unwrap();

    // Smuggle the artifact under model b by rewriting its metadata record.
    let meta_path = tmp
        .path()
        .join("contexts/metadata")
        .join(format!("{}.json", out.handle.context_id));
    let mut meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
    meta["model_id"] = serde_json::Value::String("b".into());
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

    // Reopen so the smuggled record is what the manager sees.
    drop(core);
    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("a", &path_a).await.unwrap();
    core.models.load("b", &path_b).await.unwrap();

    let err = core
        .contexts
        .query(&out.handle.context_id, "q", &QueryConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "incompatible_shape");
}

#[tokio::test]
async fn test_cancelled_ingest_leaves_nothing() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let opts = IngestOptions::default();
    opts.cancel.cancel();
    let err = core.contexts.ingest("m", DOC, opts).await.unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    // No frame, no metadata, no index entry.
    assert_eq!(core.contexts.stats().await.contexts, 0);
    assert!(core.registry.is_empty());
    for tier in Tier::ALL {
        let dir = tmp.path().join("contexts").join(tier.dir_name());
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    // Re-issuing the same call succeeds.
    core.contexts
        .ingest("m", DOC, IngestOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_unknown_is_noop() {
    let tmp = TempDir::new().unwrap();
    let (core, _) = open_core(tmp.path(), small_config()).await;
    assert!(!core.contexts.delete("no-such-context").await.unwrap());
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let out = core
        .contexts
        .ingest("m", DOC, IngestOptions::default())
        .await
        .unwrap();
    let id = out.handle.context_id.clone();

    assert!(core.contexts.delete(&id).await.unwrap());
    assert!(core.contexts.get(&id).await.is_none());
    assert!(core.registry.lookup_hash("m", &snapllm_core::context::ContextManager::content_hash(DOC)).is_none());

    let err = core
        .contexts
        .query(&id, "q", &QueryConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_query_multi_feeds_all_contexts_into_generation() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let a = core
        .contexts
        .ingest("m", "first document body", IngestOptions::default())
        .await
        .unwrap();
    let b = core
        .contexts
        .ingest("m", "second document body", IngestOptions::default())
        .await
        .unwrap();

    // Greedy decoding: generation is a pure function of the slot contents.
    let config = QueryConfig {
        sampler: SamplerConfig {
            max_tokens: 8,
            temperature: 0.0,
            repeat_penalty: 1.0,
            ..SamplerConfig::default()
        },
        ..QueryConfig::default()
    };

    let single = core
        .contexts
        .query(&a.handle.context_id, "compare them", &config)
        .await
        .unwrap();
    let multi = core
        .contexts
        .query_multi(
            &[a.handle.context_id.clone(), b.handle.context_id.clone()],
            "compare them",
            &config,
        )
        .await
        .unwrap();

    // Both contexts are accounted for...
    assert_eq!(
        multi.usage.context_tokens,
        a.handle.token_count + b.handle.token_count
    );
    // ...and the second context's KV state is visible to the decode path:
    // the slot holding [a, b] generates differently than the slot with [a].
    assert_ne!(multi.tokens, single.tokens);

    // Degenerate multi over one handle matches the plain query exactly.
    let multi_one = core
        .contexts
        .query_multi(
            std::slice::from_ref(&a.handle.context_id),
            "compare them",
            &config,
        )
        .await
        .unwrap();
    assert_eq!(multi_one.tokens, single.tokens);
    assert_eq!(multi_one.usage.context_tokens, a.handle.token_count);
}

#[tokio::test]
async fn test_ttl_sweep_removes_expired() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let opts = IngestOptions {
        // Already expired relative to any positive clock.
        ttl_secs: Some(1),
        ..IngestOptions::default()
    };
    core.contexts.ingest("m", DOC, opts).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let removed = core.contexts.sweep_expired().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(core.contexts.stats().await.contexts, 0);
}

#[tokio::test]
async fn test_ingest_async_form() {
    let tmp = TempDir::new().unwrap();
    let model_path = tmp.path().join("m.gguf");
    write_tiny_gguf(&model_path, 4, 1);

    let (core, _) = open_core(tmp.path(), small_config()).await;
    core.models.load("m", &model_path).await.unwrap();

    let handle = Arc::clone(&core.contexts).ingest_async(
        "m".to_string(),
        DOC.to_string(),
        IngestOptions::default(),
    );
    let out = handle.await.unwrap().unwrap();
    assert!(out.handle.token_count > 0);
}
