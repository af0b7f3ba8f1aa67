//! Shared helpers for the integration tests: a minimal GGUF writer and a
//! fully assembled core over a scratch home directory.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use snapllm_core::config::SnapConfig;
use snapllm_core::engine::StubEngineFactory;
use snapllm_core::SnapCore;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";
const ALIGNMENT: u64 = 32;

const T_U32: u32 = 4;
const T_STRING: u32 = 8;

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Write a tiny, valid GGUF v3 model file with one float32 tensor.
pub fn write_tiny_gguf(path: &Path, n_layers: u32, seed: u32) {
    let mut kvs = Vec::new();
    let mut kv_count = 0u64;

    push_string(&mut kvs, "general.architecture");
    kvs.extend_from_slice(&T_STRING.to_le_bytes());
    push_string(&mut kvs, "llama");
    kv_count += 1;

    let u32_kvs: [(&str, u32); 6] = [
        ("llama.block_count", n_layers),
        ("llama.attention.head_count", 4),
        ("llama.attention.head_count_kv", 2),
        ("llama.embedding_length", 64),
        ("llama.context_length", 4096),
        ("llama.vocab_size", 128),
    ];
    for (key, value) in u32_kvs {
        push_string(&mut kvs, key);
        kvs.extend_from_slice(&T_U32.to_le_bytes());
        kvs.extend_from_slice(&value.to_le_bytes());
        kv_count += 1;
    }

    let weights: Vec<u8> = (0..64u32)
        .flat_map(|i| ((i ^ seed) as f32).to_le_bytes())
        .collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(&GGUF_MAGIC);
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&1u64.to_le_bytes()); // tensor count
    buf.extend_from_slice(&kv_count.to_le_bytes());
    buf.extend_from_slice(&kvs);

    // Tensor table: one entry.
    push_string(&mut buf, "tok.weight");
    buf.extend_from_slice(&1u32.to_le_bytes()); // n_dims
    buf.extend_from_slice(&64u64.to_le_bytes()); // dim
    buf.extend_from_slice(&0u32.to_le_bytes()); // dtype F32
    buf.extend_from_slice(&0u64.to_le_bytes()); // data offset

    while buf.len() as u64 % ALIGNMENT != 0 {
        buf.push(0);
    }
    buf.extend_from_slice(&weights);

    std::fs::write(path, buf).unwrap();
}

/// A test configuration with small tier budgets and compression on.
pub fn small_config() -> SnapConfig {
    let mut config = SnapConfig::default();
    config.tiers.hot_capacity = 64 * 1024;
    config.tiers.warm_capacity = 256 * 1024;
    config.tiers.cold_capacity = 16 * 1024 * 1024;
    config.workspace.overhead_factor = 4.0;
    config
}

/// Assemble a core over `home` with the stub engine.
pub async fn open_core(home: &Path, config: SnapConfig) -> (SnapCore, Arc<StubEngineFactory>) {
    let factory = Arc::new(StubEngineFactory::new());
    let core = SnapCore::open(home, config, factory.clone()).await.unwrap();
    (core, factory)
}
