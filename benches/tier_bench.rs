//! Benchmarks for the hot paths: allocator placement, tier relocation, and
//! frame encode/decode with and without compression.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytes::Bytes;
use snapllm_core::alloc::{Tier, TieredAllocator};
use snapllm_core::config::{EvictionPolicyKind, TierConfig};
use snapllm_core::kv::{KvDtype, KvFrame, Lz4Compressor, ZstdCompressor};

fn bench_allocate_deallocate(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let config = TierConfig {
        hot_capacity: 1 << 30,
        warm_capacity: 1 << 30,
        cold_capacity: 1 << 30,
        eviction_policy: EvictionPolicyKind::Lru,
        eviction_target_utilization: 0.8,
    };

    c.bench_function("allocate_deallocate_64k", |b| {
        let alloc = TieredAllocator::new(&config);
        b.iter(|| {
            rt.block_on(async {
                let block = alloc
                    .allocate(black_box(64 * 1024), Tier::Hot, "bench")
                    .await
                    .unwrap();
                alloc.deallocate(block.id);
            })
        })
    });
}

fn bench_promote_demote(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let config = TierConfig {
        hot_capacity: 1 << 30,
        warm_capacity: 1 << 30,
        cold_capacity: 1 << 30,
        eviction_policy: EvictionPolicyKind::Lru,
        eviction_target_utilization: 0.8,
    };

    c.bench_function("promote_demote_1m", |b| {
        let alloc = TieredAllocator::new(&config);
        let block = rt
            .block_on(alloc.allocate(1 << 20, Tier::Warm, "bench"))
            .unwrap();
        alloc
            .write_block(block.id, Bytes::from(vec![7u8; 1 << 20]))
            .unwrap();
        b.iter(|| {
            rt.block_on(async {
                alloc.promote("bench", Tier::Hot).await.unwrap();
                alloc.demote("bench", Tier::Warm).await.unwrap();
            })
        })
    });
}

fn frame_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 13) as u8).collect()
}

fn bench_frame_codec(c: &mut Criterion) {
    let payload = frame_payload(4 << 20);

    c.bench_function("frame_encode_4m_raw", |b| {
        b.iter(|| {
            KvFrame::encode(
                "bench", "fp", 0, 32, 8, 128, 4096,
                KvDtype::Fp16,
                black_box(&payload),
                None,
            )
            .unwrap()
        })
    });

    c.bench_function("frame_encode_4m_lz4", |b| {
        b.iter(|| {
            KvFrame::encode(
                "bench", "fp", 0, 32, 8, 128, 4096,
                KvDtype::Fp16,
                black_box(&payload),
                Some(&Lz4Compressor),
            )
            .unwrap()
        })
    });

    c.bench_function("frame_encode_4m_zstd", |b| {
        let zstd = ZstdCompressor::new(3);
        b.iter(|| {
            KvFrame::encode(
                "bench", "fp", 0, 32, 8, 128, 4096,
                KvDtype::Fp16,
                black_box(&payload),
                Some(&zstd),
            )
            .unwrap()
        })
    });

    let encoded = KvFrame::encode(
        "bench", "fp", 0, 32, 8, 128, 4096,
        KvDtype::Fp16,
        &payload,
        Some(&Lz4Compressor),
    )
    .unwrap();
    c.bench_function("frame_decode_4m_lz4", |b| {
        b.iter(|| KvFrame::decode(black_box(&encoded)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_allocate_deallocate,
    bench_promote_demote,
    bench_frame_codec
);
criterion_main!(benches);
