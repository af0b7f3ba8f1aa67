//! Allocator invariants exercised through the public surface: accounting,
//! eviction, fallback placement, and byte-preserving tier moves.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use snapllm_core::alloc::{
    EvictionSubscriber, Tier, TieredAllocator, VictimDisposition,
};
use snapllm_core::config::{EvictionPolicyKind, TierConfig};

fn config(hot: usize, warm: usize, cold: usize) -> TierConfig {
    TierConfig {
        hot_capacity: hot,
        warm_capacity: warm,
        cold_capacity: cold,
        eviction_policy: EvictionPolicyKind::Lru,
        eviction_target_utilization: 0.8,
    }
}

#[tokio::test]
async fn test_used_tracks_block_sizes_exactly() {
    let alloc = TieredAllocator::new(&config(10_000, 10_000, 10_000));

    let mut total = 0usize;
    let mut blocks = Vec::new();
    for (i, size) in [100usize, 250, 4096, 1].iter().enumerate() {
        let block = alloc
            .allocate(*size, Tier::Warm, &format!("owner-{i}"))
            .await
            .unwrap();
        total += size;
        blocks.push(block);
    }

    assert_eq!(alloc.used(Tier::Warm), total);
    assert!(alloc.used(Tier::Warm) <= alloc.capacity(Tier::Warm));
    assert_eq!(alloc.stats(Tier::Warm).block_count, 4);

    for block in blocks {
        alloc.deallocate(block.id);
    }
    assert_eq!(alloc.used(Tier::Warm), 0);
    assert_eq!(alloc.stats(Tier::Warm).block_count, 0);
}

#[tokio::test]
async fn test_full_tier_falls_through_then_fails() {
    let alloc = TieredAllocator::new(&config(1000, 1000, 10_000));

    // Fits nowhere: even the slowest tier rejects it.
    let err = alloc.allocate(50_000, Tier::Hot, "big").await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("cold"), "error should name the last tier tried: {msg}");

    // Larger than both memory tiers: lands in cold after falling through.
    let block = alloc.allocate(1500, Tier::Hot, "c").await.unwrap();
    assert_eq!(block.tier, Tier::Cold);
}

#[tokio::test]
async fn test_promotion_preserves_bytes() {
    let tmp = TempDir::new().unwrap();
    let alloc = TieredAllocator::new(&config(10_000, 10_000, 10_000));

    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let spill = tmp.path().join("x.kvc");
    std::fs::write(&spill, &payload).unwrap();

    // Start cold, walk it up to hot, reading at every step.
    let block = alloc
        .allocate(payload.len(), Tier::Cold, "x")
        .await
        .unwrap();
    assert_eq!(block.tier, Tier::Cold);
    alloc.set_spill_path("x", spill);

    assert_eq!(alloc.read_owner("x").await.unwrap().as_ref(), &payload[..]);

    alloc.promote("x", Tier::Warm).await.unwrap();
    assert_eq!(alloc.get_tier("x"), Some(Tier::Warm));
    assert_eq!(alloc.read_owner("x").await.unwrap().as_ref(), &payload[..]);

    alloc.promote("x", Tier::Hot).await.unwrap();
    assert_eq!(alloc.get_tier("x"), Some(Tier::Hot));
    assert_eq!(alloc.read_owner("x").await.unwrap().as_ref(), &payload[..]);

    // And back down.
    alloc.demote("x", Tier::Warm).await.unwrap();
    assert_eq!(alloc.read_owner("x").await.unwrap().as_ref(), &payload[..]);
}

#[tokio::test]
async fn test_failed_promote_leaves_tier_unchanged() {
    let alloc = TieredAllocator::new(&config(100, 10_000, 10_000));

    let block = alloc.allocate(500, Tier::Warm, "big").await.unwrap();
    alloc
        .write_block(block.id, Bytes::from(vec![1u8; 500]))
        .unwrap();

    // Hot can never hold 500 bytes.
    let err = alloc.promote("big", Tier::Hot).await.unwrap_err();
    assert!(err.to_string().contains("Out of space"));
    assert_eq!(alloc.get_tier("big"), Some(Tier::Warm));
    assert_eq!(alloc.used(Tier::Warm), 500);
    assert_eq!(alloc.used(Tier::Hot), 0);
}

struct TakeoverSubscriber {
    alloc: std::sync::Weak<TieredAllocator>,
}

#[async_trait::async_trait]
impl EvictionSubscriber for TakeoverSubscriber {
    async fn on_evict(&self, owner: &str, tier: Tier, _size: usize) -> VictimDisposition {
        // Re-home the victim one tier down before the allocator frees it.
        if tier == Tier::Hot {
            if let Some(alloc) = self.alloc.upgrade() {
                if alloc.try_demote(owner, Tier::Warm).await.is_ok() {
                    return VictimDisposition::TookOwnership;
                }
            }
        }
        VictimDisposition::Release
    }
}

#[tokio::test]
async fn test_subscriber_takeover_saves_victim() {
    let alloc = Arc::new(TieredAllocator::new(&config(1000, 10_000, 10_000)));
    let subscriber = Arc::new(TakeoverSubscriber {
        alloc: Arc::downgrade(&alloc),
    });
    alloc.subscribe(
        Arc::downgrade(&subscriber) as std::sync::Weak<dyn EvictionSubscriber>
    );

    let victim = alloc.allocate(600, Tier::Hot, "victim").await.unwrap();
    alloc
        .write_block(victim.id, Bytes::from(vec![9u8; 600]))
        .unwrap();

    // Pressure hot: the subscriber demotes the victim instead of losing it.
    alloc.allocate(600, Tier::Hot, "pusher").await.unwrap();

    assert_eq!(alloc.get_tier("victim"), Some(Tier::Warm));
    assert_eq!(
        alloc.read_owner("victim").await.unwrap().as_ref(),
        &[9u8; 600][..]
    );
}

#[tokio::test]
async fn test_record_access_steers_lru() {
    let alloc = TieredAllocator::new(&config(1000, 10_000, 10_000));

    alloc.allocate(400, Tier::Hot, "first").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    alloc.allocate(400, Tier::Hot, "second").await.unwrap();

    // Touch "first" so "second" becomes the LRU victim.
    alloc.record_access("first");
    alloc.allocate(400, Tier::Hot, "third").await.unwrap();

    assert_eq!(alloc.get_tier("first"), Some(Tier::Hot));
    assert!(alloc.get_tier("second").is_none());
}

#[tokio::test]
async fn test_deallocate_owner_releases_all() {
    let alloc = TieredAllocator::new(&config(10_000, 10_000, 10_000));

    alloc.allocate(100, Tier::Hot, "multi").await.unwrap();
    alloc.allocate(200, Tier::Warm, "multi").await.unwrap();

    alloc.deallocate_owner("multi");
    assert_eq!(alloc.used(Tier::Hot), 0);
    assert_eq!(alloc.used(Tier::Warm), 0);
    assert!(alloc.get_tier("multi").is_none());
}
