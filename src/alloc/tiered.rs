//! The tiered allocator: owns three capacity-bounded pools and the block table.
//!
//! Hot and warm blocks are resident byte buffers; cold blocks are accounting
//! entries over a registered spill file. Allocation falls through to slower
//! tiers under pressure, eviction notifies subscribers before freeing, and
//! promotion/demotion commits bytes in the target tier before releasing the
//! source so a failed move leaves the block where it was.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TierConfig;

use super::policy::{BlockSample, EvictionPolicy};
use super::Tier;

/// Unique identifier for an allocated block.
pub type BlockId = u64;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Out of space in {tier}: {needed} bytes requested, {available} available")]
    OutOfSpace {
        tier: Tier,
        needed: usize,
        available: usize,
    },

    #[error("Copy failed moving {owner} from {from} to {to}: {reason}")]
    CopyFailed {
        owner: String,
        from: Tier,
        to: Tier,
        reason: String,
    },

    #[error("No block registered for owner {0}")]
    UnknownOwner(String),

    #[error("Invalid tier transition {from} -> {to}")]
    InvalidTransition { from: Tier, to: Tier },

    #[error("Owner {0} has no spill path registered for cold storage")]
    NoSpillPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A placed block, as handed back to callers.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub owner: String,
    pub tier: Tier,
    pub size: usize,
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub capacity: usize,
    pub used: usize,
    pub block_count: usize,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// What a pre-eviction subscriber did with the victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimDisposition {
    /// The subscriber has no claim; the allocator frees the bytes.
    Release,
    /// The subscriber preserved the bytes itself (persisted or re-homed);
    /// the allocator simply frees the range.
    TookOwnership,
}

/// Notified for each selected victim before its range is freed.
#[async_trait]
pub trait EvictionSubscriber: Send + Sync {
    async fn on_evict(&self, owner: &str, tier: Tier, size: usize) -> VictimDisposition;
}

#[derive(Debug)]
struct BlockInfo {
    id: BlockId,
    owner: String,
    tier: Tier,
    size: usize,
    spill_path: Option<PathBuf>,
    last_access: Instant,
    access_count: u64,
    insert_seq: u64,
}

#[derive(Default)]
struct BlockIndex {
    blocks: HashMap<BlockId, BlockInfo>,
    by_owner: HashMap<String, Vec<BlockId>>,
}

struct PoolState {
    capacity: usize,
    used: usize,
    block_count: usize,
    /// Resident bytes for memory tiers; always empty for the cold pool.
    resident: HashMap<BlockId, Bytes>,
}

impl PoolState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            block_count: 0,
            resident: HashMap::new(),
        }
    }

    fn try_reserve(&mut self, size: usize) -> bool {
        if self.used + size <= self.capacity {
            self.used += size;
            self.block_count += 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self, id: BlockId, size: usize) {
        self.used = self.used.saturating_sub(size);
        self.block_count = self.block_count.saturating_sub(1);
        self.resident.remove(&id);
    }
}

/// The tiered allocator.
pub struct TieredAllocator {
    pools: [Mutex<PoolState>; 3],
    index: Mutex<BlockIndex>,
    policy: EvictionPolicy,
    target_utilization: f64,
    subscribers: Mutex<Vec<Weak<dyn EvictionSubscriber>>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

impl TieredAllocator {
    pub fn new(config: &TierConfig) -> Self {
        Self {
            pools: [
                Mutex::new(PoolState::new(config.hot_capacity)),
                Mutex::new(PoolState::new(config.warm_capacity)),
                Mutex::new(PoolState::new(config.cold_capacity)),
            ],
            index: Mutex::new(BlockIndex::default()),
            policy: EvictionPolicy::new(config.eviction_policy),
            target_utilization: config.eviction_target_utilization,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    fn pool(&self, tier: Tier) -> &Mutex<PoolState> {
        &self.pools[tier.level() as usize]
    }

    /// Register a pre-eviction subscriber.
    ///
    /// Held weakly; a dropped subscriber is skipped.
    pub fn subscribe(&self, subscriber: Weak<dyn EvictionSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    /// Allocate `size` bytes for `owner`, trying `preferred_tier` first and
    /// falling through to slower tiers after one eviction pass each.
    pub async fn allocate(
        &self,
        size: usize,
        preferred_tier: Tier,
        owner: &str,
    ) -> Result<Block, AllocError> {
        let mut tier = preferred_tier;
        loop {
            if self.try_place(tier, size) {
                return Ok(self.register(owner, tier, size));
            }

            // One eviction pass toward target utilization, then retry.
            let freed = self.evict(size, tier).await;
            if freed > 0 && self.try_place(tier, size) {
                return Ok(self.register(owner, tier, size));
            }

            match tier.slower() {
                Some(next) => {
                    debug!(owner, %tier, %next, size, "Tier full, falling through");
                    tier = next;
                }
                None => {
                    let available = self.available(tier);
                    return Err(AllocError::OutOfSpace {
                        tier,
                        needed: size,
                        available,
                    });
                }
            }
        }
    }

    fn try_place(&self, tier: Tier, size: usize) -> bool {
        self.pool(tier).lock().unwrap().try_reserve(size)
    }

    fn register(&self, owner: &str, tier: Tier, size: usize) -> Block {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let info = BlockInfo {
            id,
            owner: owner.to_string(),
            tier,
            size,
            spill_path: None,
            last_access: Instant::now(),
            access_count: 0,
            insert_seq: seq,
        };

        let mut index = self.index.lock().unwrap();
        index.by_owner.entry(owner.to_string()).or_default().push(id);
        index.blocks.insert(id, info);

        debug!(owner, %tier, size, block_id = id, "Allocated block");
        Block {
            id,
            owner: owner.to_string(),
            tier,
            size,
        }
    }

    /// Store bytes into a memory-resident block.
    pub fn write_block(&self, block_id: BlockId, data: Bytes) -> Result<(), AllocError> {
        let (tier, owner, size) = {
            let index = self.index.lock().unwrap();
            let info = index
                .blocks
                .get(&block_id)
                .ok_or_else(|| AllocError::UnknownOwner(format!("block {block_id}")))?;
            (info.tier, info.owner.clone(), info.size)
        };

        if !tier.is_memory() {
            // Cold blocks live in their spill file; nothing resident to fill.
            return Ok(());
        }
        if data.len() > size {
            return Err(AllocError::CopyFailed {
                owner,
                from: tier,
                to: tier,
                reason: format!("payload {} exceeds reserved {}", data.len(), size),
            });
        }

        self.pool(tier).lock().unwrap().resident.insert(block_id, data);
        Ok(())
    }

    /// Read the bytes backing `owner`'s block, from pool memory or the
    /// registered spill file.
    pub async fn read_owner(&self, owner: &str) -> Result<Bytes, AllocError> {
        let (block_id, tier, spill) = {
            let index = self.index.lock().unwrap();
            let info = self.primary_block(&index, owner)?;
            (info.id, info.tier, info.spill_path.clone())
        };

        if tier.is_memory() {
            let pool = self.pool(tier).lock().unwrap();
            return pool
                .resident
                .get(&block_id)
                .cloned()
                .ok_or_else(|| AllocError::UnknownOwner(owner.to_string()));
        }

        let path = spill.ok_or_else(|| AllocError::NoSpillPath(owner.to_string()))?;
        let data = tokio::fs::read(&path).await?;
        Ok(Bytes::from(data))
    }

    fn primary_block<'a>(
        &self,
        index: &'a BlockIndex,
        owner: &str,
    ) -> Result<&'a BlockInfo, AllocError> {
        index
            .by_owner
            .get(owner)
            .and_then(|ids| ids.first())
            .and_then(|id| index.blocks.get(id))
            .ok_or_else(|| AllocError::UnknownOwner(owner.to_string()))
    }

    /// Register the on-disk file that backs this owner's bytes when cold.
    pub fn set_spill_path(&self, owner: &str, path: PathBuf) {
        let mut index = self.index.lock().unwrap();
        if let Some(ids) = index.by_owner.get(owner).cloned() {
            for id in ids {
                if let Some(info) = index.blocks.get_mut(&id) {
                    info.spill_path = Some(path.clone());
                }
            }
        }
    }

    /// Release one block.
    pub fn deallocate(&self, block_id: BlockId) {
        let mut index = self.index.lock().unwrap();
        if let Some(info) = index.blocks.remove(&block_id) {
            if let Some(ids) = index.by_owner.get_mut(&info.owner) {
                ids.retain(|id| *id != block_id);
                if ids.is_empty() {
                    index.by_owner.remove(&info.owner);
                }
            }
            self.pool(info.tier).lock().unwrap().release(block_id, info.size);
            debug!(owner = info.owner, tier = %info.tier, "Deallocated block");
        }
    }

    /// Release every block owned by `owner_id`.
    pub fn deallocate_owner(&self, owner: &str) {
        let ids = {
            let index = self.index.lock().unwrap();
            index.by_owner.get(owner).cloned().unwrap_or_default()
        };
        for id in ids {
            self.deallocate(id);
        }
    }

    /// Move `owner`'s bytes to a faster tier. The original placement is left
    /// intact on failure.
    pub async fn promote(&self, owner: &str, target: Tier) -> Result<(), AllocError> {
        self.relocate(owner, target, true, true).await
    }

    /// Move `owner`'s bytes to a slower tier. Demotion to cold requires a
    /// registered spill path; the bytes are dropped from memory and served
    /// from the file thereafter.
    pub async fn demote(&self, owner: &str, target: Tier) -> Result<(), AllocError> {
        self.relocate(owner, target, false, true).await
    }

    /// Demote without triggering eviction in the target tier. Used from
    /// pre-eviction callbacks, where a nested eviction round must not start.
    pub async fn try_demote(&self, owner: &str, target: Tier) -> Result<(), AllocError> {
        self.relocate(owner, target, false, false).await
    }

    async fn relocate(
        &self,
        owner: &str,
        target: Tier,
        upward: bool,
        evict_on_pressure: bool,
    ) -> Result<(), AllocError> {
        let (block_id, from, size, spill) = {
            let index = self.index.lock().unwrap();
            let info = self.primary_block(&index, owner)?;
            (info.id, info.tier, info.size, info.spill_path.clone())
        };

        if from == target {
            return Ok(());
        }
        let valid = if upward {
            target.level() < from.level()
        } else {
            target.level() > from.level()
        };
        if !valid {
            return Err(AllocError::InvalidTransition { from, to: target });
        }

        // Fetch the bytes before touching any accounting.
        let data = if from.is_memory() {
            if target.is_memory() {
                let pool = self.pool(from).lock().unwrap();
                Some(pool.resident.get(&block_id).cloned().ok_or_else(|| {
                    AllocError::CopyFailed {
                        owner: owner.to_string(),
                        from,
                        to: target,
                        reason: "source bytes not resident".into(),
                    }
                })?)
            } else {
                // Downward to cold: the spill file is the destination copy.
                if spill.is_none() {
                    return Err(AllocError::NoSpillPath(owner.to_string()));
                }
                None
            }
        } else {
            // Upward from cold: load the spill file.
            let path = spill.clone().ok_or_else(|| AllocError::NoSpillPath(owner.to_string()))?;
            let bytes = tokio::fs::read(&path).await.map_err(|e| AllocError::CopyFailed {
                owner: owner.to_string(),
                from,
                to: target,
                reason: e.to_string(),
            })?;
            Some(Bytes::from(bytes))
        };

        // Reserve in the target tier, evicting once if allowed.
        if !self.try_place(target, size) {
            if evict_on_pressure {
                self.evict(size, target).await;
            }
            if !self.try_place(target, size) {
                return Err(AllocError::OutOfSpace {
                    tier: target,
                    needed: size,
                    available: self.available(target),
                });
            }
        }

        // Commit: bytes present in the new tier before the old range is freed.
        if let Some(data) = data {
            if target.is_memory() {
                self.pool(target).lock().unwrap().resident.insert(block_id, data);
            }
        }

        {
            let mut index = self.index.lock().unwrap();
            match index.blocks.get_mut(&block_id) {
                Some(info) => info.tier = target,
                None => {
                    // Deallocated concurrently; roll back the reservation.
                    self.pool(target).lock().unwrap().release(block_id, size);
                    return Err(AllocError::UnknownOwner(owner.to_string()));
                }
            }
        }
        self.pool(from).lock().unwrap().release(block_id, size);

        info!(owner, %from, %target, size, "Relocated block");
        Ok(())
    }

    /// Evict from `tier` until `bytes_needed` is freed or the tier drops to
    /// its target utilization, whichever demands more. Subscribers are
    /// notified for each victim before its range is freed.
    ///
    /// Returns the number of bytes actually freed.
    pub async fn evict(&self, bytes_needed: usize, tier: Tier) -> usize {
        let to_free = {
            let pool = self.pool(tier).lock().unwrap();
            let target_bytes = (self.target_utilization * pool.capacity as f64) as usize;
            let overshoot = pool.used.saturating_sub(target_bytes);
            bytes_needed.max(overshoot)
        };
        if to_free == 0 {
            return 0;
        }

        let samples: Vec<BlockSample> = {
            let index = self.index.lock().unwrap();
            index
                .blocks
                .values()
                .filter(|info| info.tier == tier)
                .map(|info| BlockSample {
                    block_id: info.id,
                    owner: info.owner.clone(),
                    size: info.size,
                    last_access: info.last_access,
                    access_count: info.access_count,
                    insert_seq: info.insert_seq,
                })
                .collect()
        };

        let victims = self.policy.select_victims(samples, to_free, &[]);
        if victims.is_empty() {
            return 0;
        }

        let subscribers: Vec<_> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter().filter_map(|w| w.upgrade()).collect()
        };

        let mut freed = 0usize;
        for victim in victims {
            let mut disposition = VictimDisposition::Release;
            for sub in &subscribers {
                if sub.on_evict(&victim.owner, tier, victim.size).await
                    == VictimDisposition::TookOwnership
                {
                    disposition = VictimDisposition::TookOwnership;
                }
            }

            // The victim may have been re-homed by a subscriber already.
            let still_here = {
                let index = self.index.lock().unwrap();
                index
                    .blocks
                    .get(&victim.block_id)
                    .map(|info| info.tier == tier)
                    .unwrap_or(false)
            };
            if still_here {
                self.deallocate(victim.block_id);
                freed += victim.size;
                debug!(
                    owner = victim.owner,
                    %tier,
                    size = victim.size,
                    ?disposition,
                    "Evicted block"
                );
            } else {
                freed += victim.size;
            }
        }

        if freed > 0 {
            info!(freed, %tier, "Eviction round complete");
        } else {
            warn!(%tier, bytes_needed, "Eviction freed nothing");
        }
        freed
    }

    /// Record an access for auto-tiering statistics.
    pub fn record_access(&self, owner: &str) {
        let mut index = self.index.lock().unwrap();
        if let Some(ids) = index.by_owner.get(owner).cloned() {
            for id in ids {
                if let Some(info) = index.blocks.get_mut(&id) {
                    info.last_access = Instant::now();
                    info.access_count += 1;
                }
            }
        }
    }

    /// The tier currently backing `owner`'s bytes.
    pub fn get_tier(&self, owner: &str) -> Option<Tier> {
        let index = self.index.lock().unwrap();
        self.primary_block(&index, owner).ok().map(|info| info.tier)
    }

    pub fn capacity(&self, tier: Tier) -> usize {
        self.pool(tier).lock().unwrap().capacity
    }

    pub fn used(&self, tier: Tier) -> usize {
        self.pool(tier).lock().unwrap().used
    }

    pub fn available(&self, tier: Tier) -> usize {
        let pool = self.pool(tier).lock().unwrap();
        pool.capacity.saturating_sub(pool.used)
    }

    pub fn stats(&self, tier: Tier) -> TierStats {
        let pool = self.pool(tier).lock().unwrap();
        TierStats {
            capacity: pool.capacity,
            used: pool.used,
            block_count: pool.block_count,
        }
    }

    /// Owners currently placed in a tier, with their access statistics.
    pub fn owners_in_tier(&self, tier: Tier) -> Vec<(String, usize, Instant, u64)> {
        let index = self.index.lock().unwrap();
        index
            .blocks
            .values()
            .filter(|info| info.tier == tier)
            .map(|info| {
                (
                    info.owner.clone(),
                    info.size,
                    info.last_access,
                    info.access_count,
                )
            })
            .collect()
    }
}
