//! Eviction policy: decides which blocks to move out of a pressured tier.
//!
//! Victims are scored per the configured policy and drained from a max-heap
//! until enough bytes are covered. Higher score = higher eviction priority.

use std::collections::BinaryHeap;
use std::time::Instant;

use crate::config::EvictionPolicyKind;

use super::tiered::BlockId;

/// A snapshot of one block's access statistics, fed to the policy.
#[derive(Debug, Clone)]
pub struct BlockSample {
    pub block_id: BlockId,
    pub owner: String,
    pub size: usize,
    pub last_access: Instant,
    pub access_count: u64,
    pub insert_seq: u64,
}

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub owner: String,
    pub size: usize,
    pub score: f64,
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// The victim-selection engine.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    kind: EvictionPolicyKind,
}

impl EvictionPolicy {
    pub fn new(kind: EvictionPolicyKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> EvictionPolicyKind {
        self.kind
    }

    /// Compute the eviction priority for a single block.
    pub fn score(&self, sample: &BlockSample, now: Instant) -> f64 {
        let age_secs = now.duration_since(sample.last_access).as_secs_f64();
        match self.kind {
            EvictionPolicyKind::Lru => age_secs,
            EvictionPolicyKind::Lfu => 1.0 / (sample.access_count as f64 + 1.0),
            // Oldest insertion first; scores are compared, not summed, so a
            // negated sequence number orders correctly.
            EvictionPolicyKind::Fifo => -(sample.insert_seq as f64),
            EvictionPolicyKind::SizeWeightedLru => age_secs * sample.size as f64,
        }
    }

    /// Select victims from `samples` until at least `bytes_needed` is covered.
    ///
    /// Returns candidates ordered by eviction priority (highest first).
    /// Owners in the protected set are excluded.
    pub fn select_victims(
        &self,
        samples: impl IntoIterator<Item = BlockSample>,
        bytes_needed: usize,
        protected_owners: &[String],
    ) -> Vec<EvictionCandidate> {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();

        for sample in samples {
            if protected_owners.iter().any(|p| *p == sample.owner) {
                continue;
            }
            let score = self.score(&sample, now);
            heap.push(EvictionCandidate {
                block_id: sample.block_id,
                owner: sample.owner,
                size: sample.size,
                score,
            });
        }

        let mut victims = Vec::new();
        let mut covered = 0usize;
        while covered < bytes_needed {
            match heap.pop() {
                Some(candidate) => {
                    covered += candidate.size;
                    victims.push(candidate);
                }
                None => break,
            }
        }

        victims
    }
}
