//! Tiered allocator: capacity-bounded pools across GPU HBM, host RAM, and disk.
//!
//! Blocks are opaque byte ranges identified by an owner id. The allocator
//! tracks residency, moves bytes between tiers, and evicts under pressure
//! with a configurable victim-selection policy.

mod policy;
mod tiered;

pub use policy::{BlockSample, EvictionCandidate, EvictionPolicy};
pub use tiered::{
    AllocError, Block, BlockId, EvictionSubscriber, TierStats, TieredAllocator,
    VictimDisposition,
};

use serde::{Deserialize, Serialize};

/// Identifies which storage tier a block currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// GPU HBM.
    Hot,
    /// Host RAM.
    Warm,
    /// Local disk region.
    Cold,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    /// The next slower tier, or None if already coldest.
    pub fn slower(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    /// The next faster tier, or None if already hottest.
    pub fn faster(&self) -> Option<Tier> {
        match self {
            Tier::Hot => None,
            Tier::Warm => Some(Tier::Hot),
            Tier::Cold => Some(Tier::Warm),
        }
    }

    /// Directory name for this tier's frames under `contexts/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    /// Whether this tier holds bytes in memory.
    pub fn is_memory(&self) -> bool {
        !matches!(self, Tier::Cold)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert_eq!(Tier::Hot.level(), 0);
        assert_eq!(Tier::Cold.level(), 2);
    }

    #[test]
    fn test_tier_transitions() {
        assert_eq!(Tier::Hot.slower(), Some(Tier::Warm));
        assert_eq!(Tier::Cold.slower(), None);
        assert_eq!(Tier::Cold.faster(), Some(Tier::Warm));
        assert_eq!(Tier::Hot.faster(), None);
    }

    #[test]
    fn test_tier_dir_names() {
        assert_eq!(Tier::Hot.dir_name(), "hot");
        assert_eq!(Tier::Warm.to_string(), "warm");
    }
}
