//! Auto-tiering controller: keeps memory warm where it pays off.
//!
//! A background loop samples per-context access statistics, computes the
//! recommended tier under the configured policy, applies promotions and
//! demotions through the context manager, and emergency-demotes the coldest
//! items when a tier's utilization crosses its pressure threshold.

use std::sync::Arc;

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alloc::{Tier, TieredAllocator};
use crate::config::{TieringConfig, TieringPolicy};
use crate::context::ContextManager;

/// One applied (or attempted) tier move.
#[derive(Debug, Clone)]
pub struct TieringDecision {
    pub context_id: String,
    pub from: Tier,
    pub to: Tier,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Accessed often enough within the window to deserve the hot tier.
    HotPromotion,
    /// Idle past the warm threshold.
    WarmDemotion,
    /// Idle past the cold threshold.
    ColdDemotion,
    /// A tier crossed its pressure threshold.
    MemoryPressure,
}

/// Callback fired after each applied decision.
pub type DecisionCallback = Box<dyn Fn(&TieringDecision) + Send + Sync>;

/// The controller.
pub struct AutoTieringController {
    config: TieringConfig,
    allocator: Arc<TieredAllocator>,
    contexts: Arc<ContextManager>,
    callbacks: std::sync::Mutex<Vec<DecisionCallback>>,
    /// Start of the current access-counting window (unix seconds) and the
    /// access counts observed at that point.
    window: std::sync::Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    started_at: u64,
    baseline: std::collections::HashMap<String, u64>,
}

impl AutoTieringController {
    pub fn new(
        config: TieringConfig,
        allocator: Arc<TieredAllocator>,
        contexts: Arc<ContextManager>,
    ) -> Self {
        Self {
            config,
            allocator,
            contexts,
            callbacks: std::sync::Mutex::new(Vec::new()),
            window: std::sync::Mutex::new(WindowState::default()),
        }
    }

    /// Register a callback invoked after each applied decision.
    pub fn on_decision(&self, callback: DecisionCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Spawn the background loop. Cancelling the token stops it.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Auto-tiering controller stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            warn!(error = %e, "Auto-tiering cycle failed");
                        }
                    }
                }
            }
        })
    }

    /// One controller cycle. Public so tests can drive it without sleeping.
    pub async fn run_cycle(&self) -> crate::error::SnapResult<Vec<TieringDecision>> {
        let now = unix_now();
        let snapshot = self.contexts.tiering_snapshot().await;

        // Reset the counting window when it has elapsed.
        let window_counts: std::collections::HashMap<String, u64> = {
            let mut window = self.window.lock().unwrap();
            if now.saturating_sub(window.started_at) >= self.config.hot_window_secs {
                window.started_at = now;
                window.baseline = snapshot
                    .iter()
                    .map(|(id, _, _, count)| (id.clone(), *count))
                    .collect();
            }
            snapshot
                .iter()
                .map(|(id, _, _, count)| {
                    let base = window.baseline.get(id).copied().unwrap_or(0);
                    (id.clone(), count.saturating_sub(base))
                })
                .collect()
        };

        let mut decisions = Vec::new();

        // Policy pass: recommended tier per tracked context.
        for (context_id, current, last_accessed, _count) in &snapshot {
            let in_window = window_counts.get(context_id).copied().unwrap_or(0);
            let idle_secs = now.saturating_sub(*last_accessed);
            let recommended = self.recommend(*current, in_window, idle_secs);
            if recommended == *current {
                continue;
            }

            let reason = if recommended.level() < current.level() {
                DecisionReason::HotPromotion
            } else if recommended == Tier::Cold {
                DecisionReason::ColdDemotion
            } else {
                DecisionReason::WarmDemotion
            };

            let decision = TieringDecision {
                context_id: context_id.clone(),
                from: *current,
                to: recommended,
                reason,
            };
            if self.apply(&decision).await {
                decisions.push(decision);
            }
        }

        // Pressure pass: emergency demotion down to target utilization.
        decisions.extend(self.relieve_pressure(Tier::Hot, self.config.gpu_pressure_threshold).await);
        decisions.extend(self.relieve_pressure(Tier::Warm, self.config.cpu_pressure_threshold).await);

        if !decisions.is_empty() {
            debug!(applied = decisions.len(), "Auto-tiering cycle complete");
        }
        Ok(decisions)
    }

    /// The tier this context deserves under the configured policy.
    fn recommend(&self, current: Tier, accesses_in_window: u64, idle_secs: u64) -> Tier {
        let hot_by_frequency = accesses_in_window >= self.config.hot_access_count;
        let hot_by_recency = idle_secs < self.config.warm_threshold_secs;

        let wants_hot = match self.config.policy {
            TieringPolicy::AccessFrequency => hot_by_frequency,
            TieringPolicy::Recency => hot_by_recency,
            TieringPolicy::Adaptive => hot_by_frequency && hot_by_recency,
        };

        if wants_hot {
            return Tier::Hot;
        }
        if idle_secs >= self.config.cold_threshold_secs {
            return Tier::Cold;
        }
        if idle_secs >= self.config.warm_threshold_secs {
            return match current {
                // Never demote below warm on idleness alone until the cold
                // threshold is reached.
                Tier::Hot | Tier::Warm => Tier::Warm,
                Tier::Cold => Tier::Cold,
            };
        }
        // Recently used but not hot-worthy: stay put.
        current
    }

    async fn apply(&self, decision: &TieringDecision) -> bool {
        let result = if decision.to.level() < decision.from.level() {
            // Population caps bound promotions into the memory tiers.
            let stats = self.contexts.stats().await;
            let room = match decision.to {
                Tier::Hot => stats.hot < self.config.max_hot_contexts,
                Tier::Warm => stats.warm < self.config.max_warm_contexts,
                Tier::Cold => true,
            };
            if !room {
                debug!(
                    context_id = decision.context_id,
                    to = %decision.to,
                    "Promotion skipped, tier population at cap"
                );
                return false;
            }
            self.contexts.promote(&decision.context_id, decision.to).await
        } else {
            self.contexts.demote(&decision.context_id, decision.to).await
        };

        match result {
            Ok(()) => {
                debug!(
                    context_id = decision.context_id,
                    from = %decision.from,
                    to = %decision.to,
                    reason = ?decision.reason,
                    "Tiering decision applied"
                );
                for callback in self.callbacks.lock().unwrap().iter() {
                    callback(decision);
                }
                true
            }
            Err(e) => {
                debug!(
                    context_id = decision.context_id,
                    error = %e,
                    "Tiering decision not applied"
                );
                false
            }
        }
    }

    /// Demote the coldest items out of an over-pressured tier until its
    /// utilization drops to the target.
    async fn relieve_pressure(&self, tier: Tier, threshold: f64) -> Vec<TieringDecision> {
        let stats = self.allocator.stats(tier);
        if stats.usage_fraction() <= threshold {
            return Vec::new();
        }

        let target_bytes = (self.config.target_utilization * stats.capacity as f64) as usize;
        let mut to_free = stats.used.saturating_sub(target_bytes);

        // Coldest first: the oldest last-access timestamp wins.
        let mut owners = self.allocator.owners_in_tier(tier);
        owners.sort_by_key(|(_, _, last_access, _)| *last_access);

        let target_tier = tier.slower().unwrap_or(Tier::Cold);
        let mut applied = Vec::new();
        for (owner, size, _, _) in owners {
            if to_free == 0 {
                break;
            }
            let decision = TieringDecision {
                context_id: owner,
                from: tier,
                to: target_tier,
                reason: DecisionReason::MemoryPressure,
            };
            if self.apply(&decision).await {
                to_free = to_free.saturating_sub(size);
                applied.push(decision);
            }
        }

        if !applied.is_empty() {
            info!(%tier, demoted = applied.len(), "Emergency demotion relieved pressure");
        }
        applied
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_config() -> TieringConfig {
        TieringConfig {
            policy: TieringPolicy::Adaptive,
            hot_access_count: 3,
            hot_window_secs: 300,
            warm_threshold_secs: 600,
            cold_threshold_secs: 3600,
            ..TieringConfig::default()
        }
    }

    fn bare_controller(config: TieringConfig) -> AutoTieringController {
        // recommend() is pure; the collaborators are never touched by these
        // tests, so minimal instances suffice.
        let layout = crate::config::HomeLayout::new(std::env::temp_dir().join("snapllm-tiering"));
        let _ = layout.ensure_dirs();
        let allocator = Arc::new(TieredAllocator::new(&crate::config::TierConfig::default()));
        let registry = Arc::new(crate::registry::Registry::new(layout.clone()));
        let dequant = Arc::new(crate::dequant::DequantCache::new(
            layout.clone(),
            crate::config::WorkspaceConfig::default(),
        ));
        let models = Arc::new(crate::model::ModelManager::new(
            crate::config::ModelConfig::default(),
            layout.clone(),
            dequant,
            Arc::new(crate::engine::StubEngineFactory::new()),
        ));
        let contexts = ContextManager::new(
            layout,
            crate::config::IngestConfig::default(),
            crate::config::CompressionConfig::default(),
            allocator.clone(),
            registry,
            models,
        );
        AutoTieringController::new(config, allocator, contexts)
    }

    #[test]
    fn test_recommend_hot_needs_frequency_and_recency() {
        let c = bare_controller(controller_config());
        // Frequent and recent: hot.
        assert_eq!(c.recommend(Tier::Warm, 5, 10), Tier::Hot);
        // Frequent but stale: not hot under Adaptive.
        assert_ne!(c.recommend(Tier::Warm, 5, 700), Tier::Hot);
        // Recent but infrequent: not hot under Adaptive.
        assert_ne!(c.recommend(Tier::Warm, 1, 10), Tier::Hot);
    }

    #[test]
    fn test_recommend_demotes_by_idleness() {
        let c = bare_controller(controller_config());
        assert_eq!(c.recommend(Tier::Hot, 0, 700), Tier::Warm);
        assert_eq!(c.recommend(Tier::Hot, 0, 4000), Tier::Cold);
        assert_eq!(c.recommend(Tier::Warm, 0, 4000), Tier::Cold);
    }

    #[test]
    fn test_recommend_keeps_recent_in_place() {
        let c = bare_controller(controller_config());
        assert_eq!(c.recommend(Tier::Warm, 1, 50), Tier::Warm);
        assert_eq!(c.recommend(Tier::Cold, 0, 50), Tier::Cold);
    }

    #[test]
    fn test_frequency_policy_ignores_recency() {
        let mut config = controller_config();
        config.policy = TieringPolicy::AccessFrequency;
        let c = bare_controller(config);
        assert_eq!(c.recommend(Tier::Warm, 5, 700), Tier::Hot);
    }
}
