// Context-token budgets per cycle
//
// Budgets are scheduled like memory: the active sum never exceeds
// total x (1 - reserve). A cycle that needs more than it holds is either
// granted headroom or told to compress; it is never silently truncated.

use crate::config::TokenConfig;
use crate::error::{first_violation, ParallelError, ParallelResult, Violation};
use crate::models::{CycleId, CyclePhase};
use crate::storage::{tokens_key, PersistenceGateway, COLLECTION_ALLOCATIONS};
use crate::utils::{generate_id, lock_mutex_recover};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAllocation {
    pub id: String,
    pub cycle_id: CycleId,
    pub phase: CyclePhase,
    pub complexity: u8,
    pub shares_context: bool,
    pub allocated: u64,
    /// Tokens spent in the current phase
    pub used: u64,
    /// Tokens spent over the whole cycle
    pub total_used: u64,
    pub phase_multiplier: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenAllocation {
    /// Share of the allocation spent in the current phase
    pub fn utilization(&self) -> f64 {
        if self.allocated == 0 {
            0.0
        } else {
            self.used as f64 / self.allocated as f64
        }
    }
}

/// Answer to a mid-run request for more context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HeadroomDecision {
    /// The allocation now covers the need
    Granted { allocated: u64 },
    /// No room to grow; the caller must compress to fit `allowed`
    Compress { allowed: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRebalanceReport {
    pub shrunk: Vec<CycleId>,
    pub grown: Vec<CycleId>,
    pub skipped: Vec<CycleId>,
    pub tokens_moved: u64,
}

pub struct TokenBudgetManager {
    config: TokenConfig,
    /// Floor for the fair-share divisor so early cycles leave room for later ones
    max_parallel: usize,
    allocations: Mutex<HashMap<CycleId, TokenAllocation>>,
    persistence: Option<Arc<PersistenceGateway>>,
}

impl TokenBudgetManager {
    pub fn new(config: TokenConfig, max_parallel: usize) -> Self {
        Self {
            config,
            max_parallel: max_parallel.max(1),
            allocations: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceGateway>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    fn persist(&self, allocation: &TokenAllocation) {
        if let Some(persistence) = &self.persistence {
            persistence.save(COLLECTION_ALLOCATIONS, &tokens_key(&allocation.cycle_id), allocation);
        }
    }

    /// Budget left after the reserve
    pub fn usable(&self) -> u64 {
        (self.config.total_budget as f64 * (1.0 - self.config.reserve_fraction)).round() as u64
    }

    fn sum(allocations: &HashMap<CycleId, TokenAllocation>) -> u64 {
        allocations.values().map(|a| a.allocated).sum()
    }

    pub fn allocated_total(&self) -> u64 {
        Self::sum(&lock_mutex_recover(&self.allocations))
    }

    pub fn available(&self) -> u64 {
        self.usable().saturating_sub(self.allocated_total())
    }

    pub fn phase_multiplier(&self, phase: CyclePhase) -> f64 {
        let m = &self.config.phase_multipliers;
        match phase {
            CyclePhase::Design => m.design,
            CyclePhase::TestRed => m.test_red,
            CyclePhase::CodeGreen => m.code_green,
            CyclePhase::Refactor => m.refactor,
            CyclePhase::Commit => m.commit,
            CyclePhase::Failed | CyclePhase::Completed => 0.0,
        }
    }

    /// Complexity 1..10 maps onto 0.8..1.7
    pub fn complexity_multiplier(complexity: u8) -> f64 {
        0.7 + 0.1 * complexity.clamp(1, 10) as f64
    }

    /// Unclamped budget for a cycle in a phase
    pub fn target_budget(
        &self,
        complexity: u8,
        phase: CyclePhase,
        shares_context: bool,
        active_cycles: usize,
    ) -> u64 {
        let divisor = active_cycles.max(self.max_parallel) as f64;
        let base = self.usable() as f64 / divisor;
        let sharing = if shares_context {
            1.0 - self.config.sharing_discount
        } else {
            1.0
        };
        (base * Self::complexity_multiplier(complexity) * self.phase_multiplier(phase) * sharing).round() as u64
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.config.allocation_ttl_secs as i64)
    }

    /// Grant a budget to a newly admitted cycle, clamped to what is available
    pub fn allocate(
        &self,
        cycle_id: &str,
        complexity: u8,
        phase: CyclePhase,
        shares_context: bool,
        active_cycles: usize,
    ) -> ParallelResult<TokenAllocation> {
        let target = self.target_budget(complexity, phase, shares_context, active_cycles);
        let allocation = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            if let Some(existing) = allocations.get(cycle_id) {
                return Ok(existing.clone());
            }
            let available = self.usable().saturating_sub(Self::sum(&allocations));
            let granted = target.min(available);
            if granted == 0 {
                log::warn!("[TokenBudget] No tokens left for {}", cycle_id);
                return Err(ParallelError::ResourceExhausted {
                    reason: format!("token budget exhausted ({} of {} allocated)", self.usable() - available, self.usable()),
                });
            }

            let now = Utc::now();
            let allocation = TokenAllocation {
                id: generate_id("tok"),
                cycle_id: cycle_id.to_string(),
                phase,
                complexity,
                shares_context,
                allocated: granted,
                used: 0,
                total_used: 0,
                phase_multiplier: self.phase_multiplier(phase),
                created_at: now,
                updated_at: now,
                expires_at: self.expiry_from(now),
            };
            allocations.insert(cycle_id.to_string(), allocation.clone());
            allocation
        };

        if allocation.allocated < target {
            log::info!(
                "[TokenBudget] {} clamped to {} tokens (wanted {})",
                cycle_id,
                allocation.allocated,
                target
            );
        } else {
            log::info!("[TokenBudget] Allocated {} tokens to {}", allocation.allocated, cycle_id);
        }
        self.persist(&allocation);
        Ok(allocation)
    }

    /// Re-derive a cycle's budget for its new phase, within availability
    pub fn on_phase_change(
        &self,
        cycle_id: &str,
        phase: CyclePhase,
        active_cycles: usize,
    ) -> Option<TokenAllocation> {
        let updated = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            let others = Self::sum(&allocations)
                .saturating_sub(allocations.get(cycle_id).map(|a| a.allocated).unwrap_or(0));
            let allocation = allocations.get_mut(cycle_id)?;
            let target = self.target_budget(allocation.complexity, phase, allocation.shares_context, active_cycles);
            let ceiling = self.usable().saturating_sub(others);
            let now = Utc::now();
            allocation.allocated = target.min(ceiling).max(1.min(ceiling));
            allocation.phase = phase;
            allocation.phase_multiplier = self.phase_multiplier(phase);
            allocation.used = 0;
            allocation.updated_at = now;
            allocation.expires_at = self.expiry_from(now);
            allocation.clone()
        };
        log::debug!(
            "[TokenBudget] {} now in {} with {} tokens",
            cycle_id,
            phase,
            updated.allocated
        );
        self.persist(&updated);
        Some(updated)
    }

    pub fn record_usage(&self, cycle_id: &str, tokens: u64) {
        let updated = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            allocations.get_mut(cycle_id).map(|allocation| {
                let now = Utc::now();
                allocation.used = allocation.used.saturating_add(tokens);
                allocation.total_used = allocation.total_used.saturating_add(tokens);
                allocation.updated_at = now;
                allocation.expires_at = self.expiry_from(now);
                allocation.clone()
            })
        };
        if let Some(allocation) = updated {
            self.persist(&allocation);
        }
    }

    /// Grow an allocation to cover `needed` if availability permits,
    /// otherwise tell the caller to compress
    pub fn request_headroom(&self, cycle_id: &str, needed: u64) -> HeadroomDecision {
        let (decision, updated) = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            let available = self.usable().saturating_sub(Self::sum(&allocations));
            let Some(allocation) = allocations.get_mut(cycle_id) else {
                return HeadroomDecision::Compress { allowed: 0 };
            };
            if needed <= allocation.allocated {
                (
                    HeadroomDecision::Granted {
                        allocated: allocation.allocated,
                    },
                    None,
                )
            } else if needed - allocation.allocated <= available {
                allocation.allocated = needed;
                allocation.updated_at = Utc::now();
                (HeadroomDecision::Granted { allocated: needed }, Some(allocation.clone()))
            } else {
                (
                    HeadroomDecision::Compress {
                        allowed: allocation.allocated,
                    },
                    None,
                )
            }
        };
        match decision {
            HeadroomDecision::Granted { allocated } => {
                log::info!("[TokenBudget] Headroom granted to {}: {} tokens", cycle_id, allocated)
            }
            HeadroomDecision::Compress { allowed } => log::warn!(
                "[TokenBudget] {} needs {} tokens but only {} fit; compress",
                cycle_id,
                needed,
                allowed
            ),
        }
        if let Some(allocation) = updated {
            self.persist(&allocation);
        }
        decision
    }

    /// Shrink inefficient allocations, then grow saturated ones from what is free
    pub fn rebalance(&self) -> TokenRebalanceReport {
        let mut report = TokenRebalanceReport::default();
        let target_efficiency =
            (self.config.shrink_below_efficiency + self.config.grow_above_utilization) / 2.0;

        let changed: Vec<TokenAllocation> = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            let mut ids: Vec<CycleId> = allocations.keys().cloned().collect();
            ids.sort();
            let now = Utc::now();

            for id in &ids {
                let Some(allocation) = allocations.get_mut(id) else { continue };
                if allocation.used == 0 || allocation.utilization() >= self.config.shrink_below_efficiency {
                    continue;
                }
                let target = ((allocation.used as f64 / target_efficiency).ceil() as u64)
                    .max(allocation.used)
                    .min(allocation.allocated);
                if target < allocation.allocated {
                    report.tokens_moved += allocation.allocated - target;
                    allocation.allocated = target;
                    allocation.updated_at = now;
                    report.shrunk.push(id.clone());
                }
            }

            for id in &ids {
                let available = self.usable().saturating_sub(Self::sum(&allocations));
                let Some(allocation) = allocations.get_mut(id) else { continue };
                if allocation.utilization() <= self.config.grow_above_utilization {
                    continue;
                }
                let wanted = ((allocation.allocated as f64 * self.config.grow_fraction).ceil() as u64).max(1);
                let grant = wanted.min(available);
                if grant == 0 {
                    report.skipped.push(id.clone());
                    continue;
                }
                allocation.allocated += grant;
                allocation.updated_at = now;
                report.grown.push(id.clone());
            }

            report
                .shrunk
                .iter()
                .chain(report.grown.iter())
                .filter_map(|id| allocations.get(id).cloned())
                .collect()
        };

        for allocation in &changed {
            self.persist(allocation);
        }
        if !changed.is_empty() {
            log::info!(
                "[TokenBudget] Rebalanced: {} shrunk ({} tokens freed), {} grown, {} skipped",
                report.shrunk.len(),
                report.tokens_moved,
                report.grown.len(),
                report.skipped.len()
            );
        }
        report
    }

    /// Drop allocations whose TTL passed without activity
    pub fn expire_stale(&self) -> Vec<CycleId> {
        self.expire_before(Utc::now())
    }

    fn expire_before(&self, cutoff: DateTime<Utc>) -> Vec<CycleId> {
        let mut allocations = lock_mutex_recover(&self.allocations);
        let expired: Vec<CycleId> = allocations
            .values()
            .filter(|a| a.expires_at <= cutoff)
            .map(|a| a.cycle_id.clone())
            .collect();
        for id in &expired {
            allocations.remove(id);
            log::warn!("[TokenBudget] Token allocation for {} expired", id);
        }
        expired
    }

    /// Return a cycle's tokens. Safe to call more than once.
    pub fn release(&self, cycle_id: &str) -> Option<TokenAllocation> {
        let released = lock_mutex_recover(&self.allocations).remove(cycle_id);
        if let Some(allocation) = &released {
            log::debug!(
                "[TokenBudget] Released {} tokens from {} ({} used)",
                allocation.allocated,
                cycle_id,
                allocation.total_used
            );
        }
        released
    }

    pub fn get(&self, cycle_id: &str) -> Option<TokenAllocation> {
        lock_mutex_recover(&self.allocations).get(cycle_id).cloned()
    }

    pub fn allocations(&self) -> Vec<TokenAllocation> {
        let mut all: Vec<TokenAllocation> = lock_mutex_recover(&self.allocations).values().cloned().collect();
        all.sort_by(|a, b| a.cycle_id.cmp(&b.cycle_id));
        all
    }

    /// Allocations over the usable budget, blaming the newest ones
    pub fn violations(&self) -> Vec<Violation> {
        let allocations = lock_mutex_recover(&self.allocations);
        let usable = self.usable();
        let mut total = Self::sum(&allocations);
        if total <= usable {
            return Vec::new();
        }
        let detail = format!("{} tokens allocated, usable {}", total, usable);

        let mut newest: Vec<&TokenAllocation> = allocations.values().collect();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.cycle_id.cmp(&a.cycle_id)));
        let mut blamed = Vec::new();
        for allocation in newest {
            if total <= usable {
                break;
            }
            total = total.saturating_sub(allocation.allocated);
            blamed.push(allocation.cycle_id.clone());
        }
        vec![Violation::new(detail, blamed)]
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        first_violation(self.violations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenBudgetManager {
        let config = TokenConfig {
            total_budget: 100_000,
            reserve_fraction: 0.1,
            ..TokenConfig::default()
        };
        TokenBudgetManager::new(config, 3)
    }

    #[test]
    fn test_usable_budget() {
        assert_eq!(manager().usable(), 90_000);
    }

    #[test]
    fn test_equal_share_allocation() {
        let m = manager();
        let a = m.allocate("a", 3, CyclePhase::TestRed, false, 1).unwrap();
        assert_eq!(a.allocated, 30_000);
    }

    #[test]
    fn test_multipliers_apply() {
        let m = manager();
        let design = m.target_budget(3, CyclePhase::Design, false, 3);
        let commit = m.target_budget(3, CyclePhase::Commit, false, 3);
        let shared = m.target_budget(3, CyclePhase::TestRed, true, 3);
        let complex = m.target_budget(8, CyclePhase::TestRed, false, 3);
        assert_eq!(design, 36_000);
        assert_eq!(commit, 21_000);
        assert_eq!(shared, 25_500);
        assert_eq!(complex, 45_000);
    }

    #[test]
    fn test_sum_is_clamped_to_usable() {
        let m = manager();
        for id in ["a", "b", "c"] {
            m.allocate(id, 3, CyclePhase::Design, false, 3).unwrap();
        }
        assert_eq!(m.allocated_total(), 90_000);
        assert_eq!(m.get("c").unwrap().allocated, 18_000);
        assert!(matches!(
            m.allocate("d", 3, CyclePhase::Design, false, 4),
            Err(ParallelError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_headroom_granted_then_compress() {
        let m = manager();
        m.allocate("a", 3, CyclePhase::TestRed, false, 1).unwrap();
        assert_eq!(
            m.request_headroom("a", 50_000),
            HeadroomDecision::Granted { allocated: 50_000 }
        );
        m.allocate("b", 3, CyclePhase::TestRed, false, 2).unwrap();
        assert_eq!(
            m.request_headroom("b", 80_000),
            HeadroomDecision::Compress { allowed: 30_000 }
        );
        assert!(m.check_invariants().is_ok());
    }

    #[test]
    fn test_phase_change_reprices() {
        let m = manager();
        m.allocate("a", 3, CyclePhase::Design, false, 1).unwrap();
        m.record_usage("a", 100);
        let updated = m.on_phase_change("a", CyclePhase::Commit, 1).unwrap();
        assert_eq!(updated.allocated, 21_000);
        assert_eq!(updated.used, 0);
        assert_eq!(updated.total_used, 100);
    }

    #[test]
    fn test_rebalance_moves_within_ceiling() {
        let m = manager();
        for id in ["a", "b", "c"] {
            m.allocate(id, 3, CyclePhase::TestRed, false, 3).unwrap();
        }
        m.record_usage("a", 3_000);
        m.record_usage("b", 20_000);
        m.record_usage("c", 29_000);

        let report = m.rebalance();
        assert_eq!(report.shrunk, vec!["a".to_string()]);
        assert_eq!(report.grown, vec!["c".to_string()]);
        assert!(m.get("a").unwrap().allocated < 30_000);
        assert!(m.get("c").unwrap().allocated > 30_000);
        assert_eq!(m.get("b").unwrap().allocated, 30_000);
        assert!(m.allocated_total() <= 90_000);
    }

    #[test]
    fn test_expiry_and_release() {
        let m = manager();
        m.allocate("a", 3, CyclePhase::Design, false, 1).unwrap();
        assert!(m.expire_stale().is_empty());
        let expired = m.expire_before(Utc::now() + ChronoDuration::seconds(7200));
        assert_eq!(expired, vec!["a".to_string()]);
        assert!(m.release("a").is_none());
        assert_eq!(m.allocated_total(), 0);
    }

    #[test]
    fn test_violation_blames_newest_allocation() {
        let m = manager();
        m.allocate("a", 3, CyclePhase::TestRed, false, 3).unwrap();
        m.allocate("b", 3, CyclePhase::TestRed, false, 3).unwrap();
        assert!(m.violations().is_empty());

        lock_mutex_recover(&m.allocations).get_mut("a").unwrap().allocated = 80_000;
        let violations = m.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cycles, vec!["b".to_string()]);
        assert!(m.check_invariants().is_err());
    }
}
