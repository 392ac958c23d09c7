// Compute capacity: feasibility checks, allocation and periodic rebalancing

use crate::config::ResourceConfig;
use crate::error::{first_violation, ParallelError, ParallelResult, Violation};
use crate::models::{CycleId, ResourceRequirements};
use crate::storage::{resource_key, PersistenceGateway, COLLECTION_ALLOCATIONS};
use crate::utils::{generate_id, lock_mutex_recover};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, System};

/// Compute granted to one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub id: String,
    pub cycle_id: CycleId,
    pub requested: ResourceRequirements,
    pub granted: ResourceRequirements,
    /// Token budget currently granted to the cycle, mirrored from the token manager
    pub token_budget: u64,
    /// Last observed usage (disk is not sampled)
    pub observed: Option<ResourceRequirements>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feasibility {
    pub feasible: bool,
    pub reason: Option<String>,
}

impl Feasibility {
    fn ok() -> Self {
        Self {
            feasible: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            feasible: false,
            reason: Some(reason),
        }
    }
}

/// What a rebalance pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    pub shrunk: Vec<CycleId>,
    pub grown: Vec<CycleId>,
    /// Receivers whose growth could not be fully satisfied
    pub skipped: Vec<CycleId>,
}

impl RebalanceReport {
    pub fn is_empty(&self) -> bool {
        self.shrunk.is_empty() && self.grown.is_empty() && self.skipped.is_empty()
    }
}

/// Read host capacity for every dimension left at zero in the config
pub fn detect_capacity(config: &ResourceConfig) -> ResourceRequirements {
    let needs_host = config.memory_mb == 0 || config.cpu_share <= 0.0;
    let (host_memory_mb, host_cpus) = if needs_host {
        let mut system = System::new();
        system.refresh_memory();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        (system.total_memory() / 1024 / 1024, cpus)
    } else {
        (0, 0.0)
    };

    let disk_mb = if config.disk_mb == 0 {
        let disks = Disks::new_with_refreshed_list();
        disks.list().iter().map(|d| d.available_space() / 1024 / 1024).sum()
    } else {
        config.disk_mb
    };

    let mut capacity = ResourceRequirements {
        memory_mb: if config.memory_mb == 0 { host_memory_mb } else { config.memory_mb },
        cpu_share: if config.cpu_share <= 0.0 { host_cpus } else { config.cpu_share },
        disk_mb,
    };
    // Sandboxed hosts can report nothing; fall back to a few agents' worth
    if capacity.memory_mb == 0 {
        log::warn!("[ResourceAllocator] Could not detect host memory, assuming 4 agents");
        capacity.memory_mb = config.per_agent_memory_mb * 4;
    }
    if capacity.disk_mb == 0 {
        log::warn!("[ResourceAllocator] Could not detect free disk, assuming 4 agents");
        capacity.disk_mb = config.per_agent_disk_mb * 4;
    }
    log::info!(
        "[ResourceAllocator] Capacity: {} MB memory, {:.1} CPU, {} MB disk",
        capacity.memory_mb,
        capacity.cpu_share,
        capacity.disk_mb
    );
    capacity
}

fn ratio(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        used / total
    }
}

pub struct ResourceAllocator {
    config: ResourceConfig,
    capacity: ResourceRequirements,
    allocations: Mutex<HashMap<CycleId, ResourceAllocation>>,
    persistence: Option<Arc<PersistenceGateway>>,
}

impl ResourceAllocator {
    pub fn new(config: ResourceConfig) -> Self {
        let capacity = detect_capacity(&config);
        Self::with_capacity(config, capacity)
    }

    pub fn with_capacity(config: ResourceConfig, capacity: ResourceRequirements) -> Self {
        Self {
            config,
            capacity,
            allocations: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceGateway>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    fn persist(&self, allocation: &ResourceAllocation) {
        if let Some(persistence) = &self.persistence {
            persistence.save(COLLECTION_ALLOCATIONS, &resource_key(&allocation.cycle_id), allocation);
        }
    }

    pub fn capacity(&self) -> ResourceRequirements {
        self.capacity
    }

    /// Capacity left after the reserve
    pub fn usable(&self) -> ResourceRequirements {
        self.capacity.scale(1.0 - self.config.reserve_fraction)
    }

    pub fn per_agent_cap(&self) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.config.per_agent_memory_mb,
            cpu_share: self.config.per_agent_cpu_share,
            disk_mb: self.config.per_agent_disk_mb,
        }
    }

    fn sum_granted(allocations: &HashMap<CycleId, ResourceAllocation>) -> ResourceRequirements {
        allocations
            .values()
            .fold(ResourceRequirements::default(), |acc, a| acc.saturating_add(&a.granted))
    }

    /// Sum of active grants
    pub fn in_use(&self) -> ResourceRequirements {
        Self::sum_granted(&lock_mutex_recover(&self.allocations))
    }

    /// Highest per-dimension share of usable capacity that is granted
    pub fn utilization(&self) -> f64 {
        let allocations = lock_mutex_recover(&self.allocations);
        self.utilization_of(&Self::sum_granted(&allocations))
    }

    fn utilization_of(&self, used: &ResourceRequirements) -> f64 {
        let usable = self.usable();
        ratio(used.memory_mb as f64, usable.memory_mb as f64)
            .max(ratio(used.cpu_share, usable.cpu_share))
            .max(ratio(used.disk_mb as f64, usable.disk_mb as f64))
    }

    fn feasibility_against(
        &self,
        requirements: &ResourceRequirements,
        in_use: &ResourceRequirements,
    ) -> Feasibility {
        let cap = self.per_agent_cap();
        if !requirements.fits_within(&cap) {
            return Feasibility::rejected(format!(
                "request ({} MB, {:.2} CPU, {} MB disk) exceeds the per-agent cap ({} MB, {:.2} CPU, {} MB disk)",
                requirements.memory_mb,
                requirements.cpu_share,
                requirements.disk_mb,
                cap.memory_mb,
                cap.cpu_share,
                cap.disk_mb
            ));
        }
        let headroom = self.usable().saturating_sub(in_use);
        if !requirements.fits_within(&headroom) {
            return Feasibility::rejected(format!(
                "insufficient headroom: {} MB, {:.2} CPU, {} MB disk free",
                headroom.memory_mb, headroom.cpu_share, headroom.disk_mb
            ));
        }
        Feasibility::ok()
    }

    pub fn check_feasible(&self, requirements: &ResourceRequirements) -> Feasibility {
        let allocations = lock_mutex_recover(&self.allocations);
        self.feasibility_against(requirements, &Self::sum_granted(&allocations))
    }

    /// Feasibility as if `pending` were already granted on top of current use
    pub fn check_feasible_with(
        &self,
        requirements: &ResourceRequirements,
        pending: &ResourceRequirements,
    ) -> Feasibility {
        let allocations = lock_mutex_recover(&self.allocations);
        let in_use = Self::sum_granted(&allocations).saturating_add(pending);
        self.feasibility_against(requirements, &in_use)
    }

    /// Grant compute to a cycle. Re-checks feasibility under the lock and fails
    /// fast with ResourceExhausted instead of retrying.
    pub fn allocate(
        &self,
        cycle_id: &str,
        requirements: &ResourceRequirements,
    ) -> ParallelResult<ResourceAllocation> {
        let allocation = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            if let Some(existing) = allocations.get(cycle_id) {
                return Ok(existing.clone());
            }

            let in_use = Self::sum_granted(&allocations);
            let feasibility = self.feasibility_against(requirements, &in_use);
            if !feasibility.feasible {
                let reason = feasibility.reason.unwrap_or_default();
                log::warn!("[ResourceAllocator] Cannot allocate for {}: {}", cycle_id, reason);
                return Err(ParallelError::ResourceExhausted { reason });
            }

            let utilization = self.utilization_of(&in_use);
            let headroom = self.usable().saturating_sub(&in_use);
            let granted = if utilization < self.config.low_utilization {
                requirements
                    .scale(self.config.max_boost_multiplier)
                    .min(&self.per_agent_cap())
                    .min(&headroom)
                    .max(requirements)
            } else if utilization > self.config.high_utilization {
                requirements.scale(self.config.trim_fraction)
            } else {
                *requirements
            };

            let now = Utc::now();
            let allocation = ResourceAllocation {
                id: generate_id("res"),
                cycle_id: cycle_id.to_string(),
                requested: *requirements,
                granted,
                token_budget: 0,
                observed: None,
                created_at: now,
                updated_at: now,
            };
            allocations.insert(cycle_id.to_string(), allocation.clone());
            allocation
        };

        log::info!(
            "[ResourceAllocator] Allocated {} MB / {:.2} CPU / {} MB disk to {}",
            allocation.granted.memory_mb,
            allocation.granted.cpu_share,
            allocation.granted.disk_mb,
            cycle_id
        );
        self.persist(&allocation);
        Ok(allocation)
    }

    /// Record the latest measured usage of a cycle
    pub fn record_usage(&self, cycle_id: &str, memory_mb: u64, cpu_share: f64) {
        let updated = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            allocations.get_mut(cycle_id).map(|allocation| {
                allocation.observed = Some(ResourceRequirements::new(memory_mb, cpu_share, 0));
                allocation.updated_at = Utc::now();
                allocation.clone()
            })
        };
        if let Some(allocation) = updated {
            self.persist(&allocation);
        }
    }

    pub fn set_token_budget(&self, cycle_id: &str, tokens: u64) {
        let updated = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            allocations.get_mut(cycle_id).map(|allocation| {
                allocation.token_budget = tokens;
                allocation.updated_at = Utc::now();
                allocation.clone()
            })
        };
        if let Some(allocation) = updated {
            self.persist(&allocation);
        }
    }

    /// Shrink under-used grants, then grow pressured ones from what was freed.
    /// A grow either fully satisfies its receiver or is skipped.
    pub fn rebalance(&self) -> RebalanceReport {
        let mut report = RebalanceReport::default();
        let changed: Vec<ResourceAllocation> = {
            let mut allocations = lock_mutex_recover(&self.allocations);
            let mut ids: Vec<CycleId> = allocations.keys().cloned().collect();
            ids.sort();

            // Shrink pass
            for id in &ids {
                let Some(allocation) = allocations.get_mut(id) else { continue };
                let Some(observed) = allocation.observed else { continue };
                let floor = allocation.requested.scale(self.config.trim_fraction);
                let mut target = allocation.granted;

                let memory_use = ratio(observed.memory_mb as f64, allocation.granted.memory_mb as f64);
                if memory_use < self.config.shrink_memory_below {
                    let wanted = (observed.memory_mb as f64 / self.config.high_utilization).ceil() as u64;
                    target.memory_mb = wanted.max(floor.memory_mb).min(allocation.granted.memory_mb);
                }
                let cpu_use = ratio(observed.cpu_share, allocation.granted.cpu_share);
                if cpu_use < self.config.shrink_cpu_below {
                    let wanted = observed.cpu_share / self.config.high_utilization;
                    target.cpu_share = wanted.max(floor.cpu_share).min(allocation.granted.cpu_share);
                }

                if target != allocation.granted {
                    allocation.granted = target;
                    allocation.updated_at = Utc::now();
                    report.shrunk.push(id.clone());
                }
            }

            // Grow pass
            let cap = self.per_agent_cap();
            for id in &ids {
                let in_use = Self::sum_granted(&allocations);
                let headroom = self.usable().saturating_sub(&in_use);
                let Some(allocation) = allocations.get_mut(id) else { continue };
                let Some(observed) = allocation.observed else { continue };

                let mut target = allocation.granted;
                let memory_pressure = ratio(observed.memory_mb as f64, allocation.granted.memory_mb as f64);
                if memory_pressure > self.config.grow_above {
                    let wanted = (observed.memory_mb as f64 / self.config.high_utilization).ceil() as u64;
                    target.memory_mb = wanted.min(cap.memory_mb).max(allocation.granted.memory_mb);
                }
                let cpu_pressure = ratio(observed.cpu_share, allocation.granted.cpu_share);
                if cpu_pressure > self.config.grow_above {
                    let wanted = observed.cpu_share / self.config.high_utilization;
                    target.cpu_share = wanted.min(cap.cpu_share).max(allocation.granted.cpu_share);
                }
                if target == allocation.granted {
                    continue;
                }

                let delta = target.saturating_sub(&allocation.granted);
                if delta.fits_within(&headroom) {
                    allocation.granted = target;
                    allocation.updated_at = Utc::now();
                    report.grown.push(id.clone());
                } else {
                    report.skipped.push(id.clone());
                }
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
        if !report.is_empty() {
            log::info!(
                "[ResourceAllocator] Rebalanced: {} shrunk, {} grown, {} skipped",
                report.shrunk.len(),
                report.grown.len(),
                report.skipped.len()
            );
        }
        report
    }

    /// Free a cycle's grant. Safe to call more than once.
    pub fn release(&self, cycle_id: &str) -> Option<ResourceAllocation> {
        let released = lock_mutex_recover(&self.allocations).remove(cycle_id);
        if let Some(allocation) = &released {
            log::info!(
                "[ResourceAllocator] Released {} MB / {:.2} CPU from {}",
                allocation.granted.memory_mb,
                allocation.granted.cpu_share,
                cycle_id
            );
        }
        released
    }

    pub fn get(&self, cycle_id: &str) -> Option<ResourceAllocation> {
        lock_mutex_recover(&self.allocations).get(cycle_id).cloned()
    }

    pub fn allocations(&self) -> Vec<ResourceAllocation> {
        let mut all: Vec<ResourceAllocation> =
            lock_mutex_recover(&self.allocations).values().cloned().collect();
        all.sort_by(|a, b| a.cycle_id.cmp(&b.cycle_id));
        all
    }

    /// Grants over usable capacity. The newest allocations whose removal
    /// brings the sum back under capacity are blamed.
    pub fn violations(&self) -> Vec<Violation> {
        let allocations = lock_mutex_recover(&self.allocations);
        let usable = self.usable();
        let mut in_use = Self::sum_granted(&allocations);
        if in_use.fits_within(&usable) {
            return Vec::new();
        }
        let detail = format!(
            "granted ({} MB, {:.2} CPU, {} MB disk) exceeds usable ({} MB, {:.2} CPU, {} MB disk)",
            in_use.memory_mb, in_use.cpu_share, in_use.disk_mb, usable.memory_mb, usable.cpu_share, usable.disk_mb
        );

        let mut newest: Vec<&ResourceAllocation> = allocations.values().collect();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.cycle_id.cmp(&a.cycle_id)));
        let mut blamed = Vec::new();
        for allocation in newest {
            if in_use.fits_within(&usable) {
                break;
            }
            in_use = in_use.saturating_sub(&allocation.granted);
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

    fn allocator() -> ResourceAllocator {
        let config = ResourceConfig {
            per_agent_memory_mb: 4096,
            per_agent_cpu_share: 2.0,
            per_agent_disk_mb: 4096,
            ..ResourceConfig::default()
        };
        // usable: 9000 MB, 4.5 CPU, 9000 MB disk
        ResourceAllocator::with_capacity(config, ResourceRequirements::new(10_000, 5.0, 10_000))
    }

    #[test]
    fn test_usable_capacity_respects_reserve() {
        let a = allocator();
        assert_eq!(a.usable().memory_mb, 9000);
        assert!((a.usable().cpu_share - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_feasibility_rejects_over_cap() {
        let a = allocator();
        let result = a.check_feasible(&ResourceRequirements::new(8192, 1.0, 100));
        assert!(!result.feasible);
        assert!(result.reason.unwrap().contains("per-agent cap"));
    }

    #[test]
    fn test_low_utilization_boosts_within_cap() {
        let a = allocator();
        let allocation = a.allocate("c1", &ResourceRequirements::new(2000, 1.0, 1000)).unwrap();
        assert_eq!(allocation.granted.memory_mb, 3000);
        assert!((allocation.granted.cpu_share - 1.5).abs() < 1e-9);

        let capped = a.allocate("c2", &ResourceRequirements::new(3000, 1.0, 1000)).unwrap();
        assert_eq!(capped.granted.memory_mb, 4096);
    }

    #[test]
    fn test_allocation_never_exceeds_usable() {
        let a = allocator();
        let request = ResourceRequirements::new(2500, 1.0, 1000);
        let mut granted = 0;
        for i in 0..10 {
            if a.allocate(&format!("c{}", i), &request).is_ok() {
                granted += 1;
            }
            assert!(a.check_invariants().is_ok());
        }
        assert!(granted >= 2);
        assert!(a.in_use().memory_mb <= 9000);
    }

    #[test]
    fn test_exhausted_fails_fast() {
        let a = allocator();
        a.allocate("c1", &ResourceRequirements::new(4000, 2.0, 100)).unwrap();
        a.allocate("c2", &ResourceRequirements::new(4000, 2.0, 100)).unwrap();
        let err = a.allocate("c3", &ResourceRequirements::new(4000, 2.0, 100)).unwrap_err();
        assert!(matches!(err, ParallelError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let a = allocator();
        a.allocate("c1", &ResourceRequirements::new(1000, 0.5, 100)).unwrap();
        assert!(a.release("c1").is_some());
        assert!(a.release("c1").is_none());
        assert_eq!(a.in_use(), ResourceRequirements::default());
    }

    #[test]
    fn test_rebalance_moves_capacity_to_pressured_cycle() {
        let a = allocator();
        a.allocate("idle", &ResourceRequirements::new(4000, 1.0, 100)).unwrap();
        a.allocate("busy", &ResourceRequirements::new(2000, 1.0, 100)).unwrap();
        let busy_before = a.get("busy").unwrap().granted.memory_mb;

        a.record_usage("idle", 400, 0.1);
        a.record_usage("busy", busy_before, 1.0);

        let report = a.rebalance();
        assert_eq!(report.shrunk, vec!["idle".to_string()]);
        assert_eq!(report.grown, vec!["busy".to_string()]);
        assert!(a.get("idle").unwrap().granted.memory_mb < 4000);
        assert!(a.get("busy").unwrap().granted.memory_mb > busy_before);
        assert!(a.check_invariants().is_ok());
    }

    #[test]
    fn test_rebalance_skips_unsatisfiable_growth() {
        let config = ResourceConfig {
            reserve_fraction: 0.0,
            low_utilization: 0.0,
            ..ResourceConfig::default()
        };
        let a = ResourceAllocator::with_capacity(config, ResourceRequirements::new(4000, 4.0, 4000));
        a.allocate("a", &ResourceRequirements::new(2000, 1.0, 100)).unwrap();
        a.allocate("b", &ResourceRequirements::new(2000, 1.0, 100)).unwrap();
        let before = a.get("b").unwrap().granted;
        a.record_usage("a", 1990, 0.9);
        a.record_usage("b", before.memory_mb, 0.9);

        let report = a.rebalance();
        assert!(report.skipped.contains(&"b".to_string()));
        assert_eq!(a.get("b").unwrap().granted, before);
        assert!(a.check_invariants().is_ok());
    }
}
