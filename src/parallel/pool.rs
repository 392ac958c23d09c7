// Per-role agent pools with bounded waits and auto-scaling

use crate::config::{PoolConfig, PoolsConfig, ScalingConfig};
use crate::error::{first_violation, ParallelError, ParallelResult, Violation};
use crate::events::{EventBroadcaster, PoolScaledPayload, EVENT_POOL_SCALED};
use crate::models::{AgentHandle, AgentRequirements, AgentRole, CycleId};
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Samples kept for wait/service/arrival statistics
const SAMPLE_WINDOW: usize = 32;
/// Arrivals older than this do not count toward the arrival rate
const ARRIVAL_WINDOW: Duration = Duration::from_secs(60);

/// Pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub role: AgentRole,
    pub min_size: usize,
    pub max_size: usize,
    pub available: usize,
    pub busy: usize,
    pub waiting: usize,
    pub utilization: f64,
    pub mean_wait_ms: f64,
    pub mean_service_ms: f64,
}

#[derive(Debug, Clone)]
struct IdleAgent {
    handle: AgentHandle,
    idle_since: Instant,
}

#[derive(Debug, Clone)]
struct LentAgent {
    handle: AgentHandle,
    cycle_id: CycleId,
    lent_at: Instant,
}

struct RolePool {
    role: AgentRole,
    config: PoolConfig,
    available: Vec<IdleAgent>,
    busy: HashMap<String, LentAgent>,
    waiting: usize,
    next_seq: u64,
    wait_ms: VecDeque<u64>,
    service_ms: VecDeque<u64>,
    arrivals: VecDeque<Instant>,
}

fn push_sample<T>(samples: &mut VecDeque<T>, value: T) {
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(value);
}

fn mean(samples: &VecDeque<u64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

impl RolePool {
    fn new(role: AgentRole, config: PoolConfig) -> Self {
        Self {
            role,
            config,
            available: Vec::new(),
            busy: HashMap::new(),
            waiting: 0,
            next_seq: 1,
            wait_ms: VecDeque::new(),
            service_ms: VecDeque::new(),
            arrivals: VecDeque::new(),
        }
    }

    fn size(&self) -> usize {
        self.available.len() + self.busy.len()
    }

    fn utilization(&self) -> f64 {
        if self.size() == 0 {
            if self.waiting > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            self.busy.len() as f64 / self.size() as f64
        }
    }

    /// Template every agent of this role is created from
    fn template(&self) -> AgentHandle {
        AgentHandle {
            id: String::new(),
            role: self.role,
            capabilities: self.config.capabilities.clone(),
            tools: self.config.tools.clone(),
            security_level: self.config.security_level,
            memory_mb: self.config.memory_mb,
            cpu_share: self.config.cpu_share,
        }
    }

    fn create_agent(&mut self) -> AgentHandle {
        let mut handle = self.template();
        handle.id = format!("{}-{}", self.role, self.next_seq);
        self.next_seq += 1;
        handle
    }

    fn lend(&mut self, handle: AgentHandle, cycle_id: &str) -> AgentHandle {
        self.busy.insert(
            handle.id.clone(),
            LentAgent {
                handle: handle.clone(),
                cycle_id: cycle_id.to_string(),
                lent_at: Instant::now(),
            },
        );
        handle
    }

    fn arrival_rate_per_ms(&mut self) -> f64 {
        let now = Instant::now();
        while let Some(front) = self.arrivals.front() {
            if now.duration_since(*front) > ARRIVAL_WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        let Some(first) = self.arrivals.front() else {
            return 0.0;
        };
        let span_ms = now.duration_since(*first).as_millis().max(1) as f64;
        self.arrivals.len() as f64 / span_ms
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            role: self.role,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            available: self.available.len(),
            busy: self.busy.len(),
            waiting: self.waiting,
            utilization: self.utilization(),
            mean_wait_ms: mean(&self.wait_ms),
            mean_service_ms: mean(&self.service_ms),
        }
    }
}

/// Outcome of one scaling decision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingDecision {
    pub role: AgentRole,
    pub old_size: usize,
    pub new_size: usize,
}

pub struct AgentPoolManager {
    scaling: ScalingConfig,
    pools: Mutex<BTreeMap<AgentRole, RolePool>>,
    notifiers: HashMap<AgentRole, Arc<Notify>>,
    events: Option<Arc<EventBroadcaster>>,
}

impl AgentPoolManager {
    pub fn new(pools: &PoolsConfig, scaling: ScalingConfig) -> Self {
        let mut registry = BTreeMap::new();
        let mut notifiers = HashMap::new();
        for role in AgentRole::ALL {
            registry.insert(role, RolePool::new(role, pools.for_role(role).clone()));
            notifiers.insert(role, Arc::new(Notify::new()));
        }
        Self {
            scaling,
            pools: Mutex::new(registry),
            notifiers,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    fn notifier(&self, role: AgentRole) -> Arc<Notify> {
        self.notifiers
            .get(&role)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn emit_scaled(&self, decision: &ScalingDecision) {
        log::info!(
            "[AgentPool] {} pool scaled {} -> {}",
            decision.role,
            decision.old_size,
            decision.new_size
        );
        if let Some(events) = &self.events {
            events.broadcast(
                EVENT_POOL_SCALED,
                None,
                format!(
                    "{} pool {} -> {} agents",
                    decision.role, decision.old_size, decision.new_size
                ),
                PoolScaledPayload {
                    role: decision.role.to_string(),
                    old_size: decision.old_size,
                    new_size: decision.new_size,
                },
            );
        }
    }

    /// True when agents of this role are built with allow-lists and ceilings
    /// that cover the request
    pub fn can_satisfy(&self, role: AgentRole, requirements: &AgentRequirements) -> bool {
        let pools = lock_mutex_recover(&self.pools);
        pools
            .get(&role)
            .map(|pool| pool.config.max_size > 0 && pool.template().dominates(requirements))
            .unwrap_or(false)
    }

    /// Lend an agent to a cycle, waiting up to `timeout` when the pool is at max
    pub async fn acquire(
        &self,
        role: AgentRole,
        cycle_id: &str,
        requirements: &AgentRequirements,
        timeout: Duration,
    ) -> ParallelResult<AgentHandle> {
        if !self.can_satisfy(role, requirements) {
            return Err(ParallelError::AgentPoolExhausted {
                role,
                reason: "no agent of this role is permitted the requested capabilities, tools or ceilings"
                    .to_string(),
            });
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let notify = self.notifier(role);
        let mut counted_arrival = false;

        loop {
            // Registering before checking means a release between the check
            // and the await still wakes us
            let notified = notify.notified();
            {
                let mut pools = lock_mutex_recover(&self.pools);
                let Some(pool) = pools.get_mut(&role) else {
                    return Err(ParallelError::AgentPoolExhausted {
                        role,
                        reason: "pool not configured".to_string(),
                    });
                };
                if !counted_arrival {
                    push_sample(&mut pool.arrivals, started);
                    counted_arrival = true;
                }

                let found = pool
                    .available
                    .iter()
                    .position(|idle| idle.handle.dominates(requirements));
                let handle = match found {
                    Some(idx) => Some(pool.available.remove(idx).handle),
                    None if pool.size() < pool.config.max_size => Some(pool.create_agent()),
                    None => None,
                };

                if let Some(handle) = handle {
                    let waited = started.elapsed().as_millis() as u64;
                    push_sample(&mut pool.wait_ms, waited);
                    let handle = pool.lend(handle, cycle_id);
                    log::debug!(
                        "[AgentPool] Lent {} to {} after {}ms ({}/{} busy)",
                        handle.id,
                        cycle_id,
                        waited,
                        pool.busy.len(),
                        pool.config.max_size
                    );
                    return Ok(handle);
                }
                pool.waiting += 1;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let woke = !remaining.is_zero() && tokio::time::timeout(remaining, notified).await.is_ok();

            {
                let mut pools = lock_mutex_recover(&self.pools);
                if let Some(pool) = pools.get_mut(&role) {
                    pool.waiting = pool.waiting.saturating_sub(1);
                    if !woke {
                        push_sample(&mut pool.wait_ms, started.elapsed().as_millis() as u64);
                    }
                }
            }

            if !woke {
                log::warn!(
                    "[AgentPool] {} timed out after {}ms waiting for a {} agent",
                    cycle_id,
                    timeout.as_millis(),
                    role
                );
                return Err(ParallelError::AgentPoolExhausted {
                    role,
                    reason: format!("all {} agents busy for {}ms", role, timeout.as_millis()),
                });
            }
        }
    }

    fn return_agents(&self, predicate: impl Fn(&LentAgent) -> bool) -> usize {
        let mut freed: Vec<AgentRole> = Vec::new();
        {
            let mut pools = lock_mutex_recover(&self.pools);
            for pool in pools.values_mut() {
                let ids: Vec<String> = pool
                    .busy
                    .iter()
                    .filter(|(_, lent)| predicate(lent))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    if let Some(lent) = pool.busy.remove(&id) {
                        push_sample(&mut pool.service_ms, lent.lent_at.elapsed().as_millis() as u64);
                        log::debug!("[AgentPool] {} returned by {}", id, lent.cycle_id);
                        pool.available.push(IdleAgent {
                            handle: lent.handle,
                            idle_since: Instant::now(),
                        });
                        freed.push(pool.role);
                    }
                }
            }
        }
        let returned = freed.len();
        // Every waiter rechecks the pool
        freed.sort();
        freed.dedup();
        for role in &freed {
            self.notifier(*role).notify_waiters();
        }
        returned
    }

    /// Return every agent lent to a cycle. Safe to call more than once.
    pub fn release(&self, cycle_id: &str) -> usize {
        self.return_agents(|lent| lent.cycle_id == cycle_id)
    }

    /// Return a single agent
    pub fn release_agent(&self, agent_id: &str) -> bool {
        self.return_agents(|lent| lent.handle.id == agent_id) > 0
    }

    /// Agents currently lent to a cycle
    pub fn lent_to(&self, cycle_id: &str) -> Vec<AgentHandle> {
        let pools = lock_mutex_recover(&self.pools);
        pools
            .values()
            .flat_map(|pool| pool.busy.values())
            .filter(|lent| lent.cycle_id == cycle_id)
            .map(|lent| lent.handle.clone())
            .collect()
    }

    /// Bring every pool up to its minimum size
    pub fn warm_up(&self) {
        let mut decisions = Vec::new();
        {
            let mut pools = lock_mutex_recover(&self.pools);
            for pool in pools.values_mut() {
                let old_size = pool.size();
                while pool.size() < pool.config.min_size.min(pool.config.max_size) {
                    let handle = pool.create_agent();
                    pool.available.push(IdleAgent {
                        handle,
                        idle_since: Instant::now(),
                    });
                }
                if pool.size() != old_size {
                    decisions.push(ScalingDecision {
                        role: pool.role,
                        old_size,
                        new_size: pool.size(),
                    });
                }
            }
        }
        for decision in &decisions {
            self.emit_scaled(decision);
        }
    }

    /// Tear down agents idle longer than the cooldown, never below min size
    pub fn teardown_idle(&self) -> usize {
        let cooldown = Duration::from_secs(self.scaling.idle_cooldown_secs);
        self.teardown_idle_older_than(cooldown)
    }

    fn teardown_idle_older_than(&self, cooldown: Duration) -> usize {
        let mut decisions = Vec::new();
        let mut removed = 0;
        {
            let mut pools = lock_mutex_recover(&self.pools);
            for pool in pools.values_mut() {
                let old_size = pool.size();
                // Oldest idle agents go first
                pool.available.sort_by_key(|idle| idle.idle_since);
                while pool.size() > pool.config.min_size {
                    match pool.available.first() {
                        Some(idle) if idle.idle_since.elapsed() >= cooldown => {
                            let idle = pool.available.remove(0);
                            log::debug!("[AgentPool] Tearing down idle {}", idle.handle.id);
                            removed += 1;
                        }
                        _ => break,
                    }
                }
                if pool.size() != old_size {
                    decisions.push(ScalingDecision {
                        role: pool.role,
                        old_size,
                        new_size: pool.size(),
                    });
                }
            }
        }
        for decision in &decisions {
            self.emit_scaled(decision);
        }
        removed
    }

    /// Grow pools that are hot and slow to serve, shrink pools that are cold.
    /// Target size comes from arrival rate x mean service time, with growth per
    /// step capped by the max growth ratio.
    pub fn auto_scale(&self) -> Vec<ScalingDecision> {
        let mut decisions = Vec::new();
        {
            let mut pools = lock_mutex_recover(&self.pools);
            for pool in pools.values_mut() {
                let old_size = pool.size();
                let utilization = pool.utilization();
                let mean_wait = mean(&pool.wait_ms);
                let offered_load = pool.arrival_rate_per_ms() * mean(&pool.service_ms);

                if utilization > self.scaling.upper_utilization
                    && mean_wait > self.scaling.acceptable_wait_ms as f64
                    && old_size < pool.config.max_size
                {
                    let max_step = ((old_size as f64 * self.scaling.max_growth_ratio).ceil() as usize).max(1);
                    let wanted = (offered_load / self.scaling.upper_utilization).ceil() as usize;
                    let target = wanted
                        .max(old_size + 1)
                        .min(old_size + max_step)
                        .min(pool.config.max_size);
                    while pool.size() < target {
                        let handle = pool.create_agent();
                        pool.available.push(IdleAgent {
                            handle,
                            idle_since: Instant::now(),
                        });
                    }
                    pool.wait_ms.clear();
                } else if utilization < self.scaling.lower_utilization
                    && mean_wait < self.scaling.low_wait_ms as f64
                    && old_size > pool.config.min_size
                {
                    let max_step = ((old_size as f64 * self.scaling.max_growth_ratio).ceil() as usize).max(1);
                    let wanted = (offered_load / self.scaling.upper_utilization).ceil() as usize;
                    let target = wanted
                        .max(pool.busy.len())
                        .max(pool.config.min_size)
                        .max(old_size.saturating_sub(max_step));
                    pool.available.sort_by_key(|idle| idle.idle_since);
                    while pool.size() > target && !pool.available.is_empty() {
                        pool.available.remove(0);
                    }
                }

                if pool.size() != old_size {
                    decisions.push(ScalingDecision {
                        role: pool.role,
                        old_size,
                        new_size: pool.size(),
                    });
                }
            }
        }

        let grown: Vec<AgentRole> = decisions
            .iter()
            .filter(|d| d.new_size > d.old_size)
            .map(|d| d.role)
            .collect();
        for decision in &decisions {
            self.emit_scaled(decision);
        }
        for role in grown {
            self.notifier(role).notify_waiters();
        }
        decisions
    }

    pub fn stats(&self, role: AgentRole) -> Option<PoolStats> {
        lock_mutex_recover(&self.pools).get(&role).map(RolePool::stats)
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        lock_mutex_recover(&self.pools).values().map(RolePool::stats).collect()
    }

    /// Oversized pools, and agents both idle and lent (blaming the borrower)
    pub fn violations(&self) -> Vec<Violation> {
        let pools = lock_mutex_recover(&self.pools);
        let mut violations = Vec::new();
        for pool in pools.values() {
            if pool.size() > pool.config.max_size {
                violations.push(Violation::new(
                    format!(
                        "{} pool holds {} agents, max {}",
                        pool.role,
                        pool.size(),
                        pool.config.max_size
                    ),
                    Vec::new(),
                ));
            }
            for idle in &pool.available {
                if let Some(lent) = pool.busy.get(&idle.handle.id) {
                    violations.push(Violation::new(
                        format!("{} is both available and lent to {}", idle.handle.id, lent.cycle_id),
                        vec![lent.cycle_id.clone()],
                    ));
                }
            }
        }
        violations
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        first_violation(self.violations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(min: usize, max: usize) -> Arc<AgentPoolManager> {
        let mut pools = PoolsConfig::default();
        pools.code.min_size = min;
        pools.code.max_size = max;
        Arc::new(AgentPoolManager::new(&pools, ScalingConfig::default()))
    }

    fn code_request() -> AgentRequirements {
        AgentRequirements {
            capabilities: vec!["code".into()],
            tools: vec!["write".into()],
            security_level: 1,
            memory_mb: 1024,
            cpu_share: 1.0,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_up_to_max() {
        let m = manager(1, 2);
        let a = m.acquire(AgentRole::Code, "c1", &code_request(), Duration::from_millis(10)).await.unwrap();
        let b = m.acquire(AgentRole::Code, "c2", &code_request(), Duration::from_millis(10)).await.unwrap();
        assert_ne!(a.id, b.id);

        let err = m
            .acquire(AgentRole::Code, "c3", &code_request(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ParallelError::AgentPoolExhausted { role: AgentRole::Code, .. }));
        assert!(m.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_agent() {
        let m = manager(1, 1);
        let first = m.acquire(AgentRole::Code, "c1", &code_request(), Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let m = m.clone();
            tokio::spawn(async move {
                m.acquire(AgentRole::Code, "c2", &code_request(), Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(m.stats(AgentRole::Code).unwrap().waiting, 1);

        assert_eq!(m.release("c1"), 1);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(m.lent_to("c2").len(), 1);
    }

    #[tokio::test]
    async fn test_security_is_enforced() {
        let m = manager(1, 3);
        let mut request = code_request();
        request.tools.push("shell".into());
        let err = m
            .acquire(AgentRole::Code, "c1", &request, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ParallelError::AgentPoolExhausted { .. }));
        assert_eq!(m.stats(AgentRole::Code).unwrap().busy, 0);

        request = code_request();
        request.security_level = 5;
        assert!(!m.can_satisfy(AgentRole::Code, &request));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let m = manager(1, 2);
        m.acquire(AgentRole::Code, "c1", &code_request(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(m.release("c1"), 1);
        assert_eq!(m.release("c1"), 0);
        let stats = m.stats(AgentRole::Code).unwrap();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn test_warm_up_and_teardown_respect_min() {
        let m = manager(2, 3);
        m.warm_up();
        assert_eq!(m.stats(AgentRole::Code).unwrap().available, 2);
        assert_eq!(m.stats(AgentRole::Design).unwrap().available, 1);

        assert_eq!(m.teardown_idle_older_than(Duration::ZERO), 0);
        assert_eq!(m.stats(AgentRole::Code).unwrap().available, 2);
    }

    #[tokio::test]
    async fn test_teardown_above_min() {
        let m = manager(1, 3);
        for cycle in ["c1", "c2", "c3"] {
            m.acquire(AgentRole::Code, cycle, &code_request(), Duration::from_millis(10)).await.unwrap();
        }
        for cycle in ["c1", "c2", "c3"] {
            m.release(cycle);
        }
        assert_eq!(m.teardown_idle_older_than(Duration::ZERO), 2);
        assert_eq!(m.stats(AgentRole::Code).unwrap().available, 1);
    }

    #[tokio::test]
    async fn test_auto_scale_grows_hot_pool() {
        let mut pools = PoolsConfig::default();
        pools.code.min_size = 1;
        pools.code.max_size = 4;
        let scaling = ScalingConfig {
            acceptable_wait_ms: 0,
            ..ScalingConfig::default()
        };
        let m = AgentPoolManager::new(&pools, scaling);
        m.acquire(AgentRole::Code, "c1", &code_request(), Duration::from_millis(10)).await.unwrap();
        {
            let mut registry = lock_mutex_recover(&m.pools);
            let pool = registry.get_mut(&AgentRole::Code).unwrap();
            push_sample(&mut pool.wait_ms, 500);
        }
        let decisions = m.auto_scale();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].old_size, 1);
        assert_eq!(decisions[0].new_size, 2);
        assert!(m.check_invariants().is_ok());
    }
}
