// Parallel coordinator: admission authority and cycle runner
//
// The coordinator owns Cycle lifecycles. Files, compute, agents and tokens
// each belong to their own component; the coordinator only calls into them
// and reacts to what they return. Every admitted cycle runs as its own task
// with explicit suspension points: agent acquisition, dependency and
// sequencing waits, and conflict resolution.

use super::conflicts::{ConflictDetector, ConflictPredictor, CycleProfile, DetectedConflict};
use super::ledger::{ClaimKind, ClaimOutcome, FileClaim, FileConflictLedger};
use super::pool::{AgentPoolManager, ScalingDecision};
use super::resolver::{ConflictContext, ConflictResolver, ContenderInfo, Resolution, ResolutionStrategy, Side};
use super::resources::{RebalanceReport, ResourceAllocator};
use super::structure::changed_unit_names;
use super::tokens::{HeadroomDecision, TokenBudgetManager, TokenRebalanceReport};
use crate::approval::{ApprovalQueue, InMemoryApprovalQueue};
use crate::config::{validate_config, ParallelConfig};
use crate::error::{ParallelError, ParallelResult};
use crate::events::{
    EventBroadcaster, PhaseChangedPayload, ProgressEvent, EVENT_CYCLE_ADMITTED, EVENT_CYCLE_BLOCKED,
    EVENT_CYCLE_COMPLETED, EVENT_CYCLE_FAILED, EVENT_CYCLE_PHASE_CHANGED, EVENT_CYCLE_RESUMED,
};
use crate::executor::retry::{with_retry, RetryConfig};
use crate::executor::{AgentError, AgentExecutor, AgentOutput, AgentTask, DryRunExecutor};
use crate::models::state_machine::{advance_phase, transition_status};
use crate::models::{
    AgentHandle, AgentRequirements, Conflict, ConflictSeverity, Cycle, CycleId, CyclePhase,
    CycleStatus, ResolutionStatus, ResourceRequirements, Story,
};
use crate::storage::{MemoryStore, PersistenceGateway, RecordStore, COLLECTION_CYCLES};
use crate::utils::{generate_id, lock_mutex_recover};
use crate::workspace::{FileStore, MemoryFileStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Writer recorded for content that changed outside any known cycle
const EXTERNAL_WRITER: &str = "external";
/// Bound on check-resolve-retry rounds for one commit
const MAX_INTEGRATION_ROUNDS: usize = 5;
/// Phase duration assumed before any phase has been measured
const DEFAULT_PHASE_MS: u64 = 1_000;
const PHASE_SAMPLE_WINDOW: usize = 64;

/// Requirements an agent must meet to run a phase
pub fn phase_requirements(phase: CyclePhase, compute: &ResourceRequirements) -> AgentRequirements {
    let (capabilities, tools): (&[&str], &[&str]) = match phase {
        CyclePhase::Design => (&["design"], &["read"]),
        CyclePhase::TestRed => (&["test"], &["read", "write", "test-runner"]),
        CyclePhase::CodeGreen | CyclePhase::Refactor => (&["code"], &["read", "write", "test-runner"]),
        CyclePhase::Commit => (&["code"], &["read", "write"]),
        CyclePhase::Failed | CyclePhase::Completed => (&[], &[]),
    };
    AgentRequirements {
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        security_level: 1,
        memory_mb: compute.memory_mb,
        cpu_share: compute.cpu_share,
    }
}

/// Admission preview for one story
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub story_id: String,
    pub admitted: bool,
    pub reason: Option<String>,
    pub hint: Option<String>,
    pub requirements: ResourceRequirements,
    pub predicted: Vec<DetectedConflict>,
    /// Cycles the story would wait on before starting
    pub waits_on: Vec<CycleId>,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub scaling: Vec<ScalingDecision>,
    pub torn_down: usize,
    pub resources: RebalanceReport,
    pub tokens: TokenRebalanceReport,
    pub expired_tokens: Vec<CycleId>,
    pub violations: Vec<String>,
    /// Cycles failed because they broke an invariant
    pub halted: Vec<CycleId>,
}

/// A standing instruction to wait for `leader` and then rebase `files`
#[derive(Debug, Clone)]
struct SequenceOrder {
    leader: CycleId,
    files: Vec<String>,
    conflict_id: String,
}

/// Private overlay of a cycle's changes
#[derive(Debug, Default)]
struct CycleWorkspace {
    /// Content of each file when the cycle first read it
    ancestors: BTreeMap<String, String>,
    /// Changes not yet integrated
    staged: BTreeMap<String, String>,
}

struct CycleRuntime {
    cancel_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    workspace: Mutex<CycleWorkspace>,
    sequence: Mutex<Vec<SequenceOrder>>,
}

impl CycleRuntime {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            done_tx,
            workspace: Mutex::new(CycleWorkspace::default()),
            sequence: Mutex::new(Vec::new()),
        }
    }

    async fn cancelled(&self) {
        wait_flag(&self.cancel_tx).await
    }

    async fn finished(&self) {
        wait_flag(&self.done_tx).await
    }

    fn has_pending_sequence(&self) -> bool {
        !lock_mutex_recover(&self.sequence).is_empty()
    }
}

async fn wait_flag(tx: &watch::Sender<bool>) {
    let mut rx = tx.subscribe();
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct CycleEntry {
    cycle: Cycle,
    story: Story,
    /// Compute the story asked for (grants may differ)
    requirements: ResourceRequirements,
    /// Cycles that were active alongside this one
    peers: Vec<CycleId>,
    runtime: Arc<CycleRuntime>,
}

#[derive(Default)]
struct Registry {
    cycles: HashMap<CycleId, CycleEntry>,
    active_by_story: HashMap<String, CycleId>,
    completed_stories: HashSet<String>,
    failed_stories: HashSet<String>,
    /// Last cycle to integrate each file
    last_writer: HashMap<String, CycleId>,
    phase_ms: VecDeque<u64>,
}

/// Snapshot the admission checks run against
struct AdmissionView {
    active: Vec<CycleProfile>,
    active_by_story: HashMap<String, CycleId>,
    completed: HashSet<String>,
    failed: HashSet<String>,
}

struct Admission {
    requirements: ResourceRequirements,
    predicted: Vec<DetectedConflict>,
    waits_on: Vec<CycleId>,
    shares_context: bool,
}

enum Integration {
    Committed,
    /// The cycle was sent back to CODE_GREEN on a new base
    Rewound,
}

/// Wires the coordinator's collaborators
pub struct CoordinatorBuilder {
    config: ParallelConfig,
    executor: Option<Arc<dyn AgentExecutor>>,
    files: Option<Arc<dyn FileStore>>,
    records: Option<Arc<dyn RecordStore>>,
    approvals: Option<Arc<dyn ApprovalQueue>>,
    predictor: Option<Box<dyn ConflictPredictor>>,
    ladder: Option<Vec<Box<dyn ResolutionStrategy>>>,
    capacity: Option<ResourceRequirements>,
    events: Option<Arc<EventBroadcaster>>,
}

impl CoordinatorBuilder {
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            executor: None,
            files: None,
            records: None,
            approvals: None,
            predictor: None,
            ladder: None,
            capacity: None,
            events: None,
        }
    }

    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalQueue>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn predictor(mut self, predictor: Box<dyn ConflictPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Replace the default merge, reorder, escalate ladder
    pub fn resolution_ladder(mut self, ladder: Vec<Box<dyn ResolutionStrategy>>) -> Self {
        self.ladder = Some(ladder);
        self
    }

    /// Fixed host capacity instead of detecting it
    pub fn capacity(mut self, capacity: ResourceRequirements) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<ParallelCoordinator>> {
        validate_config(&self.config)?;
        let config = Arc::new(self.config);

        let events = self.events.unwrap_or_else(|| Arc::new(EventBroadcaster::new()));
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn RecordStore>);
        let persistence = Arc::new(PersistenceGateway::new(records).with_events(events.clone()));
        let approvals = self
            .approvals
            .unwrap_or_else(|| Arc::new(InMemoryApprovalQueue::new()) as Arc<dyn ApprovalQueue>);

        let detector = match self.predictor {
            Some(predictor) => ConflictDetector::with_predictor(config.conflicts.clone(), predictor),
            None => ConflictDetector::new(config.conflicts.clone()),
        };
        let resolver = match self.ladder {
            Some(ladder) => ConflictResolver::with_ladder(ladder, persistence.clone(), events.clone()),
            None => ConflictResolver::new(&config.conflicts, approvals, persistence.clone(), events.clone()),
        };
        let resources = match self.capacity {
            Some(capacity) => ResourceAllocator::with_capacity(config.resources.clone(), capacity),
            None => ResourceAllocator::new(config.resources.clone()),
        }
        .with_persistence(persistence.clone());
        let pools = AgentPoolManager::new(&config.pools, config.scaling.clone()).with_events(events.clone());
        pools.warm_up();
        let tokens = TokenBudgetManager::new(config.tokens.clone(), config.execution.max_parallel_cycles)
            .with_persistence(persistence.clone());

        let capacity = resources.capacity();
        log::info!(
            "[Coordinator] Ready: {} parallel cycles, {} MB / {:.1} CPU / {} MB disk, {} tokens",
            config.execution.max_parallel_cycles,
            capacity.memory_mb,
            capacity.cpu_share,
            capacity.disk_mb,
            config.tokens.total_budget
        );

        Ok(Arc::new(ParallelCoordinator {
            retry: RetryConfig::from(&config.execution),
            config,
            ledger: FileConflictLedger::new(),
            detector,
            resolver,
            resources,
            pools,
            tokens,
            executor: self.executor.unwrap_or_else(|| Arc::new(DryRunExecutor) as Arc<dyn AgentExecutor>),
            files: self
                .files
                .unwrap_or_else(|| Arc::new(MemoryFileStore::new()) as Arc<dyn FileStore>),
            persistence,
            events,
            registry: Mutex::new(Registry::default()),
            admission_gate: Mutex::new(()),
            file_locks: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct ParallelCoordinator {
    config: Arc<ParallelConfig>,
    ledger: FileConflictLedger,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    resources: ResourceAllocator,
    pools: AgentPoolManager,
    tokens: TokenBudgetManager,
    executor: Arc<dyn AgentExecutor>,
    files: Arc<dyn FileStore>,
    persistence: Arc<PersistenceGateway>,
    events: Arc<EventBroadcaster>,
    retry: RetryConfig,
    registry: Mutex<Registry>,
    /// Serializes admission decisions
    admission_gate: Mutex<()>,
    /// Serializes integration per file
    file_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ParallelCoordinator {
    // ---------------------------------------------------------------------
    // Admission
    // ---------------------------------------------------------------------

    /// Admit a story as a new cycle and start running it.
    ///
    /// Claims, compute and tokens are acquired all-or-nothing; any failure
    /// rolls back what was taken and is reported here, never queued.
    pub fn submit_story(self: &Arc<Self>, story: Story) -> ParallelResult<CycleId> {
        let _gate = lock_mutex_recover(&self.admission_gate);
        let cycle_id = generate_id("cyc");
        let view = self.admission_view();

        let admission = match self.evaluate(&view, &cycle_id, &story, &ResourceRequirements::default()) {
            Ok(admission) => admission,
            Err(err) => {
                log::warn!("[Coordinator] Rejected story {}: {}", story.id, err);
                return Err(err);
            }
        };

        let mut cycle = Cycle::new(cycle_id.clone(), &story);
        cycle.status = transition_status(cycle.status, CycleStatus::Admitted)?;
        if !admission.waits_on.is_empty() {
            cycle.status = transition_status(cycle.status, CycleStatus::Blocked)?;
            cycle.blocked_on = admission.waits_on.clone();
        }
        let files: BTreeSet<String> = story.touched_files.iter().cloned().collect();
        cycle.claimed_files = files.into_iter().collect();

        if let ClaimOutcome::Denied { blockers } =
            self.ledger
                .try_claim_detailed(&cycle_id, &cycle.claimed_files, ClaimKind::Read)
        {
            let detail = blockers
                .first()
                .map(|b| format!("{} is being written by {}", b.file, b.owner))
                .unwrap_or_else(|| "declared files are unavailable".to_string());
            log::warn!("[Coordinator] Rejected story {}: {}", story.id, detail);
            return Err(ParallelError::admission(
                detail,
                "Retry once the commit in progress has finished",
            ));
        }

        let allocation = match self.resources.allocate(&cycle_id, &admission.requirements) {
            Ok(allocation) => allocation,
            Err(err) => {
                self.ledger.release_all(&cycle_id);
                log::warn!("[Coordinator] Rejected story {}: {}", story.id, err);
                return Err(err);
            }
        };
        let tokens = match self.tokens.allocate(
            &cycle_id,
            story.effective_complexity(),
            CyclePhase::Design,
            admission.shares_context,
            view.active.len() + 1,
        ) {
            Ok(tokens) => tokens,
            Err(err) => {
                self.resources.release(&cycle_id);
                self.ledger.release_all(&cycle_id);
                log::warn!("[Coordinator] Rejected story {}: {}", story.id, err);
                return Err(err);
            }
        };
        self.resources.set_token_budget(&cycle_id, tokens.allocated);
        cycle.resource_allocation_id = Some(allocation.id);
        cycle.token_allocation_id = Some(tokens.id);

        let runtime = Arc::new(CycleRuntime::new());
        let peers: Vec<CycleId> = view.active.iter().map(|p| p.cycle_id.clone()).collect();
        {
            let mut registry = lock_mutex_recover(&self.registry);
            for peer in &peers {
                if let Some(entry) = registry.cycles.get_mut(peer) {
                    entry.peers.push(cycle_id.clone());
                }
            }
            registry.active_by_story.insert(story.id.clone(), cycle_id.clone());
            registry.failed_stories.remove(&story.id);
            registry.cycles.insert(
                cycle_id.clone(),
                CycleEntry {
                    cycle: cycle.clone(),
                    story: story.clone(),
                    requirements: admission.requirements,
                    peers,
                    runtime: runtime.clone(),
                },
            );
        }
        self.persist(&cycle);

        for detected in admission.predicted {
            self.resolver.open(detected);
        }

        log::info!(
            "[Coordinator] Admitted story {} as {} ({} file(s), {} tokens)",
            story.id,
            cycle_id,
            cycle.claimed_files.len(),
            tokens.allocated
        );
        self.events.broadcast(
            EVENT_CYCLE_ADMITTED,
            Some(&cycle_id),
            format!("Story {} admitted as {}", story.id, cycle_id),
            &cycle,
        );
        if !cycle.blocked_on.is_empty() {
            self.events.broadcast(
                EVENT_CYCLE_BLOCKED,
                Some(&cycle_id),
                format!("{} waits on {}", cycle_id, cycle.blocked_on.join(", ")),
                serde_json::json!({ "blockedOn": cycle.blocked_on }),
            );
        }

        tokio::spawn(Arc::clone(self).run_cycle(cycle_id.clone(), runtime));
        Ok(cycle_id)
    }

    /// Dry admission preview: evaluates stories in order as if each admitted
    /// one were running, without claiming or allocating anything
    pub fn plan(&self, stories: &[Story]) -> Vec<PlanEntry> {
        let _gate = lock_mutex_recover(&self.admission_gate);
        let mut view = self.admission_view();
        let mut pending = ResourceRequirements::default();
        let mut entries = Vec::with_capacity(stories.len());

        for story in stories {
            let candidate_id = format!("plan-{}", story.id);
            match self.evaluate(&view, &candidate_id, story, &pending) {
                Ok(admission) => {
                    pending = pending.saturating_add(&admission.requirements);
                    view.active.push(CycleProfile {
                        cycle_id: candidate_id.clone(),
                        story: story.clone(),
                        agent_ids: Vec::new(),
                    });
                    view.active_by_story.insert(story.id.clone(), candidate_id);
                    entries.push(PlanEntry {
                        story_id: story.id.clone(),
                        admitted: true,
                        reason: None,
                        hint: None,
                        requirements: admission.requirements,
                        predicted: admission.predicted,
                        waits_on: admission.waits_on,
                    });
                }
                Err(err) => entries.push(PlanEntry {
                    story_id: story.id.clone(),
                    admitted: false,
                    reason: Some(err.to_string()),
                    hint: err.hint(),
                    requirements: self.story_requirements(story),
                    predicted: Vec::new(),
                    waits_on: Vec::new(),
                }),
            }
        }
        entries
    }

    fn admission_view(&self) -> AdmissionView {
        let registry = lock_mutex_recover(&self.registry);
        let mut active: Vec<CycleProfile> = registry
            .cycles
            .values()
            .filter(|e| e.cycle.status.is_active())
            .map(|e| CycleProfile {
                cycle_id: e.cycle.id.clone(),
                story: e.story.clone(),
                agent_ids: e.cycle.agent_ids.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.cycle_id.cmp(&b.cycle_id));
        AdmissionView {
            active,
            active_by_story: registry.active_by_story.clone(),
            completed: registry.completed_stories.clone(),
            failed: registry.failed_stories.clone(),
        }
    }

    /// Compute a story asks for: explicit, or scaled from its complexity
    fn story_requirements(&self, story: &Story) -> ResourceRequirements {
        if let Some(requirements) = story.requirements {
            return requirements;
        }
        let r = &self.config.resources;
        let fraction = 0.25 + 0.05 * story.effective_complexity() as f64;
        ResourceRequirements::new(r.per_agent_memory_mb, r.per_agent_cpu_share, r.per_agent_disk_mb)
            .scale(fraction)
    }

    fn evaluate(
        &self,
        view: &AdmissionView,
        candidate_id: &str,
        story: &Story,
        pending: &ResourceRequirements,
    ) -> ParallelResult<Admission> {
        if story.id.trim().is_empty() {
            return Err(ParallelError::admission(
                "story has no id",
                "Give every story a unique id",
            ));
        }
        if let Some(existing) = view.active_by_story.get(&story.id) {
            return Err(ParallelError::admission(
                format!("story {} is already running as {}", story.id, existing),
                "Wait for the running cycle to finish or cancel it",
            ));
        }

        let max_parallel = self.config.execution.max_parallel_cycles;
        if view.active.len() >= max_parallel {
            return Err(ParallelError::admission(
                format!(
                    "parallel capacity reached ({}/{} cycles active)",
                    view.active.len(),
                    max_parallel
                ),
                "Retry when a running cycle finishes or raise execution.maxParallelCycles",
            ));
        }

        let mut waits_on = Vec::new();
        for dependency in &story.dependencies {
            if view.completed.contains(dependency) {
                continue;
            }
            if let Some(cycle_id) = view.active_by_story.get(dependency) {
                waits_on.push(cycle_id.clone());
                continue;
            }
            if view.failed.contains(dependency) {
                return Err(ParallelError::admission(
                    format!("dependency {} failed", dependency),
                    format!("Fix and complete {} first, then resubmit", dependency),
                ));
            }
            return Err(ParallelError::admission(
                format!("dependency {} is unknown", dependency),
                format!("Submit {} before {}", dependency, story.id),
            ));
        }

        let predicted = self.detector.predict(candidate_id, story, &view.active);
        let threshold = self.config.execution.reject_conflict_probability;
        // Cycles it waits on never run alongside it
        let blocking = predicted.iter().find(|c| {
            c.severity == ConflictSeverity::Critical
                && c.probability >= threshold
                && !c.cycles.iter().any(|id| waits_on.contains(id))
        });
        if let Some(blocking) = blocking {
            let other = blocking
                .cycles
                .iter()
                .find(|id| id.as_str() != candidate_id)
                .cloned()
                .unwrap_or_default();
            return Err(ParallelError::admission(
                format!(
                    "{} {} conflict with {} on {} (p={:.2})",
                    blocking.severity, blocking.kind, other, blocking.resource_id, blocking.probability
                ),
                format!("Submit after {} completes, or declare disjoint units", other),
            ));
        }

        let requirements = self.story_requirements(story);
        let feasibility = self.resources.check_feasible_with(&requirements, pending);
        if !feasibility.feasible {
            return Err(ParallelError::admission(
                feasibility
                    .reason
                    .unwrap_or_else(|| "compute is not available".to_string()),
                "Wait for running cycles to release compute or lower the story's requirements",
            ));
        }

        for phase in CyclePhase::WORK_PHASES {
            let Some(role) = phase.role() else { continue };
            if !self.pools.can_satisfy(role, &phase_requirements(phase, &requirements)) {
                return Err(ParallelError::AgentPoolExhausted {
                    role,
                    reason: format!("no {} agent can satisfy the {} requirements", role, phase),
                });
            }
        }

        let shares_context = view.active.iter().any(|p| {
            p.story.touched_files.iter().any(|f| story.touched_files.contains(f))
                || (story.epic_id.is_some() && p.story.epic_id == story.epic_id)
        });

        Ok(Admission {
            requirements,
            predicted,
            waits_on,
            shares_context,
        })
    }

    // ---------------------------------------------------------------------
    // Cycle runner
    // ---------------------------------------------------------------------

    async fn run_cycle(self: Arc<Self>, cycle_id: CycleId, runtime: Arc<CycleRuntime>) {
        let outcome = tokio::select! {
            biased;
            _ = runtime.cancelled() => Err(ParallelError::Cancelled(cycle_id.clone())),
            result = self.drive(&cycle_id, &runtime) => result,
        };
        self.finish(&cycle_id, outcome);
    }

    async fn drive(&self, cycle_id: &str, runtime: &Arc<CycleRuntime>) -> ParallelResult<()> {
        self.await_dependencies(cycle_id).await?;
        self.update_cycle(cycle_id, |c| {
            c.status = transition_status(c.status, CycleStatus::Running)?;
            Ok(())
        })?;

        loop {
            // Phase boundary: honour any sequencing decided by another cycle
            self.follow(cycle_id, runtime).await?;

            let phase = self.phase_of(cycle_id)?;
            if phase.is_terminal() {
                return Ok(());
            }

            self.run_phase(cycle_id, runtime, phase).await?;

            if phase == CyclePhase::Commit {
                if let Integration::Rewound = self.integrate(cycle_id, runtime).await? {
                    continue;
                }
            }
            self.advance(cycle_id, phase)?;
        }
    }

    async fn await_dependencies(&self, cycle_id: &str) -> ParallelResult<()> {
        let waits: Vec<(CycleId, Arc<CycleRuntime>)> = {
            let registry = lock_mutex_recover(&self.registry);
            let entry = registry
                .cycles
                .get(cycle_id)
                .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))?;
            entry
                .cycle
                .blocked_on
                .iter()
                .filter_map(|id| registry.cycles.get(id).map(|e| (id.clone(), e.runtime.clone())))
                .collect()
        };
        if waits.is_empty() {
            return Ok(());
        }

        for (dependency, runtime) in waits {
            log::info!("[Coordinator] {} waiting on dependency {}", cycle_id, dependency);
            runtime.finished().await;
            let finished = self.cycle(&dependency);
            if finished.as_ref().map(|c| c.status) != Some(CycleStatus::Completed) {
                let story = finished.map(|c| c.story_id).unwrap_or(dependency);
                return Err(ParallelError::DependencyFailed {
                    cycle_id: cycle_id.to_string(),
                    dependency: story,
                });
            }
        }

        let cycle = self.update_cycle(cycle_id, |c| {
            c.blocked_on.clear();
            Ok(())
        })?;
        self.events.broadcast(
            EVENT_CYCLE_RESUMED,
            Some(cycle_id),
            format!("{} dependencies completed", cycle_id),
            &cycle,
        );
        Ok(())
    }

    async fn run_phase(
        &self,
        cycle_id: &str,
        runtime: &Arc<CycleRuntime>,
        phase: CyclePhase,
    ) -> ParallelResult<()> {
        let Some(role) = phase.role() else {
            return Ok(());
        };
        let (story, compute) = {
            let registry = lock_mutex_recover(&self.registry);
            let entry = registry
                .cycles
                .get(cycle_id)
                .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))?;
            (entry.story.clone(), entry.requirements)
        };

        let requirements = phase_requirements(phase, &compute);
        let timeout = Duration::from_secs(self.config.execution.agent_timeout_secs);
        let acquired = with_retry(
            |_attempt| self.pools.acquire(role, cycle_id, &requirements, timeout),
            &self.retry,
            ParallelError::is_recoverable,
        )
        .await;
        let agent = acquired.result?;
        self.update_cycle(cycle_id, |c| {
            if !c.agent_ids.contains(&agent.id) {
                c.agent_ids.push(agent.id.clone());
            }
            Ok(())
        })?;

        let started = Instant::now();
        let result = match self.build_task(cycle_id, runtime, &story, phase) {
            Ok(task) => self.execute_phase(&agent, task).await,
            Err(err) => Err(err),
        };
        self.pools.release_agent(&agent.id);
        self.update_cycle(cycle_id, |c| {
            c.agent_ids.retain(|id| id != &agent.id);
            Ok(())
        })?;
        let output = result?;

        {
            let mut registry = lock_mutex_recover(&self.registry);
            registry.phase_ms.push_back(started.elapsed().as_millis() as u64);
            while registry.phase_ms.len() > PHASE_SAMPLE_WINDOW {
                registry.phase_ms.pop_front();
            }
        }
        self.tokens.record_usage(cycle_id, output.tokens_used);
        if let Some(usage) = output.usage {
            self.resources.record_usage(cycle_id, usage.memory_mb, usage.cpu_share);
        }
        log::info!(
            "[Coordinator] {} finished {} with {} ({} file(s) changed, {} tokens)",
            cycle_id,
            phase,
            agent.id,
            output.writes.len(),
            output.tokens_used
        );
        self.stage(runtime, output.writes)
    }

    fn build_task(
        &self,
        cycle_id: &str,
        runtime: &CycleRuntime,
        story: &Story,
        phase: CyclePhase,
    ) -> ParallelResult<AgentTask> {
        let mut base_contents = BTreeMap::new();
        for file in &story.touched_files {
            let known = lock_mutex_recover(&runtime.workspace).ancestors.contains_key(file);
            if !known {
                let stored = self.read_file(file)?;
                lock_mutex_recover(&runtime.workspace)
                    .ancestors
                    .entry(file.clone())
                    .or_insert(stored);
            }
            let workspace = lock_mutex_recover(&runtime.workspace);
            let view = workspace
                .staged
                .get(file)
                .or_else(|| workspace.ancestors.get(file))
                .cloned()
                .unwrap_or_default();
            base_contents.insert(file.clone(), view);
        }

        Ok(AgentTask {
            cycle_id: cycle_id.to_string(),
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            phase,
            files: story.touched_files.clone(),
            base_contents,
            token_budget: self.token_budget(cycle_id, story, phase)?,
            compress_context: false,
        })
    }

    /// Current budget, re-requested if the allocation lapsed
    fn token_budget(&self, cycle_id: &str, story: &Story, phase: CyclePhase) -> ParallelResult<u64> {
        if let Some(allocation) = self.tokens.get(cycle_id) {
            return Ok(allocation.allocated);
        }
        log::warn!("[Coordinator] Token allocation for {} lapsed; requesting a new one", cycle_id);
        let allocation = self.tokens.allocate(
            cycle_id,
            story.effective_complexity(),
            phase,
            false,
            self.active_count(),
        )?;
        self.resources.set_token_budget(cycle_id, allocation.allocated);
        Ok(allocation.allocated)
    }

    /// Run a task with backoff for transient errors. A context overflow asks
    /// the token manager for headroom once, then reruns with a bigger budget
    /// or with context compression.
    async fn execute_phase(&self, agent: &AgentHandle, mut task: AgentTask) -> ParallelResult<AgentOutput> {
        let mut headroom_requested = false;
        loop {
            let outcome = with_retry(
                |_attempt| self.executor.execute(agent, task.clone()),
                &self.retry,
                AgentError::is_retryable,
            )
            .await;
            match outcome.result {
                Ok(output) => return Ok(output),
                Err(AgentError::ContextOverflow { needed, .. }) if !headroom_requested => {
                    headroom_requested = true;
                    match self.tokens.request_headroom(&task.cycle_id, needed) {
                        HeadroomDecision::Granted { allocated } => {
                            self.resources.set_token_budget(&task.cycle_id, allocated);
                            task.token_budget = allocated;
                        }
                        HeadroomDecision::Compress { allowed } => {
                            task.token_budget = allowed;
                            task.compress_context = true;
                        }
                    }
                }
                Err(error) => {
                    log::warn!(
                        "[Coordinator] {} failed {} after {} attempt(s): {}",
                        task.cycle_id,
                        task.phase,
                        outcome.attempts,
                        error
                    );
                    return Err(ParallelError::AgentExecutionFailed {
                        cycle_id: task.cycle_id.clone(),
                        attempts: outcome.attempts,
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    /// Put agent writes into the cycle's overlay
    fn stage(&self, runtime: &CycleRuntime, writes: BTreeMap<String, String>) -> ParallelResult<()> {
        for (file, content) in writes {
            let known = lock_mutex_recover(&runtime.workspace).ancestors.contains_key(&file);
            if !known {
                let stored = self.read_file(&file)?;
                lock_mutex_recover(&runtime.workspace)
                    .ancestors
                    .entry(file.clone())
                    .or_insert(stored);
            }
            let mut workspace = lock_mutex_recover(&runtime.workspace);
            if workspace.ancestors.get(&file) == Some(&content) {
                workspace.staged.remove(&file);
            } else {
                workspace.staged.insert(file, content);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Integration
    // ---------------------------------------------------------------------

    fn file_lock(&self, file: &str) -> Arc<AsyncMutex<()>> {
        lock_mutex_recover(&self.file_locks)
            .entry(file.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Stored content of a project file; a missing file reads as empty
    fn read_file(&self, file: &str) -> ParallelResult<String> {
        self.files
            .read(file)
            .map(Option::unwrap_or_default)
            .map_err(|e| ParallelError::ProjectStorage(format!("read of {} failed: {}", file, e)))
    }

    /// Write the cycle's staged changes to project storage under write-claims.
    ///
    /// Per-file locks are only held while checking and writing; every
    /// resolution runs with them released, and the next round re-checks the
    /// stored content before writing.
    async fn integrate(&self, cycle_id: &str, runtime: &Arc<CycleRuntime>) -> ParallelResult<Integration> {
        let files: Vec<String> = lock_mutex_recover(&runtime.workspace).staged.keys().cloned().collect();
        if files.is_empty() {
            log::info!("[Coordinator] {} has nothing to integrate", cycle_id);
            return Ok(Integration::Committed);
        }

        let mut lifted: Vec<(CycleId, String)> = Vec::new();
        let mut last_conflict = None;
        for _ in 0..MAX_INTEGRATION_ROUNDS {
            // Sorted order, so overlapping commits cannot deadlock
            let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(files.len());
            for file in &files {
                guards.push(self.file_lock(file).lock_owned().await);
            }

            if runtime.has_pending_sequence() {
                drop(guards);
                self.restore_lifted(&lifted);
                self.follow(cycle_id, runtime).await?;
                return Ok(Integration::Rewound);
            }

            // Content that moved since this cycle read it
            let mut moved = Vec::new();
            for file in &files {
                let stored = self.read_file(file)?;
                let workspace = lock_mutex_recover(&runtime.workspace);
                let ancestor = workspace.ancestors.get(file).cloned().unwrap_or_default();
                if stored != ancestor {
                    let mine = workspace.staged.get(file).cloned().unwrap_or_default();
                    moved.push((file.clone(), ancestor, mine, stored));
                }
            }
            if !moved.is_empty() {
                drop(guards);
                for (file, ancestor, mine, stored) in moved {
                    let (conflict_id, ctx) = self.moved_conflict(cycle_id, &file, &ancestor, &mine, &stored);
                    last_conflict = Some(conflict_id.clone());
                    match self.resolver.resolve(&conflict_id, &ctx).await {
                        Resolution::Merged { content } => {
                            let mut workspace = lock_mutex_recover(&runtime.workspace);
                            workspace.staged.insert(file.clone(), content);
                            workspace.ancestors.insert(file, stored);
                        }
                        Resolution::Sequenced { leader, .. } => {
                            log::info!(
                                "[Coordinator] {} rebases {} onto the change by {}",
                                cycle_id,
                                file,
                                leader
                            );
                            self.restore_lifted(&lifted);
                            self.rebase(cycle_id, runtime, std::slice::from_ref(&file))?;
                            self.rewind(cycle_id)?;
                            return Ok(Integration::Rewound);
                        }
                        Resolution::Abandoned { reason } => {
                            self.restore_lifted(&lifted);
                            return Err(ParallelError::ConflictAbandoned { conflict_id, reason });
                        }
                    }
                }
                continue;
            }

            let blockers = match self.ledger.try_claim_detailed(cycle_id, &files, ClaimKind::Write) {
                ClaimOutcome::Granted => {
                    let written = self.write_staged(cycle_id, runtime, &files);
                    self.ledger.downgrade(cycle_id, &files);
                    drop(guards);
                    self.restore_lifted(&lifted);
                    written?;
                    return Ok(Integration::Committed);
                }
                ClaimOutcome::Denied { blockers } => blockers,
            };
            drop(guards);

            // Claim contention with cycles still working on the same files
            for (file, owners) in group_blockers(blockers) {
                let (conflict_id, ctx) = self.contention_conflict(cycle_id, runtime, &file, &owners);
                last_conflict = Some(conflict_id.clone());
                match self.resolver.resolve(&conflict_id, &ctx).await {
                    Resolution::Merged { content } => {
                        lock_mutex_recover(&runtime.workspace)
                            .staged
                            .insert(file.clone(), content);
                        // Their overlays keep the old ancestor; they merge at their own commit
                        for owner in owners {
                            self.ledger.release(&owner, std::slice::from_ref(&file));
                            lifted.push((owner, file.clone()));
                        }
                    }
                    Resolution::Sequenced { leader, followers } if leader == cycle_id => {
                        for follower in &followers {
                            self.order_follow(follower, cycle_id, &file, &conflict_id);
                        }
                    }
                    Resolution::Sequenced { leader, followers } => {
                        for follower in followers.iter().filter(|f| f.as_str() != cycle_id) {
                            self.order_follow(follower, &leader, &file, &conflict_id);
                        }
                        self.restore_lifted(&lifted);
                        lock_mutex_recover(&runtime.sequence).push(SequenceOrder {
                            leader,
                            files: vec![file],
                            conflict_id,
                        });
                        self.follow(cycle_id, runtime).await?;
                        return Ok(Integration::Rewound);
                    }
                    Resolution::Abandoned { reason } => {
                        self.restore_lifted(&lifted);
                        return Err(ParallelError::ConflictAbandoned { conflict_id, reason });
                    }
                }
            }
        }

        self.restore_lifted(&lifted);
        Err(ParallelError::ConflictAbandoned {
            conflict_id: last_conflict.unwrap_or_default(),
            reason: format!("integration still contended after {} rounds", MAX_INTEGRATION_ROUNDS),
        })
    }

    fn write_staged(&self, cycle_id: &str, runtime: &CycleRuntime, files: &[String]) -> ParallelResult<()> {
        let staged = lock_mutex_recover(&runtime.workspace).staged.clone();
        for file in files {
            let Some(content) = staged.get(file) else { continue };
            let exclusive = self.ledger.writer_of(file).as_deref() == Some(cycle_id)
                && self.ledger.holders(file, cycle_id).is_empty();
            if !exclusive {
                let message = format!("{} is not exclusively write-claimed by {}", file, cycle_id);
                log::error!("[Coordinator] {}", message);
                return Err(ParallelError::InvariantViolation(message));
            }
            self.files
                .write(file, content)
                .map_err(|e| ParallelError::ProjectStorage(format!("write of {} failed: {}", file, e)))?;
            lock_mutex_recover(&self.registry)
                .last_writer
                .insert(file.clone(), cycle_id.to_string());
            let mut workspace = lock_mutex_recover(&runtime.workspace);
            workspace.ancestors.insert(file.clone(), content.clone());
            workspace.staged.remove(file);
        }
        log::info!("[Coordinator] {} integrated {} file(s)", cycle_id, files.len());
        Ok(())
    }

    /// Give read claims lifted for a merge back to cycles still running
    fn restore_lifted(&self, lifted: &[(CycleId, String)]) {
        for (owner, file) in lifted {
            if !self.is_active(owner) {
                continue;
            }
            if !self.ledger.try_claim(owner, std::slice::from_ref(file), ClaimKind::Read) {
                log::debug!("[Coordinator] Could not restore read claim of {} on {}", owner, file);
            }
        }
    }

    /// Tell `follower` to wait for `leader` and rebase `file`
    fn order_follow(&self, follower: &str, leader: &str, file: &str, conflict_id: &str) {
        let Some(runtime) = self.runtime_of(follower) else { return };
        {
            let mut orders = lock_mutex_recover(&runtime.sequence);
            match orders.iter_mut().find(|o| o.leader == leader) {
                Some(order) => {
                    if !order.files.iter().any(|f| f == file) {
                        order.files.push(file.to_string());
                    }
                }
                None => orders.push(SequenceOrder {
                    leader: leader.to_string(),
                    files: vec![file.to_string()],
                    conflict_id: conflict_id.to_string(),
                }),
            }
        }
        self.ledger.release(follower, &[file.to_string()]);
        log::info!("[Coordinator] {} will follow {} on {}", follower, leader, file);
    }

    /// Wait for every leader this cycle was sequenced behind, then rebase
    async fn follow(&self, cycle_id: &str, runtime: &Arc<CycleRuntime>) -> ParallelResult<()> {
        let orders: Vec<SequenceOrder> = std::mem::take(&mut *lock_mutex_recover(&runtime.sequence));
        if orders.is_empty() {
            return Ok(());
        }
        let mut leaders: Vec<CycleId> = Vec::new();
        let mut files: BTreeSet<String> = BTreeSet::new();
        for order in &orders {
            if !leaders.contains(&order.leader) {
                leaders.push(order.leader.clone());
            }
            files.extend(order.files.iter().cloned());
        }
        let files: Vec<String> = files.into_iter().collect();

        let cycle = self.update_cycle(cycle_id, |c| {
            c.status = transition_status(c.status, CycleStatus::Blocked)?;
            c.blocked_on = leaders.clone();
            Ok(())
        })?;
        log::info!(
            "[Coordinator] {} blocked behind {} (conflict {})",
            cycle_id,
            leaders.join(", "),
            orders.iter().map(|o| o.conflict_id.as_str()).collect::<Vec<_>>().join(", ")
        );
        self.events.broadcast(
            EVENT_CYCLE_BLOCKED,
            Some(cycle_id),
            format!("{} sequenced behind {}", cycle_id, leaders.join(", ")),
            serde_json::json!({ "blockedOn": cycle.blocked_on, "files": files }),
        );
        self.ledger.release(cycle_id, &files);

        for leader in &leaders {
            if let Some(leader_runtime) = self.runtime_of(leader) {
                leader_runtime.finished().await;
            }
        }

        self.rebase(cycle_id, runtime, &files)?;
        let cycle = self.update_cycle(cycle_id, |c| {
            c.status = transition_status(c.status, CycleStatus::Running)?;
            c.blocked_on.clear();
            Ok(())
        })?;
        self.events.broadcast(
            EVENT_CYCLE_RESUMED,
            Some(cycle_id),
            format!("{} resumed on a rebased view of {} file(s)", cycle_id, files.len()),
            &cycle,
        );
        self.rewind(cycle_id)
    }

    /// Drop staged changes to `files` and re-read them as the new ancestors
    fn rebase(&self, cycle_id: &str, runtime: &CycleRuntime, files: &[String]) -> ParallelResult<()> {
        for file in files {
            let stored = self.read_file(file)?;
            let mut workspace = lock_mutex_recover(&runtime.workspace);
            workspace.staged.remove(file);
            workspace.ancestors.insert(file.clone(), stored);
        }
        if !self.ledger.try_claim(cycle_id, files, ClaimKind::Read) {
            log::debug!("[Coordinator] {} could not re-claim its rebased files yet", cycle_id);
        }
        Ok(())
    }

    fn moved_conflict(
        &self,
        cycle_id: &str,
        file: &str,
        ancestor: &str,
        mine: &str,
        stored: &str,
    ) -> (String, ConflictContext) {
        let (writer, other, committer, mut other_info, wait_graph) = {
            let registry = lock_mutex_recover(&self.registry);
            let last = registry
                .last_writer
                .get(file)
                .cloned()
                .unwrap_or_else(|| EXTERNAL_WRITER.to_string());
            (
                Self::profile_of(&registry, cycle_id),
                Self::profile_of(&registry, &last),
                Self::contender_of(&registry, cycle_id),
                Self::contender_of(&registry, &last),
                Self::wait_graph_of(&registry),
            )
        };
        other_info.finished = true;

        let writer_units = changed_unit_names(ancestor, mine);
        let other_units = changed_unit_names(ancestor, stored);
        let detected = self
            .detector
            .runtime_conflict(file, &writer, &other, &writer_units, Some(&other_units));
        let conflict = self.resolver.open(detected);

        let ctx = ConflictContext {
            file: file.to_string(),
            ancestor: ancestor.to_string(),
            committer,
            committer_content: mine.to_string(),
            others: vec![Side {
                info: other_info,
                content: Some(stored.to_string()),
            }],
            wait_graph,
        };
        (conflict.id, ctx)
    }

    fn contention_conflict(
        &self,
        cycle_id: &str,
        runtime: &CycleRuntime,
        file: &str,
        owners: &[CycleId],
    ) -> (String, ConflictContext) {
        let (ancestor, mine) = {
            let workspace = lock_mutex_recover(&runtime.workspace);
            (
                workspace.ancestors.get(file).cloned().unwrap_or_default(),
                workspace.staged.get(file).cloned().unwrap_or_default(),
            )
        };
        let my_units = changed_unit_names(&ancestor, &mine);

        let (writer, committer, others, wait_graph) = {
            let registry = lock_mutex_recover(&self.registry);
            let others: Vec<(CycleProfile, ContenderInfo, Option<Arc<CycleRuntime>>)> = owners
                .iter()
                .map(|owner| {
                    (
                        Self::profile_of(&registry, owner),
                        Self::contender_of(&registry, owner),
                        registry.cycles.get(owner).map(|e| e.runtime.clone()),
                    )
                })
                .collect();
            (
                Self::profile_of(&registry, cycle_id),
                Self::contender_of(&registry, cycle_id),
                others,
                Self::wait_graph_of(&registry),
            )
        };

        let mut sides = Vec::with_capacity(others.len());
        let mut detections = Vec::with_capacity(others.len());
        for (profile, info, other_runtime) in others {
            // Their change only counts when it was made on the same base
            let content = other_runtime.and_then(|rt| {
                let workspace = lock_mutex_recover(&rt.workspace);
                match workspace.ancestors.get(file) {
                    Some(theirs) if *theirs == ancestor => workspace.staged.get(file).cloned(),
                    _ => None,
                }
            });
            let units = content.as_ref().map(|c| changed_unit_names(&ancestor, c));
            detections.push(self.detector.runtime_conflict(
                file,
                &writer,
                &profile,
                &my_units,
                units.as_ref(),
            ));
            sides.push(Side { info, content });
        }

        ConflictDetector::rank(&mut detections);
        let mut detected = detections.swap_remove(0);
        detected.cycles = std::iter::once(cycle_id.to_string())
            .chain(owners.iter().cloned())
            .collect();
        let conflict = self.resolver.open(detected);

        let ctx = ConflictContext {
            file: file.to_string(),
            ancestor,
            committer,
            committer_content: mine,
            others: sides,
            wait_graph,
        };
        (conflict.id, ctx)
    }

    fn profile_of(registry: &Registry, cycle_id: &str) -> CycleProfile {
        match registry.cycles.get(cycle_id) {
            Some(entry) => CycleProfile {
                cycle_id: cycle_id.to_string(),
                story: entry.story.clone(),
                agent_ids: entry.cycle.agent_ids.clone(),
            },
            None => CycleProfile {
                cycle_id: cycle_id.to_string(),
                story: Story::new(cycle_id, Vec::new()),
                agent_ids: Vec::new(),
            },
        }
    }

    fn contender_of(registry: &Registry, cycle_id: &str) -> ContenderInfo {
        let Some(entry) = registry.cycles.get(cycle_id) else {
            return ContenderInfo {
                cycle_id: cycle_id.to_string(),
                priority: 0,
                estimated_remaining_ms: 0,
                unresolved_dependencies: 0,
                complexity: 1,
                finished: true,
            };
        };
        let per_phase = if registry.phase_ms.is_empty() {
            DEFAULT_PHASE_MS
        } else {
            registry.phase_ms.iter().sum::<u64>() / registry.phase_ms.len() as u64
        };
        let unresolved_dependencies = entry
            .cycle
            .blocked_on
            .iter()
            .filter(|id| {
                registry
                    .cycles
                    .get(*id)
                    .map(|e| !e.cycle.status.is_terminal())
                    .unwrap_or(false)
            })
            .count();
        ContenderInfo {
            cycle_id: cycle_id.to_string(),
            priority: entry.cycle.priority,
            estimated_remaining_ms: per_phase * entry.cycle.phase.remaining_work_phases() as u64,
            unresolved_dependencies,
            complexity: entry.cycle.complexity,
            finished: entry.cycle.status.is_terminal(),
        }
    }

    /// Who waits on whom: blocked cycles plus sequencing not yet followed
    fn wait_graph_of(registry: &Registry) -> HashMap<CycleId, Vec<CycleId>> {
        let mut graph: HashMap<CycleId, Vec<CycleId>> = HashMap::new();
        for (id, entry) in &registry.cycles {
            if entry.cycle.status.is_terminal() {
                continue;
            }
            let mut waits = entry.cycle.blocked_on.clone();
            for order in lock_mutex_recover(&entry.runtime.sequence).iter() {
                if !waits.contains(&order.leader) {
                    waits.push(order.leader.clone());
                }
            }
            if !waits.is_empty() {
                graph.insert(id.clone(), waits);
            }
        }
        graph
    }

    // ---------------------------------------------------------------------
    // Lifecycle bookkeeping
    // ---------------------------------------------------------------------

    fn persist(&self, cycle: &Cycle) {
        self.persistence.save(COLLECTION_CYCLES, &cycle.id, cycle);
    }

    fn update_cycle<F>(&self, cycle_id: &str, mutate: F) -> ParallelResult<Cycle>
    where
        F: FnOnce(&mut Cycle) -> ParallelResult<()>,
    {
        let cycle = {
            let mut registry = lock_mutex_recover(&self.registry);
            let entry = registry
                .cycles
                .get_mut(cycle_id)
                .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))?;
            mutate(&mut entry.cycle)?;
            entry.cycle.touch();
            entry.cycle.clone()
        };
        self.persist(&cycle);
        Ok(cycle)
    }

    fn phase_of(&self, cycle_id: &str) -> ParallelResult<CyclePhase> {
        self.cycle(cycle_id)
            .map(|c| c.phase)
            .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))
    }

    fn advance(&self, cycle_id: &str, from: CyclePhase) -> ParallelResult<()> {
        let Some(next) = from.next() else {
            return Ok(());
        };
        let cycle = self.update_cycle(cycle_id, |c| {
            c.phase = advance_phase(c.phase, next)?;
            Ok(())
        })?;
        self.phase_entered(&cycle, from);
        Ok(())
    }

    /// Send a cycle past CODE_GREEN back to it
    fn rewind(&self, cycle_id: &str) -> ParallelResult<()> {
        let mut previous = None;
        let cycle = self.update_cycle(cycle_id, |c| {
            if matches!(c.phase, CyclePhase::Refactor | CyclePhase::Commit) {
                previous = Some(c.phase);
                c.phase = advance_phase(c.phase, CyclePhase::CodeGreen)?;
            }
            Ok(())
        })?;
        if let Some(previous) = previous {
            self.phase_entered(&cycle, previous);
        }
        Ok(())
    }

    fn phase_entered(&self, cycle: &Cycle, previous: CyclePhase) {
        if cycle.phase.role().is_some() {
            if let Some(allocation) = self.tokens.on_phase_change(&cycle.id, cycle.phase, self.active_count()) {
                self.resources.set_token_budget(&cycle.id, allocation.allocated);
            }
        }
        log::info!("[Coordinator] {} {} -> {}", cycle.id, previous, cycle.phase);
        self.events.broadcast(
            EVENT_CYCLE_PHASE_CHANGED,
            Some(&cycle.id),
            format!("{}: {} -> {}", cycle.story_id, previous, cycle.phase),
            PhaseChangedPayload {
                story_id: cycle.story_id.clone(),
                old_phase: previous.to_string(),
                new_phase: cycle.phase.to_string(),
            },
        );
    }

    /// Release everything the cycle holds and record its outcome.
    /// Safe to call more than once; only the first call reports.
    fn finish(&self, cycle_id: &str, outcome: ParallelResult<()>) {
        self.pools.release(cycle_id);
        self.ledger.release_all(cycle_id);
        self.resources.release(cycle_id);
        self.tokens.release(cycle_id);

        let finished = {
            let mut registry = lock_mutex_recover(&self.registry);
            let Some(entry) = registry.cycles.get_mut(cycle_id) else {
                return;
            };
            if entry.cycle.status.is_terminal() {
                None
            } else {
                let target = if outcome.is_ok() {
                    CycleStatus::Completed
                } else {
                    CycleStatus::Failed
                };
                let status = match transition_status(entry.cycle.status, target) {
                    Ok(status) => status,
                    Err(err) => {
                        log::error!("[Coordinator] {}: {}; marking failed", cycle_id, err);
                        CycleStatus::Failed
                    }
                };
                entry.cycle.status = status;
                entry.cycle.phase = if status == CycleStatus::Completed {
                    CyclePhase::Completed
                } else {
                    CyclePhase::Failed
                };
                entry.cycle.error = outcome.as_ref().err().map(|e| e.to_string());
                entry.cycle.agent_ids.clear();
                entry.cycle.claimed_files.clear();
                entry.cycle.blocked_on.clear();
                entry.cycle.touch();

                let cycle = entry.cycle.clone();
                let story_id = entry.story.id.clone();
                let runtime = entry.runtime.clone();
                let peers = entry.peers.clone();
                if registry.active_by_story.get(&story_id).map(String::as_str) == Some(cycle_id) {
                    registry.active_by_story.remove(&story_id);
                }
                if status == CycleStatus::Completed {
                    registry.completed_stories.insert(story_id);
                } else {
                    registry.failed_stories.insert(story_id);
                }
                Some((cycle, runtime, peers))
            }
        };
        let Some((cycle, runtime, peers)) = finished else {
            return;
        };

        self.persist(&cycle);
        match &outcome {
            Ok(()) => {
                log::info!("[Coordinator] {} completed story {}", cycle.id, cycle.story_id);
                self.events.broadcast(
                    EVENT_CYCLE_COMPLETED,
                    Some(&cycle.id),
                    format!("Story {} completed", cycle.story_id),
                    &cycle,
                );
            }
            Err(err) => {
                let hint = err.hint().map(|h| format!(" ({})", h)).unwrap_or_default();
                match err {
                    ParallelError::ConflictAbandoned { .. } | ParallelError::InvariantViolation(_) => {
                        log::error!("[Coordinator] {} failed: {}", cycle.id, err)
                    }
                    _ => log::warn!("[Coordinator] {} failed: {}", cycle.id, err),
                }
                self.events.broadcast(
                    EVENT_CYCLE_FAILED,
                    Some(&cycle.id),
                    format!("Story {} failed: {}{}", cycle.story_id, err, hint),
                    &cycle,
                );
            }
        }
        runtime.done_tx.send_replace(true);
        self.settle_conflicts(&cycle.id, &peers);
    }

    /// Feed pair outcomes back to the detector and close predictions whose
    /// cycles have all finished
    fn settle_conflicts(&self, cycle_id: &str, peers: &[CycleId]) {
        let (story, finished_peers) = {
            let registry = lock_mutex_recover(&self.registry);
            let story = registry.cycles.get(cycle_id).map(|e| e.story.clone());
            let finished_peers: Vec<(CycleId, Story)> = peers
                .iter()
                .filter_map(|id| registry.cycles.get(id))
                .filter(|e| e.cycle.status.is_terminal())
                .map(|e| (e.cycle.id.clone(), e.story.clone()))
                .collect();
            (story, finished_peers)
        };

        let observed: Vec<Conflict> = self.resolver.list().into_iter().filter(|c| !c.predicted).collect();
        if let Some(story) = story {
            for (peer_id, peer_story) in &finished_peers {
                let collided = observed.iter().any(|c| c.involves(cycle_id) && c.involves(peer_id));
                self.detector.record_outcome(&story, peer_story, collided);
            }
        }

        for predicted in self.resolver.involving(cycle_id) {
            if !predicted.predicted || predicted.status != ResolutionStatus::Unresolved {
                continue;
            }
            if !predicted.cycles.iter().all(|id| !self.is_active_or_pending(id)) {
                continue;
            }
            let mirror = observed.iter().find(|c| {
                predicted.cycles.iter().all(|id| c.involves(id))
                    && (c.resource_id == predicted.resource_id || predicted.resource_id.starts_with("story:"))
            });
            self.resolver.close_predicted(&predicted.id, mirror);
        }
    }

    fn runtime_of(&self, cycle_id: &str) -> Option<Arc<CycleRuntime>> {
        lock_mutex_recover(&self.registry)
            .cycles
            .get(cycle_id)
            .map(|e| e.runtime.clone())
    }

    fn is_active(&self, cycle_id: &str) -> bool {
        self.cycle(cycle_id).map(|c| c.status.is_active()).unwrap_or(false)
    }

    fn is_active_or_pending(&self, cycle_id: &str) -> bool {
        self.cycle(cycle_id).map(|c| !c.status.is_terminal()).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Control and queries
    // ---------------------------------------------------------------------

    /// Cancel a cycle. Claims, compute, tokens and agents are released before
    /// this returns and the cycle is reported FAILED.
    pub fn cancel(&self, cycle_id: &str) -> ParallelResult<()> {
        let runtime = self
            .runtime_of(cycle_id)
            .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))?;
        log::info!("[Coordinator] Cancelling {}", cycle_id);
        self.halt(cycle_id, &runtime, ParallelError::Cancelled(cycle_id.to_string()));
        Ok(())
    }

    /// Stop a cycle's task and fail it with `error`
    fn halt(&self, cycle_id: &str, runtime: &CycleRuntime, error: ParallelError) {
        runtime.cancel_tx.send_replace(true);
        self.finish(cycle_id, Err(error));
    }

    /// Wait until a cycle reaches COMPLETED or FAILED
    pub async fn wait_for(&self, cycle_id: &str) -> ParallelResult<Cycle> {
        let runtime = self
            .runtime_of(cycle_id)
            .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))?;
        runtime.finished().await;
        self.cycle(cycle_id)
            .ok_or_else(|| ParallelError::CycleNotFound(cycle_id.to_string()))
    }

    /// Wait until no cycle is running, including ones admitted meanwhile
    pub async fn wait_all(&self) -> Vec<Cycle> {
        loop {
            let running: Vec<Arc<CycleRuntime>> = {
                let registry = lock_mutex_recover(&self.registry);
                registry
                    .cycles
                    .values()
                    .filter(|e| !e.cycle.status.is_terminal())
                    .map(|e| e.runtime.clone())
                    .collect()
            };
            if running.is_empty() {
                return self.cycles();
            }
            for runtime in running {
                runtime.finished().await;
            }
        }
    }

    /// One maintenance pass: scale pools, rebalance compute and tokens,
    /// expire stale token allocations and audit invariants
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let scaling = self.pools.auto_scale();
        let torn_down = self.pools.teardown_idle();
        let resources = self.resources.rebalance();
        let tokens = self.tokens.rebalance();
        for allocation in self.tokens.allocations() {
            self.resources.set_token_budget(&allocation.cycle_id, allocation.allocated);
        }
        let expired_tokens = self.tokens.expire_stale();

        let mut violations = Vec::new();
        let mut halted: Vec<CycleId> = Vec::new();
        for violation in self
            .ledger
            .violations()
            .into_iter()
            .chain(self.pools.violations())
            .chain(self.resources.violations())
            .chain(self.tokens.violations())
        {
            log::error!("[Coordinator] Invariant violated: {}", violation.detail);
            for cycle_id in &violation.cycles {
                if halted.contains(cycle_id) || !self.is_active_or_pending(cycle_id) {
                    continue;
                }
                let Some(runtime) = self.runtime_of(cycle_id) else { continue };
                self.halt(
                    cycle_id,
                    &runtime,
                    ParallelError::InvariantViolation(violation.detail.clone()),
                );
                halted.push(cycle_id.clone());
            }
            violations.push(violation.detail);
        }

        MaintenanceReport {
            scaling,
            torn_down,
            resources,
            tokens,
            expired_tokens,
            violations,
            halted,
        }
    }

    /// Run maintenance every `maintenanceIntervalSecs` until the coordinator is dropped
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.execution.maintenance_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                let report = coordinator.run_maintenance();
                log::debug!(
                    "[Coordinator] Maintenance: {} scaling change(s), {} torn down, {} token allocation(s) expired",
                    report.scaling.len(),
                    report.torn_down,
                    report.expired_tokens.len()
                );
            }
        })
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn cycle(&self, cycle_id: &str) -> Option<Cycle> {
        lock_mutex_recover(&self.registry)
            .cycles
            .get(cycle_id)
            .map(|e| e.cycle.clone())
    }

    /// All cycles, oldest first
    pub fn cycles(&self) -> Vec<Cycle> {
        let mut cycles: Vec<Cycle> = lock_mutex_recover(&self.registry)
            .cycles
            .values()
            .map(|e| e.cycle.clone())
            .collect();
        cycles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        cycles
    }

    pub fn active_count(&self) -> usize {
        lock_mutex_recover(&self.registry)
            .cycles
            .values()
            .filter(|e| e.cycle.status.is_active())
            .count()
    }

    /// Conflict audit log, oldest first
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.resolver.list()
    }

    pub fn claims(&self) -> Vec<FileClaim> {
        self.ledger.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn ledger(&self) -> &FileConflictLedger {
        &self.ledger
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn resources(&self) -> &ResourceAllocator {
        &self.resources
    }

    pub fn pools(&self) -> &AgentPoolManager {
        &self.pools
    }

    pub fn tokens(&self) -> &TokenBudgetManager {
        &self.tokens
    }

    pub fn persistence(&self) -> &PersistenceGateway {
        &self.persistence
    }
}

/// Distinct owners per contested file, files in order
fn group_blockers(blockers: Vec<FileClaim>) -> BTreeMap<String, Vec<CycleId>> {
    let mut by_file: BTreeMap<String, Vec<CycleId>> = BTreeMap::new();
    for blocker in blockers {
        let owners = by_file.entry(blocker.file).or_default();
        if !owners.contains(&blocker.owner) {
            owners.push(blocker.owner);
        }
    }
    by_file
}
