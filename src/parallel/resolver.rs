// Conflict resolution ladder: structural merge, sequential reorder, human escalation
//
// The resolver is the only writer of Conflict records. Each strategy is tried
// in order and the first success wins; every attempt is kept on the record.

use super::conflicts::DetectedConflict;
use super::structure::{self, MergeOutcome};
use crate::approval::{
    ApprovalOutcome, ApprovalQueue, ApprovalRequest, OperatorResponse, SideDiff, Suggestion,
};
use crate::config::{ConflictConfig, EscalationFallback};
use crate::events::{
    EventBroadcaster, EVENT_CONFLICT_DETECTED, EVENT_CONFLICT_ESCALATED, EVENT_CONFLICT_RESOLVED,
};
use crate::models::{
    Conflict, CycleId, ResolutionAttempt, ResolutionStatus, StrategyKind,
};
use crate::storage::{PersistenceGateway, COLLECTION_CONFLICTS};
use crate::utils::{generate_id, lock_mutex_recover};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ranking inputs for a cycle taking part in a conflict
#[derive(Debug, Clone)]
pub struct ContenderInfo {
    pub cycle_id: CycleId,
    pub priority: i32,
    pub estimated_remaining_ms: u64,
    pub unresolved_dependencies: usize,
    pub complexity: u8,
    /// Already finished; its change is in storage and cannot be reordered
    pub finished: bool,
}

/// Another side of a contested file
#[derive(Debug, Clone)]
pub struct Side {
    pub info: ContenderInfo,
    /// This side's content for the file, `None` if it has not changed it
    pub content: Option<String>,
}

/// Everything a strategy needs to decide
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub file: String,
    /// Content both sides started from
    pub ancestor: String,
    /// The cycle trying to write
    pub committer: ContenderInfo,
    pub committer_content: String,
    pub others: Vec<Side>,
    /// Existing waits: cycle -> cycles it waits on
    pub wait_graph: HashMap<CycleId, Vec<CycleId>>,
}

impl ConflictContext {
    fn contenders(&self) -> Vec<ContenderInfo> {
        std::iter::once(self.committer.clone())
            .chain(self.others.iter().map(|s| s.info.clone()))
            .collect()
    }
}

/// What a single strategy concluded
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// The committer may write `content`
    Merged { content: String, confidence: f64 },
    Sequenced {
        leader: CycleId,
        followers: Vec<CycleId>,
        confidence: f64,
    },
    Failed { reason: String },
    Abandoned { reason: String },
}

/// Final decision handed back to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Merged { content: String },
    Sequenced { leader: CycleId, followers: Vec<CycleId> },
    Abandoned { reason: String },
}

#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn attempt(&self, conflict: &Conflict, ctx: &ConflictContext) -> StrategyOutcome;
}

/// Rank contenders: finished first, then priority desc, remaining time asc,
/// unresolved dependencies asc, complexity asc, id for determinism
pub fn rank_contenders(contenders: &[ContenderInfo]) -> Vec<ContenderInfo> {
    let mut ranked = contenders.to_vec();
    ranked.sort_by(|a, b| {
        b.finished
            .cmp(&a.finished)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.estimated_remaining_ms.cmp(&b.estimated_remaining_ms))
            .then_with(|| a.unresolved_dependencies.cmp(&b.unresolved_dependencies))
            .then_with(|| a.complexity.cmp(&b.complexity))
            .then_with(|| a.cycle_id.cmp(&b.cycle_id))
    });
    ranked
}

/// True if making `followers` wait on `leader` closes a wait cycle
pub fn creates_wait_cycle(
    wait_graph: &HashMap<CycleId, Vec<CycleId>>,
    leader: &str,
    followers: &[CycleId],
) -> bool {
    let targets: HashSet<&str> = followers.iter().map(String::as_str).collect();
    let mut stack = vec![leader.to_string()];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        for next in wait_graph.get(&current).into_iter().flatten() {
            if targets.contains(next.as_str()) {
                return true;
            }
            stack.push(next.clone());
        }
    }
    false
}

fn sequence_with(ctx: &ConflictContext, leader: &str) -> Option<(CycleId, Vec<CycleId>)> {
    let followers: Vec<CycleId> = ctx
        .contenders()
        .into_iter()
        .filter(|c| c.cycle_id != leader && !c.finished)
        .map(|c| c.cycle_id)
        .collect();
    if creates_wait_cycle(&ctx.wait_graph, leader, &followers) {
        return None;
    }
    Some((leader.to_string(), followers))
}

/// Step 1: union disjoint unit changes onto the ancestor
pub struct StructuralMerge;

#[async_trait]
impl ResolutionStrategy for StructuralMerge {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StructuralMerge
    }

    async fn attempt(&self, _conflict: &Conflict, ctx: &ConflictContext) -> StrategyOutcome {
        // Every side must be compatible with every other
        let mut combined = ctx.committer_content.clone();
        for side in &ctx.others {
            let Some(content) = &side.content else { continue };
            match structure::merge_three_way(&ctx.ancestor, &combined, content) {
                MergeOutcome::Merged(merged) => combined = merged,
                MergeOutcome::Conflict(units) => {
                    return StrategyOutcome::Failed {
                        reason: format!(
                            "{} and {} both changed {}",
                            ctx.committer.cycle_id,
                            side.info.cycle_id,
                            units.join(", ")
                        ),
                    };
                }
            }
        }

        // Only changes already in storage are written alongside the committer's
        let mut content = ctx.committer_content.clone();
        for side in ctx.others.iter().filter(|s| s.info.finished) {
            if let Some(theirs) = &side.content {
                if let MergeOutcome::Merged(merged) =
                    structure::merge_three_way(&ctx.ancestor, &content, theirs)
                {
                    content = merged;
                }
            }
        }
        StrategyOutcome::Merged {
            content,
            confidence: 0.95,
        }
    }
}

/// Step 2: let the top-ranked contender go first
pub struct SequentialReorder;

#[async_trait]
impl ResolutionStrategy for SequentialReorder {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SequentialReorder
    }

    async fn attempt(&self, _conflict: &Conflict, ctx: &ConflictContext) -> StrategyOutcome {
        let ranked = rank_contenders(&ctx.contenders());
        let Some(top) = ranked.first() else {
            return StrategyOutcome::Failed {
                reason: "no contenders".to_string(),
            };
        };
        match sequence_with(ctx, &top.cycle_id) {
            Some((leader, followers)) => StrategyOutcome::Sequenced {
                leader,
                followers,
                confidence: 0.8,
            },
            None => StrategyOutcome::Failed {
                reason: format!("sequencing behind {} would create a wait cycle", top.cycle_id),
            },
        }
    }
}

/// Step 3: ask an operator, falling back after the timeout
pub struct HumanEscalation {
    queue: Arc<dyn ApprovalQueue>,
    timeout: Duration,
    fallback: EscalationFallback,
}

impl HumanEscalation {
    pub fn new(queue: Arc<dyn ApprovalQueue>, timeout: Duration, fallback: EscalationFallback) -> Self {
        Self {
            queue,
            timeout,
            fallback,
        }
    }

    fn build_request(&self, conflict: &Conflict, ctx: &ConflictContext) -> ApprovalRequest {
        let mut diffs = vec![SideDiff {
            cycle_id: ctx.committer.cycle_id.clone(),
            changed_units: structure::changed_unit_names(&ctx.ancestor, &ctx.committer_content)
                .into_iter()
                .collect(),
            diff: structure::render_diff(&ctx.ancestor, &ctx.committer_content),
        }];
        for side in &ctx.others {
            let content = side.content.as_deref().unwrap_or(&ctx.ancestor);
            diffs.push(SideDiff {
                cycle_id: side.info.cycle_id.clone(),
                changed_units: structure::changed_unit_names(&ctx.ancestor, content)
                    .into_iter()
                    .collect(),
                diff: structure::render_diff(&ctx.ancestor, content),
            });
        }

        let grid_sides: Vec<(&str, &str)> = std::iter::once((
            ctx.committer.cycle_id.as_str(),
            ctx.committer_content.as_str(),
        ))
        .chain(ctx.others.iter().map(|s| {
            (
                s.info.cycle_id.as_str(),
                s.content.as_deref().unwrap_or(&ctx.ancestor),
            )
        }))
        .collect();

        let mut suggestions = Vec::new();
        for (rank, contender) in rank_contenders(&ctx.contenders()).iter().enumerate() {
            if sequence_with(ctx, &contender.cycle_id).is_some() {
                suggestions.push(Suggestion {
                    strategy: StrategyKind::SequentialReorder,
                    confidence: (0.8 - 0.15 * rank as f64).max(0.1),
                    description: format!("Let {} finish first, then rebase the others", contender.cycle_id),
                    leader: Some(contender.cycle_id.clone()),
                });
            }
        }
        suggestions.push(Suggestion {
            strategy: StrategyKind::StructuralMerge,
            confidence: 0.2,
            description: format!("Hand-merge {} ({})", ctx.file, conflict.units.join(", ")),
            leader: None,
        });
        suggestions.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

        ApprovalRequest {
            id: generate_id("apr"),
            conflict_id: conflict.id.clone(),
            resource_id: ctx.file.clone(),
            cycles: conflict.cycles.clone(),
            diffs,
            visualization: structure::render_unit_grid(&ctx.ancestor, &grid_sides),
            suggestions,
            timeout_secs: self.timeout.as_secs(),
            created_at: Utc::now(),
        }
    }

    fn apply_fallback(&self, ctx: &ConflictContext) -> StrategyOutcome {
        match self.fallback {
            EscalationFallback::ForceSequential => {
                for contender in rank_contenders(&ctx.contenders()) {
                    if let Some((leader, followers)) = sequence_with(ctx, &contender.cycle_id) {
                        return StrategyOutcome::Sequenced {
                            leader,
                            followers,
                            confidence: 0.5,
                        };
                    }
                }
                StrategyOutcome::Abandoned {
                    reason: "escalation timed out and every ordering creates a wait cycle".to_string(),
                }
            }
            EscalationFallback::Abandon => StrategyOutcome::Abandoned {
                reason: "escalation timed out".to_string(),
            },
        }
    }
}

#[async_trait]
impl ResolutionStrategy for HumanEscalation {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HumanEscalation
    }

    async fn attempt(&self, conflict: &Conflict, ctx: &ConflictContext) -> StrategyOutcome {
        let request = self.build_request(conflict, ctx);
        let request_id = self.queue.enqueue(request).await;

        match self.queue.await_response(&request_id, self.timeout).await {
            ApprovalOutcome::Responded(OperatorResponse::UseContent { content }) => {
                StrategyOutcome::Merged {
                    content,
                    confidence: 1.0,
                }
            }
            ApprovalOutcome::Responded(OperatorResponse::Sequence { leader }) => {
                let finished_leader = ctx
                    .contenders()
                    .into_iter()
                    .find(|c| c.finished)
                    .map(|c| c.cycle_id);
                let leader = finished_leader.unwrap_or(leader);
                match sequence_with(ctx, &leader) {
                    Some((leader, followers)) => StrategyOutcome::Sequenced {
                        leader,
                        followers,
                        confidence: 1.0,
                    },
                    None => {
                        log::warn!(
                            "[ConflictResolver] Operator ordering for {} creates a wait cycle, applying fallback",
                            conflict.id
                        );
                        self.apply_fallback(ctx)
                    }
                }
            }
            ApprovalOutcome::Responded(OperatorResponse::Abandon) => StrategyOutcome::Abandoned {
                reason: "abandoned by operator".to_string(),
            },
            ApprovalOutcome::TimedOut => {
                log::warn!(
                    "[ConflictResolver] Escalation {} timed out after {}s, applying {:?} fallback",
                    request_id,
                    self.timeout.as_secs(),
                    self.fallback
                );
                self.apply_fallback(ctx)
            }
        }
    }
}

pub struct ConflictResolver {
    ladder: Vec<Box<dyn ResolutionStrategy>>,
    conflicts: Mutex<HashMap<String, Conflict>>,
    persistence: Arc<PersistenceGateway>,
    events: Arc<EventBroadcaster>,
}

impl ConflictResolver {
    /// Default ladder: merge, reorder, escalate
    pub fn new(
        config: &ConflictConfig,
        approvals: Arc<dyn ApprovalQueue>,
        persistence: Arc<PersistenceGateway>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        let ladder: Vec<Box<dyn ResolutionStrategy>> = vec![
            Box::new(StructuralMerge),
            Box::new(SequentialReorder),
            Box::new(HumanEscalation::new(
                approvals,
                Duration::from_secs(config.escalation_timeout_secs),
                config.escalation_fallback,
            )),
        ];
        Self::with_ladder(ladder, persistence, events)
    }

    pub fn with_ladder(
        ladder: Vec<Box<dyn ResolutionStrategy>>,
        persistence: Arc<PersistenceGateway>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            ladder,
            conflicts: Mutex::new(HashMap::new()),
            persistence,
            events,
        }
    }

    fn persist(&self, conflict: &Conflict) {
        self.persistence.save(COLLECTION_CONFLICTS, &conflict.id, conflict);
    }

    /// Take ownership of a detected conflict as an UNRESOLVED record
    pub fn open(&self, detected: DetectedConflict) -> Conflict {
        let conflict = Conflict {
            id: generate_id("conf"),
            kind: detected.kind,
            severity: detected.severity,
            probability: detected.probability,
            cycles: detected.cycles,
            resource_id: detected.resource_id,
            units: detected.units,
            predicted: detected.predicted,
            status: ResolutionStatus::Unresolved,
            strategy: None,
            confidence: None,
            outcome: None,
            attempts: Vec::new(),
            detected_at: detected.detected_at,
            resolved_at: None,
        };
        self.persist(&conflict);
        lock_mutex_recover(&self.conflicts).insert(conflict.id.clone(), conflict.clone());

        self.events.broadcast(
            EVENT_CONFLICT_DETECTED,
            conflict.cycles.first().map(String::as_str),
            format!(
                "{} {} conflict on {} between {}",
                conflict.severity,
                conflict.kind,
                conflict.resource_id,
                conflict.cycles.join(", ")
            ),
            &conflict,
        );
        conflict
    }

    /// Apply a status change to a stored record through the state machine
    fn update<F>(&self, conflict_id: &str, apply: F) -> Option<Conflict>
    where
        F: FnOnce(&mut Conflict),
    {
        let snapshot = {
            let mut conflicts = lock_mutex_recover(&self.conflicts);
            let conflict = conflicts.get_mut(conflict_id)?;
            apply(conflict);
            conflict.clone()
        };
        self.persist(&snapshot);
        Some(snapshot)
    }

    fn transition(
        &self,
        conflict_id: &str,
        to: ResolutionStatus,
        strategy: Option<StrategyKind>,
        confidence: Option<f64>,
        outcome: String,
    ) -> Option<Conflict> {
        let mut applied = false;
        let updated = self.update(conflict_id, |c| {
            if !c.status.can_transition_to(to) {
                log::error!(
                    "[ConflictResolver] Refusing {} -> {} on {}",
                    c.status,
                    to,
                    c.id
                );
                return;
            }
            applied = true;
            c.status = to;
            if strategy.is_some() {
                c.strategy = strategy;
            }
            if confidence.is_some() {
                c.confidence = confidence;
            }
            c.outcome = Some(outcome);
            if to.is_final() {
                c.resolved_at = Some(Utc::now());
            }
        })?;
        if !applied {
            return None;
        }

        let event = if to == ResolutionStatus::Escalated {
            EVENT_CONFLICT_ESCALATED
        } else {
            EVENT_CONFLICT_RESOLVED
        };
        self.events.broadcast(
            event,
            updated.cycles.first().map(String::as_str),
            format!(
                "Conflict {} on {} {}: {}",
                updated.id,
                updated.resource_id,
                updated.status,
                updated.outcome.as_deref().unwrap_or("")
            ),
            &updated,
        );
        Some(updated)
    }

    fn record_attempt(&self, conflict_id: &str, attempt: ResolutionAttempt) {
        self.update(conflict_id, |c| c.attempts.push(attempt));
    }

    /// Run the ladder for an open conflict. The first success wins.
    pub async fn resolve(&self, conflict_id: &str, ctx: &ConflictContext) -> Resolution {
        let Some(mut conflict) = self.get(conflict_id) else {
            return Resolution::Abandoned {
                reason: format!("unknown conflict {}", conflict_id),
            };
        };

        for strategy in &self.ladder {
            let kind = strategy.kind();
            if kind == StrategyKind::HumanEscalation {
                if let Some(updated) = self.transition(
                    conflict_id,
                    ResolutionStatus::Escalated,
                    Some(kind),
                    None,
                    "awaiting operator".to_string(),
                ) {
                    conflict = updated;
                }
            }

            let outcome = strategy.attempt(&conflict, ctx).await;
            let (succeeded, confidence, detail) = match &outcome {
                StrategyOutcome::Merged { confidence, .. } => (true, *confidence, "merged".to_string()),
                StrategyOutcome::Sequenced {
                    leader, confidence, ..
                } => (true, *confidence, format!("sequenced behind {}", leader)),
                StrategyOutcome::Failed { reason } => (false, 0.0, reason.clone()),
                StrategyOutcome::Abandoned { reason } => (false, 0.0, reason.clone()),
            };
            self.record_attempt(
                conflict_id,
                ResolutionAttempt {
                    strategy: kind,
                    succeeded,
                    confidence,
                    detail: detail.clone(),
                    at: Utc::now(),
                },
            );
            log::info!(
                "[ConflictResolver] {} on {}: {} -> {}",
                kind,
                conflict_id,
                if succeeded { "ok" } else { "failed" },
                detail
            );

            match outcome {
                StrategyOutcome::Merged { content, confidence } => {
                    self.transition(
                        conflict_id,
                        ResolutionStatus::AutoResolved,
                        Some(kind),
                        Some(confidence),
                        format!("{} merged by {}", ctx.file, kind),
                    );
                    return Resolution::Merged { content };
                }
                StrategyOutcome::Sequenced {
                    leader,
                    followers,
                    confidence,
                } => {
                    self.transition(
                        conflict_id,
                        ResolutionStatus::Sequenced,
                        Some(kind),
                        Some(confidence),
                        format!("{} proceeds first; {} wait", leader, followers.join(", ")),
                    );
                    return Resolution::Sequenced { leader, followers };
                }
                StrategyOutcome::Abandoned { reason } => {
                    return self.abandon(conflict_id, kind, reason);
                }
                StrategyOutcome::Failed { .. } => continue,
            }
        }

        self.abandon(
            conflict_id,
            StrategyKind::HumanEscalation,
            "every resolution strategy failed".to_string(),
        )
    }

    fn abandon(&self, conflict_id: &str, kind: StrategyKind, reason: String) -> Resolution {
        if self
            .get(conflict_id)
            .map(|c| c.status == ResolutionStatus::Unresolved)
            .unwrap_or(false)
        {
            self.transition(
                conflict_id,
                ResolutionStatus::Escalated,
                Some(kind),
                None,
                "no strategy succeeded".to_string(),
            );
        }
        self.transition(
            conflict_id,
            ResolutionStatus::Abandoned,
            Some(kind),
            Some(0.0),
            reason.clone(),
        );
        log::error!("[ConflictResolver] Conflict {} abandoned: {}", conflict_id, reason);
        Resolution::Abandoned { reason }
    }

    /// Close an open predicted conflict, either because the cycles never
    /// collided or by mirroring the runtime conflict that did occur
    pub fn close_predicted(&self, conflict_id: &str, mirror: Option<&Conflict>) {
        let Some(conflict) = self.get(conflict_id) else { return };
        if !conflict.predicted || conflict.status != ResolutionStatus::Unresolved {
            return;
        }
        match mirror {
            Some(runtime) if runtime.status.is_final() => {
                let status = if runtime.status == ResolutionStatus::Abandoned {
                    self.transition(
                        conflict_id,
                        ResolutionStatus::Escalated,
                        runtime.strategy,
                        None,
                        format!("materialized as {}", runtime.id),
                    );
                    ResolutionStatus::Abandoned
                } else {
                    runtime.status
                };
                self.transition(
                    conflict_id,
                    status,
                    runtime.strategy,
                    runtime.confidence,
                    format!("materialized as {}", runtime.id),
                );
            }
            _ => {
                self.record_attempt(
                    conflict_id,
                    ResolutionAttempt {
                        strategy: StrategyKind::NotMaterialized,
                        succeeded: true,
                        confidence: 1.0,
                        detail: "cycles finished without colliding".to_string(),
                        at: Utc::now(),
                    },
                );
                self.transition(
                    conflict_id,
                    ResolutionStatus::AutoResolved,
                    Some(StrategyKind::NotMaterialized),
                    Some(1.0),
                    "prediction did not materialize".to_string(),
                );
            }
        }
    }

    pub fn get(&self, conflict_id: &str) -> Option<Conflict> {
        lock_mutex_recover(&self.conflicts).get(conflict_id).cloned()
    }

    /// All conflict records, oldest first
    pub fn list(&self) -> Vec<Conflict> {
        let mut all: Vec<Conflict> = lock_mutex_recover(&self.conflicts).values().cloned().collect();
        all.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn involving(&self, cycle_id: &str) -> Vec<Conflict> {
        self.list().into_iter().filter(|c| c.involves(cycle_id)).collect()
    }
}
