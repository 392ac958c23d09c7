// End-to-end scenarios for the parallel engine
// Cycles run on an in-memory project with scripted executors

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tdd_parallel_lib::config::{ParallelConfig, PoolsConfig, ResourceConfig, ScalingConfig, TokenConfig};
use tdd_parallel_lib::events::{EVENT_CYCLE_COMPLETED, ProgressEvent};
use tdd_parallel_lib::executor::{AgentError, AgentExecutor, AgentOutput, AgentTask};
use tdd_parallel_lib::parallel::coordinator::phase_requirements;
use tdd_parallel_lib::parallel::structure::{merge_three_way, MergeOutcome};
use tdd_parallel_lib::parallel::{AgentPoolManager, ClaimKind, ClaimOutcome, FileConflictLedger, ResourceAllocator, TokenBudgetManager};
use tdd_parallel_lib::workspace::{FileStore, MemoryFileStore};
use tdd_parallel_lib::{
    AgentHandle, AgentRole, ConflictKind, CoordinatorBuilder, CyclePhase, CycleStatus, ParallelCoordinator,
    ParallelError, ResolutionStatus, ResourceRequirements, Story,
};
use tokio::sync::{broadcast, Barrier, Semaphore};

const BASE: &str = "fn alpha() {\n    1\n}\n\nfn beta() {\n    2\n}\n";

/// Replace the body line of `function` with a marker naming the story
fn edit_function(content: &str, function: &str, marker: &str) -> String {
    let header = format!("fn {}() {{", function);
    let mut out = String::new();
    let mut replace_next = false;
    for line in content.split_inclusive('\n') {
        if replace_next {
            out.push_str(&format!("    \"{}\"\n", marker));
            replace_next = false;
            continue;
        }
        replace_next = line.trim_end() == header;
        out.push_str(line);
    }
    out
}

/// CODE_GREEN edits one function per story; every cycle's first COMMIT waits
/// at a barrier so that all of them have staged changes before any integrates
struct ScriptedExecutor {
    edits: HashMap<String, (String, String)>,
    commit_gate: Barrier,
    past_gate: Mutex<HashSet<String>>,
}

impl ScriptedExecutor {
    fn new(edits: &[(&str, &str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            edits: edits
                .iter()
                .map(|(story, file, function)| (story.to_string(), (file.to_string(), function.to_string())))
                .collect(),
            commit_gate: Barrier::new(edits.len()),
            past_gate: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, _agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError> {
        let mut writes = BTreeMap::new();
        match task.phase {
            CyclePhase::CodeGreen => {
                if let Some((file, function)) = self.edits.get(&task.story_id) {
                    let base = task.base_contents.get(file).cloned().unwrap_or_default();
                    writes.insert(file.clone(), edit_function(&base, function, &task.story_id));
                }
            }
            CyclePhase::Commit => {
                let first = self.past_gate.lock().unwrap().insert(task.cycle_id.clone());
                if first {
                    self.commit_gate.wait().await;
                }
            }
            _ => {}
        }
        Ok(AgentOutput {
            writes,
            tokens_used: task.token_budget / 4,
            usage: None,
            summary: format!("{} done", task.phase),
        })
    }
}

/// Holds every execution until the test opens the gate
struct GatedExecutor {
    gate: Semaphore,
}

#[async_trait]
impl AgentExecutor for GatedExecutor {
    async fn execute(&self, _agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError> {
        // One permit per execution
        self.gate
            .acquire()
            .await
            .map_err(|e| AgentError::Backend(e.to_string()))?
            .forget();
        Ok(AgentOutput {
            tokens_used: task.token_budget / 4,
            ..AgentOutput::default()
        })
    }
}

fn test_config(max_parallel: usize) -> ParallelConfig {
    let mut config = ParallelConfig::default();
    config.execution.max_parallel_cycles = max_parallel;
    config.execution.initial_backoff_ms = 1;
    config.execution.max_backoff_ms = 5;
    config
}

fn coordinator_with(
    max_parallel: usize,
    executor: Arc<dyn AgentExecutor>,
    files: Arc<MemoryFileStore>,
) -> Arc<ParallelCoordinator> {
    CoordinatorBuilder::new(test_config(max_parallel))
        .executor(executor)
        .file_store(files)
        .capacity(ResourceRequirements::new(32_768, 16.0, 200_000))
        .build()
        .unwrap()
}

fn story(id: &str, files: &[&str]) -> Story {
    Story::new(id, files.iter().map(|f| f.to_string()).collect())
}

fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_scenario_a_disjoint_files_run_without_conflicts() {
    let files = Arc::new(MemoryFileStore::with_files([("a.x", BASE), ("b.x", BASE)]));
    let executor = ScriptedExecutor::new(&[("S-A", "a.x", "alpha"), ("S-B", "b.x", "beta")]);
    let coordinator = coordinator_with(2, executor, files.clone());

    let a = coordinator.submit_story(story("S-A", &["a.x"])).unwrap();
    let b = coordinator.submit_story(story("S-B", &["b.x"])).unwrap();
    assert_eq!(coordinator.active_count(), 2);

    let cycles = coordinator.wait_all().await;
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Completed));
    assert!(coordinator.conflicts().is_empty());

    let snapshot = files.snapshot();
    assert!(snapshot["a.x"].contains("\"S-A\""));
    assert!(snapshot["b.x"].contains("\"S-B\""));
    assert_eq!(coordinator.cycle(&a).unwrap().phase, CyclePhase::Completed);
    assert_eq!(coordinator.cycle(&b).unwrap().phase, CyclePhase::Completed);
}

#[tokio::test]
async fn test_scenario_b_different_functions_merge() {
    let files = Arc::new(MemoryFileStore::with_files([("shared.x", BASE)]));
    let executor = ScriptedExecutor::new(&[("S-A", "shared.x", "alpha"), ("S-B", "shared.x", "beta")]);
    let coordinator = coordinator_with(2, executor, files.clone());

    coordinator.submit_story(story("S-A", &["shared.x"])).unwrap();
    coordinator.submit_story(story("S-B", &["shared.x"])).unwrap();

    let conflicts = coordinator.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].predicted);
    assert_eq!(conflicts[0].kind, ConflictKind::FileOverlap);
    assert_eq!(conflicts[0].resource_id, "shared.x");

    let cycles = coordinator.wait_all().await;
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Completed), "{:?}", cycles);

    let content = files.snapshot()["shared.x"].clone();
    assert!(content.contains("\"S-A\""), "{}", content);
    assert!(content.contains("\"S-B\""), "{}", content);

    let runtime: Vec<_> = coordinator.conflicts().into_iter().filter(|c| !c.predicted).collect();
    assert!(!runtime.is_empty());
    assert!(runtime.iter().all(|c| c.status == ResolutionStatus::AutoResolved));
    assert!(coordinator.claims().is_empty());
}

#[tokio::test]
async fn test_scenario_b_same_function_is_sequenced_by_priority() {
    let files = Arc::new(MemoryFileStore::with_files([("shared.x", BASE)]));
    let executor = ScriptedExecutor::new(&[("S-HIGH", "shared.x", "alpha"), ("S-LOW", "shared.x", "alpha")]);
    let coordinator = coordinator_with(2, executor, files.clone());
    let mut events = coordinator.subscribe();

    let high = coordinator
        .submit_story(story("S-HIGH", &["shared.x"]).with_priority(5))
        .unwrap();
    let low = coordinator
        .submit_story(story("S-LOW", &["shared.x"]).with_priority(1))
        .unwrap();

    let cycles = coordinator.wait_all().await;
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Completed), "{:?}", cycles);

    let completions: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.event == EVENT_CYCLE_COMPLETED)
        .filter_map(|e| e.cycle_id)
        .collect();
    assert_eq!(completions, vec![high.clone(), low.clone()]);

    let sequenced: Vec<_> = coordinator
        .conflicts()
        .into_iter()
        .filter(|c| !c.predicted && c.status == ResolutionStatus::Sequenced)
        .collect();
    assert!(!sequenced.is_empty());
    assert!(sequenced.iter().all(|c| c.involves(&high) && c.involves(&low)));

    // The follower re-ran on top of the leader's write
    let content = files.snapshot()["shared.x"].clone();
    assert!(content.contains("\"S-LOW\""), "{}", content);
    assert!(!content.contains("\"S-HIGH\""), "{}", content);
    assert!(content.contains("fn beta() {\n    2\n}"));
}

#[tokio::test]
async fn test_scenario_c_code_pool_bounds_waiters() {
    let mut pools = PoolsConfig::default();
    pools.code.min_size = 1;
    pools.code.max_size = 3;
    let manager = Arc::new(AgentPoolManager::new(&pools, ScalingConfig::default()));
    manager.warm_up();
    let request = phase_requirements(CyclePhase::CodeGreen, &ResourceRequirements::new(1024, 0.5, 100));

    for cycle in ["c1", "c2", "c3"] {
        manager
            .acquire(AgentRole::Code, cycle, &request, Duration::from_millis(10))
            .await
            .unwrap();
    }
    let err = manager
        .acquire(AgentRole::Code, "c4", &request, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, ParallelError::AgentPoolExhausted { role: AgentRole::Code, .. }));

    let waiter = {
        let manager = manager.clone();
        let request = request.clone();
        tokio::spawn(async move {
            manager
                .acquire(AgentRole::Code, "c4", &request, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.release("c2"), 1);
    waiter.await.unwrap().unwrap();

    let stats = manager.stats(AgentRole::Code).unwrap();
    assert_eq!(stats.busy, 3);
    assert!(stats.busy + stats.available <= 3);
    assert!(manager.check_invariants().is_ok());
}

#[test]
fn test_scenario_d_token_rebalance_stays_under_ceiling() {
    let config = TokenConfig {
        total_budget: 100_000,
        reserve_fraction: 0.1,
        ..TokenConfig::default()
    };
    let tokens = TokenBudgetManager::new(config, 3);
    for cycle in ["c1", "c2", "c3"] {
        tokens.allocate(cycle, 3, CyclePhase::TestRed, false, 3).unwrap();
    }
    let sum = |t: &TokenBudgetManager| t.allocations().iter().map(|a| a.allocated).sum::<u64>();
    assert!(sum(&tokens) <= 90_000);

    let share = tokens.get("c1").unwrap().allocated;
    tokens.record_usage("c1", share / 5);
    tokens.record_usage("c2", share * 95 / 100);
    tokens.record_usage("c3", share / 2);

    let report = tokens.rebalance();
    assert_eq!(report.shrunk, vec!["c1".to_string()]);
    assert_eq!(report.grown, vec!["c2".to_string()]);
    assert!(tokens.get("c1").unwrap().allocated < share);
    assert!(tokens.get("c2").unwrap().allocated > share);
    assert_eq!(tokens.get("c3").unwrap().allocated, share);
    assert!(sum(&tokens) <= 90_000);
    assert!(tokens.check_invariants().is_ok());
}

#[tokio::test]
async fn test_scenario_e_cancellation_frees_everything() {
    let executor = Arc::new(GatedExecutor { gate: Semaphore::new(0) });
    let files = Arc::new(MemoryFileStore::with_files([("a.x", BASE)]));
    let coordinator = coordinator_with(1, executor.clone(), files);

    let id = coordinator.submit_story(story("S-1", &["a.x"])).unwrap();
    for _ in 0..200 {
        if !coordinator.pools().lent_to(&id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(coordinator.pools().lent_to(&id).len(), 1);
    assert!(!coordinator.claims().is_empty());

    coordinator.cancel(&id).unwrap();
    let cycle = coordinator.cycle(&id).unwrap();
    assert_eq!(cycle.status, CycleStatus::Failed);
    assert!(cycle.error.unwrap().contains("cancelled"));
    assert!(coordinator.pools().lent_to(&id).is_empty());
    assert!(coordinator.claims().is_empty());
    assert!(coordinator.resources().get(&id).is_none());
    assert!(coordinator.tokens().get(&id).is_none());
    assert_eq!(coordinator.pools().stats(AgentRole::Design).unwrap().busy, 0);

    // Cancelling twice is harmless
    coordinator.cancel(&id).unwrap();

    let again = coordinator.submit_story(story("S-1", &["a.x"])).unwrap();
    assert_ne!(again, id);
    executor.gate.add_permits(10_000);
    let done = coordinator.wait_for(&again).await.unwrap();
    assert_eq!(done.status, CycleStatus::Completed);
    assert!(coordinator.run_maintenance().violations.is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_cycle() {
    let coordinator = coordinator_with(1, Arc::new(GatedExecutor { gate: Semaphore::new(1) }), Arc::new(MemoryFileStore::new()));
    assert!(matches!(coordinator.cancel("missing"), Err(ParallelError::CycleNotFound(_))));
}

#[tokio::test]
async fn test_unrelated_cycles_survive_a_failure() {
    struct FailingOne;

    #[async_trait]
    impl AgentExecutor for FailingOne {
        async fn execute(&self, _agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError> {
            if task.story_id == "S-BAD" && task.phase == CyclePhase::TestRed {
                return Err(AgentError::Backend("model refused the task".into()));
            }
            Ok(AgentOutput::default())
        }
    }

    let coordinator = coordinator_with(2, Arc::new(FailingOne), Arc::new(MemoryFileStore::new()));
    let bad = coordinator.submit_story(story("S-BAD", &["a.x"])).unwrap();
    let good = coordinator.submit_story(story("S-GOOD", &["b.x"])).unwrap();
    coordinator.wait_all().await;

    let failed = coordinator.cycle(&bad).unwrap();
    assert_eq!(failed.status, CycleStatus::Failed);
    assert!(failed.error.unwrap().contains("model refused"));
    assert_eq!(coordinator.cycle(&good).unwrap().status, CycleStatus::Completed);
}

#[tokio::test]
async fn test_external_change_is_merged_at_commit() {
    struct Editing {
        inner: Arc<GatedExecutor>,
    }

    #[async_trait]
    impl AgentExecutor for Editing {
        async fn execute(&self, agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError> {
            let mut output = self.inner.execute(agent, task.clone()).await?;
            if task.phase == CyclePhase::CodeGreen {
                let base = task.base_contents.get("shared.x").cloned().unwrap_or_default();
                output.writes.insert("shared.x".into(), edit_function(&base, "alpha", "cycle"));
            }
            Ok(output)
        }
    }
    let files = Arc::new(MemoryFileStore::with_files([("shared.x", BASE)]));
    let executor = Arc::new(GatedExecutor { gate: Semaphore::new(0) });
    let coordinator = coordinator_with(1, Arc::new(Editing { inner: executor.clone() }), files.clone());

    let id = coordinator.submit_story(story("S-1", &["shared.x"])).unwrap();
    // Let DESIGN read the file, then change it behind the cycle's back
    executor.gate.add_permits(1);
    for _ in 0..200 {
        if coordinator.cycle(&id).unwrap().phase != CyclePhase::Design {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    files.write("shared.x", &edit_function(BASE, "beta", "outside")).unwrap();
    executor.gate.add_permits(10_000);

    let done = coordinator.wait_for(&id).await.unwrap();
    assert_eq!(done.status, CycleStatus::Completed);
    let content = files.snapshot()["shared.x"].clone();
    assert!(content.contains("\"cycle\""), "{}", content);
    assert!(content.contains("\"outside\""), "{}", content);

    let merged: Vec<_> = coordinator
        .conflicts()
        .into_iter()
        .filter(|c| !c.predicted && c.resource_id == "shared.x")
        .collect();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].status, ResolutionStatus::AutoResolved);
}

#[test]
fn test_concurrent_overlapping_claims_never_leave_partials() {
    let ledger = Arc::new(FileConflictLedger::new());
    let files: Vec<String> = (0..6).map(|i| format!("f{}.x", i)).collect();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let ledger = ledger.clone();
            let files = files.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let cycle = format!("c{}", worker);
                for _ in 0..300 {
                    let count = rng.gen_range(1..=3);
                    let wanted: Vec<String> = files.choose_multiple(&mut rng, count).cloned().collect();
                    let kind = if rng.gen_bool(0.5) { ClaimKind::Write } else { ClaimKind::Read };

                    match ledger.try_claim_detailed(&cycle, &wanted, kind) {
                        ClaimOutcome::Granted => {
                            assert_eq!(ledger.claims_of(&cycle).len(), wanted.len());
                            if kind == ClaimKind::Write {
                                for file in &wanted {
                                    assert_eq!(ledger.writer_of(file).as_deref(), Some(cycle.as_str()));
                                    assert!(ledger.holders(file, &cycle).is_empty());
                                }
                            }
                        }
                        ClaimOutcome::Denied { blockers } => {
                            assert!(!blockers.is_empty());
                            assert!(ledger.claims_of(&cycle).is_empty());
                        }
                    }
                    ledger.release_all(&cycle);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(ledger.snapshot().is_empty());
    assert!(ledger.check_invariants().is_ok());
}

#[test]
fn test_resource_sums_stay_within_usable_capacity() {
    let config = ResourceConfig {
        per_agent_memory_mb: 4096,
        per_agent_cpu_share: 2.0,
        per_agent_disk_mb: 4096,
        ..ResourceConfig::default()
    };
    let allocator = ResourceAllocator::with_capacity(config, ResourceRequirements::new(16_000, 8.0, 20_000));
    let usable = allocator.usable();
    let mut rng = rand::thread_rng();

    for i in 0..40 {
        let request = ResourceRequirements::new(
            rng.gen_range(256..=4096),
            rng.gen_range(0.25..=2.0),
            rng.gen_range(100..=4096),
        );
        let cycle = format!("c{}", i);
        let _ = allocator.allocate(&cycle, &request);
        if i % 3 == 0 {
            allocator.release(&cycle);
            assert!(allocator.release(&cycle).is_none());
        }
        assert!(allocator.in_use().fits_within(&usable));
        assert!(allocator.check_invariants().is_ok());
    }
}

#[test]
fn test_pool_sizes_stay_within_bounds_once_warmed() {
    let manager = AgentPoolManager::new(&PoolsConfig::default(), ScalingConfig::default());
    manager.warm_up();
    for stats in manager.all_stats() {
        assert!(stats.busy + stats.available >= stats.min_size, "{:?}", stats);
        assert!(stats.busy + stats.available <= stats.max_size, "{:?}", stats);
    }
    assert_eq!(manager.release("nobody"), 0);
}

#[test]
fn test_structural_merge_properties() {
    let ours = edit_function(BASE, "alpha", "ours");
    let theirs = edit_function(BASE, "beta", "theirs");
    match merge_three_way(BASE, &ours, &theirs) {
        MergeOutcome::Merged(content) => {
            assert!(content.contains("\"ours\""));
            assert!(content.contains("\"theirs\""));
        }
        other => panic!("disjoint changes should merge: {:?}", other),
    }

    let clash = edit_function(BASE, "alpha", "theirs");
    assert_eq!(
        merge_three_way(BASE, &ours, &clash),
        MergeOutcome::Conflict(vec!["alpha".to_string()])
    );
}
