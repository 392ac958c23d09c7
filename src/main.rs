use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tdd_parallel_lib::config::{load_merged_config, ConfigLoader};
use tdd_parallel_lib::executor::DryRunExecutor;
use tdd_parallel_lib::storage::JsonFileStore;
use tdd_parallel_lib::workspace::DiskFileStore;
use tdd_parallel_lib::{CoordinatorBuilder, CycleStatus, ParallelCoordinator, ParallelError, Story};
use tokio::sync::broadcast::error::RecvError;

/// TDD Parallel - run many TDD cycles at once without trampling each other's files
#[derive(Parser, Debug)]
#[command(name = "tdd-parallel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preview admission decisions and predicted conflicts without executing
    Plan {
        /// Story file (.json, .yaml or .yml) holding a list of stories
        #[arg(long)]
        stories: PathBuf,

        /// Explicit config file (defaults to global + project config)
        #[arg(long, env = "TDD_PARALLEL_CONFIG")]
        config: Option<PathBuf>,

        /// Project directory used for project-level config
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Run every story with the dry-run executor, printing progress events
    Run {
        #[arg(long)]
        stories: PathBuf,

        #[arg(long, env = "TDD_PARALLEL_CONFIG")]
        config: Option<PathBuf>,

        /// Project directory; files and state are kept in memory when omitted
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Print the effective configuration, or write it to a file
    Config {
        #[arg(long, env = "TDD_PARALLEL_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        project: Option<PathBuf>,

        /// Write the merged config as TOML here instead of printing it
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(async {
        match cli.command {
            Command::Plan {
                stories,
                config,
                project,
            } => plan(&stories, config.as_deref(), project.as_deref()),
            Command::Run {
                stories,
                config,
                project,
            } => run(&stories, config.as_deref(), project.as_deref()).await,
            Command::Config {
                config,
                project,
                output,
            } => show_config(config.as_deref(), project.as_deref(), output.as_deref()),
        }
    })
}

fn load_stories(path: &Path) -> Result<Vec<Story>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read stories from {}", path.display()))?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let stories: Vec<Story> = match extension {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?,
        "json" => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?,
        other => return Err(anyhow!("Unsupported story file type '{}'", other)),
    };
    if stories.is_empty() {
        return Err(anyhow!("{} contains no stories", path.display()));
    }
    Ok(stories)
}

fn build(config: Option<&Path>, project: Option<&Path>) -> Result<Arc<ParallelCoordinator>> {
    let config = load_merged_config(project, config)?;
    let mut builder = CoordinatorBuilder::new(config).executor(Arc::new(DryRunExecutor));
    if let Some(project) = project {
        builder = builder
            .file_store(Arc::new(DiskFileStore::new(project)))
            .record_store(Arc::new(JsonFileStore::for_project(project)));
    }
    builder.build()
}

fn show_config(config: Option<&Path>, project: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let config = load_merged_config(project, config)?;
    match output {
        Some(path) => {
            ConfigLoader::new().save_to_path(path, &config)?;
            println!("Wrote effective config to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?),
    }
    Ok(())
}

fn plan(stories: &Path, config: Option<&Path>, project: Option<&Path>) -> Result<()> {
    let stories = load_stories(stories)?;
    let coordinator = build(config, project)?;

    for entry in coordinator.plan(&stories) {
        if entry.admitted {
            println!(
                "ADMIT   {:<16} {} MB / {:.2} CPU / {} MB disk",
                entry.story_id,
                entry.requirements.memory_mb,
                entry.requirements.cpu_share,
                entry.requirements.disk_mb
            );
            if !entry.waits_on.is_empty() {
                println!("        waits on {}", entry.waits_on.join(", "));
            }
        } else {
            println!(
                "REJECT  {:<16} {}",
                entry.story_id,
                entry.reason.unwrap_or_default()
            );
            if let Some(hint) = entry.hint {
                println!("        hint: {}", hint);
            }
        }
        for conflict in entry.predicted {
            println!(
                "        {} {} on {} with {} (p={:.2})",
                conflict.severity,
                conflict.kind,
                conflict.resource_id,
                conflict.cycles.get(1).cloned().unwrap_or_default(),
                conflict.probability
            );
        }
    }
    Ok(())
}

async fn run(stories: &Path, config: Option<&Path>, project: Option<&Path>) -> Result<()> {
    let stories = load_stories(stories)?;
    let coordinator = build(config, project)?;
    let maintenance = coordinator.spawn_maintenance();

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("[{}] {:<20} {}", event.timestamp.format("%H:%M:%S"), event.event, event.summary),
                Err(RecvError::Lagged(skipped)) => log::warn!("Dropped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Stories that could not be admitted yet are retried whenever a cycle finishes
    let mut queue: VecDeque<Story> = stories.into();
    let mut rejected: Vec<(String, ParallelError)> = Vec::new();
    let mut finish_events = coordinator.subscribe();
    loop {
        let mut waiting = VecDeque::new();
        let mut admitted_any = false;
        while let Some(story) = queue.pop_front() {
            let story_id = story.id.clone();
            match coordinator.submit_story(story.clone()) {
                Ok(_) => admitted_any = true,
                Err(err) if should_requeue(&coordinator, &err, &story, &waiting, &queue) => {
                    waiting.push_back(story)
                }
                Err(err) => rejected.push((story_id, err)),
            }
        }
        queue = waiting;
        if queue.is_empty() {
            break;
        }
        if coordinator.active_count() == 0 {
            if admitted_any {
                continue;
            }
            break;
        }
        wait_for_finish(&mut finish_events).await;
    }
    for story in queue {
        rejected.push((
            story.id.clone(),
            ParallelError::admission("never became admissible", "Check its dependencies and requirements"),
        ));
    }

    let cycles = coordinator.wait_all().await;
    maintenance.abort();
    // Let the printer drain what is already queued
    tokio::task::yield_now().await;
    printer.abort();

    let completed = cycles.iter().filter(|c| c.status == CycleStatus::Completed).count();
    println!();
    println!(
        "{} cycle(s): {} completed, {} failed, {} story(ies) rejected",
        cycles.len(),
        completed,
        cycles.len() - completed,
        rejected.len()
    );
    for cycle in cycles.iter().filter(|c| c.status == CycleStatus::Failed) {
        println!("FAILED  {:<16} {}", cycle.story_id, cycle.error.clone().unwrap_or_default());
    }
    for (story_id, err) in &rejected {
        println!("REJECT  {:<16} {}", story_id, err);
        if let Some(hint) = err.hint() {
            println!("        hint: {}", hint);
        }
    }
    let conflicts = coordinator.conflicts();
    if !conflicts.is_empty() {
        println!("{} conflict(s) recorded", conflicts.len());
    }
    Ok(())
}

/// Rejections that may clear once running cycles finish
fn should_requeue(
    coordinator: &ParallelCoordinator,
    err: &ParallelError,
    story: &Story,
    waiting: &VecDeque<Story>,
    queue: &VecDeque<Story>,
) -> bool {
    if coordinator.active_count() == 0 && !story.dependencies.iter().any(|d| is_queued(d, waiting, queue)) {
        return false;
    }
    match err {
        ParallelError::AdmissionRejected { reason, .. } => {
            !reason.contains("failed") && !reason.contains("already running")
        }
        other => other.is_recoverable(),
    }
}

fn is_queued(story_id: &str, waiting: &VecDeque<Story>, queue: &VecDeque<Story>) -> bool {
    waiting.iter().chain(queue.iter()).any(|s| s.id == story_id)
}

async fn wait_for_finish(events: &mut tokio::sync::broadcast::Receiver<tdd_parallel_lib::events::ProgressEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.event == tdd_parallel_lib::events::EVENT_CYCLE_COMPLETED
                || event.event == tdd_parallel_lib::events::EVENT_CYCLE_FAILED =>
            {
                return
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}
