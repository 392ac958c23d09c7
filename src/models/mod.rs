// Core data model shared across the parallel engine

pub mod conflict;
pub mod state_machine;

pub use conflict::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a running or finished cycle
pub type CycleId = String;

/// TDD phase of a cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Design,
    TestRed,
    CodeGreen,
    Refactor,
    Commit,
    Failed,
    Completed,
}

impl CyclePhase {
    /// Work phases in execution order
    pub const WORK_PHASES: [CyclePhase; 5] = [
        CyclePhase::Design,
        CyclePhase::TestRed,
        CyclePhase::CodeGreen,
        CyclePhase::Refactor,
        CyclePhase::Commit,
    ];

    /// Next phase after a successful one
    pub fn next(self) -> Option<CyclePhase> {
        match self {
            CyclePhase::Design => Some(CyclePhase::TestRed),
            CyclePhase::TestRed => Some(CyclePhase::CodeGreen),
            CyclePhase::CodeGreen => Some(CyclePhase::Refactor),
            CyclePhase::Refactor => Some(CyclePhase::Commit),
            CyclePhase::Commit => Some(CyclePhase::Completed),
            CyclePhase::Failed | CyclePhase::Completed => None,
        }
    }

    /// Agent role that executes this phase
    pub fn role(self) -> Option<AgentRole> {
        match self {
            CyclePhase::Design => Some(AgentRole::Design),
            CyclePhase::TestRed => Some(AgentRole::Qa),
            CyclePhase::CodeGreen | CyclePhase::Refactor | CyclePhase::Commit => {
                Some(AgentRole::Code)
            }
            CyclePhase::Failed | CyclePhase::Completed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CyclePhase::Failed | CyclePhase::Completed)
    }

    /// Number of work phases left, counting this one
    pub fn remaining_work_phases(self) -> usize {
        CyclePhase::WORK_PHASES
            .iter()
            .position(|p| *p == self)
            .map(|idx| CyclePhase::WORK_PHASES.len() - idx)
            .unwrap_or(0)
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CyclePhase::Design => "DESIGN",
            CyclePhase::TestRed => "TEST_RED",
            CyclePhase::CodeGreen => "CODE_GREEN",
            CyclePhase::Refactor => "REFACTOR",
            CyclePhase::Commit => "COMMIT",
            CyclePhase::Failed => "FAILED",
            CyclePhase::Completed => "COMPLETED",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle status of a cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Pending,
    Admitted,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            CycleStatus::Admitted | CycleStatus::Running | CycleStatus::Blocked
        )
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleStatus::Pending => "PENDING",
            CycleStatus::Admitted => "ADMITTED",
            CycleStatus::Running => "RUNNING",
            CycleStatus::Blocked => "BLOCKED",
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Agent role, one worker pool per role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Design,
    Qa,
    Code,
}

impl AgentRole {
    pub const ALL: [AgentRole; 3] = [AgentRole::Design, AgentRole::Qa, AgentRole::Code];
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Design => write!(f, "design"),
            AgentRole::Qa => write!(f, "qa"),
            AgentRole::Code => write!(f, "code"),
        }
    }
}

/// Compute requirements of a cycle (or a capacity, when used as a ceiling)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub cpu_share: f64,
    pub disk_mb: u64,
}

impl ResourceRequirements {
    pub fn new(memory_mb: u64, cpu_share: f64, disk_mb: u64) -> Self {
        Self {
            memory_mb,
            cpu_share,
            disk_mb,
        }
    }

    /// True when every dimension of `self` is within `limit`
    pub fn fits_within(&self, limit: &ResourceRequirements) -> bool {
        self.memory_mb <= limit.memory_mb
            && self.cpu_share <= limit.cpu_share + f64::EPSILON
            && self.disk_mb <= limit.disk_mb
    }

    pub fn saturating_add(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            cpu_share: self.cpu_share + other.cpu_share,
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            cpu_share: (self.cpu_share - other.cpu_share).max(0.0),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }

    pub fn scale(&self, factor: f64) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: (self.memory_mb as f64 * factor).round() as u64,
            cpu_share: self.cpu_share * factor,
            disk_mb: (self.disk_mb as f64 * factor).round() as u64,
        }
    }

    /// Per-dimension minimum
    pub fn min(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.memory_mb.min(other.memory_mb),
            cpu_share: self.cpu_share.min(other.cpu_share),
            disk_mb: self.disk_mb.min(other.disk_mb),
        }
    }

    /// Per-dimension maximum
    pub fn max(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu_share: self.cpu_share.max(other.cpu_share),
            disk_mb: self.disk_mb.max(other.disk_mb),
        }
    }
}

/// Capability, tool and ceiling requirements an agent must dominate to be lent out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequirements {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub security_level: u8,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_share: f64,
}

/// A pooled agent lent to a cycle for one phase.
/// The allow-lists and ceilings are fixed when the agent is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentHandle {
    pub id: String,
    pub role: AgentRole,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub security_level: u8,
    pub memory_mb: u64,
    pub cpu_share: f64,
}

impl AgentHandle {
    /// True when this agent's allow-lists and ceilings cover the request
    pub fn dominates(&self, request: &AgentRequirements) -> bool {
        request.capabilities.iter().all(|c| self.capabilities.contains(c))
            && request.tools.iter().all(|t| self.tools.contains(t))
            && self.security_level >= request.security_level
            && self.memory_mb >= request.memory_mb
            && self.cpu_share + f64::EPSILON >= request.cpu_share
    }
}

/// A story submitted for execution as a TDD cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Epic the story belongs to (used for historical conflict rates)
    #[serde(default, alias = "epic_id")]
    pub epic_id: Option<String>,
    /// Files the story expects to touch
    #[serde(default, alias = "touched_files")]
    pub touched_files: Vec<String>,
    /// Structural units the story expects to touch, as `path::unit`
    #[serde(default, alias = "touched_units")]
    pub touched_units: Vec<String>,
    /// Higher value runs first when cycles contend
    #[serde(default)]
    pub priority: i32,
    /// Complexity estimate, 1 (trivial) to 10 (very complex)
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    /// Story ids that must complete before this one
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit compute requirements; derived from complexity when absent
    #[serde(default)]
    pub requirements: Option<ResourceRequirements>,
    /// Agent ids this story prefers to run on
    #[serde(default, alias = "preferred_agents")]
    pub preferred_agents: Vec<String>,
}

fn default_complexity() -> u8 {
    3
}

impl Story {
    pub fn new(id: impl Into<String>, touched_files: Vec<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            epic_id: None,
            touched_files,
            touched_units: Vec::new(),
            priority: 0,
            complexity: default_complexity(),
            dependencies: Vec::new(),
            requirements: None,
            preferred_agents: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    pub fn with_units(mut self, units: Vec<String>) -> Self {
        self.touched_units = units;
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    /// Complexity clamped into the supported range
    pub fn effective_complexity(&self) -> u8 {
        self.complexity.clamp(1, 10)
    }
}

/// One story's TDD execution instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub id: CycleId,
    pub story_id: String,
    pub phase: CyclePhase,
    pub status: CycleStatus,
    pub claimed_files: Vec<String>,
    pub agent_ids: Vec<String>,
    pub resource_allocation_id: Option<String>,
    pub token_allocation_id: Option<String>,
    pub priority: i32,
    pub complexity: u8,
    /// Cycles this one waits on before it may continue
    #[serde(default)]
    pub blocked_on: Vec<CycleId>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cycle {
    pub fn new(id: impl Into<String>, story: &Story) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            story_id: story.id.clone(),
            phase: CyclePhase::Design,
            status: CycleStatus::Pending,
            claimed_files: Vec::new(),
            agent_ids: Vec::new(),
            resource_allocation_id: None,
            token_allocation_id: None,
            priority: story.priority,
            complexity: story.effective_complexity(),
            blocked_on: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phase = CyclePhase::Design;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.last(), Some(&CyclePhase::Completed));
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_phase_roles() {
        assert_eq!(CyclePhase::Design.role(), Some(AgentRole::Design));
        assert_eq!(CyclePhase::TestRed.role(), Some(AgentRole::Qa));
        assert_eq!(CyclePhase::Commit.role(), Some(AgentRole::Code));
        assert_eq!(CyclePhase::Completed.role(), None);
    }

    #[test]
    fn test_remaining_work_phases() {
        assert_eq!(CyclePhase::Design.remaining_work_phases(), 5);
        assert_eq!(CyclePhase::Commit.remaining_work_phases(), 1);
        assert_eq!(CyclePhase::Completed.remaining_work_phases(), 0);
    }

    #[test]
    fn test_requirements_fit() {
        let small = ResourceRequirements::new(512, 0.5, 100);
        let big = ResourceRequirements::new(1024, 1.0, 200);
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
        assert_eq!(big.saturating_sub(&small), small);
    }

    #[test]
    fn test_agent_dominance() {
        let agent = AgentHandle {
            id: "code-1".to_string(),
            role: AgentRole::Code,
            capabilities: vec!["code".to_string()],
            tools: vec!["read".to_string(), "write".to_string()],
            security_level: 2,
            memory_mb: 2048,
            cpu_share: 1.0,
        };
        let mut request = AgentRequirements {
            capabilities: vec!["code".to_string()],
            tools: vec!["write".to_string()],
            security_level: 1,
            memory_mb: 1024,
            cpu_share: 0.5,
        };
        assert!(agent.dominates(&request));

        request.tools.push("shell".to_string());
        assert!(!agent.dominates(&request));

        request.tools.pop();
        request.security_level = 3;
        assert!(!agent.dominates(&request));

        request.security_level = 1;
        request.memory_mb = 4096;
        assert!(!agent.dominates(&request));
    }

    #[test]
    fn test_story_deserializes_with_defaults() {
        let json = r#"{"id": "S-1", "touchedFiles": ["a.x"], "priority": 2}"#;
        let story: Story = serde_json::from_str(json).unwrap();
        assert_eq!(story.touched_files, vec!["a.x"]);
        assert_eq!(story.complexity, 3);
        assert!(story.dependencies.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&CycleStatus::Blocked).unwrap();
        assert_eq!(json, "\"BLOCKED\"");
        let phase = serde_json::to_string(&CyclePhase::CodeGreen).unwrap();
        assert_eq!(phase, "\"CODE_GREEN\"");
    }
}
