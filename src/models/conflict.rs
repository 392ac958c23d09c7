// Conflict records and their classification

use super::CycleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of collision between cycles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Declared file sets overlap
    FileOverlap,
    /// Two cycles write the same file at the same time
    ConcurrentWrite,
    /// Overlapping test files
    TestCollision,
    /// Overlap on the import/header section of a file
    ImportConflict,
    /// No shared files, but history says these stories collide
    Semantic,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictKind::FileOverlap => "FILE_OVERLAP",
            ConflictKind::ConcurrentWrite => "CONCURRENT_WRITE",
            ConflictKind::TestCollision => "TEST_COLLISION",
            ConflictKind::ImportConflict => "IMPORT_CONFLICT",
            ConflictKind::Semantic => "SEMANTIC",
        };
        write!(f, "{}", s)
    }
}

/// Severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictSeverity::Low => "LOW",
            ConflictSeverity::Medium => "MEDIUM",
            ConflictSeverity::High => "HIGH",
            ConflictSeverity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Resolution state of a conflict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Unresolved,
    AutoResolved,
    Sequenced,
    Escalated,
    Abandoned,
}

impl ResolutionStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ResolutionStatus::AutoResolved | ResolutionStatus::Sequenced | ResolutionStatus::Abandoned
        )
    }

    /// Allowed transitions of the per-conflict state machine
    pub fn can_transition_to(self, to: ResolutionStatus) -> bool {
        use ResolutionStatus::*;
        matches!(
            (self, to),
            (Unresolved, AutoResolved)
                | (Unresolved, Sequenced)
                | (Unresolved, Escalated)
                | (Escalated, AutoResolved)
                | (Escalated, Sequenced)
                | (Escalated, Abandoned)
        )
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionStatus::Unresolved => "UNRESOLVED",
            ResolutionStatus::AutoResolved => "AUTO_RESOLVED",
            ResolutionStatus::Sequenced => "SEQUENCED",
            ResolutionStatus::Escalated => "ESCALATED",
            ResolutionStatus::Abandoned => "ABANDONED",
        };
        write!(f, "{}", s)
    }
}

/// Resolution strategies on the ladder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    StructuralMerge,
    SequentialReorder,
    HumanEscalation,
    /// Predicted conflict closed because the cycles never collided
    NotMaterialized,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::StructuralMerge => "structural_merge",
            StrategyKind::SequentialReorder => "sequential_reorder",
            StrategyKind::HumanEscalation => "human_escalation",
            StrategyKind::NotMaterialized => "not_materialized",
        };
        write!(f, "{}", s)
    }
}

/// One rung tried on the ladder, kept for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAttempt {
    pub strategy: StrategyKind,
    pub succeeded: bool,
    pub confidence: f64,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// A detected or predicted collision between cycles over a shared resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub probability: f64,
    pub cycles: Vec<CycleId>,
    /// Contested resource (a file path)
    pub resource_id: String,
    /// Structural units both sides touched
    #[serde(default)]
    pub units: Vec<String>,
    /// True for admission-time predictions
    #[serde(default)]
    pub predicted: bool,
    pub status: ResolutionStatus,
    pub strategy: Option<StrategyKind>,
    pub confidence: Option<f64>,
    pub outcome: Option<String>,
    #[serde(default)]
    pub attempts: Vec<ResolutionAttempt>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn involves(&self, cycle_id: &str) -> bool {
        self.cycles.iter().any(|c| c == cycle_id)
    }
}
