// Error taxonomy for the parallel engine

use crate::models::state_machine::StateTransitionError;
use crate::models::{AgentRole, CycleId};
use thiserror::Error;

pub type ParallelResult<T> = Result<T, ParallelError>;

/// A broken invariant and the cycles responsible for it
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub detail: String,
    /// Empty when no single cycle can be blamed
    pub cycles: Vec<CycleId>,
}

impl Violation {
    pub fn new(detail: impl Into<String>, cycles: Vec<CycleId>) -> Self {
        Self {
            detail: detail.into(),
            cycles,
        }
    }
}

/// Collapse a list of violations to the first one's message
pub fn first_violation(violations: Vec<Violation>) -> Result<(), String> {
    match violations.into_iter().next() {
        Some(violation) => Err(violation.detail),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum ParallelError {
    /// Capacity, feasibility or a high-confidence conflict; the caller retries or queues
    #[error("Admission rejected: {reason}")]
    AdmissionRejected { reason: String, hint: Option<String> },

    /// No agent of the role could be lent out in time
    #[error("Agent pool '{role}' exhausted: {reason}")]
    AgentPoolExhausted { role: AgentRole, reason: String },

    #[error("Resources exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// Every strategy failed and escalation produced no safe fallback
    #[error("Conflict {conflict_id} abandoned: {reason}")]
    ConflictAbandoned { conflict_id: String, reason: String },

    #[error("Storage degraded to in-memory operation: {0}")]
    StorageDegraded(String),

    /// Project files could not be read or written
    #[error("Project storage error: {0}")]
    ProjectStorage(String),

    #[error("Agent execution failed for cycle {cycle_id} after {attempts} attempt(s): {message}")]
    AgentExecutionFailed {
        cycle_id: CycleId,
        attempts: u32,
        message: String,
    },

    /// An observed violation of a documented invariant; halts the affected cycle only
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A story this cycle waited on finished without completing
    #[error("Cycle {cycle_id} cannot run: dependency {dependency} failed")]
    DependencyFailed { cycle_id: CycleId, dependency: String },

    #[error("Cycle {0} was cancelled")]
    Cancelled(CycleId),

    #[error("Cycle not found: {0}")]
    CycleNotFound(CycleId),

    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
}

impl ParallelError {
    pub fn admission(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        ParallelError::AdmissionRejected {
            reason: reason.into(),
            hint: Some(hint.into()),
        }
    }

    /// Remediation hint for user-visible rejections and escalations
    pub fn hint(&self) -> Option<String> {
        match self {
            ParallelError::AdmissionRejected { hint, .. } => hint.clone(),
            ParallelError::AgentPoolExhausted { role, .. } => Some(format!(
                "Retry with backoff or raise pools.{}.maxSize",
                role
            )),
            ParallelError::ResourceExhausted { .. } => {
                Some("Wait for running cycles to finish or lower the story's requirements".to_string())
            }
            ParallelError::ConflictAbandoned { .. } => {
                Some("Operator intervention required: resolve the file by hand and resubmit".to_string())
            }
            ParallelError::AgentExecutionFailed { .. } => {
                Some("Check the agent backend and resubmit the story".to_string())
            }
            ParallelError::DependencyFailed { dependency, .. } => {
                Some(format!("Fix and complete {} first, then resubmit", dependency))
            }
            _ => None,
        }
    }

    /// Whether the condition clears on its own (backoff, scale-up, capacity freeing)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ParallelError::AdmissionRejected { .. }
                | ParallelError::AgentPoolExhausted { .. }
                | ParallelError::ResourceExhausted { .. }
                | ParallelError::StorageDegraded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_hint() {
        let err = ParallelError::admission("parallel capacity reached", "retry later");
        assert_eq!(err.hint().as_deref(), Some("retry later"));
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Admission rejected: parallel capacity reached");
    }

    #[test]
    fn test_pool_exhausted_hint_names_role() {
        let err = ParallelError::AgentPoolExhausted {
            role: AgentRole::Code,
            reason: "timed out".to_string(),
        };
        assert!(err.hint().unwrap().contains("pools.code.maxSize"));
    }

    #[test]
    fn test_abandoned_is_not_recoverable() {
        let err = ParallelError::ConflictAbandoned {
            conflict_id: "c1".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!err.is_recoverable());
        assert!(err.hint().is_some());
    }
}
