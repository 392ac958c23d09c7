// Cycle status and phase state machine with validation

use super::{CyclePhase, CycleStatus};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatus { from: CycleStatus, to: CycleStatus },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhase { from: CyclePhase, to: CyclePhase },

    #[error("Cycle already in terminal state: {0}")]
    AlreadyTerminal(CycleStatus),
}

/// Validates if a cycle can move from one status to another
pub fn can_transition(from: CycleStatus, to: CycleStatus) -> bool {
    match (from, to) {
        (CycleStatus::Pending, CycleStatus::Admitted) => true,
        (CycleStatus::Pending, CycleStatus::Failed) => true, // Rejected mid-admission

        (CycleStatus::Admitted, CycleStatus::Running) => true,
        (CycleStatus::Admitted, CycleStatus::Blocked) => true, // Waiting on a dependency
        (CycleStatus::Admitted, CycleStatus::Failed) => true,

        (CycleStatus::Running, CycleStatus::Blocked) => true,
        (CycleStatus::Running, CycleStatus::Completed) => true,
        (CycleStatus::Running, CycleStatus::Failed) => true,

        (CycleStatus::Blocked, CycleStatus::Running) => true,
        (CycleStatus::Blocked, CycleStatus::Failed) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b && !a.is_terminal() => true,

        _ => false,
    }
}

/// Validates and performs a status transition
pub fn transition_status(
    current: CycleStatus,
    target: CycleStatus,
) -> Result<CycleStatus, StateTransitionError> {
    if current.is_terminal() {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidStatus {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

/// Validates if a cycle can move from one phase to another.
/// Forward steps follow the TDD order; a rebase rewinds to CODE_GREEN.
pub fn can_advance_phase(from: CyclePhase, to: CyclePhase) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == CyclePhase::Failed {
        return true;
    }
    if from.next() == Some(to) {
        return true;
    }
    // Rebase after sequencing: redo the implementation on the new base
    matches!(
        (from, to),
        (CyclePhase::CodeGreen, CyclePhase::CodeGreen)
            | (CyclePhase::Refactor, CyclePhase::CodeGreen)
            | (CyclePhase::Commit, CyclePhase::CodeGreen)
    )
}

/// Validates and performs a phase transition
pub fn advance_phase(
    current: CyclePhase,
    target: CyclePhase,
) -> Result<CyclePhase, StateTransitionError> {
    if !can_advance_phase(current, target) {
        return Err(StateTransitionError::InvalidPhase {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_status_transitions() {
        assert!(can_transition(CycleStatus::Pending, CycleStatus::Admitted));
        assert!(can_transition(CycleStatus::Admitted, CycleStatus::Running));
        assert!(can_transition(CycleStatus::Running, CycleStatus::Blocked));
        assert!(can_transition(CycleStatus::Blocked, CycleStatus::Running));
        assert!(can_transition(CycleStatus::Running, CycleStatus::Completed));
    }

    #[test]
    fn test_invalid_status_transitions() {
        assert!(!can_transition(CycleStatus::Pending, CycleStatus::Running));
        assert!(!can_transition(CycleStatus::Blocked, CycleStatus::Completed));
        assert!(!can_transition(CycleStatus::Completed, CycleStatus::Running));
    }

    #[test]
    fn test_terminal_status_rejected() {
        let result = transition_status(CycleStatus::Failed, CycleStatus::Failed);
        assert_eq!(
            result,
            Err(StateTransitionError::AlreadyTerminal(CycleStatus::Failed))
        );
    }

    #[test]
    fn test_phase_forward_and_rebase() {
        assert!(can_advance_phase(CyclePhase::Design, CyclePhase::TestRed));
        assert!(can_advance_phase(CyclePhase::Commit, CyclePhase::Completed));
        assert!(can_advance_phase(CyclePhase::Commit, CyclePhase::CodeGreen));
        assert!(can_advance_phase(CyclePhase::Design, CyclePhase::Failed));
        assert!(!can_advance_phase(CyclePhase::Design, CyclePhase::Commit));
        assert!(!can_advance_phase(CyclePhase::TestRed, CyclePhase::CodeGreen.next().unwrap().next().unwrap()));
        assert!(!can_advance_phase(CyclePhase::Completed, CyclePhase::Failed));
    }

    #[test]
    fn test_advance_phase_error_message() {
        let err = advance_phase(CyclePhase::Design, CyclePhase::Refactor).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid phase transition from DESIGN to REFACTOR"
        );
    }
}
