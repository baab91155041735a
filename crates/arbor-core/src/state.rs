//! Work node state machine states.

use serde::{Deserialize, Serialize};

/// State of a node in the work tree.
///
/// Transitions:
/// - Pending -> Running (all children succeeded, or no children)
/// - Pending -> FailureFatal / FailureRaise (escalated from children)
/// - Running -> Success / FailureRetry / FailureFatal (reported by the task)
/// - FailureRetry -> Pending (backoff timer fired, budget remaining)
/// - FailureRetry -> FailureRaise (budget exhausted)
///
/// Using an enum keeps matching exhaustive and invalid states unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkState {
    /// Waiting on children (or on its first run).
    Pending,

    /// The task's own execution is in flight.
    Running,

    /// Completed successfully.
    Success,

    /// Failed transiently; a backoff timer is armed.
    FailureRetry,

    /// Gave up: retry budget exhausted, surfaced to the parent.
    FailureRaise,

    /// Failed fatally; never retried, escalates straight up.
    FailureFatal,
}

impl WorkState {
    /// Is this a terminal state (no further transition without a reset)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkState::Success | WorkState::FailureRaise | WorkState::FailureFatal
        )
    }

    /// Is this any of the failure states?
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            WorkState::FailureRetry | WorkState::FailureRaise | WorkState::FailureFatal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkState::Success.is_terminal());
        assert!(WorkState::FailureRaise.is_terminal());
        assert!(WorkState::FailureFatal.is_terminal());
        assert!(!WorkState::Pending.is_terminal());
        assert!(!WorkState::Running.is_terminal());
        assert!(!WorkState::FailureRetry.is_terminal());
    }

    #[test]
    fn failure_states() {
        assert!(WorkState::FailureRetry.is_failure());
        assert!(WorkState::FailureRaise.is_failure());
        assert!(WorkState::FailureFatal.is_failure());
        assert!(!WorkState::Success.is_failure());
    }
}
