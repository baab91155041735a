//! Outcome model: what one execution of a task reports back.

use serde::{Deserialize, Serialize};

/// Result of a single `on_run` execution.
///
/// - `Success`: the task did its job.
/// - `Failure`: recoverable; the node's retry budget decides what happens.
/// - `Fatal`: non-recoverable at any level; escalates straight to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum WorkOutcome {
    Success,
    Failure(String),
    Fatal(String),
}

impl WorkOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        WorkOutcome::Failure(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        WorkOutcome::Fatal(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success)
    }
}
