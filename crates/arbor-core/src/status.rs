//! Status surface: outcome counters and finished-work reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::WorkState;

/// Counters the manager bumps as its direct children finish.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkCounts {
    pub succeeded: u64,
    pub raised: u64,
    pub fatal: u64,

    /// Retries scheduled anywhere in the tree.
    pub retries: u64,
}

/// Terminal report for a work attached under the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedWork {
    pub name: String,
    pub state: WorkState,

    /// Retries the node itself consumed.
    pub retries: u32,

    pub last_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}
