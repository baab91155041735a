//! arbor-core
//!
//! A hierarchical, retryable work scheduler: long-running background
//! operations are modeled as a tree of named nodes, each with its own
//! retry budget, driven to a terminal state by a single drive loop.
//!
//! Module map:
//! - **ids**: strongly-typed ULID identifiers (`WorkId`)
//! - **state**: the node state machine states
//! - **outcome**: what one task execution reports (`WorkOutcome`)
//! - **retry**: jittered exponential backoff policy and budget constants
//! - **error**: library error type
//! - **work**: the `Work` trait a concrete task implements
//! - **tree**: records, child bookkeeping, aggregate queries
//! - **sched**: deferred steps, retry timers, completion channel
//! - **manager**: the root node and the drive loop
//! - **status**: counters and finished-work reports

pub mod error;
pub mod ids;
pub mod manager;
pub mod outcome;
pub mod retry;
mod sched;
pub mod state;
pub mod status;
pub mod tree;
pub mod work;

pub use error::ArborError;
pub use ids::WorkId;
pub use manager::WorkManager;
pub use outcome::WorkOutcome;
pub use retry::{RETRY_A_FEW, RETRY_A_LOT, RETRY_FOREVER, RETRY_NEVER, RETRY_ONCE, RetryPolicy};
pub use state::WorkState;
pub use status::{FinishedWork, WorkCounts};
pub use tree::{WorkScope, WorkSpec};
pub use work::{RunContext, Work, run_blocking};
