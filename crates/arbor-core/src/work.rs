//! The `Work` trait: the only interface a concrete task implements.

use async_trait::async_trait;

use crate::error::ArborError;
use crate::outcome::WorkOutcome;
use crate::state::WorkState;
use crate::tree::WorkScope;

/// Execution context handed to `on_run`.
///
/// Carries enough for logging and for attempt-dependent behavior; it owns no
/// tree state, so the future can run on any worker thread.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Name of the node being run.
    pub name: String,

    /// How many retries have been consumed so far (0 on the first run).
    pub attempt: u32,

    /// The node's retry budget.
    pub max_retries: u32,
}

/// A schedulable unit of work.
///
/// Implementations are stored as `Arc<dyn Work>` and invoked through `&self`;
/// mutable task state lives behind interior mutability (atomics or a mutex),
/// the same way queue handlers keep their per-instance counters.
///
/// All hooks have defaults, so the minimal implementation is an empty
/// `impl Work for MyTask {}` that succeeds immediately.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Attach prerequisite children for a fresh lifecycle episode.
    ///
    /// Called on every (re)start, including each retry of this node. The
    /// previous children are already gone by the time this runs. Errors
    /// escalate the node fatally.
    fn on_reset(&self, _scope: &mut WorkScope<'_>) -> Result<(), ArborError> {
        Ok(())
    }

    /// Invoked once per Pending episode, just before the first run.
    fn on_start(&self) {}

    /// The task body. Must resolve to exactly one outcome; the default
    /// succeeds immediately. Offload blocking or CPU-heavy work with
    /// [`run_blocking`] instead of stalling the drive loop.
    async fn on_run(&self, _ctx: &RunContext) -> WorkOutcome {
        WorkOutcome::Success
    }

    /// The state to adopt after a successful run (default `Success`).
    ///
    /// Returning `Pending` requests another episode: the node resets and
    /// re-advances without consuming retry budget. Any other non-terminal
    /// return is treated as plain `Success`.
    fn on_success(&self) -> WorkState {
        WorkState::Success
    }

    /// Hook invoked before a transient failure is put on the retry timer.
    fn on_failure_retry(&self) {}

    /// Hook invoked when the retry budget is exhausted, before the node
    /// surfaces `FailureRaise` to its parent.
    fn on_failure_raise(&self) {}
}

/// Run a blocking or CPU-heavy closure on the blocking thread pool.
///
/// The drive loop must never be stalled by synchronous I/O or heavy
/// computation; leaf tasks call this from `on_run` and fold the result into
/// their outcome.
pub async fn run_blocking<T, F>(f: F) -> Result<T, ArborError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArborError::Other(format!("blocking task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Work for Noop {}

    #[tokio::test]
    async fn default_hooks_succeed_immediately() {
        let w = Noop;
        let ctx = RunContext {
            name: "noop".to_string(),
            attempt: 0,
            max_retries: 0,
        };
        assert_eq!(w.on_run(&ctx).await, WorkOutcome::Success);
        assert_eq!(w.on_success(), WorkState::Success);
    }

    #[tokio::test]
    async fn run_blocking_returns_closure_result() {
        let n = run_blocking(|| 40 + 2).await.unwrap();
        assert_eq!(n, 42);
    }
}
