//! Demo driver: a small snapshot pipeline on the work tree.
//!
//! Tree shape:
//!
//! ```text
//! snapshot                 writes the snapshot once verification passed
//! └── verify               hashes the fetched segments off the drive loop
//!     ├── fetch-headers    succeeds first try
//!     └── fetch-state      fails twice, then succeeds (retry/backoff demo)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use arbor_core::{
    ArborError, RETRY_A_FEW, RETRY_ONCE, RetryPolicy, RunContext, Work, WorkCounts, WorkManager,
    WorkOutcome, WorkScope, WorkSpec, WorkState, run_blocking,
};

/// Pretends to download one segment; fails the first `remaining_failures`
/// attempts to exercise the backoff path.
struct FetchSegment {
    remaining_failures: AtomicU32,
}

impl FetchSegment {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Work for FetchSegment {
    async fn on_run(&self, ctx: &RunContext) -> WorkOutcome {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return WorkOutcome::failure(format!("connection dropped (left={left})"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracing::info!(name = %ctx.name, attempt = ctx.attempt, "segment fetched");
        WorkOutcome::Success
    }
}

/// Verifies the fetched segments. The hashing stand-in is CPU work, so it
/// goes through `run_blocking` instead of stalling the drive loop.
struct VerifySegments;

#[async_trait]
impl Work for VerifySegments {
    fn on_reset(&self, scope: &mut WorkScope<'_>) -> Result<(), ArborError> {
        scope.add_child(
            WorkSpec::new("fetch-headers").with_max_retries(RETRY_A_FEW),
            Arc::new(FetchSegment::new(0)),
        )?;
        scope.add_child(
            WorkSpec::new("fetch-state").with_max_retries(RETRY_A_FEW),
            Arc::new(FetchSegment::new(2)),
        )?;
        Ok(())
    }

    async fn on_run(&self, _ctx: &RunContext) -> WorkOutcome {
        let digest = match run_blocking(|| {
            (0u64..100_000).fold(0u64, |acc, x| acc.wrapping_mul(31).wrapping_add(x))
        })
        .await
        {
            Ok(digest) => digest,
            Err(e) => return WorkOutcome::fatal(e.to_string()),
        };
        tracing::info!(digest, "segments verified");
        WorkOutcome::Success
    }
}

/// Top-level work: write the snapshot once verification succeeded.
struct Snapshot;

#[async_trait]
impl Work for Snapshot {
    fn on_reset(&self, scope: &mut WorkScope<'_>) -> Result<(), ArborError> {
        scope.add_child(WorkSpec::new("verify"), Arc::new(VerifySegments))?;
        Ok(())
    }

    async fn on_run(&self, ctx: &RunContext) -> WorkOutcome {
        tracing::info!(name = %ctx.name, "writing snapshot");
        WorkOutcome::Success
    }
}

#[derive(Serialize)]
struct DemoSummary<'a> {
    final_state: WorkState,
    retries: u32,
    counters: &'a WorkCounts,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Short ticks so the demo's backoff is visible without being boring.
    let mut manager =
        WorkManager::with_retry_policy(RetryPolicy::with_unit(Duration::from_millis(200)));

    let report = match manager
        .execute_work(
            WorkSpec::new("snapshot").with_max_retries(RETRY_ONCE),
            Arc::new(Snapshot),
        )
        .await
    {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "could not attach snapshot work");
            return;
        }
    };

    let summary = DemoSummary {
        final_state: report.state,
        retries: report.retries,
        counters: manager.counts(),
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "could not render summary"),
    }
}
