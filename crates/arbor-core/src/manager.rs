//! The work manager: the root of the tree and the drive loop.
//!
//! Design intent:
//! - The manager is the single mutator. Every state transition, children-map
//!   change, and parent notification happens on its drive loop; task futures
//!   run elsewhere and only post outcomes back through the scheduler channel.
//! - A node's terminal outcome is surfaced to its parent exactly once. For
//!   ordinary parents that means a re-advance; for the root it means log,
//!   count, report, and remove.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::error::ArborError;
use crate::ids::WorkId;
use crate::outcome::WorkOutcome;
use crate::retry::RetryPolicy;
use crate::sched::{Scheduler, Step};
use crate::state::WorkState;
use crate::status::{FinishedWork, WorkCounts};
use crate::tree::{WorkSpec, WorkTree};
use crate::work::{RunContext, Work};

pub struct WorkManager {
    tree: WorkTree,
    root: WorkId,
    sched: Scheduler,
    policy: RetryPolicy,
    counts: WorkCounts,
    finished: HashMap<WorkId, FinishedWork>,
}

impl WorkManager {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::standard())
    }

    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        let (tree, root) = WorkTree::new();
        Self {
            tree,
            root,
            sched: Scheduler::new(),
            policy,
            counts: WorkCounts::default(),
            finished: HashMap::new(),
        }
    }

    /// Attach a work under the root and queue its first advance.
    ///
    /// Keep a clone of the `Arc` to inspect the task object after it
    /// finishes; the tree's record is removed once the root is notified.
    pub fn add_work(&mut self, spec: WorkSpec, work: Arc<dyn Work>) -> Result<WorkId, ArborError> {
        let id = self.tree.insert_child(self.root, spec, work)?;
        self.advance(id);
        Ok(id)
    }

    /// Attach a work and drive the tree until it reaches a terminal state.
    pub async fn execute_work(
        &mut self,
        spec: WorkSpec,
        work: Arc<dyn Work>,
    ) -> Result<FinishedWork, ArborError> {
        let id = self.add_work(spec, work)?;
        self.drive(id).await
    }

    /// Drive the whole tree until `target` (a previously attached work)
    /// finishes, then return its report.
    pub async fn drive(&mut self, target: WorkId) -> Result<FinishedWork, ArborError> {
        loop {
            if let Some(report) = self.finished.get(&target) {
                return Ok(report.clone());
            }
            if !self.tree.contains(target) {
                return Err(ArborError::WorkNotFound(target));
            }
            let step = self.sched.next_step().await;
            self.dispatch(step);
        }
    }

    pub fn counts(&self) -> &WorkCounts {
        &self.counts
    }

    pub fn state_of(&self, id: WorkId) -> Option<WorkState> {
        self.tree.get(id).map(|r| r.state)
    }

    pub fn status_of(&self, id: WorkId) -> Option<String> {
        self.tree.status_line(id)
    }

    /// Status lines for every live node in the tree.
    pub fn status_lines(&self) -> Vec<String> {
        self.tree.status_lines_under(self.root)
    }

    /// Report for a finished work, if it has finished.
    pub fn finished_work(&self, id: WorkId) -> Option<&FinishedWork> {
        self.finished.get(&id)
    }

    fn dispatch(&mut self, step: Step) {
        match step {
            Step::Run { work, generation } => self.run(work, generation),
            Step::FireRetry { work, generation } => self.fire_retry(work, generation),
            Step::Complete {
                work,
                generation,
                outcome,
            } => self.complete(work, generation, outcome),
        }
    }

    /// Push a Pending node (and its descendants) forward. No-op in any
    /// other state, and re-entrant: a node with a queued step is skipped.
    fn advance(&mut self, id: WorkId) {
        match self.tree.get(id) {
            Some(record) if record.state == WorkState::Pending => {}
            _ => return,
        }
        for child in self.tree.child_ids(id) {
            self.advance(child);
        }

        let Some(record) = self.tree.get(id) else {
            return;
        };
        if record.scheduled {
            return;
        }
        let generation = record.generation;

        if self.tree.any_child_fatal(id) {
            self.mark_scheduled(id);
            self.sched.post(Step::Complete {
                work: id,
                generation,
                outcome: WorkOutcome::fatal("fatal failure in child work"),
            });
        } else if self.tree.any_child_raised(id) {
            self.mark_scheduled(id);
            self.sched.post(Step::Complete {
                work: id,
                generation,
                outcome: WorkOutcome::failure("child work exhausted its retries"),
            });
        } else if self.tree.all_children_successful(id) {
            self.mark_scheduled(id);
            self.sched.post(Step::Run {
                work: id,
                generation,
            });
        }
    }

    fn mark_scheduled(&mut self, id: WorkId) {
        if let Some(record) = self.tree.get_mut(id) {
            record.scheduled = true;
        }
    }

    /// Start the node's own execution: `on_start` once per episode, then
    /// spawn the `on_run` future. Its outcome comes back as a Complete step.
    fn run(&mut self, id: WorkId, generation: u64) {
        let (task, ctx, first) = {
            let Some(record) = self.tree.get_mut(id) else {
                return;
            };
            if record.generation != generation {
                return;
            }
            record.scheduled = false;
            if record.state != WorkState::Pending {
                return;
            }
            let first = !record.started;
            record.started = true;
            record.state = WorkState::Running;
            record.touch();
            let ctx = RunContext {
                name: record.name.clone(),
                attempt: record.retry_count,
                max_retries: record.max_retries,
            };
            (record.work.clone(), ctx, first)
        };

        if first {
            task.on_start();
        }
        tracing::debug!(name = %ctx.name, attempt = ctx.attempt, "running work");

        let tx = self.sched.sender();
        tokio::spawn(async move {
            let outcome = task.on_run(&ctx).await;
            let _ = tx.send(Step::Complete {
                work: id,
                generation,
                outcome,
            });
        });
    }

    /// Fold an outcome into the node: success adopts `on_success`'s state,
    /// transient failure arms the retry timer until the budget runs out,
    /// fatal failure is terminal immediately.
    fn complete(&mut self, id: WorkId, generation: u64, outcome: WorkOutcome) {
        let (task, name, state, retry_count, max_retries) = {
            let Some(record) = self.tree.get_mut(id) else {
                return;
            };
            if record.generation != generation {
                return;
            }
            record.scheduled = false;
            (
                record.work.clone(),
                record.name.clone(),
                record.state,
                record.retry_count,
                record.max_retries,
            )
        };
        // A completion lands on a Running node (its own execution) or on a
        // Pending one (aggregate escalation from children); anything else
        // is stale.
        if !matches!(state, WorkState::Running | WorkState::Pending) {
            return;
        }

        match outcome {
            WorkOutcome::Success => {
                let adopt = task.on_success();
                if adopt == WorkState::Pending {
                    // Another episode requested; retry budget is untouched.
                    match self.tree.reset(id) {
                        Ok(()) => self.advance(id),
                        Err(e) => {
                            self.set_terminal(id, WorkState::FailureFatal, Some(e.to_string()))
                        }
                    }
                } else if adopt.is_terminal() {
                    self.set_terminal(id, adopt, None);
                } else {
                    self.set_terminal(id, WorkState::Success, None);
                }
            }
            WorkOutcome::Failure(reason) => {
                if retry_count >= max_retries {
                    task.on_failure_raise();
                    self.set_terminal(id, WorkState::FailureRaise, Some(reason));
                } else {
                    task.on_failure_retry();
                    let delay = self.policy.next_delay(retry_count);
                    if let Some(record) = self.tree.get_mut(id) {
                        record.state = WorkState::FailureRetry;
                        record.last_error = Some(reason.clone());
                        record.retry_at = Some(Instant::now() + delay);
                        record.touch();
                    }
                    self.counts.retries += 1;
                    tracing::warn!(
                        name = %name,
                        attempt = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "work failed, retry scheduled"
                    );
                    self.sched.schedule_retry(id, generation, delay);
                }
            }
            WorkOutcome::Fatal(reason) => {
                tracing::warn!(name = %name, error = %reason, "work failed fatally");
                self.set_terminal(id, WorkState::FailureFatal, Some(reason));
            }
        }
    }

    /// A backoff timer fired: consume one retry and start a fresh episode.
    fn fire_retry(&mut self, id: WorkId, generation: u64) {
        {
            let Some(record) = self.tree.get_mut(id) else {
                return;
            };
            if record.generation != generation || record.state != WorkState::FailureRetry {
                return;
            }
            record.retry_count += 1;
            record.retry_at = None;
            record.touch();
            tracing::debug!(name = %record.name, attempt = record.retry_count, "retrying work");
        }
        match self.tree.reset(id) {
            Ok(()) => self.advance(id),
            Err(e) => self.set_terminal(id, WorkState::FailureFatal, Some(e.to_string())),
        }
    }

    /// Adopt a terminal state and notify the parent, at most once per
    /// episode.
    fn set_terminal(&mut self, id: WorkId, state: WorkState, error: Option<String>) {
        let parent = {
            let Some(record) = self.tree.get_mut(id) else {
                return;
            };
            record.state = state;
            if error.is_some() {
                record.last_error = error;
            }
            record.touch();
            if record.notified {
                return;
            }
            record.notified = true;
            tracing::debug!(name = %record.name, state = ?state, "work reached terminal state");
            record.parent
        };
        match parent {
            Some(p) if p == self.root => self.finish_under_root(id),
            Some(p) => self.advance(p),
            None => {}
        }
    }

    /// Root notification: log, count, stash the report, drop the subtree.
    /// The root itself never becomes terminal.
    fn finish_under_root(&mut self, id: WorkId) {
        let Some(record) = self.tree.get(id) else {
            return;
        };
        let report = FinishedWork {
            name: record.name.clone(),
            state: record.state,
            retries: record.retry_count,
            last_error: record.last_error.clone(),
            finished_at: Utc::now(),
        };
        match report.state {
            WorkState::Success => self.counts.succeeded += 1,
            WorkState::FailureRaise => self.counts.raised += 1,
            WorkState::FailureFatal => self.counts.fatal += 1,
            _ => {}
        }
        tracing::info!(
            name = %report.name,
            state = ?report.state,
            retries = report.retries,
            "work finished"
        );
        self.finished.insert(id, report);
        self.tree.remove_subtree(id);
    }

    #[cfg(test)]
    fn queued_steps(&self) -> usize {
        self.sched.queued_steps()
    }

    #[cfg(test)]
    fn advance_for_test(&mut self, id: WorkId) {
        self.advance(id);
    }
}

impl Default for WorkManager {
    fn default() -> Self {
        Self::new()
    }
}
