//! Deferred-step scheduling: a step queue, a retry-timer heap, and the
//! completion channel that task futures post back through.
//!
//! The scheduler is a plain object owned by its manager; there is no global
//! event loop. All steps carry the generation of the node they were armed
//! under, so anything that outlives a reset is dropped at dispatch.

use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::ids::WorkId;
use crate::outcome::WorkOutcome;

/// One deferred unit of state-machine progress.
#[derive(Debug)]
pub(crate) enum Step {
    /// Start the node's own execution.
    Run { work: WorkId, generation: u64 },

    /// A backoff timer fired; reset and re-advance the node.
    FireRetry { work: WorkId, generation: u64 },

    /// A task execution (or an aggregate evaluation) reported an outcome.
    Complete {
        work: WorkId,
        generation: u64,
        outcome: WorkOutcome,
    },
}

/// Armed retry timer.
///
/// We use reverse ordering so `BinaryHeap` acts as a min-heap (earliest
/// fire time first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct RetryTimer {
    fire_at: Instant,
    work: WorkId,
    generation: u64,
}

impl PartialOrd for RetryTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.fire_at.cmp(&self.fire_at)
    }
}

pub(crate) struct Scheduler {
    /// Steps ready to dispatch, in post order.
    ready: VecDeque<Step>,

    /// Armed backoff timers.
    timers: BinaryHeap<RetryTimer>,

    tx: UnboundedSender<Step>,
    rx: UnboundedReceiver<Step>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            tx,
            rx,
        }
    }

    /// Sender handle for spawned task futures. This is the only way work
    /// executed off the drive loop feeds results back in.
    pub(crate) fn sender(&self) -> UnboundedSender<Step> {
        self.tx.clone()
    }

    /// Queue a step for dispatch.
    pub(crate) fn post(&mut self, step: Step) {
        self.ready.push_back(step);
    }

    /// Arm a backoff timer.
    pub(crate) fn schedule_retry(&mut self, work: WorkId, generation: u64, delay: Duration) {
        self.timers.push(RetryTimer {
            fire_at: Instant::now() + delay,
            work,
            generation,
        });
    }

    /// Move due timers onto the step queue.
    fn promote_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.timers.peek() {
            if timer.fire_at > now {
                break; // heap is sorted, nothing else is due
            }
            if let Some(timer) = self.timers.pop() {
                self.ready.push_back(Step::FireRetry {
                    work: timer.work,
                    generation: timer.generation,
                });
            }
        }
    }

    /// Next step to dispatch. Waits on the completion channel or the
    /// earliest timer when nothing is ready.
    pub(crate) async fn next_step(&mut self) -> Step {
        loop {
            self.promote_due_timers();
            while let Ok(step) = self.rx.try_recv() {
                self.ready.push_back(step);
            }
            if let Some(step) = self.ready.pop_front() {
                return step;
            }

            match self.timers.peek().map(|t| t.fire_at) {
                Some(fire_at) => {
                    tokio::select! {
                        step = self.rx.recv() => {
                            if let Some(step) = step {
                                self.ready.push_back(step);
                            }
                        }
                        _ = tokio::time::sleep_until(fire_at.into()) => {}
                    }
                }
                None => {
                    if let Some(step) = self.rx.recv().await {
                        self.ready.push_back(step);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_steps(&self) -> usize {
        self.ready.len()
    }

    #[cfg(test)]
    pub(crate) fn armed_timers(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posted_steps_come_back_in_order() {
        let mut sched = Scheduler::new();
        let a = WorkId::generate();
        let b = WorkId::generate();
        sched.post(Step::Run {
            work: a,
            generation: 1,
        });
        sched.post(Step::Run {
            work: b,
            generation: 1,
        });

        match sched.next_step().await {
            Step::Run { work, .. } => assert_eq!(work, a),
            other => panic!("unexpected step: {other:?}"),
        }
        match sched.next_step().await {
            Step::Run { work, .. } => assert_eq!(work, b),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn due_timer_becomes_fire_retry() {
        let mut sched = Scheduler::new();
        let id = WorkId::generate();
        sched.schedule_retry(id, 7, Duration::ZERO);

        match sched.next_step().await {
            Step::FireRetry { work, generation } => {
                assert_eq!(work, id);
                assert_eq!(generation, 7);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(sched.armed_timers(), 0);
    }

    #[tokio::test]
    async fn earliest_timer_fires_first() {
        let mut sched = Scheduler::new();
        let late = WorkId::generate();
        let early = WorkId::generate();
        sched.schedule_retry(late, 1, Duration::from_millis(50));
        sched.schedule_retry(early, 1, Duration::ZERO);

        match sched.next_step().await {
            Step::FireRetry { work, .. } => assert_eq!(work, early),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_channel_feeds_the_queue() {
        let mut sched = Scheduler::new();
        let id = WorkId::generate();
        let tx = sched.sender();
        tokio::spawn(async move {
            let _ = tx.send(Step::Complete {
                work: id,
                generation: 1,
                outcome: WorkOutcome::Success,
            });
        });

        match sched.next_step().await {
            Step::Complete { work, outcome, .. } => {
                assert_eq!(work, id);
                assert_eq!(outcome, WorkOutcome::Success);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }
}
