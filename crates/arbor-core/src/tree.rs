//! The work tree: records, child bookkeeping, and aggregate queries.
//!
//! Design:
//! - A `WorkRecord` is the single source of truth for one node's state.
//! - The arena (`HashMap<WorkId, WorkRecord>`) owns every record; tree edges
//!   are plain ids, so parent/child links cannot form ownership cycles.
//! - Invariant: a child id appears in exactly one parent's children map, and
//!   that child's `parent` field points back at it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::ArborError;
use crate::ids::WorkId;
use crate::retry::RETRY_A_FEW;
use crate::state::WorkState;
use crate::work::Work;

/// Input spec for attaching a node.
#[derive(Debug, Clone)]
pub struct WorkSpec {
    /// Node name; must be unique among siblings.
    pub name: String,

    /// Retry budget for transient failures.
    pub max_retries: u32,
}

impl WorkSpec {
    /// Convenience constructor with the default retry budget.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: RETRY_A_FEW,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// One node of the work tree.
///
/// State transitions happen in the manager; this struct only keeps the
/// bookkeeping honest.
pub struct WorkRecord {
    pub name: String,
    pub work: Arc<dyn Work>,
    pub state: WorkState,

    /// Children by name. Name uniqueness among siblings is enforced here.
    pub children: HashMap<String, WorkId>,

    /// Back-reference; `None` only for the root.
    pub parent: Option<WorkId>,

    /// Retries consumed so far. Survives resets; cleared only on creation.
    pub retry_count: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Bars a second queued step for this node while one is outstanding.
    pub scheduled: bool,

    /// `on_start` latch; cleared by reset so each episode starts once.
    pub started: bool,

    /// Parent-notification latch; a node notifies at most once per episode.
    pub notified: bool,

    /// Lifecycle instance counter. Reset bumps it; steps and timers armed
    /// under an older generation are dropped at dispatch, which is how
    /// clearing a subtree cancels its outstanding timers.
    pub generation: u64,

    /// When the armed retry timer fires (status ETA).
    pub retry_at: Option<Instant>,

    /// Most recent failure reason.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkRecord {
    fn new(spec: WorkSpec, work: Arc<dyn Work>, parent: Option<WorkId>) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name,
            work,
            state: WorkState::Pending,
            children: HashMap::new(),
            parent,
            retry_count: 0,
            max_retries: spec.max_retries,
            scheduled: false,
            started: false,
            notified: false,
            generation: 0,
            retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Restricted handle a task receives in `on_reset` to attach its children.
pub struct WorkScope<'a> {
    tree: &'a mut WorkTree,
    parent: WorkId,
}

impl WorkScope<'_> {
    /// Attach a child under the resetting node. The child is reset (and so
    /// wires its own children) before this returns.
    pub fn add_child(&mut self, spec: WorkSpec, work: Arc<dyn Work>) -> Result<WorkId, ArborError> {
        self.tree.insert_child(self.parent, spec, work)
    }
}

/// The root's task object; the root never runs, so defaults suffice.
struct RootWork;

impl Work for RootWork {}

/// Arena of work records plus the tree bookkeeping over them.
pub struct WorkTree {
    records: HashMap<WorkId, WorkRecord>,
}

impl WorkTree {
    /// Create a tree with its root record. The root is permanently Running:
    /// it exists to parent top-level works and never completes.
    pub fn new() -> (Self, WorkId) {
        let mut tree = Self {
            records: HashMap::new(),
        };
        let root = WorkId::generate();
        let mut record = WorkRecord::new(WorkSpec::new("root"), Arc::new(RootWork), None);
        record.state = WorkState::Running;
        tree.records.insert(root, record);
        (tree, root)
    }

    pub fn get(&self, id: WorkId) -> Option<&WorkRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkId) -> Option<&mut WorkRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: WorkId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn generation(&self, id: WorkId) -> Option<u64> {
        self.records.get(&id).map(|r| r.generation)
    }

    pub fn child_ids(&self, id: WorkId) -> Vec<WorkId> {
        self.records
            .get(&id)
            .map(|r| r.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Insert a child and immediately reset it, which runs its `on_reset`
    /// and recursively wires grandchildren.
    ///
    /// Fails without mutating the tree if the name is already taken; if the
    /// child's own wiring fails, the half-attached subtree is removed before
    /// the error is returned.
    pub fn insert_child(
        &mut self,
        parent: WorkId,
        spec: WorkSpec,
        work: Arc<dyn Work>,
    ) -> Result<WorkId, ArborError> {
        let parent_record = self
            .records
            .get(&parent)
            .ok_or(ArborError::WorkNotFound(parent))?;
        if parent_record.children.contains_key(&spec.name) {
            return Err(ArborError::DuplicateChild {
                parent: parent_record.name.clone(),
                name: spec.name,
            });
        }

        let id = WorkId::generate();
        let name = spec.name.clone();
        self.records
            .insert(id, WorkRecord::new(spec, work, Some(parent)));
        if let Some(p) = self.records.get_mut(&parent) {
            p.children.insert(name, id);
            p.touch();
        }

        if let Err(e) = self.reset(id) {
            self.remove_subtree(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Put a node back into a fresh Pending episode: bump the generation,
    /// clear episode state, drop the old children, and let `on_reset`
    /// attach new ones. `retry_count` survives.
    pub fn reset(&mut self, id: WorkId) -> Result<(), ArborError> {
        let work = {
            let record = self
                .records
                .get_mut(&id)
                .ok_or(ArborError::WorkNotFound(id))?;
            record.generation += 1;
            record.state = WorkState::Pending;
            record.scheduled = false;
            record.started = false;
            record.notified = false;
            record.retry_at = None;
            record.last_error = None;
            record.touch();
            record.work.clone()
        };
        self.clear_children(id);

        let mut scope = WorkScope {
            tree: self,
            parent: id,
        };
        work.on_reset(&mut scope)
    }

    /// Cascading removal of everything under a node; the node itself stays.
    pub fn clear_children(&mut self, id: WorkId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        let children: Vec<WorkId> = record.children.values().copied().collect();
        record.children.clear();
        for child in children {
            self.drop_records(child);
        }
    }

    /// Remove a node and everything under it, unlinking it from its parent.
    pub fn remove_subtree(&mut self, id: WorkId) {
        let parent = self.records.get(&id).and_then(|r| r.parent);
        if let Some(p) = parent
            && let Some(parent_record) = self.records.get_mut(&p)
        {
            parent_record.children.retain(|_, child| *child != id);
            parent_record.touch();
        }
        self.drop_records(id);
    }

    fn drop_records(&mut self, id: WorkId) {
        if let Some(record) = self.records.remove(&id) {
            for child in record.children.values() {
                self.drop_records(*child);
            }
        }
    }

    fn child_states(&self, id: WorkId) -> impl Iterator<Item = WorkState> + '_ {
        self.records
            .get(&id)
            .into_iter()
            .flat_map(|r| r.children.values())
            .filter_map(|child| self.records.get(child).map(|r| r.state))
    }

    pub fn any_child_fatal(&self, id: WorkId) -> bool {
        self.child_states(id)
            .any(|s| s == WorkState::FailureFatal)
    }

    pub fn any_child_raised(&self, id: WorkId) -> bool {
        self.child_states(id)
            .any(|s| s == WorkState::FailureRaise)
    }

    /// Vacuously true for a childless node.
    pub fn all_children_successful(&self, id: WorkId) -> bool {
        self.child_states(id).all(|s| s == WorkState::Success)
    }

    pub fn all_children_done(&self, id: WorkId) -> bool {
        self.child_states(id).all(|s| s.is_terminal())
    }

    /// (satisfied, total) prerequisite counts for status reporting.
    pub fn prereq_progress(&self, id: WorkId) -> (usize, usize) {
        let mut done = 0;
        let mut total = 0;
        for state in self.child_states(id) {
            total += 1;
            if state == WorkState::Success {
                done += 1;
            }
        }
        (done, total)
    }

    /// Human-readable one-liner for a node.
    pub fn status_line(&self, id: WorkId) -> Option<String> {
        let record = self.records.get(&id)?;
        Some(match record.state {
            WorkState::Pending => {
                let (done, total) = self.prereq_progress(id);
                if total > 0 {
                    format!("Awaiting {done}/{total} prerequisites of: {}", record.name)
                } else {
                    format!("Queued to run: {}", record.name)
                }
            }
            WorkState::Running => format!("Running: {}", record.name),
            WorkState::Success => format!("Succeeded: {}", record.name),
            WorkState::FailureRetry => {
                let remaining = record
                    .retry_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                format!(
                    "Retrying in {} sec: {}",
                    remaining.as_secs_f64().ceil() as u64,
                    record.name
                )
            }
            WorkState::FailureRaise => format!("Failed: {}", record.name),
            WorkState::FailureFatal => format!("Fatally failed: {}", record.name),
        })
    }

    /// Status lines for every node below `id` (not including `id` itself).
    pub fn status_lines_under(&self, id: WorkId) -> Vec<String> {
        let mut lines = Vec::new();
        let mut stack = self.child_ids(id);
        while let Some(node) = stack.pop() {
            if let Some(line) = self.status_line(node) {
                lines.push(line);
            }
            stack.extend(self.child_ids(node));
        }
        lines
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf;
    impl Work for Leaf {}

    /// Attaches two fixed children on every reset.
    struct Pair;
    impl Work for Pair {
        fn on_reset(&self, scope: &mut WorkScope<'_>) -> Result<(), ArborError> {
            scope.add_child(WorkSpec::new("left"), Arc::new(Leaf))?;
            scope.add_child(WorkSpec::new("right"), Arc::new(Leaf))?;
            Ok(())
        }
    }

    #[test]
    fn insert_resets_and_wires_children() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();

        let record = tree.get(id).unwrap();
        assert_eq!(record.state, WorkState::Pending);
        assert_eq!(record.children.len(), 2);
        for child in tree.child_ids(id) {
            assert_eq!(tree.get(child).unwrap().state, WorkState::Pending);
        }
    }

    #[test]
    fn duplicate_child_rejected_without_mutation() {
        let (mut tree, root) = WorkTree::new();
        tree.insert_child(root, WorkSpec::new("x"), Arc::new(Leaf))
            .unwrap();
        let before = tree.len();

        let err = tree
            .insert_child(root, WorkSpec::new("x"), Arc::new(Leaf))
            .unwrap_err();
        assert!(matches!(err, ArborError::DuplicateChild { .. }));
        assert_eq!(tree.len(), before);
        assert_eq!(tree.child_ids(root).len(), 1);
    }

    #[test]
    fn reset_rebuilds_children_and_bumps_generation() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();
        let old_children = tree.child_ids(id);
        let old_generation = tree.generation(id).unwrap();

        tree.reset(id).unwrap();

        assert_eq!(tree.generation(id).unwrap(), old_generation + 1);
        let new_children = tree.child_ids(id);
        assert_eq!(new_children.len(), 2);
        for old in old_children {
            assert!(!tree.contains(old));
        }
    }

    #[test]
    fn reset_preserves_retry_count() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("leaf"), Arc::new(Leaf))
            .unwrap();
        tree.get_mut(id).unwrap().retry_count = 3;
        tree.reset(id).unwrap();
        assert_eq!(tree.get(id).unwrap().retry_count, 3);
    }

    #[test]
    fn clear_children_cascades_but_keeps_the_node() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();
        let children = tree.child_ids(id);

        tree.clear_children(id);

        assert!(tree.contains(id));
        assert!(tree.child_ids(id).is_empty());
        for child in children {
            assert!(!tree.contains(child));
        }
    }

    #[test]
    fn remove_subtree_cascades_and_unlinks() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();
        let children = tree.child_ids(id);

        tree.remove_subtree(id);

        assert!(!tree.contains(id));
        for child in children {
            assert!(!tree.contains(child));
        }
        assert!(tree.child_ids(root).is_empty());
    }

    #[test]
    fn aggregates_over_children() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();
        let children = tree.child_ids(id);

        assert!(!tree.all_children_successful(id));
        assert!(!tree.any_child_fatal(id));

        tree.get_mut(children[0]).unwrap().state = WorkState::Success;
        tree.get_mut(children[1]).unwrap().state = WorkState::Success;
        assert!(tree.all_children_successful(id));
        assert!(tree.all_children_done(id));

        tree.get_mut(children[1]).unwrap().state = WorkState::FailureFatal;
        assert!(tree.any_child_fatal(id));
        assert!(!tree.all_children_successful(id));

        tree.get_mut(children[1]).unwrap().state = WorkState::FailureRaise;
        assert!(tree.any_child_raised(id));
        assert!(!tree.any_child_fatal(id));
    }

    #[test]
    fn childless_node_has_vacuously_successful_children() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("leaf"), Arc::new(Leaf))
            .unwrap();
        assert!(tree.all_children_successful(id));
    }

    #[test]
    fn status_lines() {
        let (mut tree, root) = WorkTree::new();
        let id = tree
            .insert_child(root, WorkSpec::new("pair"), Arc::new(Pair))
            .unwrap();
        assert_eq!(
            tree.status_line(id).unwrap(),
            "Awaiting 0/2 prerequisites of: pair"
        );

        let children = tree.child_ids(id);
        tree.get_mut(children[0]).unwrap().state = WorkState::Success;
        assert_eq!(
            tree.status_line(id).unwrap(),
            "Awaiting 1/2 prerequisites of: pair"
        );

        let record = tree.get_mut(id).unwrap();
        record.state = WorkState::FailureRetry;
        record.retry_at = Some(Instant::now() + std::time::Duration::from_secs(7));
        let line = tree.status_line(id).unwrap();
        assert!(line.starts_with("Retrying in "), "{line}");
        assert!(line.ends_with(" sec: pair"), "{line}");
    }
}
