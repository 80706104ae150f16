// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Domain Model
//!
//! A task is a goal decomposed into a DAG of subtasks, each bound to
//! exactly one capability requirement. The graph is validated at
//! construction: unknown dependency references and cycles are rejected
//! before anything is scheduled.
//!
//! # Invariants
//!
//! - A subtask is `Ready` only when every dependency is `Succeeded`.
//! - The task is `Succeeded` only when every subtask is `Succeeded`; it is
//!   `PartiallyFailed` when only non-critical subtasks failed.
//! - The task reaches a terminal state only once every subtask is terminal
//!   (no partial result set is ever reported as final).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::device::Capability;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a subtask inside its task graph (unique per task)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubtaskId(String);

impl SubtaskId {
    pub fn new(name: impl Into<String>) -> Result<Self, TaskError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TaskError::InvalidSubtaskId(
                "Subtask id cannot be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Ready,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
    /// Permanently blocked by a failed critical dependency
    Blocked,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed | Self::Failed)
    }
}

/// Retry policy applied per subtask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let raw = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.backoff_cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// One DAG node, bound to exactly one capability requirement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub capability: Capability,
    /// Command name forwarded to the capability provider
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: BTreeSet<SubtaskId>,
    /// Non-critical subtasks fail soft: dependents proceed with a
    /// placeholder result and the task degrades to `PartiallyFailed`.
    #[serde(default = "default_critical")]
    pub critical: bool,
    pub state: SubtaskState,
    #[serde(default)]
    pub attempts: u32,
}

fn default_critical() -> bool {
    true
}

impl Subtask {
    pub fn new(id: SubtaskId, capability: Capability, command: impl Into<String>) -> Self {
        Self {
            id,
            capability,
            command: command.into(),
            params: serde_json::Value::Null,
            depends_on: BTreeSet::new(),
            critical: true,
            state: SubtaskState::Pending,
            attempts: 0,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, dep: SubtaskId) -> Self {
        self.depends_on.insert(dep);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Placeholder recorded for a failed non-critical subtask so dependents
/// can still run.
pub fn placeholder_result(subtask: &SubtaskId, error: &str) -> serde_json::Value {
    serde_json::json!({
        "subtask": subtask.as_str(),
        "placeholder": true,
        "error": error,
    })
}

/// Task Aggregate Root
///
/// Owns its subtask graph for the lifetime of the execution; collaborators
/// get read views only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal: String,
    pub state: TaskState,
    pub retry_policy: RetryPolicy,
    subtasks: HashMap<SubtaskId, Subtask>,
    /// Populated incrementally, keyed by subtask id
    results: HashMap<SubtaskId, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with validation: duplicate ids, unknown dependency
    /// references and cycles are construction errors.
    pub fn new(
        goal: impl Into<String>,
        subtasks: Vec<Subtask>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, TaskError> {
        if subtasks.is_empty() {
            return Err(TaskError::NoSubtasks);
        }

        let mut graph: HashMap<SubtaskId, Subtask> = HashMap::new();
        for subtask in subtasks {
            if graph.contains_key(&subtask.id) {
                return Err(TaskError::DuplicateSubtask(subtask.id));
            }
            graph.insert(subtask.id.clone(), subtask);
        }

        for subtask in graph.values() {
            for dep in &subtask.depends_on {
                if !graph.contains_key(dep) {
                    return Err(TaskError::UnknownDependency {
                        subtask: subtask.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if dep == &subtask.id {
                    return Err(TaskError::CycleDetected(subtask.id.clone()));
                }
            }
        }

        Self::check_for_cycles(&graph)?;

        Ok(Self {
            id: TaskId::new(),
            goal: goal.into(),
            state: TaskState::Pending,
            retry_policy,
            subtasks: graph,
            results: HashMap::new(),
            created_at: Utc::now(),
        })
    }

    /// Depth-first cycle detection over the dependency edges
    fn check_for_cycles(graph: &HashMap<SubtaskId, Subtask>) -> Result<(), TaskError> {
        fn visit(
            current: &SubtaskId,
            graph: &HashMap<SubtaskId, Subtask>,
            visited: &mut HashSet<SubtaskId>,
            rec_stack: &mut HashSet<SubtaskId>,
        ) -> Option<SubtaskId> {
            visited.insert(current.clone());
            rec_stack.insert(current.clone());

            if let Some(subtask) = graph.get(current) {
                for dep in &subtask.depends_on {
                    if !visited.contains(dep) {
                        if let Some(offender) = visit(dep, graph, visited, rec_stack) {
                            return Some(offender);
                        }
                    } else if rec_stack.contains(dep) {
                        return Some(dep.clone());
                    }
                }
            }

            rec_stack.remove(current);
            None
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for id in graph.keys() {
            if !visited.contains(id) {
                if let Some(offender) = visit(id, graph, &mut visited, &mut rec_stack) {
                    return Err(TaskError::CycleDetected(offender));
                }
            }
        }
        Ok(())
    }

    pub fn subtask(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.subtasks.get(id)
    }

    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.values()
    }

    pub fn subtask_count(&self) -> usize {
        self.subtasks.len()
    }

    pub fn results(&self) -> &HashMap<SubtaskId, serde_json::Value> {
        &self.results
    }

    /// Subtasks whose dependencies have all succeeded (or failed soft),
    /// promoted to `Ready`.
    pub fn ready_set(&mut self) -> Vec<SubtaskId> {
        let mut ready = Vec::new();
        let snapshot: Vec<(SubtaskId, BTreeSet<SubtaskId>)> = self
            .subtasks
            .values()
            .filter(|s| matches!(s.state, SubtaskState::Pending))
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();

        for (id, deps) in snapshot {
            let unblocked = deps.iter().all(|dep| {
                self.subtasks
                    .get(dep)
                    .map(|d| {
                        d.state == SubtaskState::Succeeded
                            || (d.state == SubtaskState::Failed && !d.critical)
                    })
                    .unwrap_or(false)
            });
            if unblocked {
                if let Some(subtask) = self.subtasks.get_mut(&id) {
                    subtask.state = SubtaskState::Ready;
                }
                ready.push(id);
            }
        }
        ready.sort();
        ready
    }

    pub fn mark_dispatched(&mut self, id: &SubtaskId) {
        if let Some(subtask) = self.subtasks.get_mut(id) {
            subtask.state = SubtaskState::Dispatched;
            subtask.attempts += 1;
        }
    }

    pub fn mark_retrying(&mut self, id: &SubtaskId) {
        if let Some(subtask) = self.subtasks.get_mut(id) {
            subtask.state = SubtaskState::Retrying;
        }
    }

    /// Record a successful result and advance the graph
    pub fn record_success(&mut self, id: &SubtaskId, result: serde_json::Value) {
        if let Some(subtask) = self.subtasks.get_mut(id) {
            subtask.state = SubtaskState::Succeeded;
        }
        self.results.insert(id.clone(), result);
        self.refresh_state();
    }

    /// Record a permanent failure; non-critical subtasks leave a
    /// placeholder result so dependents can proceed, critical failures
    /// block every transitive dependent.
    pub fn record_failure(&mut self, id: &SubtaskId, error: &str) {
        let critical = match self.subtasks.get_mut(id) {
            Some(subtask) => {
                subtask.state = SubtaskState::Failed;
                subtask.critical
            }
            None => return,
        };

        if critical {
            self.block_dependents(id);
        } else {
            self.results
                .insert(id.clone(), placeholder_result(id, error));
        }
        self.refresh_state();
    }

    fn block_dependents(&mut self, failed: &SubtaskId) {
        // Transitive closure over dependency edges
        let mut blocked: HashSet<SubtaskId> = HashSet::new();
        loop {
            let mut grew = false;
            for subtask in self.subtasks.values() {
                if subtask.state.is_terminal() || blocked.contains(&subtask.id) {
                    continue;
                }
                if subtask
                    .depends_on
                    .iter()
                    .any(|dep| dep == failed || blocked.contains(dep))
                {
                    blocked.insert(subtask.id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        for id in blocked {
            if let Some(subtask) = self.subtasks.get_mut(&id) {
                subtask.state = SubtaskState::Blocked;
            }
        }
    }

    /// True once every subtask has reached a terminal state
    pub fn all_terminal(&self) -> bool {
        self.subtasks.values().all(|s| s.state.is_terminal())
    }

    /// Recompute the task state; only flips to a terminal task state once
    /// every subtask is terminal.
    fn refresh_state(&mut self) {
        if !self.all_terminal() {
            self.state = TaskState::Running;
            return;
        }
        let any_critical_failed = self.subtasks.values().any(|s| {
            matches!(s.state, SubtaskState::Failed | SubtaskState::Blocked) && s.critical
        });
        let any_failed = self
            .subtasks
            .values()
            .any(|s| matches!(s.state, SubtaskState::Failed | SubtaskState::Blocked));

        self.state = if any_critical_failed {
            TaskState::Failed
        } else if any_failed {
            TaskState::PartiallyFailed
        } else {
            TaskState::Succeeded
        };
    }

    /// Cancellation: the task goes `Failed`, every non-terminal subtask is
    /// blocked, and late results for them will be discarded by the router.
    pub fn cancel(&mut self) {
        for subtask in self.subtasks.values_mut() {
            if !subtask.state.is_terminal() {
                subtask.state = SubtaskState::Blocked;
            }
        }
        self.state = TaskState::Failed;
    }

    /// Per-subtask breakdown for status reporting
    pub fn breakdown(&self) -> HashMap<SubtaskId, SubtaskState> {
        self.subtasks
            .iter()
            .map(|(id, s)| (id.clone(), s.state))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task must have at least one subtask")]
    NoSubtasks,

    #[error("Invalid subtask id: {0}")]
    InvalidSubtaskId(String),

    #[error("Duplicate subtask id '{0}'")]
    DuplicateSubtask(SubtaskId),

    #[error("Subtask '{subtask}' depends on unknown subtask '{dependency}'")]
    UnknownDependency {
        subtask: SubtaskId,
        dependency: SubtaskId,
    },

    #[error("Dependency cycle through subtask '{0}'")]
    CycleDetected(SubtaskId),

    #[error("Task '{0}' not found")]
    NotFound(TaskId),

    #[error("Task '{0}' is already terminal")]
    AlreadyTerminal(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SubtaskId {
        SubtaskId::new(s).unwrap()
    }

    fn subtask(id: &str, cap: &str) -> Subtask {
        Subtask::new(sid(id), Capability::new(cap), "run")
    }

    #[test]
    fn test_empty_task_rejected() {
        let result = Task::new("noop", vec![], RetryPolicy::default());
        assert!(matches!(result, Err(TaskError::NoSubtasks)));
    }

    #[test]
    fn test_cycle_rejected_before_scheduling() {
        let a = subtask("a", "ocr").depends_on(sid("b"));
        let b = subtask("b", "ocr").depends_on(sid("a"));
        let result = Task::new("cyclic", vec![a, b], RetryPolicy::default());
        assert!(matches!(result, Err(TaskError::CycleDetected(_))));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let a = subtask("a", "ocr").depends_on(sid("a"));
        let result = Task::new("self", vec![a], RetryPolicy::default());
        assert!(matches!(result, Err(TaskError::CycleDetected(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let a = subtask("a", "ocr").depends_on(sid("ghost"));
        let result = Task::new("dangling", vec![a], RetryPolicy::default());
        assert!(matches!(result, Err(TaskError::UnknownDependency { .. })));
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let a = subtask("a", "ocr");
        let b = subtask("b", "ssh-exec").depends_on(sid("a"));
        let mut task = Task::new("chain", vec![a, b], RetryPolicy::default()).unwrap();

        assert_eq!(task.ready_set(), vec![sid("a")]);
        // Still dispatched, not succeeded: b must stay pending
        task.mark_dispatched(&sid("a"));
        assert!(task.ready_set().is_empty());

        task.record_success(&sid("a"), serde_json::json!({"ok": true}));
        assert_eq!(task.ready_set(), vec![sid("b")]);
    }

    #[test]
    fn test_all_succeeded_yields_succeeded() {
        let a = subtask("a", "ocr");
        let b = subtask("b", "ocr").depends_on(sid("a"));
        let mut task = Task::new("t", vec![a, b], RetryPolicy::default()).unwrap();

        task.record_success(&sid("a"), serde_json::json!(1));
        assert_eq!(task.state, TaskState::Running);
        task.record_success(&sid("b"), serde_json::json!(2));
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.results().len(), 2);
    }

    #[test]
    fn test_critical_failure_blocks_dependents() {
        let a = subtask("a", "ocr");
        let b = subtask("b", "ocr").depends_on(sid("a"));
        let c = subtask("c", "ocr").depends_on(sid("b"));
        let mut task = Task::new("t", vec![a, b, c], RetryPolicy::default()).unwrap();

        task.record_failure(&sid("a"), "boom");
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.subtask(&sid("b")).unwrap().state, SubtaskState::Blocked);
        assert_eq!(task.subtask(&sid("c")).unwrap().state, SubtaskState::Blocked);
    }

    #[test]
    fn test_non_critical_failure_leaves_placeholder() {
        let a = subtask("a", "ocr").non_critical();
        let b = subtask("b", "ocr").depends_on(sid("a"));
        let mut task = Task::new("t", vec![a, b], RetryPolicy::default()).unwrap();

        task.record_failure(&sid("a"), "flaky sensor");
        // Dependent proceeds with the placeholder in place
        assert_eq!(task.ready_set(), vec![sid("b")]);
        assert!(task.results().get(&sid("a")).unwrap()["placeholder"]
            .as_bool()
            .unwrap());

        task.record_success(&sid("b"), serde_json::json!("done"));
        assert_eq!(task.state, TaskState::PartiallyFailed);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }

    #[test]
    fn test_cancel_blocks_in_flight() {
        let a = subtask("a", "ocr");
        let b = subtask("b", "ocr").depends_on(sid("a"));
        let mut task = Task::new("t", vec![a, b], RetryPolicy::default()).unwrap();

        task.mark_dispatched(&sid("a"));
        task.cancel();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.all_terminal());
    }
}
