use crate::task::handle::{Task, TaskValue};
use crate::task::types::*;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// "Depends-on" edges among pending tasks.
///
/// Each edge is stored in both directions: `upstream` answers readiness
/// queries, `downstream` drives cancellation propagation.
pub struct DependencyGraph<T: TaskValue> {
    upstream: HashMap<TaskId, Vec<Task<T>>>,
    downstream: HashMap<TaskId, Vec<Task<T>>>,
}

impl<T: TaskValue> DependencyGraph<T> {
    pub fn new() -> Self {
        Self {
            upstream: HashMap::new(),
            downstream: HashMap::new(),
        }
    }

    /// Record that `task` must not start until `upon` has finished
    pub fn add_dependency(&mut self, task: &Task<T>, upon: &Task<T>) -> Result<(), SchedulerError> {
        if task.id() == upon.id() {
            return Err(SchedulerError::invalid_edge(
                task.id(),
                upon.id(),
                "a task cannot depend on itself",
            ));
        }
        if task.state() != TaskState::Ready {
            return Err(SchedulerError::invalid_edge(
                task.id(),
                upon.id(),
                format!("dependent task is already {}", task.state()),
            ));
        }
        if self.reaches(upon.id(), task.id()) || upon.depends_on(task) {
            return Err(SchedulerError::invalid_edge(
                task.id(),
                upon.id(),
                "edge would create a cycle",
            ));
        }

        let upstream = self.upstream.entry(task.id()).or_default();
        if upstream.iter().any(|dep| dep.id() == upon.id()) {
            return Ok(());
        }
        upstream.push(upon.clone());
        self.downstream
            .entry(upon.id())
            .or_default()
            .push(task.clone());

        debug!("Recorded dependency {} -> {}", task.label(), upon.label());
        Ok(())
    }

    /// Add every edge the task declared on itself.
    ///
    /// On failure no edge for `task` is left behind.
    pub fn register(&mut self, task: &Task<T>) -> Result<(), SchedulerError> {
        for upon in task.dependencies() {
            if let Err(err) = self.add_dependency(task, &upon) {
                self.remove(task.id());
                return Err(err);
            }
        }
        Ok(())
    }

    /// True iff every dependency of `task` has finished
    pub fn is_satisfied(&self, task: &Task<T>) -> bool {
        self.upstream
            .get(&task.id())
            .is_none_or(|deps| deps.iter().all(Task::is_finished))
    }

    /// True if any dependency of `task` finished without a usable result
    pub fn has_cancelled_dependency(&self, task: &Task<T>) -> bool {
        self.upstream.get(&task.id()).is_some_and(|deps| {
            deps.iter()
                .any(|dep| dep.outcome().is_some_and(|outcome| outcome.is_cancelled()))
        })
    }

    /// Flag every transitive dependent of `task` as cancelled.
    ///
    /// Returns the dependents that were newly cancelled. They keep their
    /// `Ready` state so the dispatcher retires them without running a body.
    pub fn propagate_cancellation(&self, task: &Task<T>) -> Vec<Task<T>> {
        let mut cancelled = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([task.id()]);

        while let Some(id) = queue.pop_front() {
            let Some(dependents) = self.downstream.get(&id) else {
                continue;
            };
            for dependent in dependents {
                if !visited.insert(dependent.id()) {
                    continue;
                }
                if dependent.mark_cancelled() {
                    debug!(
                        "Cancelled {} because upstream {} was cancelled",
                        dependent.label(),
                        task.label()
                    );
                    cancelled.push(dependent.clone());
                }
                queue.push_back(dependent.id());
            }
        }

        cancelled
    }

    /// Direct dependents of a task
    pub fn dependents(&self, task_id: TaskId) -> Vec<Task<T>> {
        self.downstream.get(&task_id).cloned().unwrap_or_default()
    }

    /// Direct dependencies of a task
    pub fn dependencies(&self, task_id: TaskId) -> Vec<Task<T>> {
        self.upstream.get(&task_id).cloned().unwrap_or_default()
    }

    /// Drop a single edge; a no-op if it was never recorded
    pub fn remove_dependency(&mut self, task_id: TaskId, upon_id: TaskId) {
        if let Some(deps) = self.upstream.get_mut(&task_id) {
            deps.retain(|dep| dep.id() != upon_id);
            if deps.is_empty() {
                self.upstream.remove(&task_id);
            }
        }
        if let Some(dependents) = self.downstream.get_mut(&upon_id) {
            dependents.retain(|dependent| dependent.id() != task_id);
            if dependents.is_empty() {
                self.downstream.remove(&upon_id);
            }
        }
    }

    /// Forget a task and every edge that touches it
    pub fn remove(&mut self, task_id: TaskId) {
        if let Some(deps) = self.upstream.remove(&task_id) {
            for dep in deps {
                if let Some(dependents) = self.downstream.get_mut(&dep.id()) {
                    dependents.retain(|t| t.id() != task_id);
                    if dependents.is_empty() {
                        self.downstream.remove(&dep.id());
                    }
                }
            }
        }
        if let Some(dependents) = self.downstream.remove(&task_id) {
            for dependent in dependents {
                if let Some(deps) = self.upstream.get_mut(&dependent.id()) {
                    deps.retain(|t| t.id() != task_id);
                    if deps.is_empty() {
                        self.upstream.remove(&dependent.id());
                    }
                }
            }
        }
    }

    /// Number of tasks with at least one recorded edge
    pub fn len(&self) -> usize {
        let mut ids: HashSet<TaskId> = self.upstream.keys().copied().collect();
        ids.extend(self.downstream.keys().copied());
        ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty() && self.downstream.is_empty()
    }

    /// Whether `to` is reachable from `from` by following dependency edges
    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(deps) = self.upstream.get(&id) {
                stack.extend(deps.iter().map(Task::id));
            }
        }
        false
    }
}

impl<T: TaskValue> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}
