use crate::task::graph::DependencyGraph;
use crate::task::handle::{Completion, Start, Task, TaskBody, TaskContext, TaskObserver, TaskValue};
use crate::task::types::*;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously executing tasks
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent_tasks(max_concurrent_tasks: usize) -> Self {
        Self {
            max_concurrent_tasks,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handler for scheduler events
pub trait SchedulerEventHandler: Send + Sync {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()>;
}

/// Bounded worker pool that runs tasks once their dependencies finish.
///
/// `Scheduler` is a cloneable handle; clones share the same queue, graph
/// and slots. Bodies are started on the tokio blocking pool, never while the
/// scheduler lock is held.
pub struct Scheduler<T: TaskValue> {
    inner: Arc<SchedulerInner<T>>,
}

struct SchedulerInner<T: TaskValue> {
    config: SchedulerConfig,
    runtime: Handle,
    state: Mutex<SchedulerState<T>>,
    outstanding: watch::Sender<usize>,
    handlers: Vec<Box<dyn SchedulerEventHandler>>,
    this: Weak<SchedulerInner<T>>,
}

struct SchedulerState<T: TaskValue> {
    /// Submission order is dispatch order among ready tasks
    queue: VecDeque<Task<T>>,
    executing: HashMap<TaskId, Task<T>>,
    graph: DependencyGraph<T>,
    /// Dispatch plans built under the lock but not yet carried out
    in_flight: usize,
    stats: SchedulerStats,
}

impl<T: TaskValue> SchedulerState<T> {
    fn outstanding(&self) -> usize {
        self.queue.len() + self.executing.len() + self.in_flight
    }
}

/// Work collected under the lock and carried out after releasing it
struct Dispatch<T: TaskValue> {
    to_run: Vec<(Task<T>, Box<dyn TaskBody<T>>, Vec<Task<T>>)>,
    completions: Vec<Completion<T>>,
    events: Vec<SchedulerEvent>,
}

impl<T: TaskValue> Dispatch<T> {
    fn new() -> Self {
        Self {
            to_run: Vec::new(),
            completions: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl<T: TaskValue> Scheduler<T> {
    /// Create a scheduler on the current tokio runtime
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_event_handlers(config, Vec::new())
    }

    /// Create a scheduler that reports lifecycle events to `handlers`
    pub fn with_event_handlers(
        config: SchedulerConfig,
        handlers: Vec<Box<dyn SchedulerEventHandler>>,
    ) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        Self::with_runtime(config, runtime, handlers)
    }

    /// Create a scheduler that starts bodies on an explicit runtime
    pub fn with_runtime(
        config: SchedulerConfig,
        runtime: Handle,
        handlers: Vec<Box<dyn SchedulerEventHandler>>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (outstanding, _) = watch::channel(0);
        let inner = Arc::new_cyclic(|this| SchedulerInner {
            config,
            runtime,
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                executing: HashMap::new(),
                graph: DependencyGraph::new(),
                in_flight: 0,
                stats: SchedulerStats::default(),
            }),
            outstanding,
            handlers,
            this: this.clone(),
        });
        info!(
            "Created scheduler with {} worker slots",
            inner.config.max_concurrent_tasks
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Enqueue a task; it runs once its dependencies finish and a slot frees
    pub fn submit(&self, task: Task<T>) -> Result<TaskId, SchedulerError> {
        let id = task.id();
        self.submit_all(vec![task])?;
        Ok(id)
    }

    /// Enqueue a batch atomically.
    ///
    /// Dispatch never sees part of the batch, so a chain whose tasks depend
    /// on each other is registered as a whole or not at all.
    pub fn submit_all(
        &self,
        tasks: impl IntoIterator<Item = Task<T>>,
    ) -> Result<Vec<TaskId>, SchedulerError> {
        let tasks: Vec<Task<T>> = tasks.into_iter().collect();
        let observer = self.inner.observer();

        let mut dispatch = Dispatch::new();
        let foreign = {
            let mut state = self.inner.lock();
            let mut accepted: Vec<&Task<T>> = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let registered = task
                    .attach(observer.clone())
                    .and_then(|_| state.graph.register(task));
                if let Err(err) = registered {
                    // Attaching may have succeeded before the graph rejected an edge
                    if !matches!(err, SchedulerError::AlreadySubmitted(_)) {
                        task.detach();
                    }
                    for task in accepted {
                        state.graph.remove(task.id());
                        task.detach();
                    }
                    warn!("Rejected batch of {} tasks: {}", tasks.len(), err);
                    return Err(err);
                }
                accepted.push(task);
            }

            for task in &tasks {
                state.queue.push_back(task.clone());
                state.stats.submitted += 1;
                dispatch.events.push(SchedulerEvent::Submitted {
                    task_id: task.id(),
                    label: task.label().to_string(),
                    at: Utc::now(),
                });
                debug!("Submitted task {} ({})", task.label(), task.id());
            }
            self.inner.dispatch_locked(&mut state, &mut dispatch);

            let mut seen = HashSet::new();
            tasks
                .iter()
                .flat_map(Task::dependencies)
                .filter(|upon| seen.insert(upon.id()))
                .filter(|upon| !upon.is_finished() && !upon.is_observed_by(&observer))
                .collect::<Vec<_>>()
        };
        self.inner.run(dispatch);
        self.inner.watch_foreign(foreign);
        Ok(tasks.iter().map(Task::id).collect())
    }

    /// Add an edge to a task that is still queued in this scheduler
    pub fn add_dependency(&self, task: &Task<T>, upon: &Task<T>) -> Result<(), SchedulerError> {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.inner.lock();
            if !state.queue.iter().any(|queued| queued.id() == task.id()) {
                drop(state);
                return task.add_dependency(upon);
            }
            state.graph.add_dependency(task, upon)?;
            if let Err(err) = task.record_dependency(upon, true) {
                state.graph.remove_dependency(task.id(), upon.id());
                return Err(err);
            }
            self.inner.dispatch_locked(&mut state, &mut dispatch);
        }
        self.inner.run(dispatch);
        if !upon.is_finished() && !upon.is_observed_by(&self.inner.observer()) {
            self.inner.watch_foreign(vec![upon.clone()]);
        }
        Ok(())
    }

    /// Cancel a single task
    pub fn cancel(&self, task: &Task<T>) -> bool {
        task.cancel()
    }

    /// Cancel every queued or executing task matching `predicate`.
    ///
    /// Executing tasks are not interrupted; their slot is released when the
    /// body signals completion. Returns the number of tasks newly cancelled.
    pub fn cancel_all(&self, predicate: impl Fn(&Task<T>) -> bool) -> usize {
        let mut dispatch = Dispatch::new();
        let cancelled = {
            let mut state = self.inner.lock();
            let matching: Vec<Task<T>> = state
                .queue
                .iter()
                .chain(state.executing.values())
                .filter(|task| predicate(task))
                .cloned()
                .collect();

            let mut cancelled = 0;
            for task in matching {
                if task.mark_cancelled() {
                    cancelled += 1;
                    dispatch.events.push(SchedulerEvent::Cancelled {
                        task_id: task.id(),
                        label: task.label().to_string(),
                        at: Utc::now(),
                    });
                }
            }
            self.inner.dispatch_locked(&mut state, &mut dispatch);
            cancelled
        };
        self.inner.run(dispatch);
        if cancelled > 0 {
            debug!("Bulk-cancelled {} tasks", cancelled);
        }
        cancelled
    }

    /// Number of queued tasks that have not started
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of tasks currently holding a slot
    pub fn executing(&self) -> usize {
        self.inner.lock().executing.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats.clone()
    }

    /// Wait until nothing is queued, executing or awaiting delivery
    pub async fn wait_idle(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender is owned by `self.inner`, which outlives this borrow.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }
}

impl<T: TaskValue> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TaskValue> std::fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("queued", &state.queue.len())
            .field("executing", &state.executing.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl<T: TaskValue> SchedulerInner<T> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observer(&self) -> Weak<dyn TaskObserver<T>> {
        let this: Weak<dyn TaskObserver<T>> = self.this.clone();
        this
    }

    /// Start every ready task that fits in the free slots and retire every
    /// cancelled queued task, in submission order.
    fn dispatch_locked(&self, state: &mut SchedulerState<T>, dispatch: &mut Dispatch<T>) {
        loop {
            let mut retired_any = false;
            let mut index = 0;
            while index < state.queue.len() {
                let task = state.queue[index].clone();

                if !task.is_cancelled()
                    && state.graph.has_cancelled_dependency(&task)
                    && task.mark_cancelled()
                {
                    dispatch.events.push(SchedulerEvent::Cancelled {
                        task_id: task.id(),
                        label: task.label().to_string(),
                        at: Utc::now(),
                    });
                }

                let runnable = task.is_cancelled()
                    || (state.executing.len() < self.config.max_concurrent_tasks
                        && state.graph.is_satisfied(&task));
                if !runnable {
                    index += 1;
                    continue;
                }

                state.queue.remove(index);
                match task.begin() {
                    Start::Run(body, dependencies) => {
                        state.executing.insert(task.id(), task.clone());
                        state.stats.started += 1;
                        state.stats.peak_executing =
                            state.stats.peak_executing.max(state.executing.len());
                        dispatch.events.push(SchedulerEvent::Started {
                            task_id: task.id(),
                            label: task.label().to_string(),
                            executing: state.executing.len(),
                            at: Utc::now(),
                        });
                        debug!(
                            "Dispatched task {} ({}), {} executing",
                            task.label(),
                            task.id(),
                            state.executing.len()
                        );
                        dispatch.to_run.push((task, body, dependencies));
                    }
                    Start::Skipped(completion) => {
                        self.retire_locked(state, &task, true, dispatch);
                        dispatch.completions.push(completion);
                        retired_any = true;
                    }
                }
            }
            // Retiring may have cancelled tasks earlier in the queue
            if !retired_any {
                break;
            }
        }
        state.in_flight += 1;
    }

    /// Bookkeeping for a task that reached `Finished`
    fn retire_locked(
        &self,
        state: &mut SchedulerState<T>,
        task: &Task<T>,
        cancelled: bool,
        dispatch: &mut Dispatch<T>,
    ) {
        if cancelled {
            state.stats.cancelled += 1;
            for dependent in state.graph.propagate_cancellation(task) {
                dispatch.events.push(SchedulerEvent::Cancelled {
                    task_id: dependent.id(),
                    label: dependent.label().to_string(),
                    at: Utc::now(),
                });
            }
        } else {
            state.stats.completed += 1;
        }
        state.graph.remove(task.id());
        task.detach();
        dispatch.events.push(SchedulerEvent::Finished {
            task_id: task.id(),
            label: task.label().to_string(),
            cancelled,
            at: Utc::now(),
        });
    }

    /// Re-run dispatch without any other state change
    fn wake(&self) {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.lock();
            self.dispatch_locked(&mut state, &mut dispatch);
        }
        self.run(dispatch);
    }

    /// Dependencies submitted to another scheduler (or not at all) never
    /// report back here, so wait on them and dispatch again once they finish
    fn watch_foreign(&self, dependencies: Vec<Task<T>>) {
        for upon in dependencies {
            let this = self.this.clone();
            self.runtime.spawn(async move {
                upon.wait().await;
                if let Some(inner) = this.upgrade() {
                    debug!(
                        "Dependency {} ({}) finished outside this scheduler",
                        upon.label(),
                        upon.id()
                    );
                    inner.wake();
                }
            });
        }
    }

    /// Carry out a dispatch plan outside the lock
    fn run(&self, dispatch: Dispatch<T>) {
        for event in &dispatch.events {
            for handler in &self.handlers {
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("Event handler failed on {:?}: {}", event, err),
                    Err(_) => warn!("Event handler panicked on {:?}", event),
                }
            }
        }

        for completion in dispatch.completions {
            completion.deliver();
        }

        for (task, body, dependencies) in dispatch.to_run {
            let ctx = TaskContext::new(task, &dependencies, self.runtime.clone());
            self.runtime.spawn_blocking(move || body.start(ctx));
        }

        // Published last so `wait_idle` never returns ahead of handlers and callbacks
        let mut state = self.lock();
        state.in_flight -= 1;
        self.outstanding.send_replace(state.outstanding());
    }
}

impl<T: TaskValue> TaskObserver<T> for SchedulerInner<T> {
    fn task_cancelled(&self, task: &Task<T>) {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.lock();
            dispatch.events.push(SchedulerEvent::Cancelled {
                task_id: task.id(),
                label: task.label().to_string(),
                at: Utc::now(),
            });
            self.dispatch_locked(&mut state, &mut dispatch);
        }
        self.run(dispatch);
    }

    fn task_finished(&self, task: &Task<T>) {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.lock();
            if state.executing.remove(&task.id()).is_none() {
                warn!(
                    "Task {} ({}) finished but was not executing in this scheduler",
                    task.label(),
                    task.id()
                );
                return;
            }
            let cancelled = task.outcome().is_none_or(|outcome| outcome.is_cancelled());
            self.retire_locked(&mut state, task, cancelled, &mut dispatch);
            self.dispatch_locked(&mut state, &mut dispatch);
        }
        self.run(dispatch);
    }
}

/// Event handler that logs events
pub struct LoggingEventHandler;

impl SchedulerEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()> {
        match event {
            SchedulerEvent::Submitted { task_id, label, .. } => {
                debug!("Task submitted: {} ({})", label, task_id);
            }
            SchedulerEvent::Started {
                task_id,
                label,
                executing,
                ..
            } => {
                info!("Task started: {} ({}), {} executing", label, task_id, executing);
            }
            SchedulerEvent::Cancelled { task_id, label, .. } => {
                info!("Task cancelled: {} ({})", label, task_id);
            }
            SchedulerEvent::Finished {
                task_id,
                label,
                cancelled,
                ..
            } => {
                if *cancelled {
                    info!("Task finished as cancelled: {} ({})", label, task_id);
                } else {
                    info!("Task completed: {} ({})", label, task_id);
                }
            }
        }
        Ok(())
    }
}
