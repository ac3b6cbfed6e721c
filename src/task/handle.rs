use crate::task::types::*;
use std::collections::HashSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Values that can flow between tasks.
///
/// Downstream tasks receive clones of their dependencies' outputs, and the
/// finishing task keeps its own copy in its result slot.
pub trait TaskValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TaskValue for T {}

/// Callback fired exactly once when a task reaches `Finished`
pub type CompletionCallback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// The work a task performs.
///
/// `start` is called once on a worker thread. It must eventually call
/// [`TaskContext::finish`], but it may return long before that: the context
/// can be moved into a spawned future or any other callback-driven mechanism,
/// and the task stays `Executing` (holding its slot) until it is signalled.
pub trait TaskBody<T: TaskValue>: Send + 'static {
    fn start(self: Box<Self>, ctx: TaskContext<T>);
}

impl<T, F> TaskBody<T> for F
where
    T: TaskValue,
    F: FnOnce(TaskContext<T>) + Send + 'static,
{
    fn start(self: Box<Self>, ctx: TaskContext<T>) {
        (*self)(ctx)
    }
}

/// Receives state changes from tasks it has taken ownership of
pub(crate) trait TaskObserver<T: TaskValue>: Send + Sync {
    fn task_cancelled(&self, task: &Task<T>);
    fn task_finished(&self, task: &Task<T>);
}

enum Phase<T: TaskValue> {
    Ready(Box<dyn TaskBody<T>>),
    Executing,
    Finished(Outcome<T>),
}

impl<T: TaskValue> Phase<T> {
    fn state(&self) -> TaskState {
        match self {
            Phase::Ready(_) => TaskState::Ready,
            Phase::Executing => TaskState::Executing,
            Phase::Finished(_) => TaskState::Finished,
        }
    }
}

struct TaskRecord<T: TaskValue> {
    phase: Phase<T>,
    cancelled: bool,
    dependencies: Vec<Task<T>>,
    on_complete: Option<CompletionCallback<T>>,
    observer: Option<Weak<dyn TaskObserver<T>>>,
}

struct TaskInner<T: TaskValue> {
    id: TaskId,
    label: String,
    record: Mutex<TaskRecord<T>>,
    done: watch::Sender<bool>,
}

/// A cancellable unit of asynchronous work.
///
/// `Task` is a cheap, cloneable handle; every clone refers to the same
/// underlying state.
pub struct Task<T: TaskValue> {
    inner: Arc<TaskInner<T>>,
}

/// Result of asking a task to start
pub(crate) enum Start<T: TaskValue> {
    Run(Box<dyn TaskBody<T>>, Vec<Task<T>>),
    Skipped(Completion<T>),
}

/// A finished task whose callback has not been invoked yet.
///
/// Produced while a lock is held and delivered after it is released.
pub(crate) struct Completion<T: TaskValue> {
    task: Task<T>,
    outcome: Outcome<T>,
    callback: Option<CompletionCallback<T>>,
}

impl<T: TaskValue> Completion<T> {
    /// Run the callback, then wake waiters.
    ///
    /// A panicking callback is logged and swallowed so the scheduler still
    /// gets to release the task's slot.
    pub(crate) fn deliver(self) {
        let Completion {
            task,
            outcome,
            callback,
        } = self;
        if let Some(callback) = callback
            && panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err()
        {
            warn!(
                "Completion callback of task {} ({}) panicked",
                task.label(),
                task.id()
            );
        }
        task.inner.done.send_replace(true);
    }
}

impl<T: TaskValue> Task<T> {
    /// Create a task from any body
    pub fn new(label: impl Into<String>, body: impl TaskBody<T>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::new_v4(),
                label: label.into(),
                record: Mutex::new(TaskRecord {
                    phase: Phase::Ready(Box::new(body)),
                    cancelled: false,
                    dependencies: Vec::new(),
                    on_complete: None,
                    observer: None,
                }),
                done,
            }),
        }
    }

    /// Create a task whose body is a synchronous function of its inputs
    pub fn from_fn<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Vec<T>) -> T + Send + 'static,
    {
        Self::new(label, move |ctx: TaskContext<T>| {
            let value = f(ctx.inputs().to_vec());
            ctx.finish(value);
        })
    }

    /// Create a task whose body is a future.
    ///
    /// The future runs on the scheduler's runtime and the task finishes when
    /// it resolves, so the slot stays occupied for the whole await.
    pub fn from_future<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new(label, move |ctx: TaskContext<T>| {
            let runtime = ctx.runtime().clone();
            let future = f(ctx.inputs().to_vec());
            runtime.spawn(async move {
                let value = future.await;
                ctx.finish(value);
            });
        })
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn record(&self) -> MutexGuard<'_, TaskRecord<T>> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TaskState {
        self.record().phase.state()
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.record().cancelled
    }

    /// True when the task may be dispatched right now: it is `Ready`, not
    /// cancelled, and every dependency finished with a usable result.
    pub fn is_ready(&self) -> bool {
        let dependencies = {
            let record = self.record();
            if record.cancelled || record.phase.state() != TaskState::Ready {
                return false;
            }
            record.dependencies.clone()
        };
        dependencies
            .iter()
            .all(|dep| matches!(dep.outcome(), Some(Outcome::Completed(_))))
    }

    /// The result slot; `None` until the task finishes
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &self.record().phase {
            Phase::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn dependencies(&self) -> Vec<Task<T>> {
        self.record().dependencies.clone()
    }

    /// Whether `other` is reachable through this task's dependency edges
    pub fn depends_on(&self, other: &Task<T>) -> bool {
        let mut visited = HashSet::new();
        let mut stack = self.dependencies();
        while let Some(task) = stack.pop() {
            if task.id() == other.id() {
                return true;
            }
            if visited.insert(task.id()) {
                stack.extend(task.dependencies());
            }
        }
        false
    }

    /// Declare that this task must not start until `upon` has finished.
    ///
    /// Only valid before the task is submitted; use
    /// `Scheduler::add_dependency` for tasks that are already queued.
    pub fn add_dependency(&self, upon: &Task<T>) -> Result<(), SchedulerError> {
        self.record_dependency(upon, false)
    }

    pub(crate) fn record_dependency(
        &self,
        upon: &Task<T>,
        allow_submitted: bool,
    ) -> Result<(), SchedulerError> {
        if upon.id() == self.id() {
            return Err(SchedulerError::invalid_edge(
                self.id(),
                upon.id(),
                "a task cannot depend on itself",
            ));
        }
        if upon.depends_on(self) {
            return Err(SchedulerError::invalid_edge(
                self.id(),
                upon.id(),
                "edge would create a cycle",
            ));
        }

        let mut record = self.record();
        if record.phase.state() != TaskState::Ready {
            return Err(SchedulerError::invalid_edge(
                self.id(),
                upon.id(),
                format!("dependent task is already {}", record.phase.state()),
            ));
        }
        if record.observer.is_some() && !allow_submitted {
            return Err(SchedulerError::invalid_edge(
                self.id(),
                upon.id(),
                "dependent task has already been submitted",
            ));
        }
        if !record.dependencies.iter().any(|dep| dep.id() == upon.id()) {
            record.dependencies.push(upon.clone());
        }
        Ok(())
    }

    /// Register the completion callback, replacing any previous one.
    ///
    /// If the task has already finished the callback fires immediately.
    pub fn on_complete(&self, callback: impl FnOnce(Outcome<T>) + Send + 'static) {
        let mut record = self.record();
        let finished = match record.phase {
            Phase::Finished(ref outcome) => Some(outcome.clone()),
            _ => None,
        };
        match finished {
            Some(outcome) => {
                drop(record);
                callback(outcome);
            }
            None => record.on_complete = Some(Box::new(callback)),
        }
    }

    /// Request cancellation.
    ///
    /// A task that has not started will finish without running its body. A
    /// running task only has its flag set; its eventual result is discarded.
    /// Returns false if the task was already finished or cancelled.
    pub fn cancel(&self) -> bool {
        let observer = {
            let mut record = self.record();
            if record.cancelled || record.phase.state().is_terminal() {
                return false;
            }
            record.cancelled = true;
            record.observer.clone()
        };
        debug!("Cancelled task {} ({})", self.label(), self.id());
        if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
            observer.task_cancelled(self);
        }
        true
    }

    /// Set the cancellation flag without notifying the owning scheduler
    pub(crate) fn mark_cancelled(&self) -> bool {
        let mut record = self.record();
        if record.cancelled || record.phase.state().is_terminal() {
            return false;
        }
        record.cancelled = true;
        true
    }

    pub(crate) fn attach(&self, observer: Weak<dyn TaskObserver<T>>) -> Result<(), SchedulerError> {
        let mut record = self.record();
        if record.observer.is_some() || record.phase.state() != TaskState::Ready {
            return Err(SchedulerError::AlreadySubmitted(self.id()));
        }
        record.observer = Some(observer);
        Ok(())
    }

    /// Whether `observer` is the scheduler this task was submitted to
    pub(crate) fn is_observed_by(&self, observer: &Weak<dyn TaskObserver<T>>) -> bool {
        self.record()
            .observer
            .as_ref()
            .is_some_and(|current| Weak::ptr_eq(current, observer))
    }

    pub(crate) fn detach(&self) {
        self.record().observer = None;
    }

    /// Move a ready task to `Executing`, or straight to `Finished` if it was
    /// cancelled. Calling this on a task that is not `Ready` is a bug.
    pub(crate) fn begin(&self) -> Start<T> {
        let mut record = self.record();
        let body = match std::mem::replace(&mut record.phase, Phase::Executing) {
            Phase::Ready(body) => body,
            other => {
                let state = other.state();
                record.phase = other;
                panic!(
                    "task {} ({}) started while {}",
                    self.label(),
                    self.id(),
                    state
                );
            }
        };

        if record.cancelled {
            drop(body);
            return Start::Skipped(self.finish_locked(&mut record, None));
        }
        Start::Run(body, record.dependencies.clone())
    }

    fn finish_locked(&self, record: &mut TaskRecord<T>, value: Option<T>) -> Completion<T> {
        let outcome = match value {
            Some(value) if !record.cancelled => Outcome::Completed(value),
            _ => Outcome::Cancelled,
        };
        record.phase = Phase::Finished(outcome.clone());
        record.dependencies.clear();
        Completion {
            task: self.clone(),
            outcome,
            callback: record.on_complete.take(),
        }
    }

    /// Completion signal from a running body
    fn finish(&self, value: Option<T>) {
        let (completion, observer) = {
            let mut record = self.record();
            assert!(
                matches!(record.phase, Phase::Executing),
                "task {} ({}) signalled completion while {}",
                self.label(),
                self.id(),
                record.phase.state()
            );
            let completion = self.finish_locked(&mut record, value);
            (completion, record.observer.take())
        };
        debug!(
            "Task {} ({}) finished, cancelled={}",
            self.label(),
            self.id(),
            completion.outcome.is_cancelled()
        );
        completion.deliver();
        if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
            observer.task_finished(self);
        }
    }

    /// Wait until the task finishes and return its outcome
    pub async fn wait(&self) -> Outcome<T> {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only returns once done.
        let _ = done.wait_for(|finished| *finished).await;
        self.outcome().unwrap_or(Outcome::Cancelled)
    }
}

impl<T: TaskValue> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TaskValue> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T: TaskValue> Eq for Task<T> {}

impl<T: TaskValue> std::hash::Hash for Task<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T: TaskValue> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &record.phase.state())
            .field("cancelled", &record.cancelled)
            .field("dependencies", &record.dependencies.len())
            .finish()
    }
}

/// Handle given to a running body.
///
/// Calling [`finish`](TaskContext::finish) is the only way a running task
/// completes successfully. Dropping the context without finishing marks the
/// task as cancelled so its slot is released.
pub struct TaskContext<T: TaskValue> {
    task: Option<Task<T>>,
    inputs: Vec<T>,
    runtime: Handle,
}

impl<T: TaskValue> TaskContext<T> {
    pub(crate) fn new(task: Task<T>, dependencies: &[Task<T>], runtime: Handle) -> Self {
        let inputs = dependencies
            .iter()
            .filter_map(|dep| dep.outcome().and_then(Outcome::into_value))
            .collect();
        Self {
            task: Some(task),
            inputs,
            runtime,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.as_ref().map(Task::id).unwrap_or_default()
    }

    pub fn label(&self) -> &str {
        self.task.as_ref().map(Task::label).unwrap_or_default()
    }

    /// Outputs of this task's dependencies, in the order they were declared
    pub fn inputs(&self) -> &[T] {
        &self.inputs
    }

    /// First dependency output, for the common single-upstream case
    pub fn input(&self) -> Option<&T> {
        self.inputs.first()
    }

    /// Bodies that can abort early should poll this between steps
    pub fn is_cancelled(&self) -> bool {
        self.task.as_ref().is_none_or(Task::is_cancelled)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Signal completion with the task's result
    pub fn finish(mut self, value: T) {
        if let Some(task) = self.task.take() {
            task.finish(Some(value));
        }
    }

    /// Signal completion without a result; the task finishes as cancelled
    pub fn abandon(mut self) {
        if let Some(task) = self.task.take() {
            task.mark_cancelled();
            task.finish(None);
        }
    }
}

impl<T: TaskValue> Drop for TaskContext<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            warn!(
                "Task {} ({}) dropped its context without finishing; treating as cancelled",
                task.label(),
                task.id()
            );
            task.mark_cancelled();
            task.finish(None);
        }
    }
}
