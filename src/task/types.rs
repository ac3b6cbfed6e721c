use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Lifecycle state of a task.
///
/// States only ever move forward: `Ready -> Executing -> Finished`, or
/// `Ready -> Finished` when a task is cancelled before it starts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Waiting in a queue (or not yet submitted)
    Ready,
    /// Body has been started and has not signalled completion
    Executing,
    /// Terminal; the completion callback has fired
    Finished,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Ready => "ready",
            TaskState::Executing => "executing",
            TaskState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// What a finished task produced.
///
/// A cancelled outcome never carries a value, even when the body managed to
/// produce one before noticing the cancellation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Usable value, if the task was not cancelled
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }
}

/// Errors surfaced by the scheduling core.
///
/// Misuse of the state machine itself (starting a finished task, finishing
/// twice) is not represented here; those are bugs and panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid dependency edge {task} -> {upon}: {reason}")]
    InvalidEdge {
        task: TaskId,
        upon: TaskId,
        reason: String,
    },
    #[error("Task {0} has already been submitted")]
    AlreadySubmitted(TaskId),
    #[error("A chain needs at least one task")]
    EmptyChain,
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error("No tokio runtime available to run task bodies")]
    NoRuntime,
}

impl SchedulerError {
    pub(crate) fn invalid_edge(task: TaskId, upon: TaskId, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidEdge {
            task,
            upon,
            reason: reason.into(),
        }
    }
}

/// Events emitted by the scheduler as tasks move through their lifecycle
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Submitted {
        task_id: TaskId,
        label: String,
        at: DateTime<Utc>,
    },
    Started {
        task_id: TaskId,
        label: String,
        executing: usize,
        at: DateTime<Utc>,
    },
    Cancelled {
        task_id: TaskId,
        label: String,
        at: DateTime<Utc>,
    },
    Finished {
        task_id: TaskId,
        label: String,
        cancelled: bool,
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            SchedulerEvent::Submitted { task_id, .. }
            | SchedulerEvent::Started { task_id, .. }
            | SchedulerEvent::Cancelled { task_id, .. }
            | SchedulerEvent::Finished { task_id, .. } => *task_id,
        }
    }
}

/// Running counters for a scheduler
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// Highest number of simultaneously executing tasks seen so far
    pub peak_executing: usize,
}

impl SchedulerStats {
    pub fn finished(&self) -> u64 {
        self.completed + self.cancelled
    }
}
