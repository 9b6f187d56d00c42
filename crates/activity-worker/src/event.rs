//! Observable worker events
//!
//! Every notification the pool produces is a [`WorkerEvent`] published on a
//! broadcast channel. Subscribers that fall behind lose the oldest events
//! (see [`tokio::sync::broadcast`]); the pool itself never blocks on them.

use tokio::sync::broadcast;
use tracing::trace;

use crate::task::TaskError;
use crate::worker::WorkerError;

/// A unit of work was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub token: String,
    pub input: serde_json::Value,
    /// Identity of the slot that acquired the task
    pub worker_name: String,
}

/// A success report was accepted by the source
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessEvent {
    pub token: String,
    pub output: serde_json::Value,
    pub worker_name: String,
}

/// A failure report was accepted by the source
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEvent {
    pub token: String,
    pub error: TaskError,
    pub worker_name: String,
}

/// A heartbeat report was accepted by the source
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatEvent {
    pub token: String,
    /// Progress snapshot passed by the handler, if any
    pub details: Option<serde_json::Value>,
    pub worker_name: String,
}

/// Worker notification
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The pool started polling
    Ready,
    Task(TaskEvent),
    Success(SuccessEvent),
    Failure(FailureEvent),
    Heartbeat(HeartbeatEvent),
    /// A transport failure or bookkeeping defect
    Error(WorkerError),
    /// Active task count reached the task concurrency limit
    Full,
    /// Active task count dropped to zero
    Empty,
}

impl WorkerEvent {
    /// Short event name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Task(_) => "task",
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error(_) => "error",
            Self::Full => "full",
            Self::Empty => "empty",
        }
    }

    /// Task token carried by the event, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Task(e) => Some(&e.token),
            Self::Success(e) => Some(&e.token),
            Self::Failure(e) => Some(&e.token),
            Self::Heartbeat(e) => Some(&e.token),
            _ => None,
        }
    }
}

/// Publishing side of the event channel
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub(crate) fn emit(&self, event: WorkerEvent) {
        trace!(event = event.kind(), token = ?event.token(), "Emitting worker event");
        let _ = self.tx.send(event);
    }
}
