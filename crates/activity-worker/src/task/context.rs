//! Task execution context and heartbeat handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::event::{EventBus, HeartbeatEvent, WorkerEvent};
use crate::source::{SourceError, TaskSource};
use crate::worker::{ReportKind, WorkerError};

/// State shared by a task runner and every clone of its heartbeat handle
pub(crate) struct TaskContext {
    pub(crate) token: String,
    pub(crate) input: serde_json::Value,
    pub(crate) worker_name: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) source: Arc<dyn TaskSource>,
    pub(crate) events: EventBus,
    finished: AtomicBool,
}

impl TaskContext {
    pub(crate) fn new(
        token: String,
        input: serde_json::Value,
        worker_name: String,
        source: Arc<dyn TaskSource>,
        events: EventBus,
    ) -> Self {
        Self {
            token,
            input,
            worker_name,
            started_at: Utc::now(),
            source,
            events,
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Set the finished flag; returns false if it was already set
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    /// Escalate a failed report call with the task input attached
    pub(crate) fn report_failed(&self, kind: ReportKind, source: SourceError) {
        let error = WorkerError::Report {
            kind,
            token: self.token.clone(),
            input: self.input.clone(),
            source,
        };
        error!(token = %self.token, error = %error, "Report to task source failed");
        self.events.emit(WorkerEvent::Error(error));
    }
}

/// Handle a task handler uses to report progress
///
/// Cheap to clone; clones may outlive the handler. A heartbeat sent after the
/// task reached its terminal report is still forwarded, but the source's
/// "deadline passed" answer is only logged as a warning.
///
/// # Example
///
/// ```ignore
/// async fn handle(&self, input: Value, heartbeat: Heartbeat) -> Result<Value, TaskError> {
///     for (i, chunk) in chunks(input).enumerate() {
///         process(chunk).await?;
///         heartbeat.beat_with(json!({"chunk": i})).await;
///     }
///     Ok(json!({"done": true}))
/// }
/// ```
#[derive(Clone)]
pub struct Heartbeat {
    context: Arc<TaskContext>,
}

impl Heartbeat {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        Self { context }
    }

    /// Token of the task this handle reports for
    pub fn token(&self) -> &str {
        &self.context.token
    }

    /// Whether the task already sent its terminal report
    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Report liveness
    pub async fn beat(&self) {
        self.send(None).await;
    }

    /// Report liveness with a progress snapshot
    ///
    /// The snapshot is only surfaced in the [`WorkerEvent::Heartbeat`] event;
    /// the remote call carries the token alone.
    pub async fn beat_with(&self, details: serde_json::Value) {
        self.send(Some(details)).await;
    }

    async fn send(&self, details: Option<serde_json::Value>) {
        let context = &self.context;
        let late = context.is_finished();
        if late {
            warn!(token = %context.token, "Late heartbeat after finish");
        }

        match context.source.report_heartbeat(&context.token).await {
            Ok(()) => {
                debug!(token = %context.token, "Heartbeat sent");
                context.events.emit(WorkerEvent::Heartbeat(HeartbeatEvent {
                    token: context.token.clone(),
                    details,
                    worker_name: context.worker_name.clone(),
                }));
            }
            Err(SourceError::TaskDeadlinePassed) => {
                warn!(
                    token = %context.token,
                    finished = late,
                    "Heartbeat rejected, task deadline already passed"
                );
            }
            Err(e) => context.report_failed(ReportKind::Heartbeat, e),
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("token", &self.context.token)
            .field("finished", &self.context.is_finished())
            .finish()
    }
}
