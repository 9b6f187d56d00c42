//! Single task execution

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::context::TaskContext;
use super::definition::{encode_failure, encode_output, TaskError, TaskHandler};
use super::Heartbeat;
use crate::event::{EventBus, FailureEvent, SuccessEvent, WorkerEvent};
use crate::source::{AcquiredTask, TaskSource};
use crate::worker::ReportKind;

/// Runs one acquired task through the handler and reports its outcome
///
/// Exactly one terminal report (success or failure) is attempted per runner;
/// further `succeed`/`fail` calls are ignored.
pub struct TaskRunner {
    context: Arc<TaskContext>,
    handler: Arc<dyn TaskHandler>,
    decode_error: Option<TaskError>,
}

impl TaskRunner {
    /// Create a runner, decoding the task input
    ///
    /// Input that is not valid JSON is kept as a string and the task fails
    /// without invoking the handler.
    pub(crate) fn new(
        task: AcquiredTask,
        worker_name: String,
        source: Arc<dyn TaskSource>,
        handler: Arc<dyn TaskHandler>,
        events: EventBus,
    ) -> Self {
        let (input, decode_error) = match serde_json::from_str(&task.input) {
            Ok(input) => (input, None),
            Err(e) => {
                warn!(token = %task.token, error = %e, "Task input is not valid JSON");
                (
                    serde_json::Value::String(task.input),
                    Some(TaskError::named("InputDecodeError", e.to_string())),
                )
            }
        };

        Self {
            context: Arc::new(TaskContext::new(
                task.token,
                input,
                worker_name,
                source,
                events,
            )),
            handler,
            decode_error,
        }
    }

    pub fn token(&self) -> &str {
        &self.context.token
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.context.input
    }

    pub fn worker_name(&self) -> &str {
        &self.context.worker_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.context.started_at
    }

    /// Heartbeat handle bound to this task
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(self.context.clone())
    }

    /// Invoke the handler and send the terminal report
    ///
    /// A panicking handler is reported as a failure.
    #[instrument(skip(self), fields(token = %self.context.token, worker = %self.context.worker_name))]
    pub async fn run(self) {
        if let Some(error) = self.decode_error.clone() {
            self.fail(error).await;
            return;
        }

        debug!("Invoking task handler");
        let handler = self.handler.clone();
        let input = self.context.input.clone();
        let heartbeat = self.heartbeat();

        let outcome = AssertUnwindSafe(async move { handler.handle(input, heartbeat).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => self.succeed(output).await,
            Ok(Err(error)) => self.fail(error).await,
            Err(panic) => {
                let error = TaskError::from_panic(panic);
                warn!(error = %error, "Task handler panicked");
                self.fail(error).await;
            }
        }
    }

    /// Report success; ignored if the task already finished
    pub async fn succeed(&self, output: serde_json::Value) {
        if !self.context.mark_finished() {
            debug!(token = %self.context.token, "Task already finished, ignoring success");
            return;
        }

        let encoded = match encode_output(&output) {
            Ok(encoded) => encoded,
            Err(e) => {
                // Non-string map keys and similar cannot be encoded; report
                // the task as failed rather than dropping it.
                let error = TaskError::from(e);
                self.send_failure(error).await;
                return;
            }
        };

        let context = &self.context;
        match context.source.report_success(&context.token, encoded).await {
            Ok(()) => {
                info!(token = %context.token, worker = %context.worker_name, "Task succeeded");
                context.events.emit(WorkerEvent::Success(SuccessEvent {
                    token: context.token.clone(),
                    output,
                    worker_name: context.worker_name.clone(),
                }));
            }
            Err(e) => context.report_failed(ReportKind::Success, e),
        }
    }

    /// Report failure; ignored if the task already finished
    pub async fn fail(&self, error: TaskError) {
        if !self.context.mark_finished() {
            debug!(token = %self.context.token, "Task already finished, ignoring failure");
            return;
        }
        self.send_failure(error).await;
    }

    async fn send_failure(&self, error: TaskError) {
        let context = &self.context;
        let payload = encode_failure(&error);

        match context.source.report_failure(&context.token, payload).await {
            Ok(()) => {
                info!(
                    token = %context.token,
                    worker = %context.worker_name,
                    error = %error,
                    "Task failed"
                );
                context.events.emit(WorkerEvent::Failure(FailureEvent {
                    token: context.token.clone(),
                    error,
                    worker_name: context.worker_name.clone(),
                }));
            }
            Err(e) => context.report_failed(ReportKind::Failure, e),
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("token", &self.context.token)
            .field("worker_name", &self.context.worker_name)
            .field("started_at", &self.context.started_at)
            .field("finished", &self.context.is_finished())
            .finish()
    }
}
