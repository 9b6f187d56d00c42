//! In-memory implementation of TaskSource for testing

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::store::*;

/// Longest failure payload the source accepts
const MAX_FAILURE_LEN: usize = 256;

/// Lifecycle of a task inside the in-memory source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Claimed,
    Succeeded,
    Failed,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Internal task state
struct TaskState {
    input: String,
    status: TaskStatus,
    claimed_by: Option<String>,
    output: Option<String>,
    error: Option<String>,
    heartbeats: u32,
    terminal_reports: u32,
}

/// Queue entry; placeholders model the empty response some sources return
enum Pending {
    Task(String),
    Placeholder,
}

/// In-memory implementation of TaskSource
///
/// Hands out submitted tasks in FIFO order to long-polling callers and
/// records every report so tests can assert on them. Acquisition waits up to
/// the configured long-poll timeout and then returns `Ok(None)`, and it
/// returns [`SourceError::Cancelled`] as soon as the caller's token fires.
///
/// # Example
///
/// ```
/// use activity_worker::InMemoryTaskSource;
///
/// let source = InMemoryTaskSource::new();
/// let token = source.submit(&serde_json::json!({"order": 42}));
/// assert_eq!(source.pending_task_count(), 1);
/// assert!(!token.is_empty());
/// ```
pub struct InMemoryTaskSource {
    tasks: RwLock<HashMap<String, TaskState>>,
    queue: Mutex<VecDeque<Pending>>,
    notify: Notify,
    long_poll_timeout: Duration,
    acquire_log: Mutex<Vec<String>>,
    acquire_errors: Mutex<VecDeque<SourceError>>,
    report_errors: Mutex<VecDeque<SourceError>>,
    heartbeat_errors: Mutex<VecDeque<SourceError>>,
}

impl InMemoryTaskSource {
    /// Create a new in-memory source with a 60 second long-poll timeout
    pub fn new() -> Self {
        Self::with_long_poll_timeout(Duration::from_secs(60))
    }

    /// Create a source whose acquisition calls return empty after `timeout`
    pub fn with_long_poll_timeout(timeout: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            long_poll_timeout: timeout,
            acquire_log: Mutex::new(Vec::new()),
            acquire_errors: Mutex::new(VecDeque::new()),
            report_errors: Mutex::new(VecDeque::new()),
            heartbeat_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a task with a JSON input and return its token
    pub fn submit(&self, input: &serde_json::Value) -> String {
        self.submit_raw(input.to_string())
    }

    /// Enqueue a task with an already encoded (possibly malformed) input
    pub fn submit_raw(&self, input: impl Into<String>) -> String {
        let token = format!("tok-{}", Uuid::now_v7());
        self.tasks.write().insert(
            token.clone(),
            TaskState {
                input: input.into(),
                status: TaskStatus::Pending,
                claimed_by: None,
                output: None,
                error: None,
                heartbeats: 0,
                terminal_reports: 0,
            },
        );
        self.queue.lock().push_back(Pending::Task(token.clone()));
        self.notify.notify_waiters();
        token
    }

    /// Enqueue a response that carries no token
    pub fn submit_placeholder(&self) {
        self.queue.lock().push_back(Pending::Placeholder);
        self.notify.notify_waiters();
    }

    /// Make the next acquisition call fail with `error`
    pub fn fail_next_acquire(&self, error: SourceError) {
        self.acquire_errors.lock().push_back(error);
    }

    /// Make the next success/failure report fail with `error`
    pub fn fail_next_report(&self, error: SourceError) {
        self.report_errors.lock().push_back(error);
    }

    /// Make the next heartbeat report fail with `error`
    pub fn fail_next_heartbeat(&self, error: SourceError) {
        self.heartbeat_errors.lock().push_back(error);
    }

    /// Number of tasks waiting to be acquired
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Current status of a task
    pub fn status(&self, token: &str) -> Option<TaskStatus> {
        self.tasks.read().get(token).map(|t| t.status)
    }

    /// Identity of the slot that acquired a task
    pub fn claimed_by(&self, token: &str) -> Option<String> {
        self.tasks.read().get(token).and_then(|t| t.claimed_by.clone())
    }

    /// Output recorded by a successful report
    pub fn output(&self, token: &str) -> Option<String> {
        self.tasks.read().get(token).and_then(|t| t.output.clone())
    }

    /// Error payload recorded by a failure report
    pub fn error(&self, token: &str) -> Option<String> {
        self.tasks.read().get(token).and_then(|t| t.error.clone())
    }

    /// Number of accepted heartbeats for a task
    pub fn heartbeat_count(&self, token: &str) -> u32 {
        self.tasks.read().get(token).map_or(0, |t| t.heartbeats)
    }

    /// Number of success/failure reports received for a task, accepted or not
    pub fn terminal_report_count(&self, token: &str) -> u32 {
        self.tasks.read().get(token).map_or(0, |t| t.terminal_reports)
    }

    /// Worker names of every acquisition call, in call order
    pub fn acquire_requests(&self) -> Vec<String> {
        self.acquire_log.lock().clone()
    }

    fn claim(&self, worker_name: &str) -> Option<AcquiredTask> {
        let entry = self.queue.lock().pop_front()?;
        match entry {
            Pending::Placeholder => Some(AcquiredTask::new("", "")),
            Pending::Task(token) => {
                let mut tasks = self.tasks.write();
                let task = tasks.get_mut(&token)?;
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_name.to_string());
                Some(AcquiredTask::new(token, task.input.clone()))
            }
        }
    }

    fn settle(
        &self,
        token: &str,
        status: TaskStatus,
        payload: String,
    ) -> Result<(), SourceError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(token)
            .ok_or_else(|| SourceError::InvalidToken(token.to_string()))?;
        task.terminal_reports += 1;

        if let Some(error) = self.report_errors.lock().pop_front() {
            return Err(error);
        }

        match task.status {
            TaskStatus::Claimed => {
                task.status = status;
                match status {
                    TaskStatus::Succeeded => task.output = Some(payload),
                    _ => task.error = Some(payload),
                }
                Ok(())
            }
            TaskStatus::Pending => Err(SourceError::InvalidToken(token.to_string())),
            TaskStatus::Succeeded | TaskStatus::Failed => Err(SourceError::TaskDeadlinePassed),
        }
    }
}

impl Default for InMemoryTaskSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskSource {
    async fn acquire_next(
        &self,
        request: PollRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Option<AcquiredTask>, SourceError> {
        self.acquire_log.lock().push(request.worker_name.to_string());

        if let Some(error) = self.acquire_errors.lock().pop_front() {
            return Err(error);
        }

        // Suspend at least once per call, as a remote round trip would, so
        // concurrent callers interleave.
        tokio::task::yield_now().await;

        let deadline = Instant::now() + self.long_poll_timeout;

        loop {
            // Register interest before looking at the queue so a submit
            // between the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.claim(request.worker_name) {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            }
        }
    }

    async fn report_success(&self, token: &str, output: String) -> Result<(), SourceError> {
        self.settle(token, TaskStatus::Succeeded, output)
    }

    async fn report_failure(&self, token: &str, error: String) -> Result<(), SourceError> {
        if error.chars().count() > MAX_FAILURE_LEN {
            return Err(SourceError::Transport(format!(
                "failed to satisfy constraint: error must have length less than or equal to {MAX_FAILURE_LEN}"
            )));
        }
        self.settle(token, TaskStatus::Failed, error)
    }

    async fn report_heartbeat(&self, token: &str) -> Result<(), SourceError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(token)
            .ok_or_else(|| SourceError::InvalidToken(token.to_string()))?;

        if let Some(error) = self.heartbeat_errors.lock().pop_front() {
            return Err(error);
        }

        if task.status.is_terminal() {
            return Err(SourceError::TaskDeadlinePassed);
        }

        task.heartbeats += 1;
        Ok(())
    }
}
