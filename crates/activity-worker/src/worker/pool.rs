//! Worker pool orchestration
//!
//! Owns the poll slots and the running tasks, applies admission control and
//! implements start, stop, restart and graceful shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::admission::{Admission, LoadSignal};
use super::slot::{PollSlot, SlotGate, SlotHandle, SlotId, SlotState};
use crate::config::{ConfigError, WorkerConfig};
use crate::event::{EventBus, TaskEvent, WorkerEvent};
use crate::source::{AcquiredTask, SourceError, TaskSource};
use crate::task::{TaskHandler, TaskRunner};

/// Unique identifier of a running task inside the pool
pub type TaskId = Uuid;

/// Which report call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Success,
    Failure,
    Heartbeat,
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Worker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No task source given to the builder
    #[error("no task source configured")]
    MissingSource,

    /// No handler given to the builder
    #[error("worker does not define a task handler")]
    MissingHandler,

    /// More tasks are running than the task concurrency allows
    #[error("capacity invariant violated: {active} active tasks exceed task concurrency {cap}")]
    CapacityInvariant { active: usize, cap: usize },

    /// An acquisition call failed
    #[error("task acquisition failed for {worker_name}: {source}")]
    Acquire {
        worker_name: String,
        source: SourceError,
    },

    /// A report call failed
    #[error("{kind} report failed for task {token}: {source}")]
    Report {
        kind: ReportKind,
        token: String,
        input: serde_json::Value,
        source: SourceError,
    },

    /// Stop completed while accepted tasks are still running
    #[error("{count} tasks still ongoing")]
    TasksOngoing { count: usize },

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Snapshot of one poll slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub id: SlotId,
    pub worker_name: String,
    pub state: SlotState,
}

/// Snapshot of one running task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub token: String,
    pub input: serde_json::Value,
    pub worker_name: String,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerReport {
    pub slots: Vec<SlotReport>,
    pub tasks: Vec<TaskReport>,
}

struct PoolState {
    admission: Admission,
    /// Poll ceiling restored by `start`
    configured_poll_cap: usize,
    running: bool,
    draining: bool,
    slots: HashMap<SlotId, SlotHandle>,
    tasks: HashMap<TaskId, TaskReport>,
}

impl PoolState {
    fn lowest_free_index(&self) -> usize {
        let used: HashSet<usize> = self.slots.values().map(|slot| slot.index).collect();
        (0..=self.slots.len())
            .find(|index| !used.contains(index))
            .unwrap_or(self.slots.len())
    }
}

struct PoolInner {
    this: Weak<PoolInner>,
    config: WorkerConfig,
    source: Arc<dyn TaskSource>,
    handler: Arc<dyn TaskHandler>,
    events: EventBus,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    task_count: watch::Sender<usize>,
}

impl PoolInner {
    /// Create slots while fewer than admissible exist
    fn fill_slots(&self, state: &mut PoolState) -> Result<(), WorkerError> {
        if !state.running || state.draining {
            return Ok(());
        }
        let Some(gate) = self.this.upgrade() else {
            return Ok(());
        };

        let admissible = state.admission.admissible_slots(state.tasks.len())?;
        while state.slots.len() < admissible {
            let index = state.lowest_free_index();
            let handle = PollSlot::spawn(
                index,
                self.config.slot_worker_name(index),
                self.config.activity.clone(),
                self.source.clone(),
                gate.clone(),
                &self.shutdown,
            );
            debug!(slot_id = %handle.id, worker_name = %handle.worker_name, "Poll slot created");
            state.slots.insert(handle.id, handle);
        }
        Ok(())
    }

    fn emit_load_signal(&self, state: &PoolState, removed: bool) {
        match state.admission.load_signal(state.tasks.len(), removed) {
            Some(LoadSignal::Full) => {
                debug!(active_tasks = state.tasks.len(), "Task concurrency reached");
                self.events.emit(WorkerEvent::Full);
            }
            Some(LoadSignal::Empty) => {
                debug!("No active tasks");
                self.events.emit(WorkerEvent::Empty);
            }
            None => {}
        }
    }

    fn finish_task(&self, task_id: TaskId) {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.remove(&task_id) else {
            return;
        };
        debug!(token = %task.token, active_tasks = state.tasks.len(), "Task removed");

        self.task_count.send_replace(state.tasks.len());
        self.emit_load_signal(&state, true);

        if let Err(e) = self.fill_slots(&mut state) {
            self.escalate(e);
        }
    }
}

impl SlotGate for PoolInner {
    fn intake(&self, slot: SlotId, worker_name: &str, task: AcquiredTask) {
        let Some(pool) = self.this.upgrade() else {
            return;
        };

        let runner = TaskRunner::new(
            task,
            worker_name.to_string(),
            self.source.clone(),
            self.handler.clone(),
            self.events.clone(),
        );
        let task_id = Uuid::now_v7();
        let report = TaskReport {
            token: runner.token().to_string(),
            input: runner.input().clone(),
            worker_name: runner.worker_name().to_string(),
            started_at: runner.started_at(),
        };

        {
            let mut state = self.state.lock();
            self.events.emit(WorkerEvent::Task(TaskEvent {
                token: report.token.clone(),
                input: report.input.clone(),
                worker_name: report.worker_name.clone(),
            }));
            info!(
                %slot,
                token = %report.token,
                worker_name = %report.worker_name,
                "Task accepted"
            );

            state.tasks.insert(task_id, report);
            if let Err(e) = state.admission.admissible_slots(state.tasks.len()) {
                self.escalate(e);
            }
            self.task_count.send_replace(state.tasks.len());
            self.emit_load_signal(&state, false);
        }

        tokio::spawn(async move {
            runner.run().await;
            pool.finish_task(task_id);
        });
    }

    fn renew(&self, slot: SlotId) -> Result<bool, WorkerError> {
        let mut state = self.state.lock();
        if !state.running || state.draining || !state.slots.contains_key(&slot) {
            state.slots.remove(&slot);
            return Ok(false);
        }

        let admissible = match state.admission.admissible_slots(state.tasks.len()) {
            Ok(admissible) => admissible,
            Err(e) => {
                state.slots.remove(&slot);
                return Err(e);
            }
        };
        if state.slots.len() > admissible {
            state.slots.remove(&slot);
            return Ok(false);
        }

        self.fill_slots(&mut state)?;
        Ok(true)
    }

    fn retire(&self, slot: SlotId) {
        if self.state.lock().slots.remove(&slot).is_some() {
            debug!(%slot, "Poll slot retired");
        }
    }

    fn escalate(&self, error: WorkerError) {
        error!(error = %error, "Worker error");
        self.events.emit(WorkerEvent::Error(error));
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    source: Option<Arc<dyn TaskSource>>,
    handler: Option<Arc<dyn TaskHandler>>,
}

impl WorkerPoolBuilder {
    /// Set the remote task source
    pub fn source(mut self, source: Arc<dyn TaskSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the task handler
    pub fn handler<H: TaskHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and create the pool
    ///
    /// The pool is created stopped; call [`WorkerPool::start`].
    pub fn build(self) -> Result<WorkerPool, WorkerError> {
        self.config.validate()?;
        let source = self.source.ok_or(WorkerError::MissingSource)?;
        let handler = self.handler.ok_or(WorkerError::MissingHandler)?;
        let config = self.config;

        info!(
            activity = %config.activity,
            worker_name = %config.worker_name(),
            poll_concurrency = config.poll_concurrency,
            task_concurrency = ?config.task_concurrency,
            "Creating worker pool"
        );

        let (task_count, _) = watch::channel(0);
        let inner = Arc::new_cyclic(|this| PoolInner {
            this: this.clone(),
            events: EventBus::new(config.event_capacity),
            state: Mutex::new(PoolState {
                admission: Admission::new(0, config.task_concurrency),
                configured_poll_cap: config.poll_concurrency,
                running: false,
                draining: false,
                slots: HashMap::new(),
                tasks: HashMap::new(),
            }),
            shutdown: CancellationToken::new(),
            task_count,
            config,
            source,
            handler,
        });

        Ok(WorkerPool { inner })
    }
}

/// Bounded-concurrency worker pulling tasks from a [`TaskSource`]
///
/// # Example
///
/// ```ignore
/// use activity_worker::prelude::*;
///
/// let config = WorkerConfig::new("process_order")
///     .with_poll_concurrency(3)
///     .with_task_concurrency(10);
///
/// let pool = WorkerPool::builder(config)
///     .source(source)
///     .handler(|input: Value, heartbeat: Heartbeat| async move {
///         heartbeat.beat().await;
///         Ok(json!({"status": "completed"}))
///     })
///     .build()?;
///
/// let mut events = pool.subscribe();
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start building a pool
    pub fn builder(config: WorkerConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            config,
            source: None,
            handler: None,
        }
    }

    /// Create a pool from its three parts
    pub fn new<H: TaskHandler>(
        config: WorkerConfig,
        source: Arc<dyn TaskSource>,
        handler: H,
    ) -> Result<Self, WorkerError> {
        Self::builder(config).source(source).handler(handler).build()
    }

    /// Start polling
    ///
    /// Restores the configured poll concurrency and creates slots up to the
    /// admissible count. Emits [`WorkerEvent::Ready`] when the pool was not
    /// running; calling it on a running pool only tops up slots.
    #[instrument(skip(self), fields(activity = %self.inner.config.activity))]
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut state = self.inner.state.lock();
        let was_running = state.running;

        state.running = true;
        state.draining = false;
        state.admission.poll_cap = state.configured_poll_cap;
        self.inner.fill_slots(&mut state)?;

        if !was_running {
            info!(
                poll_concurrency = state.admission.poll_cap,
                task_concurrency = ?state.admission.task_cap,
                slots = state.slots.len(),
                "Worker pool started"
            );
            self.inner.events.emit(WorkerEvent::Ready);
        }
        Ok(())
    }

    /// Stop polling
    ///
    /// Stops every poll slot and resolves once all of them have exited.
    /// Tasks that were already accepted keep running; if any are left the
    /// result is [`WorkerError::TasksOngoing`]. Safe to call concurrently.
    #[instrument(skip(self), fields(activity = %self.inner.config.activity))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let slots: Vec<SlotHandle> = {
            let mut state = self.inner.state.lock();
            state.draining = true;
            state.running = false;
            state.admission.poll_cap = 0;
            state.slots.values().cloned().collect()
        };

        info!(slots = slots.len(), "Stopping worker pool");
        futures::future::join_all(slots.iter().map(|slot| slot.stop())).await;

        let count = self.inner.state.lock().tasks.len();
        if count > 0 {
            warn!(active_tasks = count, "Worker pool stopped with tasks ongoing");
            return Err(WorkerError::TasksOngoing { count });
        }

        info!("Worker pool stopped");
        Ok(())
    }

    /// Stop, then start again with the configured poll concurrency
    ///
    /// A stop error is returned without restarting.
    pub async fn restart(&self) -> Result<(), WorkerError> {
        self.stop().await?;
        self.start()
    }

    /// Stop polling and wait for ongoing tasks, bounded by the configured
    /// shutdown timeout
    #[instrument(skip(self), fields(activity = %self.inner.config.activity))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        match self.stop().await {
            Ok(()) => return Ok(()),
            Err(WorkerError::TasksOngoing { count }) => {
                info!(active_tasks = count, "Waiting for ongoing tasks");
            }
            Err(e) => return Err(e),
        }

        let mut task_count = self.inner.task_count.subscribe();
        let drained = tokio::time::timeout(
            self.inner.config.shutdown_timeout,
            task_count.wait_for(|count| *count == 0),
        )
        .await
        .is_ok();

        if !drained {
            warn!(
                active_tasks = self.active_tasks(),
                "Shutdown timeout reached"
            );
            return Err(WorkerError::ShutdownTimeout);
        }

        info!("Worker pool shut down");
        Ok(())
    }

    /// Change the poll concurrency at runtime
    ///
    /// Missing slots are created immediately while running; excess slots
    /// retire when their current acquisition call returns.
    pub fn set_poll_concurrency(&self, poll_concurrency: usize) -> Result<(), WorkerError> {
        if poll_concurrency == 0 {
            return Err(ConfigError::ZeroPollConcurrency.into());
        }

        let mut state = self.inner.state.lock();
        info!(
            from = state.configured_poll_cap,
            to = poll_concurrency,
            "Changing poll concurrency"
        );
        state.configured_poll_cap = poll_concurrency;
        if state.running {
            state.admission.poll_cap = poll_concurrency;
            self.inner.fill_slots(&mut state)?;
        }
        Ok(())
    }

    /// Snapshot of slots and tasks
    pub fn report(&self) -> WorkerReport {
        let state = self.inner.state.lock();

        let mut slots: Vec<_> = state.slots.values().collect();
        slots.sort_by_key(|slot| slot.index);
        let slots = slots
            .into_iter()
            .map(|slot| SlotReport {
                id: slot.id,
                worker_name: slot.worker_name.clone(),
                state: slot.state(),
            })
            .collect();

        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.started_at);

        WorkerReport { slots, tasks }
    }

    /// Subscribe to worker events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Number of tasks currently executing
    pub fn active_tasks(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Number of live poll slots
    pub fn slot_count(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Current poll concurrency ceiling (zero while stopped)
    pub fn poll_concurrency(&self) -> usize {
        self.inner.state.lock().admission.poll_cap
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
