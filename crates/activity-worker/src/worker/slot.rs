//! Poll slots
//!
//! A poll slot owns at most one outstanding acquisition call. It loops
//! acquire → hand over → renew until the pool denies renewal, its stop token
//! is cancelled, or the source reports a transport error.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::WorkerError;
use crate::source::{AcquiredTask, PollRequest, SourceError, TaskSource};

/// Unique identifier of a poll slot
pub type SlotId = Uuid;

/// Observable state of a poll slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Between acquisition calls
    Idle,
    /// Acquisition call outstanding
    Polling,
    /// Stop requested while an acquisition call is outstanding
    Retiring,
    /// Loop exited
    Stopped,
}

/// Capabilities a slot has over the pool that owns it
pub(crate) trait SlotGate: Send + Sync + 'static {
    /// Hand over an acquired task
    fn intake(&self, slot: SlotId, worker_name: &str, task: AcquiredTask);

    /// Ask to poll again; `Ok(false)` means the slot was removed and must exit
    fn renew(&self, slot: SlotId) -> Result<bool, WorkerError>;

    /// Remove the slot from the pool
    fn retire(&self, slot: SlotId);

    /// Surface an error the slot cannot handle
    fn escalate(&self, error: WorkerError);
}

/// Pool-side view of a running slot
#[derive(Debug, Clone)]
pub(crate) struct SlotHandle {
    pub(crate) id: SlotId,
    pub(crate) index: usize,
    pub(crate) worker_name: String,
    stop: CancellationToken,
    state: watch::Receiver<SlotState>,
}

impl SlotHandle {
    pub(crate) fn state(&self) -> SlotState {
        let state = *self.state.borrow();
        if state == SlotState::Polling && self.stop.is_cancelled() {
            SlotState::Retiring
        } else {
            state
        }
    }

    /// Ask the slot to stop; idempotent
    pub(crate) fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Resolves once the slot loop has exited
    pub(crate) fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            // A dropped sender means the slot task is gone.
            let _ = state.wait_for(|s| *s == SlotState::Stopped).await;
        }
    }

    /// Stop the slot and wait for its loop to exit
    pub(crate) async fn stop(&self) {
        self.request_stop();
        self.stopped().await;
    }
}

/// A single acquisition loop
pub(crate) struct PollSlot {
    id: SlotId,
    worker_name: String,
    activity: String,
    source: Arc<dyn TaskSource>,
    gate: Arc<dyn SlotGate>,
    stop: CancellationToken,
    state: watch::Sender<SlotState>,
}

impl PollSlot {
    /// Spawn a slot loop on the current runtime
    ///
    /// The slot's stop token is a child of `parent`, so cancelling the parent
    /// stops every slot.
    pub(crate) fn spawn(
        index: usize,
        worker_name: String,
        activity: String,
        source: Arc<dyn TaskSource>,
        gate: Arc<dyn SlotGate>,
        parent: &CancellationToken,
    ) -> SlotHandle {
        let id = Uuid::now_v7();
        let stop = parent.child_token();
        let (state_tx, state_rx) = watch::channel(SlotState::Idle);

        let slot = PollSlot {
            id,
            worker_name: worker_name.clone(),
            activity,
            source,
            gate,
            stop: stop.clone(),
            state: state_tx,
        };
        tokio::spawn(slot.run());

        SlotHandle {
            id,
            index,
            worker_name,
            stop,
            state: state_rx,
        }
    }

    #[instrument(skip(self), fields(slot_id = %self.id, worker_name = %self.worker_name))]
    async fn run(self) {
        debug!("Poll slot started");

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            if !self.poll_once().await {
                break;
            }

            if self.stop.is_cancelled() {
                break;
            }

            match self.gate.renew(self.id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Poll slot not renewed");
                    break;
                }
                Err(e) => {
                    self.gate.escalate(e);
                    break;
                }
            }
        }

        self.gate.retire(self.id);
        self.state.send_replace(SlotState::Stopped);
        debug!("Poll slot stopped");
    }

    /// One acquisition call; returns false if the loop must exit
    async fn poll_once(&self) -> bool {
        self.state.send_replace(SlotState::Polling);
        let request = PollRequest {
            activity: &self.activity,
            worker_name: &self.worker_name,
        };
        let result = self.source.acquire_next(request, self.stop.clone()).await;
        self.state.send_replace(SlotState::Idle);

        match result {
            Ok(Some(task)) if task.is_well_formed() => {
                self.gate.intake(self.id, &self.worker_name, task);
                true
            }
            Ok(_) => {
                trace!("No task available");
                true
            }
            Err(SourceError::Cancelled) => {
                debug!("Acquisition cancelled");
                false
            }
            Err(source) => {
                self.gate.escalate(WorkerError::Acquire {
                    worker_name: self.worker_name.clone(),
                    source,
                });
                false
            }
        }
    }
}
