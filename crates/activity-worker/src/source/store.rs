//! TaskSource trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Error type for task source operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The acquisition call ended because the polling slot was asked to stop
    #[error("request cancelled")]
    Cancelled,

    /// The task already reached a terminal state (or its deadline passed)
    ///
    /// Reported by heartbeats that race with the terminal report.
    #[error("task deadline already passed")]
    TaskDeadlinePassed,

    /// The token is unknown to the source
    #[error("invalid task token: {0}")]
    InvalidToken(String),

    /// Any other failure of the remote call
    #[error("transport error: {0}")]
    Transport(String),
}

impl SourceError {
    /// Whether this error is the expected outcome of stopping a slot
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Identity sent with every acquisition call
///
/// The remote source requires a distinct `worker_name` per concurrent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest<'a> {
    /// Remote queue the worker pulls from
    pub activity: &'a str,
    /// Per-slot worker identity
    pub worker_name: &'a str,
}

/// A unit of work handed out by the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredTask {
    /// Opaque handle required on every report call
    pub token: String,
    /// JSON encoded input
    pub input: String,
}

impl AcquiredTask {
    pub fn new(token: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            input: input.into(),
        }
    }

    /// Placeholder responses carry an empty token and must not become tasks
    pub fn is_well_formed(&self) -> bool {
        !self.token.is_empty()
    }
}

/// Remote long-poll task source
///
/// Implementations must be thread-safe; every worker slot holds a shared
/// reference and calls [`TaskSource::acquire_next`] concurrently with the
/// others (each with its own identity).
#[async_trait]
pub trait TaskSource: Send + Sync + 'static {
    /// Long-poll for the next unit of work
    ///
    /// `Ok(None)` is the normal outcome of a poll that timed out without
    /// work. The `cancel` token is cancelled when the polling slot is asked
    /// to stop; the worker never aborts the call, but an implementation may
    /// observe the token and return [`SourceError::Cancelled`] early.
    async fn acquire_next(
        &self,
        request: PollRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Option<AcquiredTask>, SourceError>;

    /// Report a successful outcome with its JSON encoded output
    async fn report_success(&self, token: &str, output: String) -> Result<(), SourceError>;

    /// Report a failed outcome; `error` is at most 256 characters
    async fn report_failure(&self, token: &str, error: String) -> Result<(), SourceError>;

    /// Report liveness of a running task
    async fn report_heartbeat(&self, token: &str) -> Result<(), SourceError>;
}
