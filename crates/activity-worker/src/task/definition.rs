//! Task handler trait and outcome payloads

use std::any::Any;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Heartbeat;

/// Longest failure payload the remote source accepts
pub const MAX_ERROR_LEN: usize = 256;

/// Marker appended to a truncated failure payload
pub const TRUNCATION_MARKER: &str = "...";

/// Error type for task failures
///
/// Serialized field by field into the failure report, so every piece of
/// information the handler puts here reaches the remote source (subject to
/// the 256 character ceiling).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error name/kind, `"Error"` unless set
    pub name: String,

    /// Human readable message
    pub message: String,

    /// Additional error details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Create a new error with the default name
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// Create a new error with an explicit name
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "task handler panicked".to_string()
        };
        Self::named("Panic", message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::named("SerializationError", err.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Encode a successful result for the remote source
pub fn encode_output(output: &serde_json::Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(output)
}

/// Encode a failure for the remote source, truncated to [`MAX_ERROR_LEN`]
pub fn encode_failure(error: &TaskError) -> String {
    let encoded = serde_json::to_string(error).unwrap_or_else(|_| error.message.clone());
    truncate_payload(encoded)
}

/// Cut a payload longer than [`MAX_ERROR_LEN`] characters to exactly that
/// length, ending in [`TRUNCATION_MARKER`]
pub fn truncate_payload(payload: String) -> String {
    if payload.chars().count() <= MAX_ERROR_LEN {
        return payload;
    }

    let keep = MAX_ERROR_LEN - TRUNCATION_MARKER.len();
    let mut truncated: String = payload.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// User supplied work handler
///
/// Invoked exactly once per accepted unit of work. The handler may send any
/// number of heartbeats through the provided [`Heartbeat`] before returning.
/// Returning `Err`, or panicking, reports the task as failed.
///
/// Any `Fn(Value, Heartbeat) -> impl Future<Output = Result<Value, TaskError>>`
/// closure is a handler.
///
/// # Example
///
/// ```ignore
/// use activity_worker::prelude::*;
///
/// struct Resize;
///
/// #[async_trait]
/// impl TaskHandler for Resize {
///     async fn handle(&self, input: Value, heartbeat: Heartbeat) -> Result<Value, TaskError> {
///         heartbeat.beat().await;
///         let image: Image = serde_json::from_value(input)?;
///         Ok(json!({"width": image.width / 2}))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Execute one unit of work
    async fn handle(
        &self,
        input: serde_json::Value,
        heartbeat: Heartbeat,
    ) -> Result<serde_json::Value, TaskError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(serde_json::Value, Heartbeat) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn handle(
        &self,
        input: serde_json::Value,
        heartbeat: Heartbeat,
    ) -> Result<serde_json::Value, TaskError> {
        (self)(input, heartbeat).await
    }
}
