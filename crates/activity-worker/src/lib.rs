//! # Activity Worker
//!
//! A bounded-concurrency work-pulling engine for long-poll activity queues.
//!
//! ## Features
//!
//! - **Poll slots**: Up to `poll_concurrency` outstanding acquisition calls, each with its own worker identity
//! - **Admission control**: Acquisition throttles as `task_concurrency` fills
//! - **Exactly one terminal report**: Success or failure per task, with heartbeats in between
//! - **Graceful stop**: Drains acquisition without abandoning accepted work; restart restores capacity
//! - **Typed events**: `Ready`, `Task`, `Success`, `Failure`, `Heartbeat`, `Error`, `Full`, `Empty`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (admission control, slot lifecycle, task bookkeeping)      │
//! └─────────────────────────────────────────────────────────────┘
//!               │ PollSlot                    │ TaskRunner
//!               ▼                             ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  TaskSource::acquire_next │   │  TaskHandler::handle         │
//! │  (long poll)              │   │  report_success / _failure   │
//! └──────────────────────────┘   │  report_heartbeat            │
//!                                └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use activity_worker::prelude::*;
//!
//! let config = WorkerConfig::from_env()?;
//! let pool = WorkerPool::builder(config)
//!     .source(Arc::new(my_source))
//!     .handler(|input: Value, heartbeat: Heartbeat| async move {
//!         heartbeat.beat().await;
//!         Ok(json!({"echo": input}))
//!     })
//!     .build()?;
//!
//! let mut events = pool.subscribe();
//! pool.start()?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let WorkerEvent::Error(e) = event {
//!         eprintln!("worker error: {e}");
//!     }
//! }
//! ```

pub mod config;
pub mod event;
pub mod source;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, WorkerConfig};
    pub use crate::event::WorkerEvent;
    pub use crate::source::{AcquiredTask, PollRequest, SourceError, TaskSource};
    pub use crate::task::{Heartbeat, TaskError, TaskHandler};
    pub use crate::worker::{WorkerError, WorkerPool};
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use config::{ConfigError, WorkerConfig};
pub use event::{FailureEvent, HeartbeatEvent, SuccessEvent, TaskEvent, WorkerEvent};
pub use source::{AcquiredTask, InMemoryTaskSource, PollRequest, SourceError, TaskSource};
pub use task::{Heartbeat, TaskError, TaskHandler, TaskRunner};
pub use telemetry::{init_tracing, TracingConfig};
pub use worker::{WorkerError, WorkerPool, WorkerPoolBuilder, WorkerReport};
