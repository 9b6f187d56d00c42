//! Worker pool for task acquisition and execution
//!
//! This module provides:
//! - [`WorkerPool`] - Orchestrator owning poll slots and running tasks
//! - [`Admission`] - Coupling of poll and task concurrency
//! - [`SlotState`] - Observable poll slot state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  PoolState (one mutex)                               │   │
//! │  │  slots · tasks · poll_cap · task_cap · draining      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │        ▲ intake / renew / retire            │ spawn          │
//! │        │                                    ▼                │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐                   │
//! │  │ PollSlot 0│ │ PollSlot 1│ │ PollSlot N│  (≤ admissible)   │
//! │  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘                   │
//! │        │ acquire_next (long poll)   │                        │
//! │        ▼                            ▼                        │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      TaskRunner per task (≤ task_concurrency)       │    │
//! │  │  handler → success / failure report, heartbeats     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use activity_worker::worker::WorkerPool;
//! use activity_worker::WorkerConfig;
//!
//! let config = WorkerConfig::new("process_order")
//!     .with_worker_name("order-worker")
//!     .with_poll_concurrency(2)
//!     .with_task_concurrency(20);
//!
//! let pool = WorkerPool::builder(config)
//!     .source(source)
//!     .handler(|input: Value, _heartbeat: Heartbeat| async move {
//!         let order: Order = serde_json::from_value(input)?;
//!         // Process the order...
//!         Ok(json!({"status": "completed"}))
//!     })
//!     .build()?;
//!
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod admission;
mod pool;
mod slot;

pub use admission::{Admission, LoadSignal};
pub use pool::{
    ReportKind, SlotReport, TaskId, TaskReport, WorkerError, WorkerPool, WorkerPoolBuilder,
    WorkerReport,
};
pub use slot::{SlotId, SlotState};
