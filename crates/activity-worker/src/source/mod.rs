//! Remote task source
//!
//! This module provides:
//! - [`TaskSource`] trait for the four remote operations (acquire, success,
//!   failure, heartbeat)
//! - [`InMemoryTaskSource`] for testing and local runs

mod memory;
mod store;

pub use memory::{InMemoryTaskSource, TaskStatus};
pub use store::{AcquiredTask, PollRequest, SourceError, TaskSource};
