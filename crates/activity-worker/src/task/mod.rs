//! Task abstractions
//!
//! A task is one unit of work handed out by the remote source. This module
//! provides:
//! - [`TaskHandler`] trait implemented by user code
//! - [`TaskRunner`] which drives one task from handler call to terminal report
//! - [`Heartbeat`] handle for liveness reports while a handler runs

mod context;
mod definition;
mod runner;

pub use context::Heartbeat;
pub use definition::{
    encode_failure, encode_output, truncate_payload, TaskError, TaskHandler, MAX_ERROR_LEN,
    TRUNCATION_MARKER,
};
pub use runner::TaskRunner;
