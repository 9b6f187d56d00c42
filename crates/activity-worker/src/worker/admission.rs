//! Admission control
//!
//! Couples the acquisition ceiling to the remaining execution capacity:
//!
//! ```text
//! admissible = task_cap.map_or(poll_cap, |cap| min(poll_cap, cap - active))
//! ```
//!
//! Active tasks exceeding the task ceiling is a bookkeeping defect and is
//! reported as [`WorkerError::CapacityInvariant`] rather than clamped.

use super::WorkerError;

/// Load notification derived from the active task count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSignal {
    /// Active tasks reached the task ceiling
    Full,
    /// Active tasks dropped to zero
    Empty,
}

/// Poll and task ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Live acquisition ceiling; zero while stopped
    pub poll_cap: usize,
    /// Execution ceiling, unbounded if unset
    pub task_cap: Option<usize>,
}

impl Admission {
    pub fn new(poll_cap: usize, task_cap: Option<usize>) -> Self {
        Self { poll_cap, task_cap }
    }

    /// Number of poll slots allowed with `active` tasks executing
    pub fn admissible_slots(&self, active: usize) -> Result<usize, WorkerError> {
        match self.task_cap {
            None => Ok(self.poll_cap),
            Some(cap) => {
                let free = cap
                    .checked_sub(active)
                    .ok_or(WorkerError::CapacityInvariant { active, cap })?;
                Ok(self.poll_cap.min(free))
            }
        }
    }

    /// Whether `active` tasks fill the execution ceiling
    pub fn is_saturated(&self, active: usize) -> bool {
        self.task_cap == Some(active)
    }

    /// Signal to emit after the task count changed to `active`
    ///
    /// `removed` is true when the change was a task leaving the pool; only a
    /// removal can produce [`LoadSignal::Empty`].
    pub fn load_signal(&self, active: usize, removed: bool) -> Option<LoadSignal> {
        if self.is_saturated(active) {
            Some(LoadSignal::Full)
        } else if removed && active == 0 {
            Some(LoadSignal::Empty)
        } else {
            None
        }
    }
}
