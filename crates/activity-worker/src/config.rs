//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default worker name prefix used when none is configured
pub const DEFAULT_WORKER_NAME: &str = "worker";

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use activity_worker::WorkerConfig;
///
/// let config = WorkerConfig::new("resize-images")
///     .with_worker_name("thumbnailer")
///     .with_poll_concurrency(3)
///     .with_task_concurrency(5);
///
/// assert_eq!(config.slot_worker_name(2), "thumbnailer-2");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Identity of the remote activity queue to poll
    pub activity: String,

    /// Prefix of the per-slot worker identity
    #[serde(default)]
    pub worker_name: Option<String>,

    /// Maximum outstanding acquisition requests
    pub poll_concurrency: usize,

    /// Maximum tasks executing at once (unbounded if unset)
    #[serde(default)]
    pub task_concurrency: Option<usize>,

    /// Buffer size of the event channel
    pub event_capacity: usize,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            activity: String::new(),
            worker_name: None,
            poll_concurrency: 1,
            task_concurrency: None,
            event_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given activity
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            ..Default::default()
        }
    }

    /// Set the worker name prefix
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    /// Set the poll concurrency
    pub fn with_poll_concurrency(mut self, n: usize) -> Self {
        self.poll_concurrency = n.max(1);
        self
    }

    /// Set the task concurrency
    pub fn with_task_concurrency(mut self, n: usize) -> Self {
        self.task_concurrency = Some(n.max(1));
        self
    }

    /// Remove the task concurrency limit
    pub fn without_task_concurrency(mut self) -> Self {
        self.task_concurrency = None;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Load configuration from environment variables
    ///
    /// | variable | field |
    /// |---|---|
    /// | `WORKER_ACTIVITY` | `activity` (required) |
    /// | `WORKER_NAME` | `worker_name` |
    /// | `POLL_CONCURRENCY` | `poll_concurrency` |
    /// | `TASK_CONCURRENCY` | `task_concurrency` |
    /// | `SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let activity = lookup("WORKER_ACTIVITY")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingActivity)?;

        let mut config = Self::new(activity);
        config.worker_name = lookup("WORKER_NAME").filter(|s| !s.is_empty());

        if let Some(n) = parse_var(&lookup, "POLL_CONCURRENCY")? {
            config.poll_concurrency = n;
        }
        config.task_concurrency = parse_var(&lookup, "TASK_CONCURRENCY")?;
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activity.is_empty() {
            return Err(ConfigError::MissingActivity);
        }
        if self.poll_concurrency == 0 {
            return Err(ConfigError::ZeroPollConcurrency);
        }
        if self.task_concurrency == Some(0) {
            return Err(ConfigError::ZeroTaskConcurrency);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }

    /// Worker name prefix, falling back to [`DEFAULT_WORKER_NAME`]
    pub fn worker_name(&self) -> &str {
        self.worker_name.as_deref().unwrap_or(DEFAULT_WORKER_NAME)
    }

    /// Remote identity of the poll slot with the given index
    pub fn slot_worker_name(&self, index: usize) -> String {
        format!("{}-{}", self.worker_name(), index)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var: key, value }),
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("activity must be set")]
    MissingActivity,

    #[error("poll concurrency must be at least 1")]
    ZeroPollConcurrency,

    #[error("task concurrency must be at least 1 when set")]
    ZeroTaskConcurrency,

    #[error("event capacity must be at least 1")]
    ZeroEventCapacity,

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
