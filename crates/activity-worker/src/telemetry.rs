// Logging bootstrap
//
// Installs a tracing-subscriber fmt layer filtered by an EnvFilter. The
// library itself only emits tracing events; binaries and tests call
// `init_tracing` once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Tracing Configuration
// ============================================================================

/// Configuration for log output
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log filter (e.g., "info", "activity_worker=debug")
    pub log_filter: Option<String>,
    /// Whether to print the event target
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG`: Full filter directive, takes precedence
    /// - `LOG_LEVEL`: Level for this crate only (e.g., "debug")
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok().map(|level| crate_filter(&level))),
            ..Default::default()
        }
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

fn crate_filter(level: &str) -> String {
    format!("activity_worker={}", level.trim().to_lowercase())
}

/// Build the filter, falling back to `info` when the configured one is invalid
pub fn build_filter(config: &TracingConfig) -> EnvFilter {
    config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Returns false if a global subscriber was already set (e.g. by a test
/// harness); the existing one is kept.
///
/// # Example
///
/// ```ignore
/// use activity_worker::telemetry::{init_tracing, TracingConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_tracing(TracingConfig::from_env());
///     // ... start the worker pool
/// }
/// ```
pub fn init_tracing(config: TracingConfig) -> bool {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(build_filter(&config));

    tracing_subscriber::registry().with(layer).try_init().is_ok()
}
