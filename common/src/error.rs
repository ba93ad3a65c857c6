use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sensor retry attempts must be at least 1")]
    NoRetryAttempts,
    #[error("sensor retry interval must be non-zero")]
    ZeroRetryInterval,
    #[error("deep sleep duration must be non-zero")]
    ZeroDeepSleep,
    #[error(
        "sleep deadline ({sleep_deadline_ms} ms) must exceed the sensor retry window ({retry_window_ms} ms)"
    )]
    SleepBeforeRetryWindow {
        sleep_deadline_ms: u64,
        retry_window_ms: u64,
    },
    #[error("`{key}` must be a non-negative integer, got `{value}`")]
    InvalidOverride { key: &'static str, value: String },
}

/// Failure reported by one of the node's collaborators.
///
/// None of these are fatal to a session; the lifecycle controller logs them and
/// carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("network link error: {0}")]
    Link(String),
    #[error("broker connection error: {0}")]
    Broker(String),
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to `{filter}` failed: {reason}")]
    Subscribe { filter: String, reason: String },
}
