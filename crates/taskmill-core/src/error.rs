use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Configuration could not be loaded: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Failures surfaced by a [`crate::WorkQueue`] when a work item cannot be enqueued.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown executor: {0}")]
    UnknownExecutor(String),

    #[error("Work queue is closed")]
    Closed,

    #[error("Work item rejected: {0}")]
    Rejected(String),
}
