use taskmill_core::{QueueError, TaskStatus};
use taskmill_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the task manager and the dispatch loop.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The creation request is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Submitted code failed the static safety check.
    #[error("Code safety check failed: {0}")]
    SafetyRejected(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    NotFound { id: String },

    /// The task's current status does not allow the requested move.
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl TaskError {
    /// Rejections raised synchronously at creation, before anything persists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TaskError::Validation(_) | TaskError::SafetyRejected(_) | TaskError::InvalidCron { .. }
        )
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "validation_error",
            TaskError::SafetyRejected(_) => "safety_rejected",
            TaskError::InvalidCron { .. } => "invalid_cron",
            TaskError::NotFound { .. } => "not_found",
            TaskError::InvalidTransition { .. } => "invalid_transition",
            TaskError::Store(_) => "store_error",
            TaskError::Queue(_) => "queue_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
