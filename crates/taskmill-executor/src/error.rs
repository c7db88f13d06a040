//! Error types for the taskmill-executor crate.

use std::time::Duration;

use thiserror::Error;

/// Failures talking to the container runtime. These are infrastructure
/// problems, never bugs in the submitted code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon could not be reached.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// Pulling an image failed or timed out.
    #[error("failed to pull image {image}: {message}")]
    Pull { image: String, message: String },

    /// Creating, starting or inspecting a container failed.
    #[error("container operation failed: {0}")]
    Container(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Writing the execution files failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        RuntimeError::Container(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
