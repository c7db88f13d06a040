//! Contracts between the engine and its external collaborators.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;
use crate::types::{ExecutionResult, TaskStatus};

/// Acknowledgement returned by a [`WorkQueue`] once an item is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueHandle(pub String);

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asynchronous broker that runs a named executor with keyword arguments,
/// optionally after a delay. Delivery is at-least-once.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(
        &self,
        executor: &str,
        kwargs: Map<String, Value>,
        delay: Duration,
    ) -> Result<QueueHandle, QueueError>;
}

/// What became of one status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The transition was written.
    Applied,
    /// The task already carried that status.
    Unchanged,
    /// The task no longer exists.
    Missing,
    /// The stored status does not allow the transition.
    Refused,
    /// The store could not be read or written.
    Failed,
}

impl ReportOutcome {
    /// Whether a `running` report with this outcome clears the item to run.
    /// A store outage does not block execution; a stopped or deleted task does.
    pub fn may_proceed(self) -> bool {
        matches!(
            self,
            ReportOutcome::Applied | ReportOutcome::Unchanged | ReportOutcome::Failed
        )
    }
}

/// Port through which a running work item reports its lifecycle.
///
/// Implementations must swallow their own failures: a report that cannot be
/// written is logged and returned as [`ReportOutcome::Failed`], never
/// surfaced back into the executor as an error.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> ReportOutcome;
}
