//! Status write-back: the read-modify-write executors report through.

use std::sync::Arc;

use async_trait::async_trait;
use taskmill_core::time::to_timestamp;
use taskmill_core::{Clock, ExecutionResult, ReportOutcome, StatusReporter, TaskKind, TaskStatus};
use taskmill_store::TaskStore;
use tracing::{debug, instrument, warn};

use crate::error::{Result, TaskError};

/// Applies status transitions to stored tasks.
///
/// A report for a task that no longer exists is dropped rather than
/// recreating the record.
#[derive(Clone)]
pub struct StoreReporter {
    store: TaskStore,
    clock: Arc<dyn Clock>,
}

impl StoreReporter {
    pub fn new(store: TaskStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, result), fields(task_id = %task_id, status = %status))]
    pub fn apply(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> Result<ReportOutcome> {
        let Some(mut task) = self.store.get_task(task_id)? else {
            debug!("status update for unknown task dropped");
            return Ok(ReportOutcome::Missing);
        };

        if task.status == status && (result.is_none() || duplicate_outcome(task.kind, status)) {
            debug!("status unchanged");
            return Ok(ReportOutcome::Unchanged);
        }
        if !task.status.can_transition_to(status, task.kind) {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                from: task.status,
                to: status,
            });
        }

        task.status = status;
        task.updated_at = to_timestamp(self.clock.now());
        if result.is_some() {
            task.result = result;
        }
        self.store.save_task(&task)?;
        Ok(ReportOutcome::Applied)
    }
}

/// A repeated terminal report for a one-shot task is a redelivery, not a
/// new outcome.
fn duplicate_outcome(kind: TaskKind, status: TaskStatus) -> bool {
    status.is_terminal() && kind != TaskKind::Scheduled
}

#[async_trait]
impl StatusReporter for StoreReporter {
    async fn report(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> ReportOutcome {
        match self.apply(task_id, status, result) {
            Ok(outcome) => outcome,
            Err(e @ TaskError::InvalidTransition { .. }) => {
                warn!(task_id = %task_id, error = %e, "status update refused");
                ReportOutcome::Refused
            }
            Err(e) => {
                warn!(task_id = %task_id, status = %status, error = %e, "status update not applied");
                ReportOutcome::Failed
            }
        }
    }
}
