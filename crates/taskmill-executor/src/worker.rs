//! Worker harness: runs one work item and reports its lifecycle.

use taskmill_core::{
    ExecutionResult, FailureKind, StatusReporter, TaskStatus, WorkItem,
};
use tracing::{info, instrument, warn};

use crate::registry::Backends;

/// Execute `item` on its executor, reporting `running` before and the final
/// status with the result after. Items without a `task_id` run unreported.
///
/// Returns `None` without executing when the `running` report is refused or
/// the task is gone, so a stopped or deleted task never runs its payload.
#[instrument(skip_all, fields(executor = %item.executor, task_id = item.task_id().unwrap_or("-")))]
pub async fn run_work_item(
    backends: &Backends,
    reporter: &dyn StatusReporter,
    item: &WorkItem,
) -> Option<ExecutionResult> {
    let task_id = item.task_id().map(str::to_owned);
    if let Some(id) = &task_id {
        let outcome = reporter.report(id, TaskStatus::Running, None).await;
        if !outcome.may_proceed() {
            info!(?outcome, "work item skipped");
            return None;
        }
    }

    let result = match backends.get(item.executor) {
        Some(executor) => executor.execute(item).await,
        None => {
            warn!("no executor registered");
            ExecutionResult::failure(
                FailureKind::Infrastructure,
                format!("no executor registered for {}", item.executor),
                0.0,
            )
        }
    };

    let status = result.status();
    info!(
        status = %status,
        execution_time = result.execution_time,
        "work item finished"
    );
    if let Some(id) = &task_id {
        reporter.report(id, status, Some(result.clone())).await;
    }
    Some(result)
}
