use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use taskmill_core::TaskKind;
use taskmill_scheduler::CreateTaskRequest;

use super::error::ApiError;
use super::format_timestamp;
use crate::app::AppState;

/// POST /api/scheduled-tasks: like `POST /api/tasks` with the kind forced
/// to `scheduled`.
pub async fn create_scheduled_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(mut request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.cron_expression.is_none() {
        return Err(ApiError::bad_request(
            "cron_expression is required for scheduled tasks",
        ));
    }
    request.task_type = Some(TaskKind::Scheduled.to_string());

    let created = state.manager.create(request).await?;
    let formatted = created.next_execution.and_then(format_timestamp);
    let mut body = json!(created);
    body["next_execution_formatted"] = json!(formatted);
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/scheduled-tasks: every periodic binding, oldest first.
pub async fn list_scheduled_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let records: Vec<Value> = state
        .manager
        .periodic()?
        .into_iter()
        .map(|record| {
            let formatted = record.next_execution.and_then(format_timestamp);
            let mut value = json!(record);
            value["next_execution_formatted"] = json!(formatted);
            value
        })
        .collect();
    Ok(Json(json!({
        "total": records.len(),
        "scheduled_tasks": records,
    })))
}
