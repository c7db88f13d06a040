//! Task CRUD endpoints under `/api/tasks`.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use taskmill_core::{TaskKind, TaskStatus};
use taskmill_scheduler::{CreateTaskRequest, CreatedTask, TaskStats};
use taskmill_store::TaskFilter;

use super::error::ApiError;
use crate::app::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// POST /api/tasks: validate, persist and dispatch a new task.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedTask>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let created = state.manager.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/tasks?type=&status=&limit=: newest first.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = TaskFilter {
        kind: query
            .task_type
            .as_deref()
            .map(str::parse::<TaskKind>)
            .transpose()
            .map_err(ApiError::bad_request)?,
        status: query
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .map_err(ApiError::bad_request)?,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let tasks = state.manager.list(filter, limit)?;
    Ok(Json(json!({
        "total": tasks.len(),
        "type": query.task_type.as_deref().unwrap_or("all"),
        "tasks": tasks,
    })))
}

/// GET /api/tasks/stats
pub async fn task_stats(State(state): State<Arc<AppState>>) -> Result<Json<TaskStats>, ApiError> {
    Ok(Json(state.manager.stats()?))
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.manager.get(&id)?;
    Ok(Json(json!({ "task": task })))
}

/// DELETE /api/tasks/{id}: also drops the periodic binding of a scheduled task.
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.manager.delete(&id)?;
    Ok(Json(json!({ "task_id": id, "deleted": true })))
}

/// POST /api/tasks/{id}/stop
pub async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.manager.stop(&id)?;
    Ok(Json(json!({ "task": task })))
}
