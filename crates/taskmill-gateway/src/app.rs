use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use taskmill_core::TaskmillConfig;
use taskmill_scheduler::TaskManager;
use tower_http::cors::{Any, CorsLayer};

use crate::http::{health, scheduled, tasks};

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub config: TaskmillConfig,
    pub manager: Arc<TaskManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: TaskmillConfig, manager: Arc<TaskManager>) -> Self {
        Self {
            config,
            manager,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health_handler))
        .route("/api/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/api/tasks/stats", get(tasks::task_stats))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/stop", post(tasks::stop_task))
        .route(
            "/api/scheduled-tasks",
            post(scheduled::create_scheduled_task).get(scheduled::list_scheduled_tasks),
        )
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
