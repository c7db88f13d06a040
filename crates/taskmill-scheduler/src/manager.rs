use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskmill_core::time::to_timestamp;
use taskmill_core::{
    Clock, CodePayload, ExecutionResult, FailureKind, HttpPayload, PeriodicTask, QueueHandle,
    ReportOutcome, Task, TaskKind, TaskPayload, TaskStatus, WorkQueue,
};
use taskmill_executor::container::script::validate_requirements;
use taskmill_executor::http::ALLOWED_METHODS;
use taskmill_sandbox::SafetyChecker;
use taskmill_store::{TaskFilter, TaskStore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::schedule::CronSchedule;
use crate::status::StoreReporter;

/// A task creation request as submitted by a caller.
///
/// Code tasks carry `function_code`; HTTP tasks carry `api_url`. When both
/// are present the code payload wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: Option<String>,
    pub task_type: Option<String>,

    pub function_code: Option<String>,
    pub function_name: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub requirements: Option<Vec<String>>,
    pub isolated: Option<bool>,

    pub api_url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub data: Option<Map<String, Value>>,
    pub timeout: Option<i64>,

    pub delay_seconds: Option<i64>,
    pub cron_expression: Option<String>,
}

/// What `create` hands back: the in-flight task, never its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub task_id: String,
    pub task_name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_handle: Option<QueueHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic: Option<PeriodicTask>,
}

/// Counts over every stored task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    #[serde(flatten)]
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

/// The validated parts of a creation request.
struct ValidRequest {
    name: String,
    kind: TaskKind,
    payload: TaskPayload,
    delay: Duration,
    schedule: Option<CronSchedule>,
}

/// Orchestrates validation, persistence, dispatch and status transitions.
pub struct TaskManager {
    store: TaskStore,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    checker: SafetyChecker,
    reporter: StoreReporter,
}

impl TaskManager {
    pub fn new(
        store: TaskStore,
        queue: Arc<dyn WorkQueue>,
        clock: Arc<dyn Clock>,
        checker: SafetyChecker,
    ) -> Self {
        let reporter = StoreReporter::new(store.clone(), clock.clone());
        Self {
            store,
            queue,
            clock,
            checker,
            reporter,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The port executors report through.
    pub fn reporter(&self) -> StoreReporter {
        self.reporter.clone()
    }

    // --- creation ----------------------------------------------------------

    /// Validate, persist as `pending`, then dispatch according to the kind.
    ///
    /// Rejected requests persist nothing. For immediate and delayed tasks
    /// this returns once the queue acknowledges the item.
    #[instrument(skip_all, fields(task_type = request.task_type.as_deref().unwrap_or("-")))]
    pub async fn create(&self, request: CreateTaskRequest) -> Result<CreatedTask> {
        let valid = self.validate(request)?;

        let id = Uuid::new_v4().to_string();
        let name = if valid.name.trim().is_empty() {
            Task::default_name(&id)
        } else {
            valid.name
        };
        let now = self.clock.now();
        let created_at = to_timestamp(now);
        let task = Task {
            id: id.clone(),
            name: name.clone(),
            kind: valid.kind,
            status: TaskStatus::Pending,
            created_at,
            updated_at: created_at,
            payload: valid.payload,
            result: None,
        };
        self.store.save_task(&task)?;
        info!(task_id = %id, name = %name, kind = %task.kind, "task created");

        let mut created = CreatedTask {
            task_id: id,
            task_name: name,
            kind: task.kind,
            status: TaskStatus::Pending,
            queue_handle: None,
            next_execution: None,
            periodic: None,
        };

        match task.kind {
            TaskKind::Immediate | TaskKind::Delayed => {
                let handle = match self.send(&task, valid.delay).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.fail_undispatched(&task, &e);
                        return Err(e);
                    }
                };
                created.queue_handle = Some(handle);
                if task.kind == TaskKind::Delayed {
                    created.next_execution = Some(created_at + valid.delay.as_secs_f64());
                }
            }
            TaskKind::Scheduled => {
                let Some(schedule) = valid.schedule else {
                    return Err(TaskError::Validation(
                        "cron_expression is required for scheduled tasks".into(),
                    ));
                };
                let next = schedule.next_after(now)?;
                let periodic = PeriodicTask {
                    task_id: task.id.clone(),
                    cron_expression: schedule.expression().to_string(),
                    backend_task_name: task.payload.executor(),
                    created_at,
                    last_run_at: None,
                    next_execution: Some(to_timestamp(next)),
                };
                self.store.save_periodic(&periodic)?;
                info!(task_id = %task.id, cron = %periodic.cron_expression, next = %next, "periodic task registered");
                created.next_execution = periodic.next_execution;
                created.periodic = Some(periodic);
            }
        }
        Ok(created)
    }

    /// Hand a task's payload to the work queue, tagged with its identity.
    pub async fn dispatch(&self, task: &Task) -> Result<QueueHandle> {
        self.send(task, Duration::ZERO).await
    }

    async fn send(&self, task: &Task, delay: Duration) -> Result<QueueHandle> {
        let item = task.payload.work_item(&task.id, &task.name);
        let handle = self
            .queue
            .send(item.executor.name(), item.kwargs, delay)
            .await?;
        info!(task_id = %task.id, executor = %item.executor, handle = %handle, delay_secs = delay.as_secs(), "task dispatched");
        Ok(handle)
    }

    /// A task the queue refused would otherwise sit in `pending` forever.
    fn fail_undispatched(&self, task: &Task, error: &TaskError) {
        let result = ExecutionResult::failure(
            FailureKind::Infrastructure,
            format!("dispatch failed: {error}"),
            0.0,
        );
        if let Err(e) = self.reporter.apply(&task.id, TaskStatus::Failed, Some(result)) {
            warn!(task_id = %task.id, error = %e, "could not record dispatch failure");
        }
    }

    fn validate(&self, request: CreateTaskRequest) -> Result<ValidRequest> {
        let Some(name) = request.name else {
            return Err(TaskError::Validation("name is required".into()));
        };
        if name.chars().count() > 100 {
            return Err(TaskError::Validation("name must be at most 100 characters".into()));
        }
        let kind: TaskKind = request
            .task_type
            .as_deref()
            .ok_or_else(|| TaskError::Validation("task_type is required".into()))?
            .parse()
            .map_err(TaskError::Validation)?;

        let delay = match (kind, request.delay_seconds) {
            (TaskKind::Delayed, None) => {
                return Err(TaskError::Validation(
                    "delay_seconds is required for delayed tasks".into(),
                ))
            }
            (_, Some(secs)) if secs < 0 => {
                return Err(TaskError::Validation("delay_seconds must be >= 0".into()))
            }
            (TaskKind::Delayed, Some(secs)) => Duration::from_secs(secs.unsigned_abs()),
            _ => Duration::ZERO,
        };

        let schedule = match (kind, request.cron_expression.as_deref()) {
            (TaskKind::Scheduled, None) => {
                return Err(TaskError::Validation(
                    "cron_expression is required for scheduled tasks".into(),
                ))
            }
            (TaskKind::Scheduled, Some(expr)) => Some(CronSchedule::parse(expr)?),
            _ => None,
        };

        let payload = if let Some(code) = request.function_code {
            let function_name = request
                .function_name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| TaskError::Validation("function_name is required".into()))?;
            let verdict = self.checker.check(&code);
            if !verdict.safe {
                return Err(TaskError::SafetyRejected(verdict.to_string()));
            }
            let requirements = request.requirements.unwrap_or_default();
            validate_requirements(&requirements).map_err(TaskError::Validation)?;
            TaskPayload::Code(CodePayload {
                function_code: code,
                function_name,
                args: request.args.unwrap_or_default(),
                kwargs: request.kwargs.unwrap_or_default(),
                requirements,
                isolated: request.isolated.unwrap_or(false),
            })
        } else if let Some(url) = request.api_url {
            validate_url(&url)?;
            if let Some(method) = &request.method {
                let upper = method.trim().to_ascii_uppercase();
                if !ALLOWED_METHODS.contains(&upper.as_str()) {
                    return Err(TaskError::Validation(format!("unsupported HTTP method: {method}")));
                }
            }
            let timeout = match request.timeout {
                Some(secs) if secs <= 0 => {
                    return Err(TaskError::Validation("timeout must be > 0".into()))
                }
                Some(secs) => Some(secs.unsigned_abs()),
                None => None,
            };
            TaskPayload::Http(HttpPayload {
                api_url: url,
                method: request.method,
                headers: request.headers.unwrap_or_default(),
                data: request.data.unwrap_or_default(),
                timeout,
            })
        } else {
            return Err(TaskError::Validation(
                "either function_code or api_url is required".into(),
            ));
        };

        Ok(ValidRequest {
            name,
            kind,
            payload,
            delay,
            schedule,
        })
    }

    // --- queries -----------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| TaskError::NotFound { id: id.to_string() })
    }

    pub fn list(&self, filter: TaskFilter, limit: usize) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter, limit)?)
    }

    /// Every recurring binding, oldest first.
    pub fn periodic(&self) -> Result<Vec<PeriodicTask>> {
        Ok(self.store.list_periodic()?)
    }

    pub fn stats(&self) -> Result<TaskStats> {
        let tasks = self.store.list_tasks(TaskFilter::default(), usize::MAX)?;
        let mut by_status: BTreeMap<String, usize> =
            TaskStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        let mut by_type: BTreeMap<String, usize> =
            TaskKind::ALL.iter().map(|k| (k.to_string(), 0)).collect();
        for task in &tasks {
            *by_status.entry(task.status.to_string()).or_default() += 1;
            *by_type.entry(task.kind.to_string()).or_default() += 1;
        }
        Ok(TaskStats {
            total: tasks.len(),
            by_status,
            by_type,
        })
    }

    // --- mutation ----------------------------------------------------------

    /// Remove a task. A scheduled task loses its periodic binding first.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let task = self.get(id)?;
        if task.kind == TaskKind::Scheduled {
            self.store.delete_periodic(id)?;
        }
        self.store.delete_task(id)?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Move a task to `stopped`. A scheduled task loses its periodic binding
    /// so it never fires again.
    #[instrument(skip(self))]
    pub fn stop(&self, id: &str) -> Result<Task> {
        let mut task = self.get(id)?;
        if !task.status.can_transition_to(TaskStatus::Stopped, task.kind) {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                from: task.status,
                to: TaskStatus::Stopped,
            });
        }
        if task.kind == TaskKind::Scheduled {
            self.store.delete_periodic(id)?;
        }
        task.status = TaskStatus::Stopped;
        task.updated_at = to_timestamp(self.clock.now());
        self.store.save_task(&task)?;
        info!(task_id = %id, "task stopped");
        Ok(task)
    }

    /// Record a status transition. Unknown tasks are ignored.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> Result<ReportOutcome> {
        self.reporter.apply(id, status, result)
    }

    /// Delete terminal tasks untouched for longer than `retention`.
    /// Scheduled tasks that still have a periodic binding are kept.
    #[instrument(skip(self))]
    pub fn purge_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = to_timestamp(self.clock.now()) - retention.as_secs_f64();
        let live: HashSet<String> = self
            .store
            .list_periodic()?
            .into_iter()
            .map(|p| p.task_id)
            .collect();
        let mut purged = 0;
        for task in self.store.list_tasks(TaskFilter::default(), usize::MAX)? {
            if !task.status.is_terminal() || task.last_touched() >= cutoff {
                continue;
            }
            if live.contains(&task.id) {
                continue;
            }
            if self.store.delete_task(&task.id)? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "expired tasks purged");
        }
        Ok(purged)
    }
}

/// Accept absolute `http`/`https` URLs with a host.
fn validate_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| TaskError::Validation(format!("api_url must be an http(s) URL: {url}")))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(TaskError::Validation(format!("api_url has no valid host: {url}")));
    }
    Ok(())
}
