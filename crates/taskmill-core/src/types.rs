use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::{ExecutorKind, WorkItem};

/// How a task is triggered. Immutable once the task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatched as soon as it is created.
    Immediate,
    /// Dispatched once after `delay_seconds`.
    Delayed,
    /// Re-dispatched on a cron cadence through a [`PeriodicTask`].
    Scheduled,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Immediate, TaskKind::Delayed, TaskKind::Scheduled];
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Immediate => "immediate",
            TaskKind::Delayed => "delayed",
            TaskKind::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(TaskKind::Immediate),
            "delayed" => Ok(TaskKind::Delayed),
            "scheduled" => Ok(TaskKind::Scheduled),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted, not yet picked up by a worker.
    Pending,
    /// A worker is executing the payload.
    Running,
    /// Last execution succeeded.
    Completed,
    /// Last execution failed.
    Failed,
    /// Explicitly stopped by a caller. Final for every kind.
    Stopped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Stopped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// Whether a task of `kind` currently in `self` may move to `next`.
    ///
    /// Transitions only move forward: `pending -> running -> completed|failed`,
    /// with `stopped` reachable from any non-terminal state. Writing the
    /// current state again is accepted for `pending`/`running` so duplicate
    /// deliveries stay harmless. A scheduled task is re-run on every fire,
    /// so its `completed`/`failed` are per-cycle outcomes rather than final:
    /// it may start a new cycle or be stopped. `stopped` never changes.
    pub fn can_transition_to(self, next: TaskStatus, kind: TaskKind) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Stopped, _) => false,
            (Pending, _) => true,
            (Running, Pending) => false,
            (Running, _) => true,
            (Completed | Failed, _) if kind == TaskKind::Scheduled => next != Pending,
            (Completed | Failed, _) => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "stopped" => Ok(TaskStatus::Stopped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Stored records written by older producers carry explicit `null`s for
/// absent optional fields; treat those as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Source code to run, plus the entry point and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodePayload {
    pub function_code: String,
    pub function_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Map<String, Value>,
    /// Third-party packages to install before running (container only).
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub requirements: Vec<String>,
    /// Run inside a container instead of the in-process sandbox.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_false"
    )]
    pub isolated: bool,
}

/// A single outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPayload {
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, String>,
    /// JSON body for `POST`/`PUT`/`PATCH`, query parameters otherwise.
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Map<String, Value>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl HttpPayload {
    pub const DEFAULT_METHOD: &'static str = "GET";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(Self::DEFAULT_METHOD)
            .to_ascii_uppercase()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT_SECS)
    }
}

/// Executor-specific parameters of a task.
///
/// Stored under the record's `data` key. Variants are told apart by their
/// required fields: `function_code` + `function_name` for code, `api_url`
/// for HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Code(CodePayload),
    Http(HttpPayload),
}

impl TaskPayload {
    /// The executor this payload is routed to.
    pub fn executor(&self) -> ExecutorKind {
        match self {
            TaskPayload::Code(code) if code.isolated || !code.requirements.is_empty() => {
                ExecutorKind::IsolatedCode
            }
            TaskPayload::Code(_) => ExecutorKind::SandboxedCode,
            TaskPayload::Http(_) => ExecutorKind::HttpCall,
        }
    }

    /// Build the work item a worker needs to run this payload, tagged with
    /// the owning task's id and name for status correlation.
    pub fn work_item(&self, task_id: &str, task_name: &str) -> WorkItem {
        let mut kwargs = Map::new();
        match self {
            TaskPayload::Code(code) => {
                kwargs.insert("code".into(), Value::String(code.function_code.clone()));
                kwargs.insert(
                    "function_name".into(),
                    Value::String(code.function_name.clone()),
                );
                kwargs.insert("args".into(), Value::Array(code.args.clone()));
                kwargs.insert("kwargs".into(), Value::Object(code.kwargs.clone()));
                if !code.requirements.is_empty() {
                    kwargs.insert(
                        "requirements".into(),
                        Value::Array(
                            code.requirements
                                .iter()
                                .cloned()
                                .map(Value::String)
                                .collect(),
                        ),
                    );
                }
            }
            TaskPayload::Http(http) => {
                kwargs.insert("url".into(), Value::String(http.api_url.clone()));
                kwargs.insert("method".into(), Value::String(http.method()));
                kwargs.insert(
                    "headers".into(),
                    Value::Object(
                        http.headers
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    ),
                );
                kwargs.insert("data".into(), Value::Object(http.data.clone()));
                kwargs.insert("timeout".into(), Value::from(http.timeout_secs()));
            }
        }
        kwargs.insert("task_id".into(), Value::String(task_id.to_string()));
        kwargs.insert("task_name".into(), Value::String(task_name.to_string()));
        WorkItem {
            executor: self.executor(),
            kwargs,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work item's arguments were malformed.
    Validation,
    /// The code was rejected by the safety checker.
    SafetyRejected,
    /// User code raised, exited non-zero, or the remote answered with an error.
    Execution,
    /// The execution exceeded its time or step budget.
    Timeout,
    /// The environment failed: runtime unreachable, no image, I/O.
    Infrastructure,
}

/// Outcome of one execution, stored on the task as `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Return value of the entry point (or the response summary for HTTP).
    #[serde(rename = "result", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Wall-clock seconds spent executing.
    #[serde(default)]
    pub execution_time: f64,
    /// Executor-specific extras (`function_name`, `status_code`, `exit_code`, ...).
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ExecutionResult {
    pub fn success(value: Value, execution_time: f64) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            failure: None,
            traceback: None,
            execution_time,
            details: Map::new(),
        }
    }

    /// A failed execution. Infrastructure failures get an `infrastructure:`
    /// prefix so they are distinguishable in the message alone.
    pub fn failure(kind: FailureKind, error: impl Into<String>, execution_time: f64) -> Self {
        let error = error.into();
        let error = if kind == FailureKind::Infrastructure {
            format!("infrastructure: {error}")
        } else {
            error
        };
        Self {
            success: false,
            value: None,
            error: Some(error),
            failure: Some(kind),
            traceback: None,
            execution_time,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Terminal status a task moves to once this result is recorded.
    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A submitted unit of work. Persisted under `task:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
    #[serde(default)]
    pub updated_at: f64,
    #[serde(rename = "data")]
    pub payload: TaskPayload,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
}

impl Task {
    pub const KEY_PREFIX: &'static str = "task:";

    pub fn key(id: &str) -> String {
        format!("{}{id}", Self::KEY_PREFIX)
    }

    /// Derived name used when a request leaves `name` blank.
    pub fn default_name(id: &str) -> String {
        let short: String = id.chars().take(8).collect();
        format!("task_{short}")
    }

    /// Most recent write time, falling back to creation for legacy records.
    pub fn last_touched(&self) -> f64 {
        if self.updated_at > 0.0 {
            self.updated_at
        } else {
            self.created_at
        }
    }
}

/// Recurring-schedule binding of a scheduled task. Persisted under
/// `periodic_task:<task_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub task_id: String,
    /// Five-field cron: minute, hour, day-of-month, month, day-of-week.
    pub cron_expression: String,
    pub backend_task_name: ExecutorKind,
    pub created_at: f64,
    #[serde(default)]
    pub last_run_at: Option<f64>,
    #[serde(default)]
    pub next_execution: Option<f64>,
}

impl PeriodicTask {
    pub const KEY_PREFIX: &'static str = "periodic_task:";

    pub fn key(task_id: &str) -> String {
        format!("{}{task_id}", Self::KEY_PREFIX)
    }
}
