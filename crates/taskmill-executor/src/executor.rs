//! The contract every execution back-end implements, and the typed views of
//! the keyword arguments a work item carries.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use taskmill_core::{ExecutionResult, ExecutorKind, FailureKind, WorkItem};

/// One execution back-end.
///
/// `execute` never fails past its boundary: every problem, including a
/// malformed work item, comes back as a failed [`ExecutionResult`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, item: &WorkItem) -> ExecutionResult;
}

/// Keyword arguments of the two code executors.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeArgs {
    pub code: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Keyword arguments of the HTTP executor.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpArgs {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Seconds. Falls back to the executor's configured default.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Decode a work item's kwargs, or explain why they are malformed.
pub fn parse_args<T: DeserializeOwned>(item: &WorkItem) -> Result<T, ExecutionResult> {
    serde_json::from_value(Value::Object(item.kwargs.clone())).map_err(|e| {
        ExecutionResult::failure(
            FailureKind::Validation,
            format!("invalid arguments for {}: {e}", item.executor),
            0.0,
        )
    })
}

/// Seconds elapsed since `start`.
pub(crate) fn elapsed(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
