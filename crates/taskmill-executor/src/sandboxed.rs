//! In-process execution in the restricted Python scope.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use taskmill_core::config::SandboxConfig;
use taskmill_core::{ExecutionResult, ExecutorKind, FailureKind, WorkItem};
use taskmill_sandbox::{SafetyChecker, Sandbox, ScriptError};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::executor::{elapsed, parse_args, CodeArgs, Executor};

/// Wall time allowed past the sandbox deadline before the run is abandoned.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Runs code in the sandbox after it passes the safety checker.
#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
    sandbox: Sandbox,
    checker: SafetyChecker,
}

impl SandboxedExecutor {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            sandbox: Sandbox::from_config(config),
            checker: SafetyChecker::new(config.max_code_size),
        }
    }
}

#[async_trait]
impl Executor for SandboxedExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::SandboxedCode
    }

    #[instrument(skip_all, fields(task_id = item.task_id().unwrap_or("-")))]
    async fn execute(&self, item: &WorkItem) -> ExecutionResult {
        let start = Instant::now();
        let args: CodeArgs = match parse_args(item) {
            Ok(args) => args,
            Err(failure) => return failure,
        };

        let verdict = self.checker.check(&args.code);
        if !verdict.safe {
            warn!(reason = %verdict, "code rejected by safety checker");
            return ExecutionResult::failure(
                FailureKind::SafetyRejected,
                format!("code safety check failed: {verdict}"),
                elapsed(start),
            );
        }

        let sandbox = self.sandbox.clone();
        let limit = sandbox.limits().timeout + JOIN_GRACE;
        let function_name = args.function_name.clone();
        let handle = tokio::task::spawn_blocking(move || {
            sandbox.run(&args.code, &args.function_name, &args.args, &args.kwargs)
        });

        let result = match join_within(handle, limit, start).await {
            Ok(Ok(output)) => {
                debug!(steps = output.steps, "sandboxed code finished");
                ExecutionResult::success(output.value, elapsed(start))
                    .with_detail("stdout", output.stdout)
            }
            Ok(Err(err)) => script_failure(err, elapsed(start)),
            Err(failure) => failure,
        };
        result.with_detail("function_name", Value::String(function_name))
    }
}

/// Await a blocking run for at most `limit`. A run still going by then is
/// reported as timed out; its thread is left to finish on its own.
async fn join_within<T>(
    handle: JoinHandle<T>,
    limit: Duration,
    start: Instant,
) -> Result<T, ExecutionResult> {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(ExecutionResult::failure(
            FailureKind::Infrastructure,
            format!("sandbox worker failed: {join}"),
            elapsed(start),
        )),
        Err(_) => {
            error!(?limit, "sandbox run outlived its deadline, abandoning it");
            Err(ExecutionResult::failure(
                FailureKind::Timeout,
                format!("execution exceeded the time limit of {limit:?}"),
                elapsed(start),
            ))
        }
    }
}

fn script_failure(err: ScriptError, execution_time: f64) -> ExecutionResult {
    let kind = match &err {
        ScriptError::StepLimit(_) | ScriptError::Timeout(_) => FailureKind::Timeout,
        ScriptError::Internal(_) => FailureKind::Infrastructure,
        _ => FailureKind::Execution,
    };
    let failure = ExecutionResult::failure(kind, err.to_string(), execution_time);
    match err.traceback() {
        Some(traceback) => failure.with_traceback(traceback),
        None => failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(kwargs: Value) -> WorkItem {
        WorkItem {
            executor: ExecutorKind::SandboxedCode,
            kwargs: kwargs.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn returns_the_function_value() {
        let executor = SandboxedExecutor::new(&SandboxConfig::default());
        let result = executor
            .execute(&item(json!({
                "code": "def add(a, b=2):\n    print('adding')\n    return a + b\n",
                "function_name": "add",
                "args": [40],
                "task_id": "t-1",
            })))
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.value, Some(json!(42)));
        assert_eq!(result.details["function_name"], json!("add"));
        assert_eq!(result.details["stdout"], json!("adding\n"));
    }

    #[tokio::test]
    async fn rejects_unsafe_code_without_running_it() {
        let executor = SandboxedExecutor::new(&SandboxConfig::default());
        let result = executor
            .execute(&item(json!({
                "code": "import os\ndef f():\n    return os.getcwd()\n",
                "function_name": "f",
            })))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::SafetyRejected));
        assert!(result.error.unwrap().contains("forbidden import"));
    }

    #[tokio::test]
    async fn raised_exceptions_become_execution_failures() {
        let executor = SandboxedExecutor::new(&SandboxConfig::default());
        let result = executor
            .execute(&item(json!({
                "code": "def f():\n    raise ValueError('bad input')\n",
                "function_name": "f",
            })))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error.as_deref(), Some("ValueError: bad input"));
        assert!(result.traceback.unwrap().contains("line 2, in f"));
    }

    #[tokio::test]
    async fn missing_entry_point_is_a_failure() {
        let executor = SandboxedExecutor::new(&SandboxConfig::default());
        let result = executor
            .execute(&item(json!({"code": "x = 1\n", "function_name": "main"})))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error.as_deref(), Some("function 'main' not found in code"));
    }

    #[tokio::test]
    async fn a_run_past_the_join_limit_is_a_timeout() {
        let start = Instant::now();
        let handle = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
            7
        });
        let failure = join_within(handle, Duration::from_millis(20), start)
            .await
            .unwrap_err();
        assert_eq!(failure.failure, Some(FailureKind::Timeout));
        assert!(!failure.success);
    }

    #[tokio::test]
    async fn a_run_inside_the_join_limit_returns_its_value() {
        let handle = tokio::task::spawn_blocking(|| 7);
        let value = join_within(handle, Duration::from_secs(5), Instant::now())
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn native_call_past_the_deadline_is_a_timeout() {
        let config = SandboxConfig {
            execution_timeout_secs: 1,
            ..SandboxConfig::default()
        };
        let result = SandboxedExecutor::new(&config)
            .execute(&item(json!({
                "code": "def f():\n    return sum(range(4 * 10**8))\n",
                "function_name": "f",
            })))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Timeout), "{result:?}");
    }

    #[tokio::test]
    async fn step_budget_exhaustion_is_a_timeout() {
        let config = SandboxConfig {
            max_steps: 5_000,
            ..SandboxConfig::default()
        };
        let result = SandboxedExecutor::new(&config)
            .execute(&item(json!({
                "code": "def spin():\n    while True:\n        pass\n",
                "function_name": "spin",
            })))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Timeout));
    }
}
