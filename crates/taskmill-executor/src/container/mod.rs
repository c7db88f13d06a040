//! Container-isolated execution.
//!
//! Each run gets a private temporary directory holding the entry script, the
//! payload and an optional requirements file. The directory is mounted
//! read-only at `/app` in a fresh container with memory, CPU and pid caps.
//! The image is resolved first: a local copy wins, otherwise each candidate
//! is pulled with a bounded number of retries before moving to the next.

pub mod docker;
pub mod runtime;
pub mod script;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use taskmill_core::config::ContainerConfig;
use taskmill_core::{ExecutionResult, ExecutorKind, FailureKind, WorkItem};
use taskmill_sandbox::SafetyChecker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::executor::{elapsed, parse_args, CodeArgs, Executor};
use crate::truncate::{truncate_output, DEFAULT_MAX_CHARS};

pub use docker::DockerRuntime;
pub use runtime::{ContainerRuntime, Mount, ResourceLimits, RunOutcome, RunSpec};

pub struct ContainerExecutor {
    /// `Err` holds why the runtime could not be reached at startup.
    runtime: std::result::Result<Arc<dyn ContainerRuntime>, String>,
    config: ContainerConfig,
    checker: SafetyChecker,
}

impl ContainerExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        checker: SafetyChecker,
    ) -> Self {
        Self {
            runtime: Ok(runtime),
            config,
            checker,
        }
    }

    /// An executor that fails every item with an infrastructure error.
    pub fn unavailable(config: ContainerConfig, checker: SafetyChecker, reason: String) -> Self {
        Self {
            runtime: Err(reason),
            config,
            checker,
        }
    }

    /// First candidate image that is present or can be pulled.
    #[instrument(skip_all)]
    pub async fn resolve_image(&self, runtime: &dyn ContainerRuntime) -> Option<String> {
        let timeout = Duration::from_secs(self.config.pull_timeout_secs);
        let backoff = Duration::from_secs(self.config.pull_backoff_secs);
        let attempts = self.config.pull_retries.max(1);

        for image in self.config.candidate_images() {
            match runtime.image_exists(&image).await {
                Ok(true) => {
                    debug!(image = %image, "image present locally");
                    return Some(image);
                }
                Ok(false) => {}
                Err(e) => warn!(image = %image, error = %e, "image lookup failed"),
            }
            for attempt in 1..=attempts {
                match runtime.pull(&image, timeout).await {
                    Ok(()) => {
                        info!(image = %image, attempt, "image pulled");
                        return Some(image);
                    }
                    Err(e) => {
                        warn!(image = %image, attempt, error = %e, "image pull failed");
                        if attempt < attempts {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
        None
    }

    fn run_spec(&self, image: &str, source: &std::path::Path, has_requirements: bool) -> RunSpec {
        RunSpec {
            name: format!("taskmill-{}", Uuid::new_v4().simple()),
            image: image.to_string(),
            command: script::command(has_requirements, self.config.pip_index_url.as_deref()),
            working_dir: script::MOUNT_POINT.to_string(),
            mounts: vec![Mount {
                source: source.to_path_buf(),
                target: script::MOUNT_POINT.to_string(),
                read_only: true,
            }],
            env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ],
            limits: ResourceLimits {
                memory_bytes: self.config.memory_bytes,
                cpu_period: self.config.cpu_period,
                cpu_quota: self.config.cpu_quota,
                pids_limit: self.config.pids_limit,
            },
            network: has_requirements && self.config.network_for_dependencies,
            timeout: Duration::from_secs(self.config.run_timeout_secs),
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::IsolatedCode
    }

    #[instrument(skip_all, fields(task_id = item.task_id().unwrap_or("-")))]
    async fn execute(&self, item: &WorkItem) -> ExecutionResult {
        let start = Instant::now();
        let args: CodeArgs = match parse_args(item) {
            Ok(args) => args,
            Err(failure) => return failure,
        };
        let runtime = match &self.runtime {
            Ok(runtime) => runtime.clone(),
            Err(reason) => {
                return ExecutionResult::failure(
                    FailureKind::Infrastructure,
                    format!("container runtime unavailable: {reason}"),
                    elapsed(start),
                )
            }
        };

        let verdict = self.checker.check(&args.code);
        if !verdict.safe {
            return ExecutionResult::failure(
                FailureKind::SafetyRejected,
                format!("code safety check failed: {verdict}"),
                elapsed(start),
            );
        }
        if let Err(reason) = script::validate_requirements(&args.requirements) {
            return ExecutionResult::failure(FailureKind::Validation, reason, elapsed(start));
        }

        let Some(image) = self.resolve_image(runtime.as_ref()).await else {
            return ExecutionResult::failure(
                FailureKind::Infrastructure,
                format!(
                    "no container image available (tried {})",
                    self.config.candidate_images().join(", ")
                ),
                elapsed(start),
            );
        };

        let workdir = match tempfile::Builder::new().prefix("taskmill-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::Infrastructure,
                    format!("failed to create work directory: {e}"),
                    elapsed(start),
                )
            }
        };
        if let Err(e) = script::write_files(
            workdir.path(),
            &args.code,
            &args.function_name,
            &args.args,
            &args.kwargs,
            &args.requirements,
        ) {
            return ExecutionResult::failure(
                FailureKind::Infrastructure,
                format!("failed to write execution files: {e}"),
                elapsed(start),
            );
        }

        let spec = self.run_spec(&image, workdir.path(), !args.requirements.is_empty());
        let timeout = spec.timeout;
        info!(image = %image, name = %spec.name, "starting container");
        let outcome = match runtime.run(spec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::Infrastructure,
                    format!("container run failed: {e}"),
                    elapsed(start),
                )
                .with_detail("image", image)
            }
        };
        debug!(
            container_id = %outcome.container_id,
            exit_code = outcome.exit_code,
            "container finished"
        );

        interpret(&outcome, timeout, elapsed(start))
            .with_detail("function_name", args.function_name)
            .with_detail("image", image)
            .with_detail("exit_code", outcome.exit_code)
            .with_detail("container_id", outcome.container_id)
    }
}

/// Turn a finished run into a result.
fn interpret(outcome: &RunOutcome, timeout: Duration, execution_time: f64) -> ExecutionResult {
    let logs = truncate_output(outcome.output.trim(), DEFAULT_MAX_CHARS);
    if outcome.timed_out {
        return ExecutionResult::failure(
            FailureKind::Timeout,
            format!("container run exceeded {}s", timeout.as_secs()),
            execution_time,
        )
        .with_detail("logs", logs);
    }
    if outcome.exit_code != 0 {
        return ExecutionResult::failure(
            FailureKind::Execution,
            format!("execution failed with exit code {}", outcome.exit_code),
            execution_time,
        )
        .with_detail("logs", logs);
    }
    match script::parse_outcome(&outcome.output) {
        Some(mut fields) => {
            if fields.get("success").and_then(Value::as_bool).unwrap_or(false) {
                let value = fields.remove("result").unwrap_or(Value::Null);
                return ExecutionResult::success(value, execution_time);
            }
            let error = fields
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("execution failed");
            let failure = ExecutionResult::failure(FailureKind::Execution, error, execution_time);
            match fields.get("traceback").and_then(Value::as_str) {
                Some(traceback) => failure.with_traceback(traceback),
                None => failure,
            }
        }
        None => ExecutionResult::success(Value::String(logs), execution_time)
            .with_detail("note", "output was not structured; returning raw output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::error::{Result, RuntimeError};

    #[derive(Default)]
    struct FakeRuntime {
        local: HashSet<String>,
        pullable: HashSet<String>,
        output: String,
        exit_code: i64,
        timed_out: bool,
        pulls: Mutex<Vec<String>>,
        runs: Mutex<Vec<RunSpec>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn image_exists(&self, image: &str) -> Result<bool> {
            Ok(self.local.contains(image))
        }

        async fn pull(&self, image: &str, _timeout: Duration) -> Result<()> {
            self.pulls.lock().unwrap().push(image.to_string());
            if self.pullable.contains(image) {
                Ok(())
            } else {
                Err(RuntimeError::Pull {
                    image: image.to_string(),
                    message: "not found".to_string(),
                })
            }
        }

        async fn run(&self, spec: RunSpec) -> Result<RunOutcome> {
            for mount in &spec.mounts {
                assert!(mount.source.join(script::ENTRY_SCRIPT).exists());
            }
            self.runs.lock().unwrap().push(spec);
            Ok(RunOutcome {
                exit_code: self.exit_code,
                output: self.output.clone(),
                container_id: "c0ffee".to_string(),
                timed_out: self.timed_out,
            })
        }
    }

    fn config() -> ContainerConfig {
        ContainerConfig {
            image: "py:primary".to_string(),
            fallback_images: vec!["py:fallback-1".to_string(), "py:fallback-2".to_string()],
            pull_retries: 2,
            pull_backoff_secs: 0,
            ..ContainerConfig::default()
        }
    }

    fn item(kwargs: Value) -> WorkItem {
        WorkItem {
            executor: ExecutorKind::IsolatedCode,
            kwargs: kwargs.as_object().cloned().unwrap_or_default(),
        }
    }

    fn code_item() -> WorkItem {
        item(json!({"code": "def f():\n    return 1\n", "function_name": "f", "task_id": "t-1"}))
    }

    fn executor(runtime: FakeRuntime) -> (ContainerExecutor, Arc<FakeRuntime>) {
        let runtime = Arc::new(runtime);
        let exec = ContainerExecutor::new(runtime.clone(), config(), SafetyChecker::default());
        (exec, runtime)
    }

    #[tokio::test]
    async fn local_image_is_used_without_pulling() {
        let (exec, runtime) = executor(FakeRuntime {
            local: HashSet::from(["py:primary".to_string()]),
            ..FakeRuntime::default()
        });
        assert_eq!(exec.resolve_image(runtime.as_ref()).await.as_deref(), Some("py:primary"));
        assert!(runtime.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn falls_back_after_bounded_retries() {
        let (exec, runtime) = executor(FakeRuntime {
            pullable: HashSet::from(["py:fallback-2".to_string()]),
            ..FakeRuntime::default()
        });
        assert_eq!(exec.resolve_image(runtime.as_ref()).await.as_deref(), Some("py:fallback-2"));
        assert_eq!(
            *runtime.pulls.lock().unwrap(),
            vec!["py:primary", "py:primary", "py:fallback-1", "py:fallback-1", "py:fallback-2"]
        );
    }

    #[tokio::test]
    async fn no_image_means_no_container() {
        let (exec, runtime) = executor(FakeRuntime::default());
        let result = exec.execute(&code_item()).await;
        assert_eq!(result.failure, Some(FailureKind::Infrastructure));
        assert!(result.error.unwrap().starts_with("infrastructure: no container image"));
        assert!(runtime.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn structured_output_becomes_the_result() {
        let (exec, runtime) = executor(FakeRuntime {
            local: HashSet::from(["py:primary".to_string()]),
            output: "{\"success\": true, \"result\": {\"answer\": 42}}\n".to_string(),
            ..FakeRuntime::default()
        });
        let result = exec.execute(&code_item()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.value, Some(json!({"answer": 42})));
        assert_eq!(result.details["container_id"], json!("c0ffee"));
        assert_eq!(result.details["exit_code"], json!(0));
        assert_eq!(result.details["image"], json!("py:primary"));

        let runs = runtime.runs.lock().unwrap();
        let spec = &runs[0];
        assert_eq!(spec.command, vec!["python", "/app/execute.py"]);
        assert!(!spec.network);
        assert!(spec.mounts[0].read_only);
        assert_eq!(spec.mounts[0].target, "/app");
        assert!(spec.env.contains(&("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())));
        assert_eq!(spec.limits.memory_bytes, 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn requirements_enable_network_and_pip() {
        let (exec, runtime) = executor(FakeRuntime {
            local: HashSet::from(["py:primary".to_string()]),
            output: "Collecting requests\n{\"success\": true, \"result\": null}\n".to_string(),
            ..FakeRuntime::default()
        });
        let result = exec
            .execute(&item(json!({
                "code": "def f():\n    return None\n",
                "function_name": "f",
                "requirements": ["requests>=2"],
            })))
            .await;
        assert!(result.success);
        let runs = runtime.runs.lock().unwrap();
        assert!(runs[0].network);
        assert_eq!(runs[0].command[0], "sh");
    }

    #[tokio::test]
    async fn bad_requirements_are_rejected_before_resolution() {
        let (exec, runtime) = executor(FakeRuntime::default());
        let result = exec
            .execute(&item(json!({
                "code": "def f():\n    return None\n",
                "function_name": "f",
                "requirements": ["--extra-index-url http://evil"],
            })))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Validation));
        assert!(runtime.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_logs() {
        let (exec, _) = executor(FakeRuntime {
            local: HashSet::from(["py:primary".to_string()]),
            output: "Traceback ...\nMemoryError\n".to_string(),
            exit_code: 137,
            ..FakeRuntime::default()
        });
        let result = exec.execute(&code_item()).await;
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error.as_deref(), Some("execution failed with exit code 137"));
        assert_eq!(result.details["logs"], json!("Traceback ...\nMemoryError"));
    }

    #[test]
    fn interpret_handles_each_outcome() {
        let run = |output: &str, exit_code: i64, timed_out: bool| RunOutcome {
            exit_code,
            output: output.to_string(),
            container_id: "c".to_string(),
            timed_out,
        };
        let timeout = Duration::from_secs(300);

        let raised = interpret(
            &run("{\"success\": false, \"error\": \"ValueError: x\", \"traceback\": \"tb\"}", 0, false),
            timeout,
            0.5,
        );
        assert_eq!(raised.error.as_deref(), Some("ValueError: x"));
        assert_eq!(raised.traceback.as_deref(), Some("tb"));

        let raw = interpret(&run("hello\n", 0, false), timeout, 0.5);
        assert!(raw.success);
        assert_eq!(raw.value, Some(json!("hello")));
        assert!(raw.details.contains_key("note"));

        let slow = interpret(&run("", -1, true), timeout, 300.0);
        assert_eq!(slow.failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn unavailable_runtime_is_infrastructure() {
        let exec = ContainerExecutor::unavailable(config(), SafetyChecker::default(), "no socket".into());
        let result = exec.execute(&code_item()).await;
        assert_eq!(result.failure, Some(FailureKind::Infrastructure));
        assert_eq!(
            result.error.as_deref(),
            Some("infrastructure: container runtime unavailable: no socket")
        );
    }
}
