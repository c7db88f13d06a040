//! Contract with the container runtime.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    /// `source:target[:ro]`, the bind syntax the runtime expects.
    pub fn bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Hard caps applied to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
}

/// Everything needed to start one container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    pub network: bool,
    /// Wall-clock limit; the container is killed once it passes.
    pub timeout: Duration,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i64,
    /// Interleaved stdout and stderr.
    pub output: String,
    pub container_id: String,
    pub timed_out: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull(&self, image: &str, timeout: Duration) -> Result<()>;

    /// Run to completion, capture output, then remove the container.
    async fn run(&self, spec: RunSpec) -> Result<RunOutcome>;
}
