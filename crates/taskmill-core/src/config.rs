use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_CONFIG_PATH: &str = "taskmill.toml";
pub const ENV_PREFIX: &str = "TASKMILL_";

/// Top-level config (taskmill.toml + TASKMILL_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment, e.g.
/// `TASKMILL_SCHEDULER__TICK_SECS=30`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskmillConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub container: ContainerConfig,
    pub http: HttpConfig,
    pub queue: QueueConfig,
    pub retention: RetentionConfig,
}

impl TaskmillConfig {
    /// Load configuration from a TOML file (missing file is fine) with
    /// environment overrides on top.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        let config: TaskmillConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_secs must be > 0".into()));
        }
        if self.sandbox.max_code_size == 0 {
            return Err(ConfigError::Invalid("sandbox.max_code_size must be > 0".into()));
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid("queue.max_concurrent must be > 0".into()));
        }
        if self.container.image.trim().is_empty() {
            return Err(ConfigError::Invalid("container.image must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "taskmill.db".to_string(),
        }
    }
}

/// Periodic dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scans of the periodic records.
    pub tick_secs: u64,
    /// How early (ms) a record may fire ahead of its `next_execution`.
    pub tolerance_ms: u64,
    /// Dispatch a fire that was missed while the loop was down (once).
    pub catch_up_missed: bool,
    /// Take a store-backed lease of this many seconds before each scan.
    /// Unset means single-instance mode.
    pub lease_secs: Option<u64>,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            tolerance_ms: 1000,
            catch_up_missed: true,
            lease_secs: None,
        }
    }
}

/// In-process code execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum accepted source size in bytes.
    pub max_code_size: usize,
    /// Modules user code may import.
    pub allowed_modules: Vec<String>,
    pub execution_timeout_secs: u64,
    /// Traced call and line events allowed per execution.
    pub max_steps: u64,
    /// Cap on captured `print` output.
    pub max_output_bytes: usize,
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_code_size: 1024 * 1024,
            allowed_modules: [
                "math",
                "datetime",
                "json",
                "re",
                "random",
                "collections",
                "itertools",
                "functools",
                "operator",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            execution_timeout_secs: 300,
            max_steps: 50_000_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Container-isolated execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Connect to the local container runtime on startup.
    pub enabled: bool,
    /// Primary image.
    pub image: String,
    /// Tried in order when the primary image is unavailable.
    pub fallback_images: Vec<String>,
    pub pull_retries: u32,
    pub pull_backoff_secs: u64,
    pub pull_timeout_secs: u64,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub run_timeout_secs: u64,
    /// Allow network access when dependencies must be installed.
    pub network_for_dependencies: bool,
    pub pip_index_url: Option<String>,
}

impl ContainerConfig {
    /// Primary image followed by the fallbacks, in resolution order.
    pub fn candidate_images(&self) -> Vec<String> {
        std::iter::once(self.image.clone())
            .chain(self.fallback_images.iter().cloned())
            .collect()
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "python:3.11-slim".to_string(),
            fallback_images: vec!["python:3.10-slim".to_string(), "python:3.9-slim".to_string()],
            pull_retries: 3,
            pull_backoff_secs: 2,
            pull_timeout_secs: 30,
            memory_bytes: 512 * 1024 * 1024,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            pids_limit: 256,
            run_timeout_secs: 300,
            network_for_dependencies: true,
            pip_index_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub default_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            user_agent: concat!("taskmill/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Work items allowed to execute at once.
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Terminal tasks older than this are purged.
    pub result_expiry_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            result_expiry_secs: 86_400,
            cleanup_interval_secs: 3_600,
        }
    }
}
