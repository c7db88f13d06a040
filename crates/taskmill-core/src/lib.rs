//! `taskmill-core`: shared data model and contracts for the taskmill workspace.
//!
//! Holds the persisted [`Task`] / [`PeriodicTask`] records, the status state
//! machine, executor kind tags and their keyword-argument layout, the two
//! ports the engine talks through ([`WorkQueue`], [`StatusReporter`]), a
//! [`Clock`] abstraction, and the figment-backed [`TaskmillConfig`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ports;
pub mod time;
pub mod types;

pub use config::TaskmillConfig;
pub use dispatch::{ExecutorKind, WorkItem};
pub use error::{ConfigError, QueueError};
pub use ports::{QueueHandle, ReportOutcome, StatusReporter, WorkQueue};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{
    CodePayload, ExecutionResult, FailureKind, HttpPayload, PeriodicTask, Task, TaskKind,
    TaskPayload, TaskStatus,
};
