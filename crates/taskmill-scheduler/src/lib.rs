//! `taskmill-scheduler`: task lifecycle orchestration.
//!
//! # Overview
//!
//! [`TaskManager`] validates creation requests, persists tasks through the
//! store and hands immediate and delayed work to a [`WorkQueue`]. Scheduled
//! tasks get a periodic binding that the [`DispatchLoop`] scans every tick,
//! dispatching due records and advancing their `next_execution`.
//!
//! | Kind        | Dispatch                                          |
//! |-------------|---------------------------------------------------|
//! | `immediate` | Queued on creation                                |
//! | `delayed`   | Queued on creation with a countdown               |
//! | `scheduled` | Queued by the dispatch loop on every cron fire    |
//!
//! [`LocalQueue`] is the in-process queue: a tokio task per item behind a
//! concurrency semaphore, reporting status through [`StoreReporter`].
//!
//! [`WorkQueue`]: taskmill_core::WorkQueue

pub mod dispatch;
pub mod error;
pub mod manager;
pub mod queue;
pub mod schedule;
pub mod status;

pub use dispatch::{DispatchLoop, TickReport};
pub use error::{Result, TaskError};
pub use manager::{CreateTaskRequest, CreatedTask, TaskManager, TaskStats};
pub use queue::LocalQueue;
pub use schedule::CronSchedule;
pub use status::StoreReporter;
