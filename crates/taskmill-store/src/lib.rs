//! `taskmill-store`: key-value persistence for task records.
//!
//! [`KvStore`] is the raw byte contract (`set`/`get`/`delete`/`scan`), with a
//! SQLite implementation for durable deployments and a `DashMap` one for
//! tests and ephemeral runs. [`TaskStore`] layers the `task:<id>` and
//! `periodic_task:<task_id>` records on top. Every write replaces the whole
//! record; there are no partial updates and no cross-record transactions.

pub mod db;
pub mod error;
pub mod kv;
pub mod tasks;

pub use error::{Result, StoreError};
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use tasks::{TaskFilter, TaskStore};
