//! `taskmill-executor`: the execution back-ends and the worker harness.
//!
//! Three back-ends implement one [`Executor`] contract and are selected by
//! [`ExecutorKind`](taskmill_core::ExecutorKind):
//! - [`SandboxedExecutor`]: in-process restricted Python scope
//! - [`ContainerExecutor`]: resource-limited container per run
//! - [`HttpExecutor`]: one outbound request
//!
//! None of them lets a failure escape `execute`; everything comes back as a
//! failed [`ExecutionResult`](taskmill_core::ExecutionResult).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskmill_core::config::SandboxConfig;
//! use taskmill_executor::{Backends, SandboxedExecutor};
//!
//! let backends = Backends::new().with(Arc::new(SandboxedExecutor::new(&SandboxConfig::default())));
//! assert!(backends.resolve("dynamic.execute_code").is_ok());
//! ```

pub mod container;
pub mod error;
pub mod executor;
pub mod http;
pub mod registry;
pub mod sandboxed;
pub mod truncate;
pub mod worker;

pub use container::{ContainerExecutor, ContainerRuntime, DockerRuntime};
pub use error::{Result, RuntimeError};
pub use executor::Executor;
pub use http::HttpExecutor;
pub use registry::Backends;
pub use sandboxed::SandboxedExecutor;
pub use worker::run_work_item;
