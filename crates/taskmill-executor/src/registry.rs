//! Executor registry: maps each [`ExecutorKind`] to the back-end that runs it.
//! Workers resolve the executor named on a work item through this table.

use std::collections::HashMap;
use std::sync::Arc;

use taskmill_core::{ExecutorKind, QueueError};

use crate::executor::Executor;

#[derive(Clone, Default)]
pub struct Backends {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under its own kind, replacing any previous entry.
    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    /// Resolve an executor by its routing name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Executor>, QueueError> {
        let kind: ExecutorKind = name
            .parse()
            .map_err(|_| QueueError::UnknownExecutor(name.to_string()))?;
        self.get(kind)
            .ok_or_else(|| QueueError::UnknownExecutor(name.to_string()))
    }

    pub fn kinds(&self) -> Vec<ExecutorKind> {
        ExecutorKind::ALL
            .into_iter()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").field("kinds", &self.kinds()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmill_core::config::SandboxConfig;

    use crate::sandboxed::SandboxedExecutor;

    #[test]
    fn resolves_registered_names_only() {
        let backends =
            Backends::new().with(Arc::new(SandboxedExecutor::new(&SandboxConfig::default())));
        assert_eq!(backends.kinds(), vec![ExecutorKind::SandboxedCode]);
        assert!(backends.resolve("dynamic.execute_code").is_ok());
        assert!(matches!(
            backends.resolve("api.execute_request"),
            Err(QueueError::UnknownExecutor(name)) if name == "api.execute_request"
        ));
        assert!(matches!(
            backends.resolve("nope"),
            Err(QueueError::UnknownExecutor(_))
        ));
    }
}
