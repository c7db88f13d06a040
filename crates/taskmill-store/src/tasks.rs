use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use taskmill_core::{PeriodicTask, Task, TaskKind, TaskStatus};
use tracing::{instrument, warn};

use crate::error::{Result, StoreError};
use crate::kv::KvStore;

/// Optional constraints for [`TaskStore::list_tasks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.kind.map_or(true, |k| k == task.kind)
            && self.status.map_or(true, |s| s == task.status)
    }
}

/// Task and periodic-task records over a [`KvStore`].
///
/// Records are stored as JSON text. Writes replace the whole record, so
/// callers updating a field must read, modify, and save.
#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // --- tasks -------------------------------------------------------------

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn save_task(&self, task: &Task) -> Result<()> {
        self.put(&Task::key(&task.id), task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.fetch(&Task::key(id))
    }

    /// Tasks matching `filter`, newest first, at most `limit` of them.
    ///
    /// Records that no longer decode are logged and left out.
    pub fn list_tasks(&self, filter: TaskFilter, limit: usize) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .scan_records::<Task>(Task::KEY_PREFIX)?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Returns whether a record was removed.
    #[instrument(skip(self))]
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let key = Task::key(id);
        Ok(self.kv.delete(&[key.as_str()])? > 0)
    }

    // --- periodic tasks ----------------------------------------------------

    #[instrument(skip(self, periodic), fields(task_id = %periodic.task_id))]
    pub fn save_periodic(&self, periodic: &PeriodicTask) -> Result<()> {
        self.put(&PeriodicTask::key(&periodic.task_id), periodic)
    }

    pub fn get_periodic(&self, task_id: &str) -> Result<Option<PeriodicTask>> {
        self.fetch(&PeriodicTask::key(task_id))
    }

    /// Every periodic record, ordered by creation time.
    pub fn list_periodic(&self) -> Result<Vec<PeriodicTask>> {
        let mut records = self.scan_records::<PeriodicTask>(PeriodicTask::KEY_PREFIX)?;
        records.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(records)
    }

    /// Keys of every periodic record. The dispatch loop reads records one by
    /// one so a single corrupt record only fails itself.
    pub fn periodic_keys(&self) -> Result<Vec<String>> {
        self.kv.scan(PeriodicTask::KEY_PREFIX)
    }

    /// Load one periodic record by its full store key.
    pub fn get_periodic_by_key(&self, key: &str) -> Result<Option<PeriodicTask>> {
        self.fetch(key)
    }

    #[instrument(skip(self))]
    pub fn delete_periodic(&self, task_id: &str) -> Result<bool> {
        let key = PeriodicTask::key(task_id);
        Ok(self.kv.delete(&[key.as_str()])? > 0)
    }

    // --- private helpers ---------------------------------------------------

    fn put<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.kv.set(key, &bytes)
    }

    fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.kv.get(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            })
    }

    fn scan_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for key in self.kv.scan(prefix)? {
            match self.fetch::<T>(&key) {
                Ok(Some(record)) => records.push(record),
                // Deleted between scan and read.
                Ok(None) => {}
                Err(StoreError::Serialization { key, source }) => {
                    warn!(%key, "skipping undecodable record: {source}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}
