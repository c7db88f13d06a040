//! In-process [`WorkQueue`]: each item runs as a tokio task after its delay,
//! with at most `max_concurrent` executing at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use taskmill_core::{QueueError, QueueHandle, StatusReporter, WorkItem, WorkQueue};
use taskmill_executor::{run_work_item, Backends};
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

pub struct LocalQueue {
    backends: Arc<Backends>,
    reporter: Arc<dyn StatusReporter>,
    permits: Arc<Semaphore>,
}

impl LocalQueue {
    pub fn new(backends: Backends, reporter: Arc<dyn StatusReporter>, max_concurrent: usize) -> Self {
        Self {
            backends: Arc::new(backends),
            reporter,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Refuse new items. Items already waiting for a permit are dropped;
    /// items already executing finish.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn send(
        &self,
        executor: &str,
        kwargs: Map<String, Value>,
        delay: Duration,
    ) -> Result<QueueHandle, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let kind = self.backends.resolve(executor)?.kind();
        let handle = QueueHandle(Uuid::new_v4().to_string());
        let item = WorkItem {
            executor: kind,
            kwargs,
        };

        let backends = self.backends.clone();
        let reporter = self.reporter.clone();
        let permits = self.permits.clone();
        let span = tracing::info_span!("work_item", handle = %handle, executor = %kind);
        tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Ok(_permit) = permits.acquire_owned().await else {
                    warn!(task_id = item.task_id().unwrap_or("-"), "queue closed; work item dropped");
                    return;
                };
                run_work_item(&backends, reporter.as_ref(), &item).await;
            }
            .instrument(span),
        );

        debug!(handle = %handle, executor = %kind, delay_secs = delay.as_secs(), "work item enqueued");
        Ok(handle)
    }
}
