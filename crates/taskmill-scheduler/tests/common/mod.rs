#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use taskmill_core::{ManualClock, QueueError, QueueHandle, WorkQueue};
use taskmill_sandbox::SafetyChecker;
use taskmill_scheduler::{CreateTaskRequest, TaskManager};
use taskmill_store::{MemoryKv, TaskStore};

#[derive(Debug, Clone)]
pub struct Sent {
    pub executor: String,
    pub kwargs: Map<String, Value>,
    pub delay: Duration,
}

/// Records every item instead of running it.
#[derive(Default)]
pub struct RecordingQueue {
    pub sent: Mutex<Vec<Sent>>,
    pub refuse: AtomicBool,
}

impl RecordingQueue {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    async fn send(
        &self,
        executor: &str,
        kwargs: Map<String, Value>,
        delay: Duration,
    ) -> Result<QueueHandle, QueueError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected("broker unavailable".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(Sent {
            executor: executor.to_string(),
            kwargs,
            delay,
        });
        Ok(QueueHandle(format!("h-{}", sent.len())))
    }
}

pub struct Harness {
    pub manager: Arc<TaskManager>,
    pub queue: Arc<RecordingQueue>,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKv>,
}

pub fn harness(now: DateTime<Utc>) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let queue = Arc::new(RecordingQueue::default());
    let clock = Arc::new(ManualClock::new(now));
    let manager = Arc::new(TaskManager::new(
        TaskStore::new(kv.clone()),
        queue.clone(),
        clock.clone(),
        SafetyChecker::default(),
    ));
    Harness {
        manager,
        queue,
        clock,
        kv,
    }
}

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
}

pub fn ts(at: DateTime<Utc>) -> f64 {
    taskmill_core::time::to_timestamp(at)
}

pub fn code_request(kind: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        name: Some("t1".into()),
        task_type: Some(kind.into()),
        function_code: Some("def f(): return 42".into()),
        function_name: Some("f".into()),
        ..CreateTaskRequest::default()
    }
}

pub fn scheduled_request(cron: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        cron_expression: Some(cron.into()),
        ..code_request("scheduled")
    }
}

pub fn http_request(url: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        name: Some("call".into()),
        task_type: Some("immediate".into()),
        api_url: Some(url.into()),
        ..CreateTaskRequest::default()
    }
}
