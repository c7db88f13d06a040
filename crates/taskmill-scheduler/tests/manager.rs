mod common;

use std::time::Duration;

use common::{at, code_request, harness, http_request, scheduled_request, ts};
use serde_json::json;
use taskmill_core::{ExecutionResult, FailureKind, ReportOutcome, TaskKind, TaskStatus};
use taskmill_scheduler::{CreateTaskRequest, TaskError};
use taskmill_store::TaskFilter;

#[tokio::test]
async fn immediate_task_is_pending_and_queued() {
    let h = harness(at(12, 0, 0));
    let created = h.manager.create(code_request("immediate")).await.unwrap();

    assert_eq!(created.status, TaskStatus::Pending);
    assert_eq!(created.queue_handle.as_ref().unwrap().0, "h-1");
    assert!(created.next_execution.is_none());

    let task = h.manager.get(&created.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.kind, TaskKind::Immediate);
    assert_eq!(task.created_at, ts(at(12, 0, 0)));

    let sent = h.queue.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].executor, "dynamic.execute_code");
    assert_eq!(sent[0].delay, Duration::ZERO);
    assert_eq!(sent[0].kwargs["task_id"], json!(created.task_id));
    assert_eq!(sent[0].kwargs["task_name"], json!("t1"));
    assert_eq!(sent[0].kwargs["code"], json!("def f(): return 42"));
}

#[tokio::test]
async fn delayed_task_is_queued_with_countdown() {
    let h = harness(at(12, 0, 0));
    let created = h
        .manager
        .create(CreateTaskRequest {
            delay_seconds: Some(30),
            ..code_request("delayed")
        })
        .await
        .unwrap();
    assert_eq!(created.next_execution, Some(ts(at(12, 0, 30))));
    assert_eq!(h.queue.sent()[0].delay, Duration::from_secs(30));
}

#[tokio::test]
async fn delayed_task_requires_a_non_negative_delay() {
    let h = harness(at(12, 0, 0));
    let missing = h.manager.create(code_request("delayed")).await.unwrap_err();
    assert!(matches!(missing, TaskError::Validation(_)));

    let negative = h
        .manager
        .create(CreateTaskRequest {
            delay_seconds: Some(-5),
            ..code_request("delayed")
        })
        .await
        .unwrap_err();
    assert!(matches!(negative, TaskError::Validation(_)));
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn scheduled_task_registers_first_fire() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    assert_eq!(created.next_execution, Some(ts(at(12, 5, 0))));
    assert!(created.queue_handle.is_none());
    assert!(h.queue.sent().is_empty());

    let periodic = h.manager.periodic().unwrap();
    assert_eq!(periodic.len(), 1);
    assert_eq!(periodic[0].task_id, created.task_id);
    assert_eq!(periodic[0].cron_expression, "*/5 * * * *");
    assert_eq!(periodic[0].next_execution, Some(ts(at(12, 5, 0))));
    assert_eq!(periodic[0].last_run_at, None);
}

#[tokio::test]
async fn hourly_schedule_starts_next_hour() {
    let h = harness(at(12, 30, 0));
    let created = h.manager.create(scheduled_request("0 * * * *")).await.unwrap();
    assert_eq!(created.next_execution, Some(ts(at(13, 0, 0))));
}

#[tokio::test]
async fn scheduled_task_requires_valid_cron() {
    let h = harness(at(12, 0, 0));
    let missing = h.manager.create(code_request("scheduled")).await.unwrap_err();
    assert!(matches!(missing, TaskError::Validation(_)));

    let bad = h.manager.create(scheduled_request("* * *")).await.unwrap_err();
    assert!(matches!(bad, TaskError::InvalidCron { .. }));
    assert_eq!(bad.code(), "invalid_cron");
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn unsafe_code_is_rejected_without_persisting() {
    let h = harness(at(12, 0, 0));
    let err = h
        .manager
        .create(CreateTaskRequest {
            function_code: Some("import os\ndef f(): return os.getcwd()".into()),
            ..code_request("immediate")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::SafetyRejected(_)));
    assert!(err.is_validation());
    assert!(h.kv.is_empty());
    assert!(h.queue.sent().is_empty());
}

#[tokio::test]
async fn request_shape_is_validated() {
    let h = harness(at(12, 0, 0));
    let cases = [
        CreateTaskRequest {
            name: None,
            ..code_request("immediate")
        },
        CreateTaskRequest {
            task_type: None,
            ..code_request("immediate")
        },
        code_request("weekly"),
        CreateTaskRequest {
            function_name: Some("  ".into()),
            ..code_request("immediate")
        },
        CreateTaskRequest {
            name: Some("t".into()),
            task_type: Some("immediate".into()),
            ..CreateTaskRequest::default()
        },
        http_request("ftp://example.com"),
        CreateTaskRequest {
            method: Some("BREW".into()),
            ..http_request("https://example.com")
        },
        CreateTaskRequest {
            timeout: Some(0),
            ..http_request("https://example.com")
        },
        CreateTaskRequest {
            requirements: Some(vec!["requests; rm -rf /".into()]),
            ..code_request("immediate")
        },
    ];
    for request in cases {
        let err = h.manager.create(request.clone()).await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)), "{request:?}: {err}");
    }
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn blank_name_gets_a_derived_default() {
    let h = harness(at(12, 0, 0));
    let created = h
        .manager
        .create(CreateTaskRequest {
            name: Some("".into()),
            ..code_request("immediate")
        })
        .await
        .unwrap();
    assert_eq!(created.task_name, format!("task_{}", &created.task_id[..8]));
}

#[tokio::test]
async fn payloads_route_to_their_executor() {
    let h = harness(at(12, 0, 0));
    h.manager
        .create(CreateTaskRequest {
            requirements: Some(vec!["requests==2.31.0".into()]),
            ..code_request("immediate")
        })
        .await
        .unwrap();
    h.manager
        .create(CreateTaskRequest {
            method: Some("post".into()),
            data: Some(json!({"a": 1}).as_object().cloned().unwrap()),
            ..http_request("https://example.com/hook")
        })
        .await
        .unwrap();

    let sent = h.queue.sent();
    assert_eq!(sent[0].executor, "isolated.execute_code");
    assert_eq!(sent[0].kwargs["requirements"], json!(["requests==2.31.0"]));
    assert_eq!(sent[1].executor, "api.execute_request");
    assert_eq!(sent[1].kwargs["method"], json!("POST"));
    assert_eq!(sent[1].kwargs["timeout"], json!(30));
}

#[tokio::test]
async fn queue_refusal_fails_the_task() {
    let h = harness(at(12, 0, 0));
    h.queue.refuse(true);
    let err = h.manager.create(code_request("immediate")).await.unwrap_err();
    assert!(matches!(err, TaskError::Queue(_)));

    let tasks = h.manager.list(TaskFilter::default(), 10).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    let result = tasks[0].result.as_ref().unwrap();
    assert_eq!(result.failure, Some(FailureKind::Infrastructure));
    assert!(result.error.as_ref().unwrap().starts_with("infrastructure: dispatch failed"));
}

#[tokio::test]
async fn deleting_scheduled_task_removes_both_records() {
    let h = harness(at(12, 0, 0));
    let created = h.manager.create(scheduled_request("0 * * * *")).await.unwrap();
    h.manager.delete(&created.task_id).unwrap();

    assert!(h.manager.periodic().unwrap().is_empty());
    assert!(matches!(
        h.manager.get(&created.task_id),
        Err(TaskError::NotFound { .. })
    ));
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn deleting_unknown_task_is_not_found() {
    let h = harness(at(12, 0, 0));
    let err = h.manager.delete("nope").unwrap_err();
    assert!(matches!(err, TaskError::NotFound { id } if id == "nope"));
}

#[tokio::test]
async fn stopping_scheduled_task_unbinds_it() {
    let h = harness(at(12, 0, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(10));

    let stopped = h.manager.stop(&created.task_id).unwrap();
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert_eq!(stopped.updated_at, ts(at(12, 0, 10)));
    assert!(h.manager.periodic().unwrap().is_empty());

    let again = h.manager.stop(&created.task_id).unwrap_err();
    assert!(matches!(again, TaskError::InvalidTransition { .. }));
}

#[tokio::test]
async fn finished_one_shot_task_cannot_be_stopped() {
    let h = harness(at(12, 0, 0));
    let created = h.manager.create(code_request("immediate")).await.unwrap();
    h.manager
        .update_status(&created.task_id, TaskStatus::Running, None)
        .unwrap();
    h.manager
        .update_status(
            &created.task_id,
            TaskStatus::Completed,
            Some(ExecutionResult::success(json!(42), 0.01)),
        )
        .unwrap();
    let err = h.manager.stop(&created.task_id).unwrap_err();
    assert_eq!(err.code(), "invalid_transition");
    assert!(matches!(h.manager.stop("missing"), Err(TaskError::NotFound { .. })));
}

#[tokio::test]
async fn status_update_for_unknown_task_creates_nothing() {
    let h = harness(at(12, 0, 0));
    let outcome = h
        .manager
        .update_status(
            "ghost",
            TaskStatus::Completed,
            Some(ExecutionResult::success(json!(1), 0.0)),
        )
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Missing);
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn listing_filters_and_counts() {
    let h = harness(at(12, 0, 0));
    let first = h.manager.create(code_request("immediate")).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    h.manager.create(scheduled_request("0 * * * *")).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    h.manager
        .create(CreateTaskRequest {
            delay_seconds: Some(60),
            ..code_request("delayed")
        })
        .await
        .unwrap();
    h.manager
        .update_status(&first.task_id, TaskStatus::Failed, None)
        .unwrap();

    let all = h.manager.list(TaskFilter::default(), 10).unwrap();
    let kinds: Vec<_> = all.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TaskKind::Delayed, TaskKind::Scheduled, TaskKind::Immediate]);

    let limited = h.manager.list(TaskFilter::default(), 1).unwrap();
    assert_eq!(limited[0].kind, TaskKind::Delayed);

    let failed = h
        .manager
        .list(
            TaskFilter {
                status: Some(TaskStatus::Failed),
                ..TaskFilter::default()
            },
            10,
        )
        .unwrap();
    assert_eq!(failed.len(), 1);

    let stats = h.manager.stats().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status["pending"], 2);
    assert_eq!(stats.by_status["failed"], 1);
    assert_eq!(stats.by_status["stopped"], 0);
    assert_eq!(stats.by_type["scheduled"], 1);

    let body = serde_json::to_value(&stats).unwrap();
    assert_eq!(body["pending"], json!(2));
    assert_eq!(body["by_type"]["immediate"], json!(1));
}

#[tokio::test]
async fn purge_removes_only_expired_terminal_tasks() {
    let h = harness(at(0, 0, 0));
    let old_done = h.manager.create(code_request("immediate")).await.unwrap();
    let old_pending = h.manager.create(code_request("immediate")).await.unwrap();
    let scheduled = h.manager.create(scheduled_request("0 * * * *")).await.unwrap();
    h.manager
        .update_status(&old_done.task_id, TaskStatus::Completed, None)
        .unwrap();
    h.manager
        .update_status(&scheduled.task_id, TaskStatus::Completed, None)
        .unwrap();

    h.clock.advance(chrono::Duration::hours(2));
    let fresh = h.manager.create(code_request("immediate")).await.unwrap();
    h.manager
        .update_status(&fresh.task_id, TaskStatus::Failed, None)
        .unwrap();

    let purged = h.manager.purge_expired(Duration::from_secs(3600)).unwrap();
    assert_eq!(purged, 1);
    assert!(h.manager.get(&old_done.task_id).is_err());
    assert!(h.manager.get(&old_pending.task_id).is_ok());
    assert!(h.manager.get(&scheduled.task_id).is_ok());
    assert!(h.manager.get(&fresh.task_id).is_ok());
}
