mod common;

use std::sync::Arc;

use common::{at, harness, scheduled_request, ts, Harness};
use serde_json::json;
use taskmill_core::config::SchedulerConfig;
use taskmill_core::{Clock, ExecutorKind, PeriodicTask};
use taskmill_scheduler::{DispatchLoop, TickReport};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 60,
        tolerance_ms: 1000,
        catch_up_missed: true,
        lease_secs: None,
    }
}

fn dispatch_loop(h: &Harness, config: SchedulerConfig) -> DispatchLoop {
    let clock: Arc<dyn Clock> = h.clock.clone();
    DispatchLoop::new(h.manager.clone(), clock, config)
}

fn periodic(h: &Harness, task_id: &str) -> PeriodicTask {
    h.manager.store().get_periodic(task_id).unwrap().unwrap()
}

#[tokio::test]
async fn fires_once_per_slot_and_advances() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    let dl = dispatch_loop(&h, config());

    h.clock.set(at(12, 4, 58));
    let report = dl.tick().await;
    assert_eq!(report.scanned, 1);
    assert_eq!(report.dispatched, 0);

    h.clock.set(at(12, 5, 0));
    assert_eq!(dl.tick().await.dispatched, 1);
    let record = periodic(&h, &created.task_id);
    assert_eq!(record.next_execution, Some(ts(at(12, 10, 0))));
    assert_eq!(record.last_run_at, Some(ts(at(12, 5, 0))));

    let sent = h.queue.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].executor, "dynamic.execute_code");
    assert_eq!(sent[0].kwargs["task_id"], json!(created.task_id));
    assert_eq!(sent[0].kwargs["task_name"], json!("t1"));

    h.clock.set(at(12, 5, 30));
    assert_eq!(dl.tick().await.dispatched, 0);
    assert_eq!(h.queue.sent().len(), 1);
}

#[tokio::test]
async fn early_dispatch_inside_tolerance_does_not_refire() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    let dl = dispatch_loop(&h, config());

    h.clock.set(at(12, 4, 59) + chrono::Duration::milliseconds(200));
    assert_eq!(dl.tick().await.dispatched, 1);
    assert_eq!(
        periodic(&h, &created.task_id).next_execution,
        Some(ts(at(12, 10, 0)))
    );

    h.clock.set(at(12, 5, 0));
    assert_eq!(dl.tick().await.dispatched, 0);
}

#[tokio::test]
async fn unset_next_execution_is_initialized_without_dispatch() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    let mut record = periodic(&h, &created.task_id);
    record.next_execution = None;
    h.manager.store().save_periodic(&record).unwrap();

    h.clock.set(at(12, 7, 0));
    let report = dispatch_loop(&h, config()).tick().await;
    assert_eq!(report.initialized, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(
        periodic(&h, &created.task_id).next_execution,
        Some(ts(at(12, 10, 0)))
    );
}

#[tokio::test]
async fn orphaned_record_is_skipped_and_kept() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    h.manager.store().delete_task(&created.task_id).unwrap();

    h.clock.set(at(12, 5, 0));
    let report = dispatch_loop(&h, config()).tick().await;
    assert_eq!(report.orphaned, 1);
    assert!(h.queue.sent().is_empty());
    assert!(h.manager.store().get_periodic(&created.task_id).unwrap().is_some());
}

#[tokio::test]
async fn bad_record_does_not_abort_the_scan() {
    let h = harness(at(12, 3, 0));
    h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    h.manager
        .store()
        .save_periodic(&PeriodicTask {
            task_id: "broken".into(),
            cron_expression: "not a cron".into(),
            backend_task_name: ExecutorKind::SandboxedCode,
            created_at: 0.0,
            last_run_at: None,
            next_execution: Some(0.0),
        })
        .unwrap();
    h.manager
        .store()
        .kv()
        .set("periodic_task:garbled", b"{not json")
        .unwrap();

    h.clock.set(at(12, 5, 0));
    let report = dispatch_loop(&h, config()).tick().await;
    assert_eq!(
        report,
        TickReport {
            scanned: 3,
            dispatched: 1,
            errors: 2,
            ..TickReport::default()
        }
    );
}

#[tokio::test]
async fn missed_fire_is_caught_up_once() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();

    h.clock.set(at(13, 1, 0));
    let dl = dispatch_loop(&h, config());
    assert_eq!(dl.tick().await.dispatched, 1);
    assert_eq!(h.queue.sent().len(), 1);
    assert_eq!(
        periodic(&h, &created.task_id).next_execution,
        Some(ts(at(13, 5, 0)))
    );
}

#[tokio::test]
async fn missed_fire_is_only_rescheduled_without_catch_up() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();

    h.clock.set(at(13, 1, 0));
    let report = dispatch_loop(
        &h,
        SchedulerConfig {
            catch_up_missed: false,
            ..config()
        },
    )
    .tick()
    .await;
    assert_eq!(report.rescheduled, 1);
    assert!(h.queue.sent().is_empty());
    let record = periodic(&h, &created.task_id);
    assert_eq!(record.next_execution, Some(ts(at(13, 5, 0))));
    assert_eq!(record.last_run_at, None);
}

#[tokio::test]
async fn queue_failure_keeps_the_slot_for_the_next_tick() {
    let h = harness(at(12, 3, 0));
    let created = h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    let dl = dispatch_loop(&h, config());

    h.queue.refuse(true);
    h.clock.set(at(12, 5, 0));
    assert_eq!(dl.tick().await.errors, 1);
    assert_eq!(
        periodic(&h, &created.task_id).next_execution,
        Some(ts(at(12, 5, 0)))
    );

    h.queue.refuse(false);
    h.clock.set(at(12, 6, 0));
    assert_eq!(dl.tick().await.dispatched, 1);
}

#[tokio::test]
async fn lease_keeps_a_second_instance_out() {
    let h = harness(at(12, 3, 0));
    h.manager.create(scheduled_request("*/5 * * * *")).await.unwrap();
    let leased = SchedulerConfig {
        lease_secs: Some(30),
        ..config()
    };
    let first = dispatch_loop(&h, leased.clone());
    let second = dispatch_loop(&h, leased);

    h.clock.set(at(12, 5, 0));
    assert_eq!(first.tick().await.dispatched, 1);
    assert!(second.tick().await.lease_skipped);

    h.clock.set(at(12, 5, 10));
    assert!(!first.tick().await.lease_skipped);

    h.clock.set(at(12, 6, 0));
    let report = second.tick().await;
    assert!(!report.lease_skipped);
    assert_eq!(report.scanned, 1);
    assert_eq!(h.queue.sent().len(), 1);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = harness(at(12, 3, 0));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(dispatch_loop(&h, config()).run(rx));
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
