use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskmill_core::config::SchedulerConfig;
use taskmill_core::time::{from_timestamp, to_timestamp};
use taskmill_core::{Clock, TaskStatus};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::manager::TaskManager;
use crate::schedule::CronSchedule;

/// Store key of the dispatch lease.
pub const LEASE_KEY: &str = "dispatch_lease";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    holder: String,
    expires_at: f64,
}

/// What happened to one periodic record during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// `next_execution` was unset and has now been computed.
    Initialized,
    NotDue,
    Dispatched,
    /// Missed by more than a tick with catch-up disabled: moved forward only.
    Rescheduled,
    /// The owning task is gone or stopped; left for the deletion path.
    Orphaned,
}

/// Counters for one pass over the periodic records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub initialized: usize,
    pub dispatched: usize,
    pub rescheduled: usize,
    pub orphaned: usize,
    pub errors: usize,
    /// Another instance held the lease, so nothing was scanned.
    pub lease_skipped: bool,
}

/// Periodic dispatch: scans every [`PeriodicTask`](taskmill_core::PeriodicTask)
/// each tick and pushes the due ones onto the work queue.
///
/// Meant to run as a single instance. With `lease_secs` configured, each tick
/// first takes a store-backed lease so overlapping instances mostly stay out
/// of each other's way; delivery remains at-least-once either way.
pub struct DispatchLoop {
    manager: Arc<TaskManager>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    holder: String,
}

impl DispatchLoop {
    pub fn new(manager: Arc<TaskManager>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            manager,
            clock,
            config,
            holder: Uuid::new_v4().to_string(),
        }
    }

    /// Main loop. Ticks every `tick_secs` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.config.tick_secs, "dispatch loop started");
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.dispatched > 0 || report.errors > 0 {
                        info!(
                            scanned = report.scanned,
                            dispatched = report.dispatched,
                            errors = report.errors,
                            "dispatch tick"
                        );
                    } else {
                        debug!(scanned = report.scanned, "dispatch tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatch loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every periodic record. Per-record failures are logged
    /// and counted; they never stop the scan.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        if let Some(lease_secs) = self.config.lease_secs {
            match self.acquire_lease(now, lease_secs) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("dispatch lease held elsewhere; skipping tick");
                    report.lease_skipped = true;
                    return report;
                }
                Err(e) => {
                    error!(error = %e, "dispatch lease unavailable; skipping tick");
                    report.lease_skipped = true;
                    return report;
                }
            }
        }

        let keys = match self.manager.store().periodic_keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "periodic scan failed");
                report.errors += 1;
                return report;
            }
        };

        for key in keys {
            report.scanned += 1;
            match self.process(&key, now).await {
                Ok(Some(Outcome::Initialized)) => report.initialized += 1,
                Ok(Some(Outcome::Dispatched)) => report.dispatched += 1,
                Ok(Some(Outcome::Rescheduled)) => report.rescheduled += 1,
                Ok(Some(Outcome::Orphaned)) => report.orphaned += 1,
                Ok(Some(Outcome::NotDue)) | Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(key = %key, error = %e, "periodic record not processed");
                }
            }
        }
        report
    }

    /// Returns `None` when the record vanished between scan and read.
    async fn process(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Outcome>> {
        let store = self.manager.store();
        let Some(mut periodic) = store.get_periodic_by_key(key)? else {
            return Ok(None);
        };
        let schedule = CronSchedule::parse(&periodic.cron_expression)?;

        let Some(next_ts) = periodic.next_execution else {
            let next = schedule.next_after(now)?;
            periodic.next_execution = Some(to_timestamp(next));
            store.save_periodic(&periodic)?;
            debug!(task_id = %periodic.task_id, next = %next, "next execution initialized");
            return Ok(Some(Outcome::Initialized));
        };
        let next = from_timestamp(next_ts).ok_or_else(|| {
            TaskError::Validation(format!("invalid next_execution: {next_ts}"))
        })?;

        let tolerance = chrono::Duration::from_std(self.config.tolerance())
            .unwrap_or_else(|_| chrono::Duration::zero());
        if now + tolerance < next {
            return Ok(Some(Outcome::NotDue));
        }

        let task = match store.get_task(&periodic.task_id)? {
            Some(task) if task.status != TaskStatus::Stopped => task,
            _ => {
                debug!(task_id = %periodic.task_id, "owning task gone or stopped; skipping");
                return Ok(Some(Outcome::Orphaned));
            }
        };

        let tick = chrono::Duration::from_std(self.config.tick())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let missed = now - next > tick;
        let outcome = if missed && !self.config.catch_up_missed {
            info!(task_id = %task.id, scheduled_for = %next, "missed fire skipped");
            Outcome::Rescheduled
        } else {
            if missed {
                info!(task_id = %task.id, scheduled_for = %next, "catching up missed fire");
            }
            self.manager.dispatch(&task).await?;
            periodic.last_run_at = Some(to_timestamp(now));
            Outcome::Dispatched
        };

        // Strictly after the slot just handled, so an early dispatch inside
        // the tolerance window cannot fire the same slot again.
        let following = schedule.next_after(now.max(next))?;
        periodic.next_execution = Some(to_timestamp(following));

        // A delete that landed after the read must not be undone by this write.
        if store.get_periodic(&periodic.task_id)?.is_none() {
            debug!(task_id = %periodic.task_id, "periodic record removed during dispatch");
            return Ok(Some(outcome));
        }
        store.save_periodic(&periodic)?;
        debug!(task_id = %periodic.task_id, cron = %periodic.cron_expression, next = %following, "next execution scheduled");
        Ok(Some(outcome))
    }

    /// Best-effort mutual exclusion between instances sharing a store.
    fn acquire_lease(&self, now: DateTime<Utc>, lease_secs: u64) -> Result<bool> {
        let kv = self.manager.store().kv();
        let now_ts = to_timestamp(now);
        if let Some(bytes) = kv.get(LEASE_KEY)? {
            if let Ok(current) = serde_json::from_slice::<Lease>(&bytes) {
                if current.holder != self.holder && current.expires_at > now_ts {
                    return Ok(false);
                }
            }
        }
        let lease = Lease {
            holder: self.holder.clone(),
            expires_at: now_ts + lease_secs as f64,
        };
        let bytes = serde_json::to_vec(&lease)
            .map_err(|e| TaskError::Validation(format!("lease encoding failed: {e}")))?;
        kv.set(LEASE_KEY, &bytes)?;

        // Read back: a competing writer in the same window wins if its write
        // landed last.
        let held = kv
            .get(LEASE_KEY)?
            .and_then(|b| serde_json::from_slice::<Lease>(&b).ok())
            .is_some_and(|l| l.holder == self.holder);
        Ok(held)
    }
}
