//! Maintenance supervision
//!
//! Folds completion signals of submitted tasks into the per-kind history,
//! asks the schedule engine what is due and submits the due tasks. Tasks are
//! fire-and-forget: a pass never waits for one to finish, a later pass sees
//! its outcome through the task signals.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::controller::desired::DesiredState;
use crate::controller::observed::{ObservedState, TaskSignal, TaskState};
use crate::controller::platform::ClusterPlatform;
use crate::controller::schedule::due_actions;
use crate::crd::{Etcd, MaintenanceKind, MaintenanceRecord, TaskOutcome};

/// How long a freshly submitted task may be missing from the task listing
const MISSING_TASK_GRACE_SECONDS: i64 = 60;

/// What the maintenance step did in one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaintenanceReport {
    /// Updated history, one record per kind in `MaintenanceKind::ALL` order
    pub records: Vec<MaintenanceRecord>,
    /// Tasks submitted in this pass
    pub triggered: Vec<(MaintenanceKind, String)>,
    /// Tasks observed failing in this pass, with their failure message
    pub failed: Vec<(MaintenanceKind, String)>,
    /// Earliest future schedule boundary
    pub next_boundary: Option<DateTime<Utc>>,
    /// Kinds whose schedule cannot be evaluated
    pub invalid: BTreeMap<MaintenanceKind, String>,
}

impl MaintenanceReport {
    /// Some task is still running
    pub fn in_flight(&self) -> bool {
        self.records.iter().any(|r| r.in_flight.is_some())
    }
}

/// Update the record of `kind`, creating it on first use
fn touch<F>(records: &mut Vec<MaintenanceRecord>, kind: MaintenanceKind, update: F)
where
    F: FnOnce(&mut MaintenanceRecord),
{
    match records.iter_mut().find(|r| r.kind == kind) {
        Some(record) => update(record),
        None => {
            let mut record = MaintenanceRecord::new(kind);
            update(&mut record);
            records.push(record);
        }
    }
}

/// Apply task completion signals to the history
///
/// Returns the updated history and the tasks that failed since the last pass.
pub fn fold_signals(
    history: &[MaintenanceRecord],
    tasks: &[TaskSignal],
    now: DateTime<Utc>,
) -> (Vec<MaintenanceRecord>, Vec<(MaintenanceKind, String)>) {
    let mut records = history.to_vec();
    let mut failed = Vec::new();

    for record in &mut records {
        let Some(name) = record.in_flight.clone() else {
            continue;
        };

        match tasks.iter().find(|t| t.name == name) {
            Some(task) if task.state == TaskState::Running => {}
            Some(task) if task.state == TaskState::Succeeded => {
                record.in_flight = None;
                record.last_completed = Some(task.finished_at.unwrap_or(now));
                record.last_outcome = Some(TaskOutcome::Succeeded);
                record.last_message = None;
                info!(kind = %record.kind, task = %name, "maintenance task succeeded");
            }
            Some(task) => {
                let message = task
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("task {} failed", name));
                record.in_flight = None;
                record.last_completed = Some(task.finished_at.unwrap_or(now));
                record.last_outcome = Some(TaskOutcome::Failed);
                record.last_message = Some(message.clone());
                warn!(kind = %record.kind, task = %name, %message, "maintenance task failed");
                failed.push((record.kind, message));
            }
            None => {
                let fresh = record
                    .last_triggered
                    .is_some_and(|t| now - t < Duration::seconds(MISSING_TASK_GRACE_SECONDS));
                if fresh {
                    continue;
                }
                let message = format!("task {} no longer exists", name);
                record.in_flight = None;
                record.last_completed = Some(now);
                record.last_outcome = Some(TaskOutcome::Failed);
                record.last_message = Some(message.clone());
                warn!(kind = %record.kind, task = %name, "maintenance task disappeared");
                failed.push((record.kind, message));
            }
        }
    }

    (records, failed)
}

/// Run the maintenance step of a pass
///
/// With `allowed` unset (a structural write happened in this pass, or no
/// member is healthy) completion signals are still folded in, but nothing is
/// submitted and no boundary is consumed, so due kinds fire on a later pass.
/// A submission the platform rejects leaves its boundary unconsumed as well.
pub async fn run_maintenance<P>(
    platform: &P,
    etcd: &Etcd,
    desired: &DesiredState,
    observed: &ObservedState,
    history: &[MaintenanceRecord],
    allowed: bool,
    now: DateTime<Utc>,
) -> MaintenanceReport
where
    P: ClusterPlatform + ?Sized,
{
    let (mut records, failed) = fold_signals(history, &observed.tasks, now);
    let due = due_actions(
        now,
        &desired.schedules,
        &records,
        observed.delta_bytes,
        desired.creation_time,
    );

    let mut triggered = Vec::new();

    if allowed {
        for (kind, at) in &due.suppressed {
            debug!(%kind, boundary = %at, "maintenance suppressed, previous task still running");
            touch(&mut records, *kind, |record| record.last_scheduled = Some(*at));
        }

        for (kind, at) in &due.due {
            match platform.submit_task(etcd, desired, *kind, now).await {
                Ok(name) => {
                    touch(&mut records, *kind, |record| {
                        record.last_scheduled = Some(*at);
                        record.last_triggered = Some(now);
                        record.in_flight = Some(name.clone());
                    });
                    triggered.push((*kind, name));
                }
                Err(e) => {
                    warn!(%kind, error = %e, "failed to submit maintenance task");
                }
            }
        }
    } else if !due.is_empty() {
        debug!(due = due.due.len(), "maintenance deferred to a later pass");
    }

    records.sort_by_key(|r| r.kind);

    MaintenanceReport {
        records,
        triggered,
        failed,
        next_boundary: due.next_boundary,
        invalid: due.invalid,
    }
}
