//! Status and conditions management for Etcd resources
//!
//! The aggregator recomputes the whole status from the previous status, the
//! desired and observed state, and what the pass did. It never masks a
//! transient divergence between desired and materialized members, and
//! condition transition times only move when a condition's status changes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controller::desired::DesiredState;
use crate::controller::error::Error;
use crate::controller::maintenance::MaintenanceReport;
use crate::controller::members::{ConvergenceAction, WaitReason};
use crate::controller::observed::ObservedState;
use crate::controller::operation::{
    OperationEvent, OperationStateMachine, OperationUpdate, TransitionContext, event_for_action,
    event_for_error, operation_type,
};
use crate::crd::{
    Condition, ConditionStatus, ConditionType, EtcdStatus, LastOperation, MemberEndpoint,
    MemberHealth, ObjectReference, OperationState, OperationType, RolloutProgress, TaskOutcome,
};
use crate::resources::common::{backup_name, quorum};

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    now: DateTime<Utc>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: &[Condition], now: DateTime<Utc>) -> Self {
        Self {
            conditions: existing.to_vec(),
            now,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only changes with the status; the update time
    /// always moves to `now`.
    pub fn set_condition(
        mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        let now = self.now;

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.last_update_time = now;
        } else {
            self.conditions.push(Condition {
                type_,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                last_update_time: now,
            });
        }
        self
    }

    pub fn available(self, status: ConditionStatus, reason: &str, message: &str) -> Self {
        self.set_condition(ConditionType::Available, status, reason, message)
    }

    pub fn progressing(self, status: ConditionStatus, reason: &str, message: &str) -> Self {
        self.set_condition(ConditionType::Progressing, status, reason, message)
    }

    pub fn backup_ready(self, status: ConditionStatus, reason: &str, message: &str) -> Self {
        self.set_condition(ConditionType::BackupReady, status, reason, message)
    }

    /// Build the conditions list in type order
    pub fn build(mut self) -> Vec<Condition> {
        self.conditions.sort_by_key(|c| c.type_);
        self.conditions
    }
}

/// What a pass did, as far as status is concerned
#[derive(Debug, Default)]
pub struct PassOutcome<'a> {
    /// Planned action, absent when planning failed
    pub action: Option<&'a ConvergenceAction>,
    pub error: Option<&'a Error>,
    pub maintenance: Option<&'a MaintenanceReport>,
    pub rollout: Option<RolloutProgress>,
    pub retained_claims: Vec<String>,
}

/// Recomputes status after each pass
#[derive(Clone, Debug)]
pub struct StatusAggregator {
    /// How long a member may be unhealthy before Available turns False
    pub unhealthy_grace: Duration,
}

impl StatusAggregator {
    pub fn new(unhealthy_grace: Duration) -> Self {
        Self { unhealthy_grace }
    }

    /// Compute the status after a pass
    pub fn recompute(
        &self,
        previous: &EtcdStatus,
        desired: &DesiredState,
        observed: &ObservedState,
        outcome: &PassOutcome<'_>,
        now: DateTime<Utc>,
    ) -> EtcdStatus {
        let endpoints = endpoints(previous, desired, observed, now);
        let workload = observed.workload.as_ref();
        let history = outcome
            .maintenance
            .map(|r| r.records.clone())
            .unwrap_or_else(|| previous.maintenance.clone());

        let (available, available_reason, available_message) =
            self.availability(observed, &endpoints, now);
        let (progressing, progressing_reason, progressing_message) =
            progressing(previous, outcome);
        let (backup, backup_reason, backup_message) = backup_readiness(desired, &history);

        let conditions = ConditionBuilder::from_existing(&previous.conditions, now)
            .available(available, available_reason, &available_message)
            .progressing(progressing, progressing_reason, &progressing_message)
            .backup_ready(backup, backup_reason, &backup_message)
            .build();

        let ready_replicas = observed.healthy();
        let converged = outcome.error.is_none()
            && matches!(outcome.action, Some(ConvergenceAction::NoOp));

        let last_error = if let Some(error) = outcome.error {
            Some(error.to_string())
        } else if let Some((kind, message)) = outcome.maintenance.and_then(|r| r.failed.first()) {
            Some(
                Error::MaintenanceTaskFailed {
                    kind: *kind,
                    message: message.clone(),
                }
                .to_string(),
            )
        } else if converged {
            None
        } else {
            previous.last_error.clone()
        };

        EtcdStatus {
            etcd_ref: workload
                .map(|w| ObjectReference {
                    api_version: "apps/v1".to_string(),
                    kind: "StatefulSet".to_string(),
                    name: w.name.clone(),
                })
                .or_else(|| previous.etcd_ref.clone()),
            backup_ref: desired.backup_enabled.then(|| ObjectReference {
                api_version: "batch/v1".to_string(),
                kind: "Job".to_string(),
                name: backup_name(&desired.name),
            }),
            ready: available == ConditionStatus::True,
            conditions,
            replicas: observed.materialized(),
            ready_replicas,
            current_replicas: workload.map(|w| w.current_replicas).unwrap_or(0),
            updated_replicas: workload.map(|w| w.updated_replicas).unwrap_or(0),
            current_revision: workload.and_then(|w| w.current_revision.clone()),
            updated_revision: workload.and_then(|w| w.update_revision.clone()),
            endpoints,
            last_operation: last_operation(previous, desired, observed, outcome, now),
            last_error,
            observed_generation: if converged {
                Some(
                    previous
                        .observed_generation
                        .map_or(desired.generation, |g| g.max(desired.generation)),
                )
            } else {
                previous.observed_generation
            },
            failed_generation: match outcome.error {
                Some(Error::FatalSpec(_)) => Some(desired.generation),
                _ => None,
            },
            maintenance: history,
            rollout: outcome.rollout.clone(),
            retained_claims: outcome.retained_claims.clone(),
            cluster_id: observed
                .membership
                .as_ref()
                .and_then(|m| m.cluster_id.clone())
                .or_else(|| previous.cluster_id.clone()),
        }
    }

    /// Status after a pass that failed before the desired state was known
    pub fn record_failure(
        &self,
        previous: &EtcdStatus,
        generation: i64,
        error: &Error,
        now: DateTime<Utc>,
    ) -> EtcdStatus {
        let fatal = matches!(error, Error::FatalSpec(_) | Error::ValidationError(_));
        let mut status = previous.clone();

        let mut builder = ConditionBuilder::from_existing(&previous.conditions, now);
        if fatal {
            builder = builder.progressing(ConditionStatus::False, "SpecInvalid", &error.to_string());
        }
        status.conditions = builder.build();

        let type_ = previous
            .last_operation
            .as_ref()
            .map(|op| op.type_)
            .unwrap_or(OperationType::Create);
        let update = OperationUpdate {
            type_,
            event: event_for_error(error),
            description: error.to_string(),
            progress: previous.last_operation.as_ref().map_or(0, |op| op.progress),
        };
        let machine = OperationStateMachine::new();
        let ctx = TransitionContext {
            generation_changed: previous.failed_generation != Some(generation),
            ..Default::default()
        };
        let current = spec_corrected(&machine, previous, generation, now);
        status.last_operation = machine
            .advance(current.as_ref(), update, &ctx, now)
            .or(current);

        status.last_error = Some(error.to_string());
        status.failed_generation = fatal.then_some(generation);
        status
    }

    /// Status at the start of teardown
    pub fn record_deletion(&self, previous: &EtcdStatus, now: DateTime<Utc>) -> EtcdStatus {
        let mut status = previous.clone();
        let action = ConvergenceAction::Delete;

        status.conditions = ConditionBuilder::from_existing(&previous.conditions, now)
            .progressing(ConditionStatus::True, "Deleting", &action.to_string())
            .build();

        let update = OperationUpdate {
            type_: OperationType::Delete,
            event: event_for_action(&action),
            description: action.to_string(),
            progress: 0,
        };
        status.last_operation = OperationStateMachine::new()
            .advance(
                previous.last_operation.as_ref(),
                update,
                &TransitionContext::default(),
                now,
            )
            .or_else(|| previous.last_operation.clone());
        status
    }

    fn availability(
        &self,
        observed: &ObservedState,
        endpoints: &[MemberEndpoint],
        now: DateTime<Utc>,
    ) -> (ConditionStatus, &'static str, String) {
        let Some(workload) = observed.workload.as_ref() else {
            return (
                ConditionStatus::Unknown,
                "WorkloadMissing",
                "member workload does not exist".to_string(),
            );
        };

        let voting = workload.replicas;
        let in_range: Vec<&MemberEndpoint> =
            endpoints.iter().filter(|e| e.ordinal < voting).collect();
        let healthy = i32::try_from(
            in_range
                .iter()
                .filter(|e| e.health == MemberHealth::Healthy)
                .count(),
        )
        .unwrap_or(i32::MAX);
        let needed = quorum(voting);

        if voting == 0 || healthy < needed {
            return (
                ConditionStatus::False,
                "QuorumLost",
                format!("{}/{} members healthy, quorum needs {}", healthy, voting, needed),
            );
        }

        let grace = chrono::Duration::from_std(self.unhealthy_grace)
            .unwrap_or(chrono::Duration::MAX);
        let mut unhealthy = in_range
            .iter()
            .filter(|e| e.health != MemberHealth::Healthy)
            .peekable();

        if unhealthy.peek().is_none() {
            return (
                ConditionStatus::True,
                "QuorumHealthy",
                format!("{}/{} members healthy", healthy, voting),
            );
        }

        let persistent: Vec<&str> = unhealthy
            .filter(|e| e.unhealthy_since.is_some_and(|since| now - since > grace))
            .map(|e| e.name.as_str())
            .collect();

        if persistent.is_empty() {
            (
                ConditionStatus::Progressing,
                "MemberUnhealthy",
                format!("{}/{} members healthy, waiting for the rest", healthy, voting),
            )
        } else {
            (
                ConditionStatus::False,
                "MemberUnhealthy",
                format!(
                    "members unhealthy for more than {}s: {}",
                    self.unhealthy_grace.as_secs(),
                    persistent.join(", ")
                ),
            )
        }
    }
}

fn endpoints(
    previous: &EtcdStatus,
    desired: &DesiredState,
    observed: &ObservedState,
    now: DateTime<Utc>,
) -> Vec<MemberEndpoint> {
    observed
        .members
        .iter()
        .map(|member| {
            let unhealthy_since = if member.health == MemberHealth::Healthy {
                None
            } else {
                previous
                    .endpoints
                    .iter()
                    .find(|e| e.ordinal == member.ordinal)
                    .and_then(|e| e.unhealthy_since)
                    .or(Some(now))
            };

            MemberEndpoint {
                name: member.name.clone(),
                ordinal: member.ordinal,
                port: desired.client_port,
                health: member.health,
                leader: observed.leader == Some(member.ordinal),
                unhealthy_since,
            }
        })
        .collect()
}

fn progressing(
    previous: &EtcdStatus,
    outcome: &PassOutcome<'_>,
) -> (ConditionStatus, &'static str, String) {
    let previous_status = previous
        .condition(ConditionType::Progressing)
        .map(|c| c.status)
        .unwrap_or(ConditionStatus::Unknown);

    if let Some(error) = outcome.error {
        let message = error.to_string();
        return match error {
            Error::RolloutStalled(_) => (ConditionStatus::False, "RolloutStalled", message),
            Error::QuorumSafetyViolation(_) => {
                (ConditionStatus::False, "ScaleDownRefused", message)
            }
            Error::FatalSpec(_) | Error::ValidationError(_) => {
                (ConditionStatus::False, "SpecInvalid", message)
            }
            e if e.is_transient() => (previous_status, "TransientError", message),
            _ => (ConditionStatus::False, "ReconcileError", message),
        };
    }

    let Some(action) = outcome.action else {
        return (previous_status, "Unknown", "no action planned".to_string());
    };

    let reason = match action {
        ConvergenceAction::NoOp => {
            return (ConditionStatus::False, "Converged", action.to_string());
        }
        ConvergenceAction::Create { .. } => "Creating",
        ConvergenceAction::ScaleUp { .. }
        | ConvergenceAction::PromoteLearner { .. }
        | ConvergenceAction::Wait {
            reason: WaitReason::MemberJoining { .. },
        } => "ScalingUp",
        ConvergenceAction::ScaleDown { .. } | ConvergenceAction::RemoveStale { .. } => "ScalingDown",
        ConvergenceAction::UpdateSpec { .. }
        | ConvergenceAction::Wait {
            reason: WaitReason::RolloutStep { .. },
        } => "RollingUpdate",
        ConvergenceAction::Delete => "Deleting",
        ConvergenceAction::Wait { .. } => "Waiting",
    };

    (ConditionStatus::True, reason, action.to_string())
}

fn backup_readiness(
    desired: &DesiredState,
    history: &[crate::crd::MaintenanceRecord],
) -> (ConditionStatus, &'static str, String) {
    if !desired.schedules.any_configured() {
        return (
            ConditionStatus::Unknown,
            "NotConfigured",
            "no maintenance schedule configured".to_string(),
        );
    }

    let invalid = desired.schedules.invalid();
    if !invalid.is_empty() {
        let message = invalid
            .iter()
            .map(|(kind, reason)| format!("{}: {}", kind, reason))
            .collect::<Vec<_>>()
            .join("; ");
        return (ConditionStatus::False, "ScheduleConfigInvalid", message);
    }

    let failures: Vec<String> = history
        .iter()
        .filter(|r| r.last_outcome == Some(TaskOutcome::Failed))
        .map(|r| {
            format!(
                "{}: {}",
                r.kind,
                r.last_message.as_deref().unwrap_or("task failed")
            )
        })
        .collect();
    if !failures.is_empty() {
        return (
            ConditionStatus::False,
            "MaintenanceTaskFailed",
            failures.join("; "),
        );
    }

    (
        ConditionStatus::True,
        "SchedulesValid",
        "maintenance schedules are valid".to_string(),
    )
}

/// Leave `Failed` first when the generation that failed has been replaced
fn spec_corrected(
    machine: &OperationStateMachine,
    previous: &EtcdStatus,
    generation: i64,
    now: DateTime<Utc>,
) -> Option<LastOperation> {
    let current = previous.last_operation.clone();
    let Some(op) = current.as_ref() else {
        return current;
    };
    if op.state != OperationState::Failed || previous.failed_generation == Some(generation) {
        return current;
    }

    let ctx = TransitionContext {
        generation_changed: true,
        ..Default::default()
    };
    let update = OperationUpdate {
        type_: op.type_,
        event: OperationEvent::SpecCorrected,
        description: "spec corrected, retrying".to_string(),
        progress: 0,
    };
    machine.advance(Some(op), update, &ctx, now).or(current)
}

fn progress(action: &ConvergenceAction, desired: &DesiredState, observed: &ObservedState) -> u8 {
    let percent = |done: i32, total: i32| -> u8 {
        if total <= 0 {
            return 0;
        }
        u8::try_from((done.clamp(0, total) * 100) / total).unwrap_or(100)
    };

    match action {
        ConvergenceAction::NoOp => 100,
        ConvergenceAction::Create { .. } | ConvergenceAction::Delete => 0,
        ConvergenceAction::UpdateSpec { .. }
        | ConvergenceAction::Wait {
            reason: WaitReason::RolloutStep { .. },
        } => {
            let workload = observed.workload.as_ref();
            percent(
                workload.map_or(0, |w| w.updated_replicas),
                workload.map_or(0, |w| w.replicas),
            )
        }
        _ => percent(observed.healthy(), desired.replicas),
    }
}

fn last_operation(
    previous: &EtcdStatus,
    desired: &DesiredState,
    observed: &ObservedState,
    outcome: &PassOutcome<'_>,
    now: DateTime<Utc>,
) -> Option<LastOperation> {
    let machine = OperationStateMachine::new();
    let mut current = spec_corrected(&machine, previous, desired.generation, now);

    let previous_progress = current.as_ref().map_or(0, |op| op.progress);
    let report = outcome.maintenance;

    let (event, description, progress) = if let Some(error) = outcome.error {
        (event_for_error(error), error.to_string(), previous_progress)
    } else if let Some((kind, message)) = report.and_then(|r| r.failed.first()) {
        let error = Error::MaintenanceTaskFailed {
            kind: *kind,
            message: message.clone(),
        };
        (OperationEvent::ActionError, error.to_string(), previous_progress)
    } else if let Some(action) = outcome.action {
        let maintenance_running = report.is_some_and(|r| r.in_flight());
        match action {
            ConvergenceAction::NoOp if maintenance_running => {
                let kinds = report
                    .map(|r| {
                        r.records
                            .iter()
                            .filter(|rec| rec.in_flight.is_some())
                            .map(|rec| rec.kind.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                (
                    OperationEvent::MaintenanceTriggered,
                    format!("maintenance running: {}", kinds),
                    100,
                )
            }
            _ => (
                event_for_action(action),
                action.to_string(),
                progress(action, desired, observed),
            ),
        }
    } else {
        return current;
    };

    // The type is fixed when work starts: a finished create stays a create
    // while the cluster idles, and the next action opens a reconcile
    let creating = matches!(outcome.action, Some(ConvergenceAction::Create { .. }))
        || current.as_ref().is_some_and(|op| {
            op.type_ == OperationType::Create
                && (op.state != OperationState::Succeeded || event == OperationEvent::Converged)
        });
    let type_ = operation_type(desired.deleting, creating);

    let ctx = TransitionContext {
        generation_changed: previous.failed_generation != Some(desired.generation),
        ready_replicas: observed.healthy(),
        desired_replicas: desired.replicas,
    };

    // A template change replacing a rollout still in progress aborts it first
    let replaces_rollout = matches!(
        outcome.action,
        Some(ConvergenceAction::UpdateSpec { fields, .. }) if !fields.is_empty()
    ) && previous.rollout.is_some()
        && current
            .as_ref()
            .is_some_and(|op| op.state == OperationState::Processing);
    if replaces_rollout && outcome.error.is_none() {
        let update = OperationUpdate {
            type_,
            event: OperationEvent::Superseded,
            description: "rollout replaced by a newer spec".to_string(),
            progress: 0,
        };
        current = machine.advance(current.as_ref(), update, &ctx, now).or(current);
    }

    let update = OperationUpdate {
        type_,
        event,
        description,
        progress,
    };
    machine.advance(current.as_ref(), update, &ctx, now).or(current)
}

/// Whether `next` differs from `previous` enough to be written
///
/// Condition update times alone do not count, except that an otherwise
/// unchanged status is still refreshed once per `resync` as a heartbeat.
pub fn needs_write(
    previous: Option<&EtcdStatus>,
    next: &EtcdStatus,
    now: DateTime<Utc>,
    resync: Duration,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    if without_update_times(previous) != without_update_times(next) {
        return true;
    }

    let resync = chrono::Duration::from_std(resync).unwrap_or(chrono::Duration::MAX);
    previous
        .conditions
        .iter()
        .map(|c| c.last_update_time)
        .min()
        .is_some_and(|oldest| now - oldest >= resync)
}

fn without_update_times(status: &EtcdStatus) -> EtcdStatus {
    let mut status = status.clone();
    for condition in &mut status.conditions {
        condition.last_update_time = DateTime::<Utc>::UNIX_EPOCH;
    }
    status
}
