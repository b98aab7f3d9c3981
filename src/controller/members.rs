//! Member-set convergence planning
//!
//! Computes the single next step that moves the member set toward the desired
//! state without risking quorum. The planner is pure: it reads desired and
//! observed state and never talks to the platform.
//!
//! Ordering rules:
//! - members are added one at a time, and only when every existing member is
//!   healthy, so at most one member is ever joining;
//! - a new member is registered as a learner before its pod starts and is
//!   promoted to a voter once healthy; nothing else moves while it catches up;
//! - members still registered beyond the workload are unregistered first;
//! - at most `floor((V-1)/2)` members are removed per step (one for V=2),
//!   highest ordinals first, and never leaving fewer healthy members than the
//!   quorum of the remaining size;
//! - template changes roll one member at a time, highest ordinal first, by
//!   lowering the workload's rolling-update partition;
//! - pending scale changes take precedence over template rollouts.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::controller::desired::DesiredState;
use crate::controller::error::{Error, Result};
use crate::controller::observed::{ObservedState, WorkloadState};
use crate::crd::{MemberHealth, RolloutProgress, SpecField};
use crate::resources::common::quorum;

/// Why a pass makes no structural change while not yet converged
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// The platform has not observed the latest workload write yet
    WorkloadSyncing,
    /// Some members are not healthy
    MembersNotReady { healthy: i32, expected: i32 },
    /// A rolled member has not come back healthy yet
    RolloutStep { ordinal: i32 },
    /// A learner has not caught up with the leader yet
    MemberJoining { ordinal: i32 },
    /// No member answered the member list request
    MembershipUnknown,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::WorkloadSyncing => write!(f, "waiting for the workload to sync"),
            WaitReason::MembersNotReady { healthy, expected } => {
                write!(f, "waiting for members: {}/{} healthy", healthy, expected)
            }
            WaitReason::RolloutStep { ordinal } => {
                write!(f, "waiting for member {} to become healthy on the new revision", ordinal)
            }
            WaitReason::MemberJoining { ordinal } => {
                write!(f, "waiting for learner {} to catch up", ordinal)
            }
            WaitReason::MembershipUnknown => write!(f, "waiting for the member list"),
        }
    }
}

/// The next convergence step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConvergenceAction {
    /// Fully converged
    NoOp,
    /// Create the workload with a single bootstrap member
    Create { replicas: i32 },
    /// Register member `to - 1` as a learner and start its pod
    ScaleUp { by: i32, to: i32 },
    /// Unregister the highest members and stop their pods
    ScaleDown { by: i32, to: i32, removing: Vec<i32> },
    /// Turn a caught-up learner into a voter
    PromoteLearner { ordinal: i32 },
    /// Unregister members without a pod in the workload, highest first
    RemoveStale { ordinals: Vec<i32> },
    /// Write the member template (when `fields` is non-empty) or lower the
    /// rolling-update partition to roll the next member
    UpdateSpec { fields: Vec<SpecField>, partition: i32 },
    /// Tear down the cluster
    Delete,
    Wait { reason: WaitReason },
}

impl ConvergenceAction {
    /// Whether applying the action writes to the workload or its volumes
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ConvergenceAction::Create { .. }
                | ConvergenceAction::ScaleUp { .. }
                | ConvergenceAction::ScaleDown { .. }
                | ConvergenceAction::PromoteLearner { .. }
                | ConvergenceAction::RemoveStale { .. }
                | ConvergenceAction::UpdateSpec { .. }
                | ConvergenceAction::Delete
        )
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ConvergenceAction::NoOp => "noop",
            ConvergenceAction::Create { .. } => "create",
            ConvergenceAction::ScaleUp { .. } => "scale_up",
            ConvergenceAction::ScaleDown { .. } => "scale_down",
            ConvergenceAction::PromoteLearner { .. } => "promote_learner",
            ConvergenceAction::RemoveStale { .. } => "remove_stale",
            ConvergenceAction::UpdateSpec { .. } => "update_spec",
            ConvergenceAction::Delete => "delete",
            ConvergenceAction::Wait { .. } => "wait",
        }
    }
}

impl fmt::Display for ConvergenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceAction::NoOp => write!(f, "cluster converged"),
            ConvergenceAction::Create { replicas } => {
                write!(f, "creating workload with {} member", replicas)
            }
            ConvergenceAction::ScaleUp { by, to } => {
                write!(f, "adding {} member (target {})", by, to)
            }
            ConvergenceAction::ScaleDown { by, to, removing } => {
                write!(f, "removing {} members {:?} (target {})", by, removing, to)
            }
            ConvergenceAction::PromoteLearner { ordinal } => {
                write!(f, "promoting learner {} to voter", ordinal)
            }
            ConvergenceAction::RemoveStale { ordinals } => {
                write!(f, "unregistering members {:?} outside the workload", ordinals)
            }
            ConvergenceAction::UpdateSpec { fields, partition } if fields.is_empty() => {
                write!(f, "rolling update: advancing partition to {}", partition)
            }
            ConvergenceAction::UpdateSpec { fields, partition } => {
                write!(
                    f,
                    "rolling update of {:?} starting at partition {}",
                    fields, partition
                )
            }
            ConvergenceAction::Delete => write!(f, "deleting cluster"),
            ConvergenceAction::Wait { reason } => write!(f, "{}", reason),
        }
    }
}

/// Plans member-set changes
#[derive(Clone, Debug)]
pub struct MemberSetManager {
    /// How long one rolled member may take to become healthy
    pub member_ready_timeout: Duration,
}

impl MemberSetManager {
    pub fn new(member_ready_timeout: Duration) -> Self {
        Self {
            member_ready_timeout,
        }
    }

    /// Compute the next convergence step
    ///
    /// Refused scale-downs surface as `QuorumSafetyViolation` and stalled
    /// rollouts as `RolloutStalled`; both are decided before any write.
    pub fn plan(
        &self,
        desired: &DesiredState,
        observed: &ObservedState,
        rollout: Option<&RolloutProgress>,
        now: DateTime<Utc>,
    ) -> Result<ConvergenceAction> {
        if desired.deleting {
            return Ok(ConvergenceAction::Delete);
        }

        let Some(workload) = observed.workload.as_ref() else {
            return Ok(ConvergenceAction::Create { replicas: 1 });
        };

        if workload.is_syncing() {
            return Ok(ConvergenceAction::Wait {
                reason: WaitReason::WorkloadSyncing,
            });
        }

        let voting = workload.replicas;

        if let Some(membership) = observed.membership.as_ref() {
            // A learner registered for the next ordinal is a join whose scale
            // write has not landed yet
            let joining = Some(voting)
                .filter(|_| desired.replicas > voting)
                .filter(|o| membership.member(*o).is_some_and(|m| m.learner));
            let stale = membership.beyond(voting, joining);
            if !stale.is_empty() {
                return Ok(ConvergenceAction::RemoveStale { ordinals: stale });
            }

            if let Some(ordinal) = membership.pending_learner(voting) {
                let caught_up = observed
                    .member(ordinal)
                    .is_some_and(|m| m.health == MemberHealth::Healthy);
                if caught_up {
                    return Ok(ConvergenceAction::PromoteLearner { ordinal });
                }
                // A shrink may drop the learner instead of waiting for it
                if desired.replicas >= voting {
                    return Ok(ConvergenceAction::Wait {
                        reason: WaitReason::MemberJoining { ordinal },
                    });
                }
            }
        }

        if desired.replicas < voting {
            return plan_scale_down(desired.replicas, voting, observed);
        }

        let healthy = healthy_below(observed, voting);
        if desired.replicas > voting {
            if healthy == voting {
                if observed.membership.is_none() {
                    return Ok(ConvergenceAction::Wait {
                        reason: WaitReason::MembershipUnknown,
                    });
                }
                return Ok(ConvergenceAction::ScaleUp {
                    by: 1,
                    to: voting + 1,
                });
            }
            debug!(
                healthy,
                voting, "scale-up blocked until every member is healthy"
            );
        }

        let rollout_action = self.plan_rollout(desired, observed, workload, rollout, now)?;
        if let Some(action) = rollout_action {
            return Ok(action);
        }

        if healthy < voting || observed.materialized() < voting {
            return Ok(ConvergenceAction::Wait {
                reason: WaitReason::MembersNotReady {
                    healthy,
                    expected: desired.replicas,
                },
            });
        }

        Ok(ConvergenceAction::NoOp)
    }

    fn plan_rollout(
        &self,
        desired: &DesiredState,
        observed: &ObservedState,
        workload: &WorkloadState,
        rollout: Option<&RolloutProgress>,
        now: DateTime<Utc>,
    ) -> Result<Option<ConvergenceAction>> {
        let voting = workload.replicas;

        let fields = desired.fingerprint.diff(workload.fingerprint.as_ref());
        if !fields.is_empty() {
            let partition = (voting - 1).max(0);
            if !can_restart(observed, voting, partition) {
                return Ok(Some(ConvergenceAction::Wait {
                    reason: WaitReason::MembersNotReady {
                        healthy: healthy_below(observed, voting),
                        expected: voting,
                    },
                }));
            }
            return Ok(Some(ConvergenceAction::UpdateSpec {
                fields: fields.into_iter().collect(),
                partition,
            }));
        }

        let Some(update_revision) = workload.update_revision.as_deref() else {
            return Ok(None);
        };

        let outdated = |ordinal: i32| {
            observed
                .member(ordinal)
                .is_none_or(|m| m.revision.as_deref() != Some(update_revision))
        };
        let settled = |ordinal: i32| {
            !outdated(ordinal)
                && observed
                    .member(ordinal)
                    .is_some_and(|m| m.health == MemberHealth::Healthy)
        };

        let partition = workload.partition.clamp(0, voting);
        let all_updated = (0..voting).all(|o| !outdated(o));
        let rolling = workload.current_revision.as_deref() != Some(update_revision);
        if (all_updated || !rolling) && rollout.is_none() {
            return Ok(None);
        }

        // Members in the rolled range must be back before the next step
        if let Some(waiting) = (partition..voting).rev().find(|o| !settled(*o)) {
            if let Some(progress) = rollout {
                let waited = now - progress.step_started_at;
                let timeout = chrono::Duration::from_std(self.member_ready_timeout)
                    .unwrap_or(chrono::Duration::MAX);
                if waited > timeout {
                    return Err(Error::RolloutStalled(format!(
                        "member {} did not become healthy on revision {} within {}s",
                        waiting,
                        update_revision,
                        self.member_ready_timeout.as_secs()
                    )));
                }
            }
            return Ok(Some(ConvergenceAction::Wait {
                reason: WaitReason::RolloutStep { ordinal: waiting },
            }));
        }

        if partition == 0 || all_updated {
            // Rolled range covers every member, or the rest already matches
            if partition > 0 {
                return Ok(Some(ConvergenceAction::UpdateSpec {
                    fields: Vec::new(),
                    partition: 0,
                }));
            }
            return Ok(None);
        }

        let next = partition - 1;
        if !can_restart(observed, voting, next) {
            return Ok(Some(ConvergenceAction::Wait {
                reason: WaitReason::MembersNotReady {
                    healthy: healthy_below(observed, voting),
                    expected: voting,
                },
            }));
        }

        Ok(Some(ConvergenceAction::UpdateSpec {
            fields: Vec::new(),
            partition: next,
        }))
    }
}

/// Rollout bookkeeping after a pass
///
/// A step timer starts whenever the partition moves or a rollout is first
/// noticed, and is kept while the pass waits on (or stalls on) that step.
pub fn next_rollout(
    previous: Option<&RolloutProgress>,
    action: &ConvergenceAction,
    workload: Option<&WorkloadState>,
    now: DateTime<Utc>,
) -> Option<RolloutProgress> {
    match action {
        ConvergenceAction::UpdateSpec { fields, partition } => Some(RolloutProgress {
            fields: if fields.is_empty() {
                previous.map(|p| p.fields.clone()).unwrap_or_default()
            } else {
                fields.clone()
            },
            partition: *partition,
            step_started_at: now,
        }),
        ConvergenceAction::Wait {
            reason: WaitReason::RolloutStep { .. },
        } => match previous {
            Some(progress) => Some(progress.clone()),
            None => Some(RolloutProgress {
                fields: Vec::new(),
                partition: workload.map(|w| w.partition).unwrap_or(0),
                step_started_at: now,
            }),
        },
        ConvergenceAction::NoOp | ConvergenceAction::Create { .. } | ConvergenceAction::Delete => {
            None
        }
        _ => previous.cloned(),
    }
}

/// Healthy members with an ordinal below `limit`
fn healthy_below(observed: &ObservedState, limit: i32) -> i32 {
    let healthy = observed
        .members
        .iter()
        .filter(|m| m.ordinal < limit && m.health == MemberHealth::Healthy)
        .count();
    i32::try_from(healthy).unwrap_or(i32::MAX)
}

/// Whether member `ordinal` may be restarted without losing quorum
fn can_restart(observed: &ObservedState, voting: i32, ordinal: i32) -> bool {
    if voting <= 1 {
        return true;
    }
    let others = observed
        .members
        .iter()
        .filter(|m| m.ordinal < voting && m.ordinal != ordinal)
        .filter(|m| m.health == MemberHealth::Healthy)
        .count();
    i32::try_from(others).unwrap_or(i32::MAX) >= quorum(voting)
}

/// Largest number of members removable from `voting` in one step
pub fn max_removal(voting: i32) -> i32 {
    match voting {
        v if v <= 1 => 0,
        2 => 1,
        v => (v - 1) / 2,
    }
}

fn plan_scale_down(
    target: i32,
    voting: i32,
    observed: &ObservedState,
) -> Result<ConvergenceAction> {
    let healthy = healthy_below(observed, voting);
    let required = quorum(voting);
    if healthy < required {
        return Err(Error::QuorumSafetyViolation(format!(
            "refusing to remove members: only {} of {} members are healthy, quorum is {}",
            healthy, voting, required
        )));
    }

    let wanted = (voting - target).min(max_removal(voting));

    // Prefer the largest step that stays safe
    for by in (1..=wanted).rev() {
        let to = voting - by;
        let remaining_healthy = healthy_below(observed, to);
        if remaining_healthy < quorum(to) {
            continue;
        }

        // Remaining healthy members hold quorum, so a removed leader has a successor
        let removing: Vec<i32> = (to..voting).rev().collect();
        if let Some(leader) = observed.leader
            && removing.contains(&leader)
        {
            debug!(
                leader,
                successors = remaining_healthy,
                "leader is among the removed members"
            );
        }

        return Ok(ConvergenceAction::ScaleDown { by, to, removing });
    }

    Err(Error::QuorumSafetyViolation(format!(
        "refusing to shrink from {} to {} members: remaining members would not hold quorum",
        voting, target
    )))
}
