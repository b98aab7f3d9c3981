//! Unit tests for member-set planning

use std::time::Duration;

use chrono::Duration as ChronoDuration;

use etcd_operator::controller::members::{max_removal, next_rollout};
use etcd_operator::controller::observed::ObservedState;
use etcd_operator::controller::{
    ConvergenceAction, DesiredState, Error, MemberSetManager, WaitReason,
};
use etcd_operator::crd::{MemberHealth, RolloutProgress, SpecField};

use crate::common::*;

fn manager() -> MemberSetManager {
    MemberSetManager::new(Duration::from_secs(600))
}

fn desired(replicas: i32) -> DesiredState {
    desired_for(&create_test_etcd("main", "default", replicas))
}

/// A cluster in the middle of a rollout from "rev-1" to "rev-2"
///
/// Members listed in `updated` already run the new revision.
fn rolling(desired: &DesiredState, replicas: i32, partition: i32, updated: &[i32]) -> ObservedState {
    let mut observed = converged(desired, replicas);
    if let Some(w) = observed.workload.as_mut() {
        w.update_revision = Some("rev-2".to_string());
        w.partition = partition;
        w.updated_replicas = i32::try_from(updated.len()).unwrap();
    }
    for m in observed.members.iter_mut() {
        if updated.contains(&m.ordinal) {
            m.revision = Some("rev-2".to_string());
        }
    }
    observed
}

fn progress(partition: i32, started_secs: i64) -> RolloutProgress {
    RolloutProgress {
        fields: vec![SpecField::Image],
        partition,
        step_started_at: at(started_secs),
    }
}

mod bootstrap_tests {
    use super::*;

    #[test]
    fn test_missing_workload_creates_single_member() {
        let desired = desired(3);
        let observed = ObservedState::default();
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::Create { replicas: 1 });
    }

    #[test]
    fn test_deletion_wins_over_everything() {
        let etcd = EtcdBuilder::new("main", "default").deleting_at(epoch()).build();
        let desired = desired_for(&etcd);
        let observed = converged(&desired, 3);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::Delete);
    }

    #[test]
    fn test_syncing_workload_waits() {
        let desired = desired(3);
        let mut observed = converged(&desired, 3);
        observed.workload.as_mut().unwrap().generation = 2;

        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::WorkloadSyncing
            }
        );
        assert!(!action.is_structural());
    }

    #[test]
    fn test_converged_cluster_is_noop() {
        let desired = desired(3);
        let observed = converged(&desired, 3);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::NoOp);
        assert_eq!(action.to_string(), "cluster converged");
    }

    #[test]
    fn test_missing_member_is_not_masked() {
        let desired = desired(3);
        let mut observed = converged(&desired, 3);
        observed.members.retain(|m| m.ordinal != 2);

        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::MembersNotReady {
                    healthy: 2,
                    expected: 3
                }
            }
        );
    }
}

mod scale_up_tests {
    use super::*;

    #[test]
    fn test_adds_one_member_at_a_time() {
        let desired = desired(5);
        let observed = converged(&desired, 3);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::ScaleUp { by: 1, to: 4 });
    }

    #[test]
    fn test_blocked_while_a_member_is_unhealthy() {
        let desired = desired(5);
        let observed = with_health(converged(&desired, 3), 1, MemberHealth::Unhealthy);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::MembersNotReady {
                    healthy: 2,
                    expected: 5
                }
            }
        );
    }

    #[test]
    fn test_scale_takes_precedence_over_rollout() {
        let old = desired(3);
        let new = desired_for(
            &EtcdBuilder::new("main", "default")
                .with_replicas(5)
                .with_version("v3.5.18")
                .build(),
        );
        let observed = converged(&old, 3);
        let action = manager().plan(&new, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::ScaleUp { by: 1, to: 4 });
    }
}

mod membership_tests {
    use super::*;

    fn with_members(mut observed: ObservedState, voters: i32, learners: &[i32]) -> ObservedState {
        observed.membership = Some(membership("main", voters, learners));
        observed
    }

    #[test]
    fn test_caught_up_learner_is_promoted() {
        let desired = desired(5);
        let observed = with_members(converged(&desired, 3), 2, &[2]);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::PromoteLearner { ordinal: 2 });
        assert!(action.is_structural());
    }

    #[test]
    fn test_lagging_learner_holds_the_next_member() {
        let desired = desired(5);
        let observed = with_health(
            with_members(converged(&desired, 3), 2, &[2]),
            2,
            MemberHealth::Unhealthy,
        );
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::MemberJoining { ordinal: 2 }
            }
        );
    }

    #[test]
    fn test_shrink_does_not_wait_for_a_learner() {
        let desired = desired(2);
        let observed = with_health(
            with_members(converged(&desired, 3), 2, &[2]),
            2,
            MemberHealth::Unhealthy,
        );
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::ScaleDown {
                by: 1,
                to: 2,
                removing: vec![2]
            }
        );
    }

    #[test]
    fn test_members_outside_workload_are_unregistered_first() {
        let desired = desired(5);
        let observed = with_members(converged(&desired, 3), 5, &[]);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::RemoveStale { ordinals: vec![4, 3] });
    }

    #[test]
    fn test_registered_joiner_is_kept() {
        let desired = desired(5);
        let observed = with_members(converged(&desired, 3), 3, &[3]);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::ScaleUp { by: 1, to: 4 });
    }

    #[test]
    fn test_joiner_dropped_when_target_falls() {
        let desired = desired(3);
        let observed = with_members(converged(&desired, 3), 3, &[3]);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::RemoveStale { ordinals: vec![3] });
    }

    #[test]
    fn test_scale_up_needs_the_member_list() {
        let desired = desired(5);
        let mut observed = converged(&desired, 3);
        observed.membership = None;
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::MembershipUnknown
            }
        );

        // Nothing else depends on it
        let steady = super::desired(3);
        let mut observed = converged(&steady, 3);
        observed.membership = None;
        let action = manager().plan(&steady, &observed, None, at(0)).unwrap();
        assert_eq!(action, ConvergenceAction::NoOp);
    }
}

mod scale_down_tests {
    use super::*;

    #[test]
    fn test_removal_limits() {
        assert_eq!(max_removal(1), 0);
        assert_eq!(max_removal(2), 1);
        assert_eq!(max_removal(3), 1);
        assert_eq!(max_removal(5), 2);
        assert_eq!(max_removal(9), 4);
    }

    #[test]
    fn test_removes_highest_ordinals_first() {
        let desired = desired(3);
        let observed = converged(&desired, 5);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::ScaleDown {
                by: 2,
                to: 3,
                removing: vec![4, 3]
            }
        );
    }

    #[test]
    fn test_large_shrink_is_stepped() {
        let desired = desired(1);
        let observed = converged(&desired, 3);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::ScaleDown {
                by: 1,
                to: 2,
                removing: vec![2]
            }
        );
    }

    #[test]
    fn test_two_members_may_drop_to_one() {
        let desired = desired(1);
        let observed = converged(&desired, 2);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::ScaleDown {
                by: 1,
                to: 1,
                removing: vec![1]
            }
        );
    }

    #[test]
    fn test_refused_without_quorum() {
        let desired = desired(1);
        let observed = converged(&desired, 3);
        let observed = with_health(observed, 1, MemberHealth::Unhealthy);
        let observed = with_health(observed, 2, MemberHealth::Unhealthy);

        let result = manager().plan(&desired, &observed, None, at(0));
        assert!(matches!(result, Err(Error::QuorumSafetyViolation(_))));
    }

    #[test]
    fn test_refused_when_survivors_are_unhealthy() {
        // Quorum holds now, but only the members being removed are healthy
        let desired = desired(3);
        let observed = converged(&desired, 5);
        let observed = with_health(observed, 0, MemberHealth::Unhealthy);
        let observed = with_health(observed, 1, MemberHealth::Unhealthy);

        let result = manager().plan(&desired, &observed, None, at(0));
        assert!(matches!(result, Err(Error::QuorumSafetyViolation(_))));
    }

    #[test]
    fn test_unhealthy_member_among_removed_is_fine() {
        let desired = desired(3);
        let observed = with_health(converged(&desired, 5), 4, MemberHealth::Unhealthy);
        let action = manager().plan(&desired, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::ScaleDown {
                by: 2,
                to: 3,
                removing: vec![4, 3]
            }
        );
    }
}

mod rollout_tests {
    use super::*;

    #[test]
    fn test_template_change_starts_at_highest_ordinal() {
        let old = desired(3);
        let new = desired_for(&EtcdBuilder::new("main", "default").with_version("v3.5.18").build());
        let observed = converged(&old, 3);

        let action = manager().plan(&new, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::UpdateSpec {
                fields: vec![SpecField::Image],
                partition: 2
            }
        );
    }

    #[test]
    fn test_template_change_waits_for_quorum_headroom() {
        let old = desired(3);
        let new = desired_for(&EtcdBuilder::new("main", "default").with_version("v3.5.18").build());
        let observed = with_health(converged(&old, 3), 1, MemberHealth::Unhealthy);

        let action = manager().plan(&new, &observed, None, at(0)).unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::MembersNotReady {
                    healthy: 2,
                    expected: 3
                }
            }
        );
    }

    #[test]
    fn test_partition_steps_down_once_rolled_member_is_back() {
        let desired = desired(3);
        let observed = rolling(&desired, 3, 2, &[2]);
        let action = manager()
            .plan(&desired, &observed, Some(&progress(2, 0)), at(30))
            .unwrap();
        assert_eq!(
            action,
            ConvergenceAction::UpdateSpec {
                fields: vec![],
                partition: 1
            }
        );
    }

    #[test]
    fn test_waits_for_rolled_member() {
        let desired = desired(3);
        let observed = with_health(rolling(&desired, 3, 2, &[2]), 2, MemberHealth::Unhealthy);
        let action = manager()
            .plan(&desired, &observed, Some(&progress(2, 0)), at(60))
            .unwrap();
        assert_eq!(
            action,
            ConvergenceAction::Wait {
                reason: WaitReason::RolloutStep { ordinal: 2 }
            }
        );
    }

    #[test]
    fn test_stalls_after_member_ready_timeout() {
        let desired = desired(3);
        let observed = with_health(rolling(&desired, 3, 2, &[2]), 2, MemberHealth::Unhealthy);
        let result = manager().plan(&desired, &observed, Some(&progress(2, 0)), at(601));
        assert!(matches!(result, Err(Error::RolloutStalled(_))));
    }

    #[test]
    fn test_rollout_completes_at_partition_zero() {
        let desired = desired(3);
        let observed = rolling(&desired, 3, 0, &[0, 1, 2]);
        let action = manager()
            .plan(&desired, &observed, Some(&progress(0, 0)), at(30))
            .unwrap();
        assert_eq!(action, ConvergenceAction::NoOp);
    }

    #[test]
    fn test_already_updated_members_skip_to_zero() {
        let desired = desired(3);
        let observed = rolling(&desired, 3, 1, &[0, 1, 2]);
        let action = manager()
            .plan(&desired, &observed, Some(&progress(1, 0)), at(30))
            .unwrap();
        assert_eq!(
            action,
            ConvergenceAction::UpdateSpec {
                fields: vec![],
                partition: 0
            }
        );
    }
}

mod rollout_bookkeeping_tests {
    use super::*;

    #[test]
    fn test_template_write_starts_a_step() {
        let action = ConvergenceAction::UpdateSpec {
            fields: vec![SpecField::Image],
            partition: 2,
        };
        let next = next_rollout(None, &action, None, at(5)).unwrap();
        assert_eq!(next.partition, 2);
        assert_eq!(next.fields, vec![SpecField::Image]);
        assert_eq!(next.step_started_at, at(5));
    }

    #[test]
    fn test_partition_step_keeps_fields() {
        let action = ConvergenceAction::UpdateSpec {
            fields: vec![],
            partition: 1,
        };
        let next = next_rollout(Some(&progress(2, 0)), &action, None, at(40)).unwrap();
        assert_eq!(next.fields, vec![SpecField::Image]);
        assert_eq!(next.partition, 1);
        assert_eq!(next.step_started_at, at(40));
    }

    #[test]
    fn test_waiting_keeps_step_timer() {
        let action = ConvergenceAction::Wait {
            reason: WaitReason::RolloutStep { ordinal: 2 },
        };
        let next = next_rollout(Some(&progress(2, 0)), &action, None, at(300)).unwrap();
        assert_eq!(next.step_started_at, at(0));
    }

    #[test]
    fn test_converged_clears_rollout() {
        assert!(
            next_rollout(
                Some(&progress(0, 0)),
                &ConvergenceAction::NoOp,
                None,
                at(10)
            )
            .is_none()
        );
    }

    #[test]
    fn test_step_duration_matches_timeout() {
        let started = progress(2, 0).step_started_at;
        assert_eq!(at(600) - started, ChronoDuration::seconds(600));
    }
}
