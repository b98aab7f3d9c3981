//! End-to-end reconcile scenarios against the in-memory platform
//!
//! Each test drives full passes through `reconcile_at`, letting the fake
//! workload settle between passes the way the StatefulSet controller would.

use kube::runtime::controller::Action;

use etcd_operator::controller::observed::TaskState;
use etcd_operator::controller::{Error, error_policy};
use etcd_operator::crd::{
    BackupConfig, ConditionStatus, ConditionType, Etcd, MaintenanceKind, MemberHealth,
    OperationState, OperationType, PvcRetentionPolicy,
};
use etcd_operator::resources::configmap::{ClusterState, InitialCluster};

use crate::common::*;

fn harness(replicas: i32, policy: PvcRetentionPolicy) -> Harness {
    Harness::new(
        EtcdBuilder::new("main", "default")
            .with_replicas(replicas)
            .with_retention(policy)
            .build(),
    )
}

fn operation(h: &Harness) -> (OperationType, OperationState) {
    let op = h.status().last_operation.as_ref().unwrap();
    (op.type_, op.state)
}

mod bootstrap_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_grows_one_member_at_a_time() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);

        h.pass().await.unwrap();
        assert!(h.platform.state().finalizer);
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "Creating"
        );
        assert_eq!(
            operation(&h),
            (OperationType::Create, OperationState::Processing)
        );
        assert_eq!(h.status().observed_generation, None);

        h.settle();
        h.advance(10);
        let passes = h.converge(20).await + 1;

        // Each new member joins as a learner and is promoted on the next pass
        assert_eq!(passes, 6);
        assert_eq!(
            h.platform.writes(),
            vec![
                RecordedWrite::Create { replicas: 1 },
                RecordedWrite::Scale { replicas: 2 },
                RecordedWrite::Scale { replicas: 3 },
            ]
        );
        assert_eq!(
            h.platform.membership_changes(),
            vec![
                MembershipChange::AddLearner(1),
                MembershipChange::Promote(1),
                MembershipChange::AddLearner(2),
                MembershipChange::Promote(2),
            ]
        );
        assert_eq!(
            h.platform.registered(),
            [(0, false), (1, false), (2, false)].into_iter().collect()
        );
        assert_eq!(
            h.status().cluster_id.as_deref(),
            Some(SIM_CLUSTER_ID)
        );
        assert_eq!(
            operation(&h),
            (OperationType::Create, OperationState::Succeeded)
        );
        assert_eq!(h.status().observed_generation, Some(1));
        assert_eq!(h.status().ready_replicas, 3);
        assert!(h.status().ready);
        assert_eq!(
            h.condition(ConditionType::Available).status,
            ConditionStatus::True
        );
        assert_eq!(h.platform.claims().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_spec_waits_for_correction() {
        let mut h = Harness::new(
            EtcdBuilder::new("main", "default")
                .with_version("latest")
                .build(),
        );

        let err = h.pass().await.unwrap_err();
        assert!(matches!(err, Error::FatalSpec(_)));
        assert!(h.platform.writes().is_empty());

        let progressing = h.condition(ConditionType::Progressing);
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "SpecInvalid");
        assert_eq!(
            operation(&h),
            (OperationType::Create, OperationState::Failed)
        );
        assert_eq!(h.status().failed_generation, Some(1));
        assert!(h.status().last_error.is_some());
        assert_eq!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::await_change()
        );

        // Retrying the same generation stays failed
        h.advance(10);
        assert!(h.pass().await.is_err());
        assert_eq!(operation(&h).1, OperationState::Failed);

        h.update_spec(|spec| spec.etcd.version = "v3.5.17".to_string());
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(
            operation(&h),
            (OperationType::Create, OperationState::Processing)
        );
        assert_eq!(h.status().failed_generation, None);
        assert_eq!(
            h.platform.writes(),
            vec![RecordedWrite::Create { replicas: 1 }]
        );
    }

    #[tokio::test]
    async fn test_first_member_bootstraps_alone() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.pass().await.unwrap();

        let config = h.platform.state().config.clone().unwrap();
        assert!(config.contains("initial-cluster-state: new"));
        assert!(config.contains("initial-cluster: main-0=http://main-0.main-peer.default.svc:2380\n"));

        h.settle();
        h.advance(10);
        h.pass().await.unwrap();

        // The joiner sees the running cluster, not a fresh one
        let config = h.platform.state().config.clone().unwrap();
        assert!(config.contains("initial-cluster-state: existing"));
        assert!(config.contains("main-1=http://main-1.main-peer.default.svc:2380"));
        assert!(!config.contains("main-2="));
        assert_eq!(h.platform.registered(), [(0, false), (1, true)].into_iter().collect());
        assert_eq!(h.condition(ConditionType::Progressing).reason, "ScalingUp");
    }

    #[tokio::test]
    async fn test_new_cluster_without_quorum_never_forms() {
        let etcd = EtcdBuilder::new("main", "default").with_replicas(3).build();
        let mut h = Harness::new(etcd.clone());
        h.pass().await.unwrap();

        // Three members announced as new, only one of them running
        h.platform
            .set_config(&etcd, &InitialCluster { members: 3, state: ClusterState::New });
        h.settle();

        let state = h.platform.state();
        assert!(state.cluster_id.is_none());
        assert!(state.registered.is_empty());
        assert!(state.pods.values().all(|p| p.health == MemberHealth::Unhealthy));
    }

    #[tokio::test]
    async fn test_unregistered_member_cannot_join() {
        let mut h = harness(1, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;

        // Started without being added first
        if let Some(w) = h.platform.state().workload.as_mut() {
            w.replicas = 2;
        }
        h.settle();

        let state = h.platform.state();
        assert!(!state.started.contains(&1));
        assert_eq!(state.pods[&1].health, MemberHealth::Unhealthy);
        assert_eq!(state.pods[&0].health, MemberHealth::Healthy);
    }

    #[tokio::test]
    async fn test_lagging_learner_holds_scale_up() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.pass().await.unwrap();
        h.settle();
        h.advance(10);
        h.pass().await.unwrap();

        h.platform.set_sick(1, true);
        h.settle();
        h.advance(10);
        h.pass().await.unwrap();
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(h.condition(ConditionType::Progressing).reason, "ScalingUp");
        assert_eq!(h.platform.replicas(), Some(2));
        assert_eq!(h.platform.membership_changes(), vec![MembershipChange::AddLearner(1)]);

        h.platform.set_sick(1, false);
        h.settle();
        h.advance(10);
        h.converge(20).await;
        assert_eq!(h.platform.replicas(), Some(3));
        assert!(h.platform.registered().values().all(|learner| !learner));
    }

    #[tokio::test]
    async fn test_unknown_membership_holds_scale_up() {
        let mut h = harness(1, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;
        let writes = h.platform.writes().len();

        h.update_spec(|spec| spec.replicas = 3);
        h.platform.state().member_list_unavailable = true;
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(h.platform.writes().len(), writes);
        assert!(h.platform.membership_changes().is_empty());
        assert_eq!(h.condition(ConditionType::Progressing).reason, "Waiting");

        h.platform.state().member_list_unavailable = false;
        h.advance(10);
        h.converge(20).await;
        assert_eq!(h.platform.replicas(), Some(3));
    }
}

mod scale_down_tests {
    use super::*;

    #[tokio::test]
    async fn test_retain_master_keeps_leader_claim() {
        let mut h = harness(5, PvcRetentionPolicy::RetainMaster);
        h.converge(20).await;
        h.platform.set_leader(4);

        h.update_spec(|spec| spec.replicas = 3);
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(
            h.platform.writes().last(),
            Some(&RecordedWrite::Scale { replicas: 3 })
        );
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "ScalingDown"
        );
        assert_eq!(
            h.platform.state().deleted_claims,
            vec!["data-main-3".to_string()]
        );
        assert_eq!(h.status().retained_claims, vec!["data-main-4".to_string()]);

        // Later passes leave the retained claim alone
        h.settle();
        h.advance(10);
        h.converge(10).await;

        assert!(h.platform.claims().contains("data-main-4"));
        assert!(!h.platform.claims().contains("data-main-3"));
        assert_eq!(h.platform.state().deleted_claims.len(), 1);
        assert_eq!(h.status().retained_claims, vec!["data-main-4".to_string()]);
        assert_eq!(h.status().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_retained_claim_released_when_member_returns() {
        let mut h = harness(5, PvcRetentionPolicy::RetainMaster);
        h.converge(20).await;
        h.platform.set_leader(4);

        h.update_spec(|spec| spec.replicas = 3);
        h.advance(10);
        h.pass().await.unwrap();
        h.settle();
        h.advance(10);
        h.converge(10).await;

        h.update_spec(|spec| spec.replicas = 5);
        h.advance(10);
        h.converge(20).await;

        assert!(h.status().retained_claims.is_empty());
        assert_eq!(h.platform.replicas(), Some(5));
        assert_eq!(
            h.platform.state().deleted_claims,
            vec!["data-main-3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_large_shrink_steps_down_to_one() {
        let mut h = harness(5, PvcRetentionPolicy::DeleteAll);
        h.converge(20).await;
        let before = h.platform.writes().len();
        let changes = h.platform.membership_changes().len();
        assert_eq!(h.status().observed_generation, Some(1));

        h.update_spec(|spec| spec.replicas = 1);
        let mut passes = 0;
        loop {
            h.advance(10);
            h.pass().await.unwrap();
            passes += 1;
            if h.condition(ConditionType::Progressing).reason == "Converged" {
                break;
            }
            assert_eq!(h.status().observed_generation, Some(1));
            h.settle();
            assert!(passes < 10, "shrink did not finish");
        }

        assert_eq!(
            h.platform.writes()[before..],
            [
                RecordedWrite::Scale { replicas: 3 },
                RecordedWrite::Scale { replicas: 2 },
                RecordedWrite::Scale { replicas: 1 },
            ]
        );
        assert_eq!(
            h.platform.membership_changes()[changes..],
            [
                MembershipChange::Remove(4),
                MembershipChange::Remove(3),
                MembershipChange::Remove(2),
                MembershipChange::Remove(1),
            ]
        );
        assert_eq!(h.status().observed_generation, Some(2));
        assert_eq!(h.platform.registered(), [(0, false)].into_iter().collect());
        assert_eq!(h.platform.claims().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_removes_claims() {
        let mut h = harness(5, PvcRetentionPolicy::DeleteAll);
        h.converge(20).await;

        h.update_spec(|spec| spec.replicas = 3);
        h.advance(10);
        h.pass().await.unwrap();

        let mut deleted = h.platform.state().deleted_claims.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["data-main-3", "data-main-4"]);
        assert!(h.status().retained_claims.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_removal_is_swept() {
        let mut h = harness(5, PvcRetentionPolicy::DeleteAll);
        h.converge(20).await;

        // The workload shrank but the claims were never deleted
        {
            let mut state = h.platform.state();
            if let Some(w) = state.workload.as_mut() {
                w.replicas = 3;
            }
            state.pods.remove(&3);
            state.pods.remove(&4);
            state.registered.remove(&3);
            state.registered.remove(&4);
        }
        h.update_spec(|spec| spec.replicas = 3);
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "Converged"
        );
        let claims = h.platform.claims();
        assert_eq!(claims.len(), 3);
        assert!(!claims.contains("data-main-3"));
        assert!(!claims.contains("data-main-4"));
    }

    #[tokio::test]
    async fn test_members_left_registered_are_unregistered() {
        let mut h = harness(5, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;
        let changes = h.platform.membership_changes().len();

        // The workload shrank but the members were never removed
        {
            let mut state = h.platform.state();
            if let Some(w) = state.workload.as_mut() {
                w.replicas = 3;
            }
            state.pods.remove(&3);
            state.pods.remove(&4);
        }
        h.update_spec(|spec| spec.replicas = 3);
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "ScalingDown"
        );
        assert_eq!(
            h.platform.membership_changes()[changes..],
            [MembershipChange::Remove(4), MembershipChange::Remove(3)]
        );
        assert_eq!(h.platform.replicas(), Some(3));

        h.settle();
        h.advance(10);
        h.converge(10).await;
        assert_eq!(h.platform.registered().len(), 3);
    }

    #[tokio::test]
    async fn test_unsafe_scale_down_is_refused() {
        let mut h = harness(3, PvcRetentionPolicy::DeleteAll);
        h.converge(20).await;
        let writes = h.platform.writes().len();

        h.platform.set_sick(1, true);
        h.platform.set_sick(2, true);
        h.settle();
        h.update_spec(|spec| spec.replicas = 1);
        h.advance(10);

        let err = h.pass().await.unwrap_err();
        assert!(matches!(err, Error::QuorumSafetyViolation(_)));
        assert_eq!(h.platform.writes().len(), writes);
        assert!(h.platform.state().deleted_claims.is_empty());

        let progressing = h.condition(ConditionType::Progressing);
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "ScaleDownRefused");
        assert_eq!(operation(&h).1, OperationState::Error);
        assert_ne!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::await_change()
        );
    }
}

mod rollout_tests {
    use super::*;

    fn bump_version(h: &mut Harness) {
        h.update_spec(|spec| spec.etcd.version = "v3.5.18".to_string());
        h.advance(10);
    }

    #[tokio::test]
    async fn test_version_bump_rolls_highest_ordinal_first() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;
        let before = h.platform.writes().len();

        bump_version(&mut h);
        h.pass().await.unwrap();
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "RollingUpdate"
        );
        assert!(h.status().rollout.is_some());
        assert_eq!(
            operation(&h),
            (OperationType::Reconcile, OperationState::Processing)
        );

        h.settle();
        h.advance(10);
        h.converge(20).await;

        assert_eq!(
            h.platform.writes()[before..],
            [
                RecordedWrite::Template { partition: 2 },
                RecordedWrite::Partition { partition: 1 },
                RecordedWrite::Partition { partition: 0 },
            ]
        );
        let status = h.status();
        assert_eq!(status.current_revision.as_deref(), Some("main-r2"));
        assert_eq!(status.updated_revision.as_deref(), Some("main-r2"));
        assert_eq!(status.updated_replicas, 3);
        assert!(status.rollout.is_none());
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(
            operation(&h),
            (OperationType::Reconcile, OperationState::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_member_stalls_rollout() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;

        bump_version(&mut h);
        h.pass().await.unwrap();
        h.platform.set_sick(2, true);
        h.settle();

        h.advance(10);
        h.pass().await.unwrap();
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "RollingUpdate"
        );
        assert_eq!(
            h.platform.writes().last(),
            Some(&RecordedWrite::Template { partition: 2 })
        );

        h.advance(600);
        let err = h.pass().await.unwrap_err();
        assert!(matches!(err, Error::RolloutStalled(_)));

        let progressing = h.condition(ConditionType::Progressing);
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "RolloutStalled");
        let available = h.condition(ConditionType::Available);
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason, "MemberUnhealthy");
        assert_eq!(operation(&h).1, OperationState::Error);
        assert!(h.status().rollout.is_some());
    }

    #[tokio::test]
    async fn test_rollout_resumes_after_recovery() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;

        bump_version(&mut h);
        h.pass().await.unwrap();
        h.platform.set_sick(2, true);
        h.settle();
        h.advance(10);
        h.pass().await.unwrap();

        h.platform.set_sick(2, false);
        h.settle();
        h.advance(10);
        h.pass().await.unwrap();

        assert_eq!(
            h.platform.writes().last(),
            Some(&RecordedWrite::Partition { partition: 1 })
        );
    }
}

mod maintenance_tests {
    use super::*;

    fn backed_up(backup: BackupConfig) -> Etcd {
        EtcdBuilder::new("main", "default").with_backup(backup).build()
    }

    #[tokio::test]
    async fn test_no_submission_during_structural_passes() {
        let mut h = Harness::new(
            EtcdBuilder::new("main", "default")
                .with_delta_snapshots(300)
                .build(),
        );
        h.now = at(400);

        h.pass().await.unwrap();
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "Creating"
        );
        assert!(h.platform.state().submitted.is_empty());
    }

    #[tokio::test]
    async fn test_delta_snapshot_lifecycle() {
        let mut h = Harness::new(
            EtcdBuilder::new("main", "default")
                .with_delta_snapshots(300)
                .build(),
        );
        h.converge(20).await;
        assert!(h.platform.state().submitted.is_empty());
        assert_eq!(
            h.condition(ConditionType::BackupReady).reason,
            "SchedulesValid"
        );

        h.now = at(301);
        h.pass().await.unwrap();
        {
            let state = h.platform.state();
            assert_eq!(state.submitted.len(), 1);
            assert_eq!(state.submitted[0].0, MaintenanceKind::DeltaSnapshot);
        }
        assert_eq!(operation(&h).1, OperationState::Processing);
        assert!(
            h.status()
                .maintenance_record(MaintenanceKind::DeltaSnapshot)
                .and_then(|r| r.in_flight.as_ref())
                .is_some()
        );

        h.platform
            .finish_task(MaintenanceKind::DeltaSnapshot, TaskState::Failed, at(320));
        h.now = at(330);
        h.pass().await.unwrap();

        let backup_ready = h.condition(ConditionType::BackupReady);
        assert_eq!(backup_ready.status, ConditionStatus::False);
        assert_eq!(backup_ready.reason, "MaintenanceTaskFailed");
        assert!(backup_ready.message.contains("snapshot upload failed"));
        assert_eq!(operation(&h).1, OperationState::Error);
        assert!(
            h.status()
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("snapshot upload failed"))
        );
        assert_eq!(h.platform.state().submitted.len(), 1);

        // The next boundary tries again
        h.now = at(601);
        h.pass().await.unwrap();
        assert_eq!(h.platform.state().submitted.len(), 2);
        assert_eq!(operation(&h).1, OperationState::Processing);

        h.platform
            .finish_task(MaintenanceKind::DeltaSnapshot, TaskState::Succeeded, at(620));
        h.now = at(630);
        h.pass().await.unwrap();

        let backup_ready = h.condition(ConditionType::BackupReady);
        assert_eq!(backup_ready.status, ConditionStatus::True);
        assert_eq!(operation(&h).1, OperationState::Succeeded);
        assert_eq!(h.status().last_error, None);
    }

    #[tokio::test]
    async fn test_write_volume_triggers_early_delta() {
        let mut h = Harness::new(backed_up(BackupConfig {
            delta_snapshot_period_seconds: Some(300),
            delta_snapshot_memory_limit: Some(1024),
            ..backup_config()
        }));
        h.converge(20).await;

        h.platform.state().delta_bytes = Some(4096);
        h.advance(10);
        h.pass().await.unwrap();
        assert_eq!(h.platform.state().submitted.len(), 1);

        // Still running, not submitted twice
        h.advance(10);
        h.pass().await.unwrap();
        assert_eq!(h.platform.state().submitted.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_retries_next_pass() {
        let mut h = Harness::new(
            EtcdBuilder::new("main", "default")
                .with_delta_snapshots(300)
                .build(),
        );
        h.converge(20).await;
        h.platform.state().reject_submissions = true;

        h.now = at(301);
        h.pass().await.unwrap();
        assert!(h.platform.state().submitted.is_empty());

        h.platform.state().reject_submissions = false;
        h.now = at(311);
        h.pass().await.unwrap();
        assert_eq!(h.platform.state().submitted.len(), 1);
    }
}

mod teardown_tests {
    use super::*;

    async fn converged_then_deleted(policy: PvcRetentionPolicy, leader: i32) -> Harness {
        let mut h = harness(3, policy);
        h.converge(20).await;
        h.platform.set_leader(leader);
        h.advance(10);
        h.request_deletion();

        let action = h.pass().await.unwrap();
        assert_eq!(action, Action::await_change());
        h
    }

    #[tokio::test]
    async fn test_delete_all() {
        let h = converged_then_deleted(PvcRetentionPolicy::DeleteAll, 0).await;

        let state = h.platform.state();
        assert!(state.workload_deleted);
        assert!(state.claims.is_empty());
        assert!(!state.finalizer);
        drop(state);
        assert_eq!(
            operation(&h),
            (OperationType::Delete, OperationState::Processing)
        );
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "Deleting"
        );
    }

    #[tokio::test]
    async fn test_retain_all() {
        let h = converged_then_deleted(PvcRetentionPolicy::RetainAll, 0).await;

        let state = h.platform.state();
        assert!(state.workload_deleted);
        assert_eq!(state.claims.len(), 3);
        assert!(state.deleted_claims.is_empty());
        assert!(!state.finalizer);
    }

    #[tokio::test]
    async fn test_retain_master() {
        let h = converged_then_deleted(PvcRetentionPolicy::RetainMaster, 1).await;

        let claims = h.platform.claims();
        assert_eq!(claims.len(), 1);
        assert!(claims.contains("data-main-1"));
    }

    #[tokio::test]
    async fn test_without_finalizer_nothing_to_do() {
        let mut h = harness(3, PvcRetentionPolicy::DeleteAll);
        h.request_deletion();

        let action = h.pass().await.unwrap();
        assert_eq!(action, Action::await_change());

        let state = h.platform.state();
        assert!(!state.workload_deleted);
        assert_eq!(state.status_writes, 0);
    }
}

mod platform_error_tests {
    use super::*;

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;
        let writes = h.platform.writes().len();

        h.update_spec(|spec| spec.replicas = 5);
        h.platform.state().conflicts = 1;
        h.advance(10);

        let err = h.pass().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.platform.writes().len(), writes);
        assert_eq!(
            h.condition(ConditionType::Progressing).reason,
            "TransientError"
        );
        assert_eq!(operation(&h).1, OperationState::Pending);
        assert_ne!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::await_change()
        );

        h.advance(10);
        h.pass().await.unwrap();
        assert_eq!(
            h.platform.writes().last(),
            Some(&RecordedWrite::Scale { replicas: 4 })
        );
        assert_eq!(operation(&h).1, OperationState::Processing);
        assert_eq!(h.status().replicas, 3);

        // The learner registered before the conflict is not added twice
        assert_eq!(
            h.platform.membership_changes().last(),
            Some(&MembershipChange::AddLearner(3))
        );
        assert_eq!(
            h.platform
                .membership_changes()
                .iter()
                .filter(|c| **c == MembershipChange::AddLearner(3))
                .count(),
            1
        );
    }
}

mod status_write_tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_status_is_not_rewritten() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.converge(20).await;
        let writes = h.status_writes();

        h.advance(10);
        h.pass().await.unwrap();
        assert_eq!(h.status_writes(), writes);

        // Heartbeat once the oldest condition is a resync interval old
        h.advance(300);
        h.pass().await.unwrap();
        assert_eq!(h.status_writes(), writes + 1);
    }

    #[tokio::test]
    async fn test_ancillary_objects_applied_every_pass() {
        let mut h = harness(1, PvcRetentionPolicy::RetainAll);
        let passes = h.converge(20).await;
        assert_eq!(h.platform.state().ancillary_applies, passes);
    }
}

mod backoff_tests {
    use super::*;
    use etcd_operator::BackoffConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_retries_back_off_until_a_pass_succeeds() {
        let mut h = harness(3, PvcRetentionPolicy::RetainAll);
        h.ctx = h.ctx.clone().with_backoff(BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        });
        let err = Error::Transient("conflict".into());

        assert_eq!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::requeue(Duration::from_secs(10))
        );

        h.pass().await.unwrap();
        assert_eq!(
            error_policy(h.arc_etcd(), &err, h.arc_ctx()),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
