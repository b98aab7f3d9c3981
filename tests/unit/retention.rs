//! Unit tests for volume retention decisions

use std::collections::BTreeSet;

use etcd_operator::controller::retention::{
    RemovedMember, all_members, claims_to_delete, orphaned_members, removed_members,
};
use etcd_operator::crd::PvcRetentionPolicy;

use crate::common::*;

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

mod policy_tests {
    use super::*;

    fn removed() -> Vec<RemovedMember> {
        vec![
            RemovedMember {
                ordinal: 4,
                claims: vec!["data-main-4".to_string(), "wal-main-4".to_string()],
            },
            RemovedMember {
                ordinal: 3,
                claims: vec!["data-main-3".to_string()],
            },
        ]
    }

    #[test]
    fn test_retain_all_keeps_everything() {
        assert!(claims_to_delete(PvcRetentionPolicy::RetainAll, &removed(), Some(4)).is_empty());
        assert!(claims_to_delete(PvcRetentionPolicy::RetainAll, &removed(), None).is_empty());
    }

    #[test]
    fn test_delete_all_ignores_master() {
        assert_eq!(
            claims_to_delete(PvcRetentionPolicy::DeleteAll, &removed(), Some(4)),
            set(&["data-main-3", "data-main-4", "wal-main-4"])
        );
    }

    #[test]
    fn test_retain_master_keeps_every_master_claim() {
        assert_eq!(
            claims_to_delete(PvcRetentionPolicy::RetainMaster, &removed(), Some(4)),
            set(&["data-main-3"])
        );
    }

    #[test]
    fn test_retain_master_with_surviving_master() {
        assert_eq!(
            claims_to_delete(PvcRetentionPolicy::RetainMaster, &removed(), Some(0)),
            set(&["data-main-3", "data-main-4", "wal-main-4"])
        );
    }

    #[test]
    fn test_nothing_removed() {
        for policy in [
            PvcRetentionPolicy::DeleteAll,
            PvcRetentionPolicy::RetainMaster,
            PvcRetentionPolicy::RetainAll,
        ] {
            assert!(claims_to_delete(policy, &[], Some(0)).is_empty());
        }
    }

    #[test]
    fn test_default_policy_is_retain_all() {
        assert_eq!(PvcRetentionPolicy::default(), PvcRetentionPolicy::RetainAll);
    }
}

mod observed_claims_tests {
    use super::*;

    #[test]
    fn test_removed_members_pick_up_observed_claims() {
        let desired = desired_for(&create_test_etcd("main", "default", 5));
        let observed = converged(&desired, 5);

        let removed = removed_members(&observed, &[4, 3]);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].ordinal, 4);
        assert_eq!(removed[0].claims, vec!["data-main-4".to_string()]);
    }

    #[test]
    fn test_member_without_claims() {
        let desired = desired_for(&create_test_etcd("main", "default", 3));
        let mut observed = converged(&desired, 3);
        observed.claims.remove(&2);

        let removed = removed_members(&observed, &[2]);
        assert!(removed[0].claims.is_empty());
    }

    #[test]
    fn test_all_members_covers_every_claim() {
        let desired = desired_for(&create_test_etcd("main", "default", 3));
        let observed = converged(&desired, 3);
        let ordinals: Vec<i32> = all_members(&observed).iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn test_orphans_are_beyond_replicas_and_podless() {
        let desired = desired_for(&create_test_etcd("main", "default", 3));
        let mut observed = converged(&desired, 5);
        observed.workload.as_mut().unwrap().replicas = 3;
        // Member 4 is gone, member 3 is still shutting down
        observed.members.retain(|m| m.ordinal != 4);

        let orphans = orphaned_members(&observed);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].ordinal, 4);
    }

    #[test]
    fn test_no_orphans_without_workload() {
        let desired = desired_for(&create_test_etcd("main", "default", 3));
        let mut observed = converged(&desired, 3);
        observed.workload = None;
        assert!(orphaned_members(&observed).is_empty());
    }
}
