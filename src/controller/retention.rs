//! Volume retention
//!
//! Decides which persistent volume claims go away when members are removed,
//! either by a scale-down or by cluster deletion. The decision depends only on
//! the policy, the removed members and the master at removal time, so a pass
//! retried after a crash derives exactly the same set.

use std::collections::BTreeSet;

use crate::controller::observed::ObservedState;
use crate::crd::PvcRetentionPolicy;

/// A member being removed together with the claims bound to it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedMember {
    pub ordinal: i32,
    pub claims: Vec<String>,
}

/// Claims to delete for the given removed members
///
/// `master` is the member identified as leader at removal time. Under
/// `RetainMaster` its claims survive even when the master itself is removed.
pub fn claims_to_delete(
    policy: PvcRetentionPolicy,
    removed: &[RemovedMember],
    master: Option<i32>,
) -> BTreeSet<String> {
    match policy {
        PvcRetentionPolicy::RetainAll => BTreeSet::new(),
        PvcRetentionPolicy::DeleteAll => removed
            .iter()
            .flat_map(|m| m.claims.iter().cloned())
            .collect(),
        PvcRetentionPolicy::RetainMaster => removed
            .iter()
            .filter(|m| Some(m.ordinal) != master)
            .flat_map(|m| m.claims.iter().cloned())
            .collect(),
    }
}

/// Removed members for the given ordinals, with their observed claims
pub fn removed_members(observed: &ObservedState, ordinals: &[i32]) -> Vec<RemovedMember> {
    ordinals
        .iter()
        .map(|ordinal| RemovedMember {
            ordinal: *ordinal,
            claims: observed.claims.get(ordinal).cloned().unwrap_or_default(),
        })
        .collect()
}

/// Every member that holds claims, for teardown
pub fn all_members(observed: &ObservedState) -> Vec<RemovedMember> {
    let ordinals: Vec<i32> = observed.claims.keys().copied().collect();
    removed_members(observed, &ordinals)
}

/// Members already removed from the workload whose claims are still around
///
/// Covers removals whose claim deletion was interrupted. A claim only counts
/// once its pod is gone, so a member that is still shutting down is left alone.
pub fn orphaned_members(observed: &ObservedState) -> Vec<RemovedMember> {
    let Some(workload) = observed.workload.as_ref() else {
        return Vec::new();
    };

    let ordinals: Vec<i32> = observed
        .claims
        .keys()
        .copied()
        .filter(|ordinal| *ordinal >= workload.replicas && observed.member(*ordinal).is_none())
        .collect();

    removed_members(observed, &ordinals)
}
