//! PodDisruptionBudget generation for etcd clusters
//!
//! Voluntary disruptions (node drains, cluster upgrades) may never take the
//! cluster below quorum.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Etcd;
use crate::resources::common::{owner_reference, quorum, standard_labels};

/// Minimum members that must stay available for a member count
///
/// - 1 member: 0, a single member cluster cannot survive any disruption anyway
/// - n members: quorum(n)
pub fn min_available(replicas: i32) -> i32 {
    if replicas <= 1 { 0 } else { quorum(replicas) }
}

/// Generate a PodDisruptionBudget for the cluster
pub fn generate_pdb(etcd: &Etcd) -> PodDisruptionBudget {
    let name = etcd.name_any();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: etcd.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available(etcd.spec.replicas))),
            selector: Some(LabelSelector {
                match_labels: Some(standard_labels(&name)),
                ..Default::default()
            }),
            // Unhealthy members may be evicted only while the budget holds
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
