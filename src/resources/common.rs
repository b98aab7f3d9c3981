//! Common utilities for Kubernetes resource generation
//!
//! Names, labels and owner references shared by every generated resource, so
//! the reconciler, the observer and the generators agree on identities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::ResourceExt;

use crate::crd::{Etcd, MaintenanceKind};

/// API version for the Etcd CRD
pub const API_VERSION: &str = "druid.sapcloud.io/v1";

/// Kind for the Etcd CRD
pub const KIND: &str = "Etcd";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "etcd-operator";

/// Finalizer blocking removal until teardown has applied the retention policy
pub const FINALIZER: &str = "druid.sapcloud.io/etcd-protection";

/// Name of the volume claim template; claims are `data-<name>-<ordinal>`
pub const CLAIM_TEMPLATE: &str = "data";

/// Label set by the member sidecar on the current leader
pub const ROLE_LABEL: &str = "druid.sapcloud.io/role";

/// Pod annotation carrying bytes written since the last snapshot
pub const DELTA_BYTES_ANNOTATION: &str = "druid.sapcloud.io/delta-snapshot-bytes";

/// Label identifying the maintenance kind of a job
pub const MAINTENANCE_KIND_LABEL: &str = "druid.sapcloud.io/maintenance-kind";

/// Annotation holding the template fingerprint on the workload and its pods
pub const FINGERPRINT_ANNOTATION: &str = "druid.sapcloud.io/template-fingerprint";

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Generate an owner reference for an Etcd
///
/// Every child resource is controlled by the Etcd so the platform's garbage
/// collector removes what the retention policy does not govern.
pub fn owner_reference(etcd: &Etcd) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: etcd.name_any(),
        uid: etcd.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels identifying every resource belonging to one Etcd
pub fn standard_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "etcd".to_string()),
        (INSTANCE_LABEL.to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Pod labels: user labels merged over the standard ones
///
/// The instance label cannot be overridden since selectors depend on it.
pub fn member_labels(etcd: &Etcd) -> BTreeMap<String, String> {
    let name = etcd.name_any();
    let mut labels = standard_labels(&name);

    for (key, value) in &etcd.spec.etcd.labels {
        if key != INSTANCE_LABEL {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Labels for a maintenance job
pub fn maintenance_labels(name: &str, kind: MaintenanceKind) -> BTreeMap<String, String> {
    let mut labels = standard_labels(name);
    labels.insert(MAINTENANCE_KIND_LABEL.to_string(), kind.slug().to_string());
    labels
}

/// Label selector string matching every member pod of a cluster
pub fn selector(name: &str) -> String {
    format!("app.kubernetes.io/name=etcd,{}={}", INSTANCE_LABEL, name)
}

pub fn pod_name(name: &str, ordinal: i32) -> String {
    format!("{}-{}", name, ordinal)
}

pub fn claim_name(name: &str, ordinal: i32) -> String {
    format!("{}-{}-{}", CLAIM_TEMPLATE, name, ordinal)
}

/// Ordinal encoded in a claim name, if the claim belongs to this cluster
pub fn claim_ordinal(name: &str, claim: &str) -> Option<i32> {
    claim
        .strip_prefix(&format!("{}-{}-", CLAIM_TEMPLATE, name))
        .and_then(|rest| rest.parse().ok())
}

/// Ordinal encoded in a pod name, if the pod belongs to this cluster
pub fn pod_ordinal(name: &str, pod: &str) -> Option<i32> {
    pod.strip_prefix(&format!("{}-", name))
        .and_then(|rest| rest.parse().ok())
}

pub fn peer_service_name(name: &str) -> String {
    format!("{}-peer", name)
}

pub fn client_service_name(etcd: &Etcd) -> String {
    etcd.spec
        .etcd
        .service_name
        .clone()
        .unwrap_or_else(|| format!("{}-client", etcd.name_any()))
}

pub fn config_map_name(name: &str) -> String {
    format!("{}-config", name)
}

/// Name of the maintenance job family reported as the backup ref
pub fn backup_name(name: &str) -> String {
    format!("{}-backup", name)
}

/// Quorum size for a member count
pub fn quorum(members: i32) -> i32 {
    members / 2 + 1
}

/// API server timestamp as a chrono instant
pub fn from_api_time(time: &Time) -> Option<DateTime<Utc>> {
    Some(time.0)
}

/// Chrono instant as an API server timestamp
pub fn to_api_time(at: DateTime<Utc>) -> Option<Time> {
    Some(Time(at))
}
