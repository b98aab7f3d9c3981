//! Observed state collection
//!
//! Folds the raw platform objects belonging to one cluster into the shape the
//! planner and the status aggregator consume. Collection is pure so tests can
//! build observed state from fixtures without an API server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use crate::controller::desired::TemplateFingerprint;
use crate::controller::membership::Membership;
use crate::crd::{MaintenanceKind, MemberHealth};
use crate::resources::common::{
    DELTA_BYTES_ANNOTATION, FINGERPRINT_ANNOTATION, MAINTENANCE_KIND_LABEL, ROLE_LABEL,
    claim_ordinal, from_api_time, pod_name, pod_ordinal,
};

/// The replicated workload as last seen
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadState {
    pub name: String,
    /// Revision guarding optimistic-concurrency writes
    pub resource_version: Option<String>,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub current_replicas: i32,
    pub updated_replicas: i32,
    pub current_revision: Option<String>,
    pub update_revision: Option<String>,
    pub fingerprint: Option<TemplateFingerprint>,
    /// Rolling-update partition; members at or above it run the update revision
    pub partition: i32,
    pub generation: i64,
    pub observed_generation: i64,
}

impl WorkloadState {
    /// The platform has not yet acted on the latest workload write
    pub fn is_syncing(&self) -> bool {
        self.observed_generation < self.generation
    }
}

/// One member pod
#[derive(Clone, Debug, PartialEq)]
pub struct MemberState {
    pub ordinal: i32,
    pub name: String,
    pub health: MemberHealth,
    /// Workload revision the pod was created from
    pub revision: Option<String>,
    pub leader: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

/// Progress of one maintenance task
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSignal {
    pub kind: MaintenanceKind,
    pub name: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Everything the pass knows about the running cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedState {
    pub workload: Option<WorkloadState>,
    /// Members ordered by ordinal; absent pods within range are `Unknown`
    pub members: Vec<MemberState>,
    /// Bound claims by member ordinal
    pub claims: BTreeMap<i32, Vec<String>>,
    pub leader: Option<i32>,
    /// Bytes written since the last snapshot, as reported by the leader
    pub delta_bytes: Option<u64>,
    pub tasks: Vec<TaskSignal>,
    /// Member list reported by etcd; `None` when no member could be asked
    pub membership: Option<Membership>,
}

impl ObservedState {
    /// Members the platform currently materializes
    pub fn materialized(&self) -> i32 {
        count(self.members.iter().filter(|m| m.health != MemberHealth::Unknown))
    }

    pub fn healthy(&self) -> i32 {
        count(self.members.iter().filter(|m| m.health == MemberHealth::Healthy))
    }

    pub fn member(&self, ordinal: i32) -> Option<&MemberState> {
        self.members.iter().find(|m| m.ordinal == ordinal)
    }

    /// Replica count of the workload, 0 when it does not exist
    pub fn workload_replicas(&self) -> i32 {
        self.workload.as_ref().map(|w| w.replicas).unwrap_or(0)
    }

    pub fn task(&self, name: &str) -> Option<&TaskSignal> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

fn count<I: Iterator>(iter: I) -> i32 {
    i32::try_from(iter.count()).unwrap_or(i32::MAX)
}

/// Build observed state from the platform objects of the cluster `name`
pub fn collect(
    name: &str,
    statefulset: Option<&StatefulSet>,
    pods: &[Pod],
    claims: &[PersistentVolumeClaim],
    jobs: &[Job],
) -> ObservedState {
    let workload = statefulset.map(|sts| workload_state(name, sts));
    let replicas = workload.as_ref().map(|w| w.replicas).unwrap_or(0);

    let mut by_ordinal: BTreeMap<i32, MemberState> = pods
        .iter()
        .filter_map(|pod| member_state(name, pod))
        .map(|m| (m.ordinal, m))
        .collect();

    for ordinal in 0..replicas {
        by_ordinal.entry(ordinal).or_insert_with(|| MemberState {
            ordinal,
            name: pod_name(name, ordinal),
            health: MemberHealth::Unknown,
            revision: None,
            leader: false,
        });
    }

    let labelled_leader = by_ordinal.values().find(|m| m.leader).map(|m| m.ordinal);
    let leader = labelled_leader.or_else(|| {
        by_ordinal
            .get(&0)
            .filter(|m| m.health != MemberHealth::Unknown)
            .map(|m| m.ordinal)
    });

    let delta_bytes = leader.and_then(|ordinal| {
        pods.iter()
            .find(|pod| {
                pod.metadata
                    .name
                    .as_deref()
                    .and_then(|n| pod_ordinal(name, n))
                    == Some(ordinal)
            })
            .and_then(|pod| pod.metadata.annotations.as_ref())
            .and_then(|a| a.get(DELTA_BYTES_ANNOTATION))
            .and_then(|v| v.parse().ok())
    });

    let mut claims_by_ordinal: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for claim in claims {
        if claim.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(claim_name) = claim.metadata.name.as_deref() else {
            continue;
        };
        if let Some(ordinal) = claim_ordinal(name, claim_name) {
            claims_by_ordinal
                .entry(ordinal)
                .or_default()
                .push(claim_name.to_string());
        }
    }
    for names in claims_by_ordinal.values_mut() {
        names.sort();
    }

    let mut tasks: Vec<TaskSignal> = jobs.iter().filter_map(task_signal).collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name));

    ObservedState {
        workload,
        members: by_ordinal.into_values().collect(),
        claims: claims_by_ordinal,
        leader,
        delta_bytes,
        tasks,
        membership: None,
    }
}

fn workload_state(name: &str, sts: &StatefulSet) -> WorkloadState {
    let spec = sts.spec.as_ref();
    let status = sts.status.as_ref();

    WorkloadState {
        name: sts.metadata.name.clone().unwrap_or_else(|| name.to_string()),
        resource_version: sts.metadata.resource_version.clone(),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(0),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        current_replicas: status.and_then(|s| s.current_replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        current_revision: status.and_then(|s| s.current_revision.clone()),
        update_revision: status.and_then(|s| s.update_revision.clone()),
        fingerprint: sts
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FINGERPRINT_ANNOTATION))
            .and_then(|v| TemplateFingerprint::from_annotation(v)),
        partition: spec
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|u| u.rolling_update.as_ref())
            .and_then(|r| r.partition)
            .unwrap_or(0),
        generation: sts.metadata.generation.unwrap_or(0),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
    }
}

fn member_state(name: &str, pod: &Pod) -> Option<MemberState> {
    let pod_name = pod.metadata.name.as_deref()?;
    let ordinal = pod_ordinal(name, pod_name)?;

    let terminating = pod.metadata.deletion_timestamp.is_some();
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });

    let labels = pod.metadata.labels.as_ref();

    Some(MemberState {
        ordinal,
        name: pod_name.to_string(),
        health: if ready && !terminating {
            MemberHealth::Healthy
        } else {
            MemberHealth::Unhealthy
        },
        revision: labels
            .and_then(|l| l.get("controller-revision-hash"))
            .cloned(),
        leader: labels
            .and_then(|l| l.get(ROLE_LABEL))
            .is_some_and(|role| role == "leader"),
    })
}

/// Progress of a maintenance job, `None` for jobs of other owners
fn task_signal(job: &Job) -> Option<TaskSignal> {
    let kind = job
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MAINTENANCE_KIND_LABEL))
        .and_then(|slug| MaintenanceKind::from_slug(slug))?;
    let name = job.metadata.name.clone()?;
    let status = job.status.as_ref();

    let finished = |type_: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == type_ && c.status == "True")
            })
            .map(|c| {
                (
                    c.last_transition_time.as_ref().and_then(from_api_time),
                    c.message.clone(),
                )
            })
    };

    let (state, finished_at, message) = if let Some((at, msg)) = finished("Complete") {
        (TaskState::Succeeded, at, msg)
    } else if let Some((at, msg)) = finished("Failed") {
        (TaskState::Failed, at, msg)
    } else {
        (TaskState::Running, None, None)
    };

    Some(TaskSignal {
        kind,
        name,
        state,
        started_at: status
            .and_then(|s| s.start_time.as_ref())
            .and_then(from_api_time)
            .or_else(|| {
                job.metadata
                    .creation_timestamp
                    .as_ref()
                    .and_then(from_api_time)
            }),
        finished_at: finished_at
            .or_else(|| {
                status
                    .and_then(|s| s.completion_time.as_ref())
                    .and_then(from_api_time)
            }),
        message,
    })
}
