//! Maintenance job generation
//!
//! Each triggered maintenance task runs as one Job. Jobs never retry on
//! their own: a failed task waits for the next schedule boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::desired::DesiredState;
use crate::crd::{Etcd, MaintenanceKind};
use crate::resources::common::{client_service_name, maintenance_labels, owner_reference};
use crate::resources::configmap::TLS_MOUNT_PATH;
use crate::resources::statefulset::{resource_requirements, tls_volumes};

/// Finished jobs are garbage-collected after this many seconds
pub const JOB_TTL_SECONDS: i32 = 3600;

/// Name of the job for a kind triggered at `now`
///
/// The name is derived from the trigger time, so resubmitting the same
/// boundary targets the same job.
pub fn job_name(name: &str, kind: MaintenanceKind, now: DateTime<Utc>) -> String {
    format!("{}-{}-{}", name, kind.slug(), now.timestamp())
}

fn command(etcd: &Etcd, kind: MaintenanceKind) -> (Vec<String>, Vec<String>) {
    let cfg = &etcd.spec.etcd;
    let scheme = if cfg.tls.is_some() { "https" } else { "http" };
    let endpoint = format!(
        "--endpoints={}://{}:{}",
        scheme,
        client_service_name(etcd),
        cfg.client_port
    );

    let (command, mut args) = match kind {
        MaintenanceKind::Defragmentation => (
            vec!["etcdctl".to_string()],
            vec!["defrag".to_string(), "--cluster".to_string(), endpoint],
        ),
        MaintenanceKind::FullSnapshot => (
            vec!["etcdbrctl".to_string()],
            vec!["snapshot".to_string(), "--full".to_string(), endpoint],
        ),
        MaintenanceKind::DeltaSnapshot => (
            vec!["etcdbrctl".to_string()],
            vec!["snapshot".to_string(), "--delta".to_string(), endpoint],
        ),
        MaintenanceKind::GarbageCollection => (
            vec!["etcdbrctl".to_string()],
            vec!["gc".to_string(), endpoint],
        ),
    };

    if kind != MaintenanceKind::Defragmentation
        && let Some(backup) = &etcd.spec.backup
    {
        args.push(format!("--storage-provider={}", backup.store.provider));
        args.push(format!("--store-container={}", backup.store.container));
        args.push(format!("--store-prefix={}", backup.store.prefix));
    }

    if cfg.tls.as_ref().is_some_and(|t| t.client_secret_ref.is_some()) {
        args.push(format!("--cacert={}/client/ca.crt", TLS_MOUNT_PATH));
        args.push(format!("--cert={}/client/tls.crt", TLS_MOUNT_PATH));
        args.push(format!("--key={}/client/tls.key", TLS_MOUNT_PATH));
    }

    (command, args)
}

/// Generate the Job for one maintenance task
pub fn generate_job(
    etcd: &Etcd,
    desired: &DesiredState,
    kind: MaintenanceKind,
    now: DateTime<Utc>,
) -> Job {
    let name = etcd.name_any();
    let labels = maintenance_labels(&name, kind);
    let backup = etcd.spec.backup.as_ref();

    // Defragmentation only needs etcdctl, shipped with the member image
    let image = match kind {
        MaintenanceKind::Defragmentation => desired.image.clone(),
        _ => desired
            .agent_image
            .clone()
            .unwrap_or_else(|| desired.image.clone()),
    };

    let (command, args) = command(etcd, kind);
    let (volumes, mounts) = tls_volumes(etcd, &["client"]);

    let container = Container {
        name: kind.slug().to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(command),
        args: Some(args),
        env_from: backup
            .and_then(|b| b.store.secret_ref.as_ref())
            .filter(|_| kind != MaintenanceKind::Defragmentation)
            .map(|secret| {
                vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: secret.clone(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }]
            }),
        volume_mounts: Some(mounts),
        resources: backup
            .and_then(|b| b.resources.as_ref())
            .map(resource_requirements),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(&name, kind, now)),
            namespace: etcd.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                "druid.sapcloud.io/scheduled-at".to_string(),
                now.to_rfc3339(),
            )])),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    priority_class_name: etcd.spec.priority_class_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
