//! StatefulSet generation for etcd members
//!
//! One StatefulSet runs every member of a cluster. Member identity is the pod
//! ordinal, each member owns the claim `data-<name>-<ordinal>`, and rollouts
//! are driven by the operator through the rolling-update partition rather
//! than by the platform's own controller.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy,
    StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource, EnvVar,
    EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, SeccompProfile, SecretEnvSource, SecretVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::desired::DesiredState;
use crate::crd::{Etcd, ResourceList, ResourceRequirements};
use crate::resources::common::{
    CLAIM_TEMPLATE, FINGERPRINT_ANNOTATION, config_map_name, member_labels, owner_reference,
    peer_service_name, standard_labels,
};
use crate::resources::configmap::{CONFIG_KEY, CONFIG_MOUNT_PATH, METRICS_PORT, TLS_MOUNT_PATH};

/// Port of the backup agent sidecar
pub const BACKUP_AGENT_PORT: i32 = 8080;

const CONFIG_VOLUME: &str = "etcd-config";

/// Map CRD resource requirements onto the Kubernetes type
pub fn resource_requirements(resources: &ResourceRequirements) -> K8sResourceRequirements {
    fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    }

    K8sResourceRequirements {
        limits: resources.limits.as_ref().map(quantities),
        requests: resources.requests.as_ref().map(quantities),
        ..Default::default()
    }
}

/// Secret volumes and mounts for the configured TLS material
///
/// Each secret is mounted at `<TLS_MOUNT_PATH>/<purpose>`.
pub fn tls_volumes(etcd: &Etcd, purposes: &[&str]) -> (Vec<Volume>, Vec<VolumeMount>) {
    let Some(tls) = etcd.spec.etcd.tls.as_ref() else {
        return (Vec::new(), Vec::new());
    };

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    for purpose in purposes {
        let secret = match *purpose {
            "server" => Some(&tls.server_secret_ref),
            "peer" => tls.peer_secret_ref.as_ref(),
            "client" => tls.client_secret_ref.as_ref(),
            _ => None,
        };
        let Some(secret) = secret else {
            continue;
        };

        let volume_name = format!("tls-{}", purpose);
        volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                default_mode: Some(0o640),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{}/{}", TLS_MOUNT_PATH, purpose),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_anti_affinity(name: &str) -> Affinity {
    let term = |weight, topology_key: &str| WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "app.kubernetes.io/instance".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![name.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: topology_key.to_string(),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                term(100, "kubernetes.io/hostname"),
                term(50, "topology.kubernetes.io/zone"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn etcd_container(etcd: &Etcd, desired: &DesiredState, tls_mounts: Vec<VolumeMount>) -> Container {
    let cfg = &etcd.spec.etcd;

    let health_probe = |initial_delay, failure_threshold| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::Int(METRICS_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let mut volume_mounts = vec![
        VolumeMount {
            name: CLAIM_TEMPLATE.to_string(),
            mount_path: "/var/etcd/data".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    volume_mounts.extend(tls_mounts);

    // The shared configuration carries ${POD_NAME} placeholders
    let startup = format!(
        "sed \"s/\\${{POD_NAME}}/${{POD_NAME}}/g\" {dir}/{key} > /tmp/{key} && exec etcd --config-file /tmp/{key}",
        dir = CONFIG_MOUNT_PATH,
        key = CONFIG_KEY,
    );

    Container {
        name: "etcd".to_string(),
        image: Some(desired.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-ec".to_string(), startup]),
        ports: Some(vec![
            ContainerPort {
                container_port: cfg.client_port,
                name: Some("client".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: cfg.peer_port,
                name: Some("peer".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: METRICS_PORT,
                name: Some("metrics".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(volume_mounts),
        resources: cfg.resources.as_ref().map(resource_requirements),
        readiness_probe: Some(health_probe(15, 3)),
        liveness_probe: Some(health_probe(60, 6)),
        ..Default::default()
    }
}

fn backup_agent_container(
    etcd: &Etcd,
    desired: &DesiredState,
    tls_mounts: Vec<VolumeMount>,
) -> Option<Container> {
    let backup = etcd.spec.backup.as_ref()?;
    let image = desired.agent_image.clone()?;
    let name = etcd.name_any();
    let cfg = &etcd.spec.etcd;

    let scheme = if cfg.tls.is_some() { "https" } else { "http" };
    let mut args = vec![
        "server".to_string(),
        format!("--endpoints={}://${{POD_NAME}}.{}:{}", scheme, peer_service_name(&name), cfg.client_port),
        format!("--server-port={}", BACKUP_AGENT_PORT),
        format!("--storage-provider={}", backup.store.provider),
        format!("--store-container={}", backup.store.container),
        format!("--store-prefix={}", backup.store.prefix),
        "--report-role-label".to_string(),
        "--report-delta-bytes".to_string(),
    ];
    if cfg.tls.as_ref().is_some_and(|t| t.client_secret_ref.is_some()) {
        args.push(format!("--cacert={}/client/ca.crt", TLS_MOUNT_PATH));
        args.push(format!("--cert={}/client/tls.crt", TLS_MOUNT_PATH));
        args.push(format!("--key={}/client/tls.key", TLS_MOUNT_PATH));
    }

    let mut env = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
    ];
    if let Some(region) = &backup.store.region {
        env.push(EnvVar {
            name: "STORE_REGION".to_string(),
            value: Some(region.clone()),
            ..Default::default()
        });
    }

    Some(Container {
        name: "backup-agent".to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["etcdbrctl".to_string()]),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            container_port: BACKUP_AGENT_PORT,
            name: Some("backup-agent".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        env_from: backup.store.secret_ref.as_ref().map(|secret| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }]
        }),
        volume_mounts: Some(tls_mounts),
        resources: backup.resources.as_ref().map(resource_requirements),
        ..Default::default()
    })
}

/// Generate the member StatefulSet
///
/// `replicas` and `partition` are passed separately from `desired` because a
/// template write carries over the observed member count while the partition
/// is stepped by the planner.
pub fn generate_statefulset(
    etcd: &Etcd,
    desired: &DesiredState,
    replicas: i32,
    partition: i32,
) -> StatefulSet {
    let name = etcd.name_any();
    let cfg = &etcd.spec.etcd;
    let fingerprint = desired.fingerprint.to_annotation();

    let mut pod_annotations = cfg.annotations.clone();
    pod_annotations.insert(FINGERPRINT_ANNOTATION.to_string(), fingerprint.clone());

    let (mut volumes, etcd_tls_mounts) = tls_volumes(etcd, &["server", "peer"]);
    let (agent_volumes, agent_tls_mounts) = tls_volumes(etcd, &["client"]);
    volumes.extend(agent_volumes);
    volumes.push(Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(&name),
            default_mode: Some(0o644),
            ..Default::default()
        }),
        ..Default::default()
    });

    let mut containers = vec![etcd_container(etcd, desired, etcd_tls_mounts)];
    containers.extend(backup_agent_container(etcd, desired, agent_tls_mounts));

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(CLAIM_TEMPLATE.to_string()),
            labels: Some(standard_labels(&name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cfg.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cfg.storage_capacity.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: etcd.namespace(),
            labels: Some(standard_labels(&name)),
            annotations: Some(BTreeMap::from([(
                FINGERPRINT_ANNOTATION.to_string(),
                fingerprint,
            )])),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(peer_service_name(&name)),
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(standard_labels(&name)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(partition),
                    ..Default::default()
                }),
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(member_labels(etcd)),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    priority_class_name: etcd.spec.priority_class_name.clone(),
                    termination_grace_period_seconds: Some(30),
                    affinity: Some(generate_anti_affinity(&name)),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(65532),
                        fs_group: Some(65532),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            // Claim deletion is decided by the retention policy, never by the platform
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}
