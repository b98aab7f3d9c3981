//! ConfigMap generation for etcd member configuration
//!
//! Members read `etcd.conf.yaml` at startup. The initial cluster list and state
//! depend on where the cluster is in its life: the first member bootstraps a
//! one-member cluster on its own, every later member joins the running cluster
//! as `existing` with the members registered so far. Both are kept out of the
//! rendering used for the template fingerprint, so scaling never triggers a
//! rolling update.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::validation::parse_duration;
use crate::crd::Etcd;
use crate::resources::common::{
    config_map_name, owner_reference, peer_service_name, pod_name, standard_labels,
};

/// Key of the configuration file inside the ConfigMap
pub const CONFIG_KEY: &str = "etcd.conf.yaml";

/// Mount path of the configuration inside member containers
pub const CONFIG_MOUNT_PATH: &str = "/var/etcd/config";

/// Mount path of TLS material inside member containers
pub const TLS_MOUNT_PATH: &str = "/var/etcd/ssl";

/// Plaintext listener serving `/health` and `/metrics` for probes
pub const METRICS_PORT: i32 = 2381;

/// Value of `initial-cluster-state`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

/// Bootstrap parameters of a member starting without data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitialCluster {
    /// Ordinals `0..members` are listed in `initial-cluster`
    pub members: i32,
    pub state: ClusterState,
}

impl InitialCluster {
    /// Member 0 alone forms the cluster
    pub fn bootstrap() -> Self {
        Self {
            members: 1,
            state: ClusterState::New,
        }
    }

    /// Members join the running cluster made of ordinals `0..members`
    pub fn existing(members: i32) -> Self {
        Self {
            members: members.max(1),
            state: ClusterState::Existing,
        }
    }
}

/// Peer URL member `ordinal` advertises
pub fn peer_url(etcd: &Etcd, ordinal: i32) -> String {
    let name = etcd.name_any();
    let ns = etcd.namespace().unwrap_or_else(|| "default".to_string());
    let member = pod_name(&name, ordinal);
    format!(
        "{}://{}.{}.{}.svc:{}",
        peer_scheme(etcd),
        member,
        peer_service_name(&name),
        ns,
        etcd.spec.etcd.peer_port
    )
}

fn peer_scheme(etcd: &Etcd) -> &'static str {
    match &etcd.spec.etcd.tls {
        Some(tls) if tls.peer_secret_ref.is_some() => "https",
        _ => "http",
    }
}

/// Generate the member configuration ConfigMap
pub fn generate_config_map(etcd: &Etcd, cluster: &InitialCluster) -> ConfigMap {
    let name = etcd.name_any();

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&name)),
            namespace: etcd.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            render_config(etcd, Some(cluster)),
        )])),
        ..Default::default()
    }
}

/// Render the configuration file
///
/// With `cluster` unset the initial-cluster entries are omitted.
pub fn render_config(etcd: &Etcd, cluster: Option<&InitialCluster>) -> String {
    let name = etcd.name_any();
    let ns = etcd.namespace().unwrap_or_else(|| "default".to_string());
    let cfg = &etcd.spec.etcd;
    let peer_service = peer_service_name(&name);

    let client_scheme = if cfg.tls.is_some() { "https" } else { "http" };
    let peer_scheme = peer_scheme(etcd);

    // Values the platform substitutes per pod at startup
    let mut lines = vec![
        "name: ${POD_NAME}".to_string(),
        format!("data-dir: {}", cfg.data_dir),
        "metrics: basic".to_string(),
        format!("listen-metrics-urls: http://0.0.0.0:{}", METRICS_PORT),
        "snapshot-count: 75000".to_string(),
        "enable-v2: false".to_string(),
        format!(
            "quota-backend-bytes: {}",
            cfg.quota_bytes.unwrap_or(8 * 1024 * 1024 * 1024)
        ),
        format!("listen-client-urls: {}://0.0.0.0:{}", client_scheme, cfg.client_port),
        format!(
            "advertise-client-urls: {}://${{POD_NAME}}.{}.{}.svc:{}",
            client_scheme, peer_service, ns, cfg.client_port
        ),
        format!("listen-peer-urls: {}://0.0.0.0:{}", peer_scheme, cfg.peer_port),
        format!(
            "initial-advertise-peer-urls: {}://${{POD_NAME}}.{}.{}.svc:{}",
            peer_scheme, peer_service, ns, cfg.peer_port
        ),
        format!("initial-cluster-token: etcd-{}", name),
        "auto-compaction-mode: periodic".to_string(),
        "auto-compaction-retention: 30m".to_string(),
    ];

    // Go-style duration seconds; validation has already rejected malformed values
    if let Ok(timeout) = parse_duration(&cfg.connection_timeout) {
        lines.push(format!("grpc-keepalive-timeout: {}s", timeout.as_secs()));
    }

    if let Some(cluster) = cluster {
        let initial_cluster = (0..cluster.members.max(1))
            .map(|ordinal| format!("{}={}", pod_name(&name, ordinal), peer_url(etcd, ordinal)))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("initial-cluster: {}", initial_cluster));
        lines.push(format!("initial-cluster-state: {}", cluster.state.as_str()));
    }

    if let Some(tls) = &cfg.tls {
        lines.push("client-transport-security:".to_string());
        lines.push(format!("  cert-file: {}/server/tls.crt", TLS_MOUNT_PATH));
        lines.push(format!("  key-file: {}/server/tls.key", TLS_MOUNT_PATH));
        lines.push(format!("  trusted-ca-file: {}/server/ca.crt", TLS_MOUNT_PATH));
        lines.push("  client-cert-auth: true".to_string());
        lines.push("  auto-tls: false".to_string());
        if tls.peer_secret_ref.is_some() {
            lines.push("peer-transport-security:".to_string());
            lines.push(format!("  cert-file: {}/peer/tls.crt", TLS_MOUNT_PATH));
            lines.push(format!("  key-file: {}/peer/tls.key", TLS_MOUNT_PATH));
            lines.push(format!("  trusted-ca-file: {}/peer/ca.crt", TLS_MOUNT_PATH));
            lines.push("  client-cert-auth: true".to_string());
            lines.push("  auto-tls: false".to_string());
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
