//! Process-wide operator configuration
//!
//! Everything here is read once from the environment at startup and is
//! immutable afterwards. Invalid values fall back to defaults with a warning.

use std::time::Duration;

use tracing::warn;

/// Default repository for etcd images; the tag is the cluster's version
pub const DEFAULT_ETCD_IMAGE_REPOSITORY: &str = "quay.io/coreos/etcd";

/// Default backup agent image
pub const DEFAULT_BACKUP_AGENT_IMAGE: &str =
    "europe-docker.pkg.dev/gardener-project/releases/gardener/etcdbrctl:v0.30.1";

#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Restrict the controller to a single namespace
    pub watch_namespace: Option<String>,
    pub etcd_image_repository: String,
    pub backup_agent_image: String,
    /// Requeue interval for converged clusters
    pub resync_interval: Duration,
    /// How long a rolling update waits for one member to become healthy
    pub member_ready_timeout: Duration,
    /// How long a member may stay unhealthy before Available turns False
    pub unhealthy_grace_period: Duration,
    pub enable_leader_election: bool,
    pub health_port: u16,
    pub webhook_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            etcd_image_repository: DEFAULT_ETCD_IMAGE_REPOSITORY.to_string(),
            backup_agent_image: DEFAULT_BACKUP_AGENT_IMAGE.to_string(),
            resync_interval: Duration::from_secs(300),
            member_ready_timeout: Duration::from_secs(600),
            unhealthy_grace_period: Duration::from_secs(120),
            enable_leader_election: true,
            health_port: 8080,
            webhook_port: 8443,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            etcd_image_repository: lookup("ETCD_DEFAULT_IMAGE_REPOSITORY")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.etcd_image_repository),
            backup_agent_image: lookup("ETCD_BACKUP_AGENT_IMAGE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.backup_agent_image),
            resync_interval: seconds(&lookup, "ETCD_RESYNC_INTERVAL_SECS", defaults.resync_interval),
            member_ready_timeout: seconds(
                &lookup,
                "ETCD_MEMBER_READY_TIMEOUT_SECS",
                defaults.member_ready_timeout,
            ),
            unhealthy_grace_period: seconds(
                &lookup,
                "ETCD_UNHEALTHY_GRACE_SECS",
                defaults.unhealthy_grace_period,
            ),
            enable_leader_election: match lookup("ETCD_ENABLE_LEADER_ELECTION").as_deref() {
                None => defaults.enable_leader_election,
                Some("true") | Some("1") => true,
                Some("false") | Some("0") => false,
                Some(other) => {
                    warn!(value = %other, "Invalid ETCD_ENABLE_LEADER_ELECTION, using default");
                    defaults.enable_leader_election
                }
            },
            health_port: port(&lookup, "HEALTH_PORT", defaults.health_port),
            webhook_port: port(&lookup, "WEBHOOK_PORT", defaults.webhook_port),
        }
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(key, value = %raw, "Invalid duration in seconds, using default");
                default
            }
        },
    }
}

fn port<F>(lookup: &F, key: &str, default: u16) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => {
                warn!(key, value = %raw, "Invalid port, using default");
                default
            }
        },
    }
}
