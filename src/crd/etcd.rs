use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Etcd is the Schema for the etcds API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "druid.sapcloud.io",
    version = "v1",
    kind = "Etcd",
    plural = "etcds",
    shortname = "etcd",
    namespaced,
    status = "EtcdStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Operation", "type":"string", "jsonPath":".status.lastOperation.type"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// Number of etcd members
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Configuration of the etcd members themselves
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Snapshot and garbage collection configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfig>,

    /// What happens to member volumes when members are removed
    #[serde(default)]
    pub pvc_retention_policy: PvcRetentionPolicy,

    /// Priority class applied to member pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

/// Member configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// etcd release, e.g. "v3.5.17"
    #[serde(default = "default_version")]
    pub version: String,

    /// Full image reference; overrides the image derived from `version`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Size of each member's data volume (e.g. "16Gi")
    #[serde(default = "default_storage_capacity")]
    pub storage_capacity: String,

    /// Storage class for member volumes (uses the cluster default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Data directory inside the member volume
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_client_port")]
    pub client_port: i32,

    #[serde(default = "default_peer_port")]
    pub peer_port: i32,

    /// Timeout for client connections (e.g. "5m", "30s")
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,

    /// Backend quota in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Cron expression for online defragmentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defragmentation_schedule: Option<String>,

    /// Name of the client service (defaults to "<name>-client")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Extra labels for member pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for member pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            image: None,
            storage_capacity: default_storage_capacity(),
            storage_class: None,
            data_dir: default_data_dir(),
            client_port: default_client_port(),
            peer_port: default_peer_port(),
            connection_timeout: default_connection_timeout(),
            quota_bytes: None,
            resources: None,
            defragmentation_schedule: None,
            service_name: None,
            tls: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_version() -> String {
    "v3.5.17".to_string()
}

fn default_storage_capacity() -> String {
    "16Gi".to_string()
}

fn default_data_dir() -> String {
    "/var/etcd/data/new.etcd".to_string()
}

fn default_client_port() -> i32 {
    2379
}

fn default_peer_port() -> i32 {
    2380
}

fn default_connection_timeout() -> String {
    "5m".to_string()
}

/// TLS material for client and peer traffic, referenced by secret name
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret holding ca.crt, tls.crt and tls.key for the client listener
    pub server_secret_ref: String,

    /// Secret used for peer traffic; peer traffic is plaintext if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_secret_ref: Option<String>,

    /// Client certificate used by the backup agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<String>,
}

/// Resource requirements for etcd and backup agent containers
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Snapshot schedule and object-store location
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Cron expression for full snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_snapshot_schedule: Option<String>,

    /// Period between delta snapshots, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_period_seconds: Option<i64>,

    /// Accumulated write volume (bytes) that triggers an early delta snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_memory_limit: Option<i64>,

    /// Period between snapshot garbage collections, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_period_seconds: Option<i64>,

    /// Backup agent image (defaults to the operator-wide agent image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Where snapshots are stored
    pub store: StoreSpec,
}

/// Object-store location for snapshots
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    pub provider: StorageProvider,

    /// Bucket or container name
    pub container: String,

    /// Key prefix inside the container
    pub prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Secret holding object-store credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Supported object-store providers
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum StorageProvider {
    S3,
    ABS,
    GCS,
    Swift,
    OSS,
    Local,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::S3 => write!(f, "S3"),
            StorageProvider::ABS => write!(f, "ABS"),
            StorageProvider::GCS => write!(f, "GCS"),
            StorageProvider::Swift => write!(f, "Swift"),
            StorageProvider::OSS => write!(f, "OSS"),
            StorageProvider::Local => write!(f, "Local"),
        }
    }
}

/// Which member volumes survive member removal or cluster deletion
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum PvcRetentionPolicy {
    /// Delete the volumes of every removed member
    DeleteAll,
    /// Delete every removed member's volume except the leader's
    RetainMaster,
    /// Never delete member volumes
    #[default]
    RetainAll,
}

impl std::fmt::Display for PvcRetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PvcRetentionPolicy::DeleteAll => write!(f, "DeleteAll"),
            PvcRetentionPolicy::RetainMaster => write!(f, "RetainMaster"),
            PvcRetentionPolicy::RetainAll => write!(f, "RetainAll"),
        }
    }
}

/// Status of the Etcd resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStatus {
    /// The workload running the members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ref: Option<ObjectReference>,

    /// The maintenance job family, when backups are configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<ObjectReference>,

    /// Conditions, at most one per type, in a fixed order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Members the platform currently materializes
    #[serde(default)]
    pub replicas: i32,

    /// Members whose endpoint reports healthy
    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub current_replicas: i32,

    #[serde(default)]
    pub updated_replicas: i32,

    /// Mirrors the Available condition
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<MemberEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Generation whose convergence has completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Generation rejected as unrealisable; cleared by a newer generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_generation: Option<i64>,

    /// Per-kind maintenance history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintenance: Vec<MaintenanceRecord>,

    /// Rolling update in progress, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutProgress>,

    /// Claims of removed members kept on purpose by the retention policy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retained_claims: Vec<String>,

    /// Identifier etcd assigned when the cluster bootstrapped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl EtcdStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn maintenance_record(&self, kind: MaintenanceKind) -> Option<&MaintenanceRecord> {
        self.maintenance.iter().find(|r| r.kind == kind)
    }

    /// Ordinal of the member last reported as leader
    pub fn last_known_leader(&self) -> Option<i32> {
        self.endpoints.iter().find(|e| e.leader).map(|e| e.ordinal)
    }
}

/// Reference to a managed object
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Condition types, in the order they appear in status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConditionType {
    /// Quorum of members is healthy
    Available,
    /// A member-set change is under way
    Progressing,
    /// Maintenance schedules are valid and the last snapshots succeeded
    BackupReady,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Available => write!(f, "Available"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::BackupReady => write!(f, "BackupReady"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
    Progressing,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
            ConditionStatus::Progressing => write!(f, "Progressing"),
        }
    }
}

/// A durable fact about the cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// Machine-readable reason for the current status
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,

    /// Last time the condition was evaluated
    pub last_update_time: DateTime<Utc>,
}

/// What the operator is doing right now
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: OperationType,

    pub state: OperationState,

    /// Completion estimate, 0-100
    pub progress: u8,

    pub description: String,

    pub last_update_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum OperationType {
    Create,
    Reconcile,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => write!(f, "Create"),
            OperationType::Reconcile => write!(f, "Reconcile"),
            OperationType::Delete => write!(f, "Delete"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum OperationState {
    Pending,
    Processing,
    Succeeded,
    Error,
    Failed,
    Aborted,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Pending => write!(f, "Pending"),
            OperationState::Processing => write!(f, "Processing"),
            OperationState::Succeeded => write!(f, "Succeeded"),
            OperationState::Error => write!(f, "Error"),
            OperationState::Failed => write!(f, "Failed"),
            OperationState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Liveness of a single member
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum MemberHealth {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A member as reported in status
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberEndpoint {
    pub name: String,
    pub ordinal: i32,
    pub port: i32,
    pub health: MemberHealth,
    #[serde(default)]
    pub leader: bool,
    /// When the member was first seen unhealthy in the current streak
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
}

/// Kinds of maintenance the operator schedules
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MaintenanceKind {
    FullSnapshot,
    DeltaSnapshot,
    GarbageCollection,
    Defragmentation,
}

impl MaintenanceKind {
    pub const ALL: [MaintenanceKind; 4] = [
        MaintenanceKind::FullSnapshot,
        MaintenanceKind::DeltaSnapshot,
        MaintenanceKind::GarbageCollection,
        MaintenanceKind::Defragmentation,
    ];

    /// Lowercase name used in job names and labels
    pub fn slug(&self) -> &'static str {
        match self {
            MaintenanceKind::FullSnapshot => "full-snapshot",
            MaintenanceKind::DeltaSnapshot => "delta-snapshot",
            MaintenanceKind::GarbageCollection => "garbage-collection",
            MaintenanceKind::Defragmentation => "defragmentation",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        MaintenanceKind::ALL.into_iter().find(|k| k.slug() == slug)
    }
}

impl std::fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceKind::FullSnapshot => write!(f, "FullSnapshot"),
            MaintenanceKind::DeltaSnapshot => write!(f, "DeltaSnapshot"),
            MaintenanceKind::GarbageCollection => write!(f, "GarbageCollection"),
            MaintenanceKind::Defragmentation => write!(f, "Defragmentation"),
        }
    }
}

/// Outcome of a finished maintenance task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// Maintenance history for one kind
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRecord {
    pub kind: MaintenanceKind,

    /// Latest schedule boundary consumed, whether triggered or suppressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,

    /// Task currently running for this kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<TaskOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl MaintenanceRecord {
    pub fn new(kind: MaintenanceKind) -> Self {
        Self {
            kind,
            last_scheduled: None,
            last_triggered: None,
            in_flight: None,
            last_completed: None,
            last_outcome: None,
            last_message: None,
        }
    }
}

/// Fields of the member template whose change requires a rolling update
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecField {
    Image,
    Resources,
    Configuration,
    BackupAgent,
    Scheduling,
}

/// Rolling update bookkeeping
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutProgress {
    /// Fields being rolled out
    pub fields: Vec<SpecField>,

    /// Members with an ordinal at or above this value run the new template
    pub partition: i32,

    /// When the current step was started
    pub step_started_at: DateTime<Utc>,
}
