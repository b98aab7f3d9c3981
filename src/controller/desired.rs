//! Desired state for one reconcile pass
//!
//! Resolves an `Etcd` into the values the rest of the pass works with. The
//! result is built once per pass and never mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::schedule::{Cadence, Schedules};
use crate::controller::validation::{validate_member, validate_replicas};
use crate::crd::{Etcd, MaintenanceKind, PvcRetentionPolicy, SpecField};
use crate::resources::common::from_api_time;
use crate::resources::configmap::render_config;

/// Hashes of the roll-relevant parts of the member template
///
/// Stored as an annotation on the workload so the next pass can tell which
/// fields differ without comparing full pod templates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFingerprint {
    pub image: String,
    pub resources: String,
    pub configuration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_agent: Option<String>,
    pub scheduling: String,
}

impl TemplateFingerprint {
    pub fn from_resource(etcd: &Etcd, image: &str, agent_image: Option<&str>) -> Self {
        let spec = &etcd.spec;

        Self {
            image: image.to_string(),
            resources: digest(&spec.etcd.resources),
            configuration: digest(&render_config(etcd, None)),
            backup_agent: spec.backup.as_ref().map(|backup| {
                digest(&(agent_image, &backup.store, &backup.resources, &spec.etcd.tls))
            }),
            scheduling: digest(&(
                &spec.priority_class_name,
                &spec.etcd.labels,
                &spec.etcd.annotations,
            )),
        }
    }

    /// Fields that differ from an observed fingerprint; all of them when unknown
    pub fn diff(&self, observed: Option<&TemplateFingerprint>) -> BTreeSet<SpecField> {
        let Some(observed) = observed else {
            return BTreeSet::from([
                SpecField::Image,
                SpecField::Resources,
                SpecField::Configuration,
                SpecField::BackupAgent,
                SpecField::Scheduling,
            ]);
        };

        let mut fields = BTreeSet::new();
        if self.image != observed.image {
            fields.insert(SpecField::Image);
        }
        if self.resources != observed.resources {
            fields.insert(SpecField::Resources);
        }
        if self.configuration != observed.configuration {
            fields.insert(SpecField::Configuration);
        }
        if self.backup_agent != observed.backup_agent {
            fields.insert(SpecField::BackupAgent);
        }
        if self.scheduling != observed.scheduling {
            fields.insert(SpecField::Scheduling);
        }
        fields
    }

    pub fn to_annotation(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_annotation(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }
}

fn digest<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    let hash = hex::encode(hasher.finalize());
    hash.chars().take(16).collect()
}

/// Validated view of what the cluster should look like
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    pub name: String,
    pub namespace: String,
    pub generation: i64,
    /// Where maintenance schedules start counting
    pub creation_time: DateTime<Utc>,
    pub deleting: bool,
    pub replicas: i32,
    pub client_port: i32,
    pub image: String,
    /// Backup agent image, when backups are configured
    pub agent_image: Option<String>,
    pub fingerprint: TemplateFingerprint,
    pub retention: PvcRetentionPolicy,
    pub schedules: Schedules,
    pub backup_enabled: bool,
}

impl DesiredState {
    /// Resolve an Etcd into the desired state for this pass
    ///
    /// Problems that no amount of retrying can fix surface as `FatalSpec`.
    /// Unusable schedules do not fail the pass: the affected kind is marked
    /// invalid and reported through status instead.
    pub fn from_resource(etcd: &Etcd, config: &OperatorConfig) -> Result<Self> {
        let name = etcd.name_any();
        let namespace = etcd
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

        validate_replicas(etcd.spec.replicas).map_err(into_fatal)?;
        validate_member(&etcd.spec).map_err(into_fatal)?;

        let image = etcd.spec.etcd.image.clone().unwrap_or_else(|| {
            format!("{}:{}", config.etcd_image_repository, etcd.spec.etcd.version)
        });

        let agent_image = etcd.spec.backup.as_ref().map(|backup| {
            backup
                .image
                .clone()
                .unwrap_or_else(|| config.backup_agent_image.clone())
        });

        let fingerprint = TemplateFingerprint::from_resource(etcd, &image, agent_image.as_deref());

        Ok(Self {
            name,
            namespace,
            generation: etcd.metadata.generation.unwrap_or(0),
            creation_time: etcd
                .metadata
                .creation_timestamp
                .as_ref()
                .and_then(from_api_time)
                .unwrap_or_else(Utc::now),
            deleting: etcd.metadata.deletion_timestamp.is_some(),
            replicas: etcd.spec.replicas,
            client_port: etcd.spec.etcd.client_port,
            image,
            agent_image,
            fingerprint,
            retention: etcd.spec.pvc_retention_policy,
            schedules: schedules(etcd),
            backup_enabled: etcd.spec.backup.is_some(),
        })
    }
}

fn into_fatal(error: Error) -> Error {
    match error {
        Error::ValidationError(msg) => Error::FatalSpec(msg),
        other => other,
    }
}

fn schedules(etcd: &Etcd) -> Schedules {
    let mut cadences = BTreeMap::new();
    cadences.insert(
        MaintenanceKind::Defragmentation,
        Cadence::from_cron(etcd.spec.etcd.defragmentation_schedule.as_deref()),
    );

    let Some(backup) = &etcd.spec.backup else {
        cadences.insert(MaintenanceKind::FullSnapshot, Cadence::Disabled);
        cadences.insert(MaintenanceKind::DeltaSnapshot, Cadence::Disabled);
        cadences.insert(MaintenanceKind::GarbageCollection, Cadence::Disabled);
        return Schedules {
            cadences,
            delta_memory_limit: None,
        };
    };

    let full = Cadence::from_cron(backup.full_snapshot_schedule.as_deref());
    let delta = match (&full, backup.delta_snapshot_period_seconds) {
        (Cadence::Cron(_), None | Some(0)) => Cadence::Invalid(
            "deltaSnapshotPeriodSeconds must be > 0 when a full snapshot schedule is set"
                .to_string(),
        ),
        (_, period) => Cadence::from_period(period),
    };

    cadences.insert(MaintenanceKind::FullSnapshot, full);
    cadences.insert(MaintenanceKind::DeltaSnapshot, delta);
    cadences.insert(
        MaintenanceKind::GarbageCollection,
        Cadence::from_period(backup.garbage_collection_period_seconds),
    );

    Schedules {
        cadences,
        delta_memory_limit: backup
            .delta_snapshot_memory_limit
            .and_then(|limit| u64::try_from(limit).ok())
            .filter(|limit| *limit > 0),
    }
}
