//! Validation logic for Etcd specs
//!
//! The same checks run at admission time (webhook) and at reconcile time, so a
//! resource that slipped past admission is still caught before it is acted on.

use std::str::FromStr;
use std::time::Duration;

use crate::controller::error::{Error, Result};
use crate::crd::{BackupConfig, Etcd, EtcdSpec};

/// Minimum number of members
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of members (etcd does not benefit from more)
pub const MAX_REPLICAS: i32 = 9;

/// Validate the whole spec
pub fn validate_spec(etcd: &Etcd) -> Result<()> {
    validate_replicas(etcd.spec.replicas)?;
    validate_member(&etcd.spec)?;
    validate_schedules(&etcd.spec)?;
    Ok(())
}

/// Validate member count
pub fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

/// Validate the fields that decide whether a member can start at all
pub fn validate_member(spec: &EtcdSpec) -> Result<()> {
    let etcd = &spec.etcd;

    if let Some(image) = &etcd.image {
        validate_image_reference(image)?;
    } else {
        validate_version(&etcd.version)?;
    }

    validate_quantity(&etcd.storage_capacity)
        .map_err(|e| Error::ValidationError(format!("storageCapacity: {}", e)))?;

    parse_duration(&etcd.connection_timeout)
        .map_err(|e| Error::ValidationError(format!("connectionTimeout: {}", e)))?;

    for (field, port) in [("clientPort", etcd.client_port), ("peerPort", etcd.peer_port)] {
        if !(1..=65535).contains(&port) {
            return Err(Error::ValidationError(format!(
                "{} {} is out of range",
                field, port
            )));
        }
    }
    if etcd.client_port == etcd.peer_port {
        return Err(Error::ValidationError(
            "clientPort and peerPort must differ".to_string(),
        ));
    }

    if let Some(quota) = etcd.quota_bytes
        && quota <= 0
    {
        return Err(Error::ValidationError(
            "quotaBytes must be positive".to_string(),
        ));
    }

    if let Some(backup) = &spec.backup
        && let Some(image) = &backup.image
    {
        validate_image_reference(image)?;
    }

    Ok(())
}

/// Validate every schedule and period in the spec
pub fn validate_schedules(spec: &EtcdSpec) -> Result<()> {
    if let Some(expr) = &spec.etcd.defragmentation_schedule {
        parse_cron(expr)
            .map_err(|e| Error::ValidationError(format!("defragmentationSchedule: {}", e)))?;
    }

    if let Some(backup) = &spec.backup {
        validate_backup(backup)?;
    }

    Ok(())
}

/// Validate backup schedules, periods and limits
pub fn validate_backup(backup: &BackupConfig) -> Result<()> {
    if let Some(expr) = &backup.full_snapshot_schedule {
        parse_cron(expr)
            .map_err(|e| Error::ValidationError(format!("fullSnapshotSchedule: {}", e)))?;

        match backup.delta_snapshot_period_seconds {
            Some(period) if period > 0 => {}
            Some(period) => {
                return Err(Error::ValidationError(format!(
                    "deltaSnapshotPeriodSeconds must be > 0 when a full snapshot schedule is set, got {}",
                    period
                )));
            }
            None => {
                return Err(Error::ValidationError(
                    "deltaSnapshotPeriodSeconds is required when a full snapshot schedule is set"
                        .to_string(),
                ));
            }
        }
    } else if let Some(period) = backup.delta_snapshot_period_seconds
        && period < 0
    {
        return Err(Error::ValidationError(format!(
            "deltaSnapshotPeriodSeconds must not be negative, got {}",
            period
        )));
    }

    if let Some(limit) = backup.delta_snapshot_memory_limit
        && limit <= 0
    {
        return Err(Error::ValidationError(format!(
            "deltaSnapshotMemoryLimit must be positive, got {}",
            limit
        )));
    }

    if let Some(period) = backup.garbage_collection_period_seconds
        && period <= 0
    {
        return Err(Error::ValidationError(format!(
            "garbageCollectionPeriodSeconds must be positive, got {}",
            period
        )));
    }

    if backup.store.container.is_empty() {
        return Err(Error::ValidationError(
            "store.container must not be empty".to_string(),
        ));
    }

    Ok(())
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parse a cron expression
///
/// Accepts the classic five-field form (minute precision) as well as the
/// six/seven-field form with a leading seconds field. In the five-field form
/// the day-of-week field counts from 0 (Sunday) to 7 (Sunday again) and is
/// rewritten to day names, since the cron crate numbers Sunday as 1.
pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, String> {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = weekday_names(weekday)
                .map_err(|e| format!("invalid cron expression {:?}: {}", expr, e))?;
            format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)
        }
        fields if fields.len() == 6 || fields.len() == 7 => trimmed.to_string(),
        fields => {
            return Err(format!(
                "invalid cron expression {:?}: expected 5 to 7 fields, found {}",
                expr,
                fields.len()
            ));
        }
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression {:?}: {}", expr, e))
}

/// Rewrite a numeric day-of-week field (0-7, Sunday is 0 and 7) to day names
///
/// Wildcards and elements already written with names are left alone.
fn weekday_names(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" || field.starts_with("*/") {
        return Ok(field.to_string());
    }

    let mut out: Vec<String> = Vec::new();
    for element in field.split(',') {
        if element.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(element.to_string());
            continue;
        }

        let (range, step) = match element.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step {:?}", element))?;
                if step == 0 {
                    return Err(format!("invalid day-of-week step {:?}", element));
                }
                (range, step)
            }
            None => (element, 1),
        };

        let day = |value: &str| -> std::result::Result<u8, String> {
            match value.parse::<u8>() {
                Ok(n) if n <= 7 => Ok(n),
                _ => Err(format!("day of week {:?} is outside 0-7", value)),
            }
        };
        let (first, last) = match range.split_once('-') {
            Some((a, b)) => (day(a)?, day(b)?),
            None if step > 1 => (day(range)?, 6),
            None => {
                let n = day(range)?;
                (n, n)
            }
        };
        if first > last {
            return Err(format!("day-of-week range {:?} runs backwards", element));
        }

        for n in (first..=last).step_by(usize::from(step)) {
            let name = WEEKDAYS[usize::from(n % 7)].to_string();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }

    Ok(out.join(","))
}

/// Parse a duration such as "30s", "5m", "1h30m"
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    if value.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {:?}", value))?;
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration unit {:?} in {:?}", ch, value)),
        };
        total = total.saturating_add(amount.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("duration {:?} is missing a unit", value));
    }

    Ok(Duration::from_secs(total))
}

/// Validate a Kubernetes quantity used for storage (e.g. "16Gi")
pub fn validate_quantity(size: &str) -> std::result::Result<(), String> {
    const SUFFIXES: [&str; 8] = ["Ki", "Mi", "Gi", "Ti", "K", "M", "G", "T"];

    let Some(suffix) = SUFFIXES.iter().find(|s| size.ends_with(*s)) else {
        return Err(format!("quantity must end with a binary or decimal unit: {}", size));
    };

    let number = size.trim_end_matches(suffix);
    match number.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err(format!("invalid quantity number: {}", size)),
    }
}

/// Validate an etcd version such as "v3.5.17"
pub fn validate_version(version: &str) -> Result<()> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    let parts: Vec<&str> = trimmed.split('.').collect();
    let numeric = parts.len() == 3 && parts.iter().all(|p| p.parse::<u32>().is_ok());

    if !numeric {
        return Err(Error::FatalSpec(format!(
            "version {:?} is not a semantic version like v3.5.17",
            version
        )));
    }

    if parts.first() != Some(&"3") {
        return Err(Error::FatalSpec(format!(
            "etcd major version {:?} is not supported",
            version
        )));
    }

    Ok(())
}

/// Validate a container image reference
pub fn validate_image_reference(image: &str) -> Result<()> {
    let bad = image.is_empty()
        || image.chars().any(char::is_whitespace)
        || image.ends_with(':')
        || image.ends_with('@')
        || image.starts_with(':');

    if bad {
        return Err(Error::FatalSpec(format!(
            "image reference {:?} is not valid",
            image
        )));
    }

    Ok(())
}

/// Result of comparing old and new spec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecDiff {
    pub replicas_changed: bool,
    /// Scale direction (positive = up, negative = down)
    pub replica_delta: i32,
    pub version_changed: bool,
    pub resources_changed: bool,
    pub backup_changed: bool,
    pub retention_changed: bool,
}

impl SpecDiff {
    /// Check if any changes require a rolling update
    pub fn requires_rolling_update(&self) -> bool {
        self.version_changed || self.resources_changed || self.backup_changed
    }

    /// Check if this is a scale-only operation
    pub fn is_scale_only(&self) -> bool {
        self.replicas_changed && !self.requires_rolling_update()
    }

    pub fn has_changes(&self) -> bool {
        self.replicas_changed || self.requires_rolling_update() || self.retention_changed
    }
}

/// Validate an update and describe what changed
pub fn validate_spec_change(old: &Etcd, new: &Etcd) -> Result<SpecDiff> {
    let old_spec = &old.spec;
    let new_spec = &new.spec;

    if old_spec.etcd.storage_class != new_spec.etcd.storage_class {
        return Err(Error::ValidationError(
            "storage class cannot be changed after creation".to_string(),
        ));
    }

    if old_spec.etcd.storage_capacity != new_spec.etcd.storage_capacity {
        return Err(Error::ValidationError(
            "storage capacity cannot be changed after creation".to_string(),
        ));
    }

    if old_spec.etcd.client_port != new_spec.etcd.client_port
        || old_spec.etcd.peer_port != new_spec.etcd.peer_port
    {
        return Err(Error::ValidationError(
            "client and peer ports cannot be changed after creation".to_string(),
        ));
    }

    if let (Some(old_backup), Some(new_backup)) = (&old_spec.backup, &new_spec.backup)
        && old_backup.store.provider != new_backup.store.provider
    {
        return Err(Error::ValidationError(
            "backup store provider cannot be changed after creation".to_string(),
        ));
    }

    let replica_delta = new_spec.replicas - old_spec.replicas;

    Ok(SpecDiff {
        replicas_changed: replica_delta != 0,
        replica_delta,
        version_changed: old_spec.etcd.version != new_spec.etcd.version
            || old_spec.etcd.image != new_spec.etcd.image,
        resources_changed: old_spec.etcd.resources != new_spec.etcd.resources,
        backup_changed: old_spec.backup != new_spec.backup,
        retention_changed: old_spec.pvc_retention_policy != new_spec.pvc_retention_policy,
    })
}
