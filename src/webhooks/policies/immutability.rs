//! Immutability policies
//!
//! - Storage class and capacity cannot be changed after creation
//! - Client and peer ports cannot be changed after creation
//! - The backup store provider cannot be switched
//! - The etcd minor version can only increase (no downgrades)

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec_change;

/// Parse "v3.5.17" into (3, 5)
fn minor_version(version: &str) -> Option<(u32, u32)> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Validate immutable fields and version upgrade rules
pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    // Only apply immutability checks on UPDATE, not CREATE
    let Some(old_etcd) = ctx.old_etcd else {
        return ValidationResult::allowed();
    };

    if let Err(e) = validate_spec_change(old_etcd, ctx.etcd) {
        return ValidationResult::denied("ImmutableFieldChanged", &e.to_string());
    }

    // Explicit image overrides are taken as given
    if old_etcd.spec.etcd.image.is_none() && ctx.etcd.spec.etcd.image.is_none() {
        let old_version = minor_version(&old_etcd.spec.etcd.version);
        let new_version = minor_version(&ctx.etcd.spec.etcd.version);

        if let (Some(old), Some(new)) = (old_version, new_version)
            && new < old
        {
            return ValidationResult::denied(
                "VersionDowngradeNotAllowed",
                &format!(
                    "etcd minor version downgrades are not allowed. Current version: {}, requested: {}",
                    old_etcd.spec.etcd.version, ctx.etcd.spec.etcd.version
                ),
            );
        }
    }

    ValidationResult::allowed()
}
