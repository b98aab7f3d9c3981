//! Admission policies for Etcd resources
//!
//! A policy looks at the submitted object (and the stored one on update) and
//! either lets it through or names the reason it was refused.

pub mod immutability;
pub mod spec;

pub use immutability::validate_immutability;
pub use spec::validate_spec_policy;

use crate::crd::Etcd;

/// Outcome of one policy, or of all of them
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// The object under review; `old_etcd` is set only for updates
pub struct ValidationContext<'a> {
    pub etcd: &'a Etcd,
    pub old_etcd: Option<&'a Etcd>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(etcd: &'a Etcd, old_etcd: Option<&'a Etcd>) -> Self {
        Self { etcd, old_etcd }
    }

    pub fn is_create(&self) -> bool {
        self.old_etcd.is_none()
    }
}

const POLICIES: &[fn(&ValidationContext) -> ValidationResult] =
    &[validate_spec_policy, validate_immutability];

/// First refusal wins
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    POLICIES
        .iter()
        .map(|policy| policy(ctx))
        .find(|result| !result.allowed)
        .unwrap_or_else(ValidationResult::allowed)
}
