//! Spec policies
//!
//! Rejects resources the controller could never realise: member counts out of
//! range, unusable images or versions, and schedules that cannot be parsed.

use super::{ValidationContext, ValidationResult};
use crate::controller::error::Error;
use crate::controller::validation::validate_spec;

/// Validate the submitted spec on its own
pub fn validate_spec_policy(ctx: &ValidationContext) -> ValidationResult {
    match validate_spec(ctx.etcd) {
        Ok(()) => ValidationResult::allowed(),
        Err(Error::FatalSpec(message)) => ValidationResult::denied("UnsupportedSpec", &message),
        Err(e) => ValidationResult::denied("InvalidSpec", &e.to_string()),
    }
}
