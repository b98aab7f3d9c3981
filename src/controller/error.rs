//! Error types for the Etcd controller

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::crd::{MaintenanceKind, OperationState};

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Write conflict or temporary unavailability of the resource store
    #[error("Transient platform error (will retry): {0}")]
    Transient(String),

    /// The etcd membership API failed or refused a change
    #[error("Membership error (will retry): {0}")]
    Membership(String),

    /// A scale-down that could lose quorum was refused before any write
    #[error("Quorum safety violation: {0}")]
    QuorumSafetyViolation(String),

    /// A member did not become healthy within the rollout wait
    #[error("Rollout stalled: {0}")]
    RolloutStalled(String),

    #[error("Maintenance task {kind} failed: {message}")]
    MaintenanceTaskFailed {
        kind: MaintenanceKind,
        message: String,
    },

    /// The desired state cannot be realised without a spec correction
    #[error("Unrecoverable spec error: {0}")]
    FatalSpec(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// Whether another pass could succeed without a spec change
    ///
    /// Client errors from the API server are final except for conflicts and
    /// throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(response)) => {
                !(400..500).contains(&response.code) || matches!(response.code, 409 | 429)
            }
            Error::FatalSpec(_)
            | Error::ValidationError(_)
            | Error::SerializationError(_)
            | Error::MissingObjectKey(_) => false,
            // Everything else resumes from the same point on the next trigger
            _ => true,
        }
    }

    /// Check if this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }

    /// Check if this error is a platform hiccup that must never surface as Failed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::Membership(_)
                | Error::KubeError(_)
                | Error::NotFound(_)
                | Error::FinalizerError(_)
        ) && self.is_retryable()
    }

    /// LastOperation state this error is reported as
    pub fn operation_state(&self) -> OperationState {
        match self {
            Error::FatalSpec(_) | Error::ValidationError(_) => OperationState::Failed,
            Error::QuorumSafetyViolation(_)
            | Error::RolloutStalled(_)
            | Error::MaintenanceTaskFailed { .. } => OperationState::Error,
            _ if self.is_transient() => OperationState::Pending,
            _ => OperationState::Error,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::MissingObjectKey(_) => "missing_key",
            Error::NotFound(_) => "not_found",
            Error::FinalizerError(_) => "finalizer",
            Error::Transient(_) => "transient",
            Error::Membership(_) => "membership",
            Error::QuorumSafetyViolation(_) => "quorum_safety",
            Error::RolloutStalled(_) => "rollout_stalled",
            Error::MaintenanceTaskFailed { .. } => "maintenance_failed",
            Error::FatalSpec(_) => "fatal_spec",
            Error::ValidationError(_) => "validation",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue delays after failed passes
///
/// The n-th consecutive failure of an object waits `initial * multiplier^n`,
/// spread by `jitter` in either direction and capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let growth = self
            .multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let base = self.initial_delay.as_secs_f64() * growth;
        let spread = if self.jitter > 0.0 {
            base * self.jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        let secs = (base + spread).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// `None` means wait for a spec change instead of retrying
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Option<Duration> {
        error
            .is_retryable()
            .then(|| self.delay_for_attempt(attempt))
    }
}
