pub mod context;
pub mod desired;
pub mod error;
pub mod maintenance;
pub mod members;
pub mod membership;
pub mod observed;
pub mod operation;
pub mod platform;
pub mod reconciler;
pub mod retention;
pub mod schedule;
pub mod status;
pub mod validation;

pub use context::Context;
pub use desired::{DesiredState, TemplateFingerprint};
pub use error::{BackoffConfig, Error, Result};
pub use maintenance::{MaintenanceReport, run_maintenance};
pub use members::{ConvergenceAction, MemberSetManager, WaitReason};
pub use membership::{ClusterMember, Membership};
pub use observed::ObservedState;
pub use operation::OperationStateMachine;
pub use platform::{ClusterPlatform, KubePlatform, WorkloadWrite};
pub use reconciler::{error_policy, reconcile, reconcile_at};
pub use status::{ConditionBuilder, PassOutcome, StatusAggregator, needs_write};
pub use validation::{MAX_REPLICAS, MIN_REPLICAS, SpecDiff, validate_spec, validate_spec_change};
