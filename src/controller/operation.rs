//! LastOperation state machine
//!
//! The LastOperation record only moves along the transitions listed here.
//! Each pass derives one event from what it did and asks the machine for the
//! next state, so illegal moves (leaving `Failed` without a spec correction,
//! turning a deletion back into a reconcile) are impossible by construction.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::controller::error::Error;
use crate::controller::members::ConvergenceAction;
use crate::crd::{LastOperation, OperationState, OperationType};

/// Events that move the LastOperation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationEvent {
    /// A structural change was issued or one is still settling
    ActionStarted,
    /// A maintenance task was submitted
    MaintenanceTriggered,
    /// The member set matches the desired state
    Converged,
    /// The platform rejected or lost a write; retried with backoff
    TransientError,
    /// A safety check refused to act, a rollout stalled or maintenance failed
    ActionError,
    /// The desired state cannot be realised
    FatalError,
    /// A new spec generation replaced a failed one
    SpecCorrected,
    /// A rollout in progress was replaced by a newer template
    Superseded,
    DeletionRequested,
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationEvent::ActionStarted => write!(f, "ActionStarted"),
            OperationEvent::MaintenanceTriggered => write!(f, "MaintenanceTriggered"),
            OperationEvent::Converged => write!(f, "Converged"),
            OperationEvent::TransientError => write!(f, "TransientError"),
            OperationEvent::ActionError => write!(f, "ActionError"),
            OperationEvent::FatalError => write!(f, "FatalError"),
            OperationEvent::SpecCorrected => write!(f, "SpecCorrected"),
            OperationEvent::Superseded => write!(f, "Superseded"),
            OperationEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Facts available to guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// The spec generation differs from the one that last failed
    pub generation_changed: bool,
    pub ready_replicas: i32,
    pub desired_replicas: i32,
}

#[derive(Debug)]
pub struct Transition {
    pub from: OperationState,
    pub to: OperationState,
    pub event: OperationEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: OperationState,
        to: OperationState,
        event: OperationEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: OperationState,
        to: OperationState,
        event: OperationEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: OperationState,
        event: OperationEvent,
    },
    GuardFailed {
        from: OperationState,
        to: OperationState,
        event: OperationEvent,
        reason: String,
    },
}

/// What a pass wants the LastOperation record to say
#[derive(Debug, Clone)]
pub struct OperationUpdate {
    pub type_: OperationType,
    pub event: OperationEvent,
    pub description: String,
    pub progress: u8,
}

pub struct OperationStateMachine {
    transitions: Vec<Transition>,
}

impl Default for OperationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStateMachine {
    pub fn new() -> Self {
        use OperationEvent as E;
        use OperationState as S;

        let mut transitions = Vec::new();

        // States an operation can be worked on from
        for from in [S::Pending, S::Processing, S::Succeeded, S::Error, S::Aborted] {
            transitions.push(Transition::new(from, S::Processing, E::ActionStarted, "Convergence step issued"));
            transitions.push(Transition::new(from, S::Processing, E::MaintenanceTriggered, "Maintenance task submitted"));
            transitions.push(Transition::new(from, S::Succeeded, E::Converged, "Cluster converged"));
            transitions.push(Transition::new(from, S::Pending, E::TransientError, "Platform error, retrying"));
            transitions.push(Transition::new(from, S::Error, E::ActionError, "Action refused or failed"));
            transitions.push(Transition::new(from, S::Failed, E::FatalError, "Spec cannot be realised"));
            transitions.push(Transition::new(from, S::Processing, E::DeletionRequested, "Deletion started"));
        }

        transitions.push(Transition::new(S::Processing, S::Aborted, E::Superseded, "Rollout replaced by a newer spec"));

        // Failed is left only by a spec correction or deletion
        transitions.push(Transition::new(S::Failed, S::Pending, E::SpecCorrected, "Spec corrected, retrying"));
        transitions.push(Transition::new(S::Failed, S::Failed, E::FatalError, "Spec still cannot be realised"));
        transitions.push(Transition::new(S::Failed, S::Processing, E::DeletionRequested, "Deletion started"));

        Self { transitions }
    }

    pub fn transition(
        &self,
        current: OperationState,
        event: OperationEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: OperationState, event: OperationEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: OperationState) -> Vec<OperationEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.from, transition.event) {
            (OperationState::Failed, OperationEvent::SpecCorrected) if !ctx.generation_changed => {
                Some("spec generation has not changed since the failure".to_string())
            }
            (_, OperationEvent::Converged) if ctx.ready_replicas < ctx.desired_replicas => Some(
                format!(
                    "not all members ready: {}/{}",
                    ctx.ready_replicas, ctx.desired_replicas
                ),
            ),
            _ => None,
        }
    }

    /// Compute the LastOperation after `event`
    ///
    /// A record of type `Delete` keeps that type. A rejected transition leaves
    /// the previous record untouched.
    pub fn advance(
        &self,
        previous: Option<&LastOperation>,
        update: OperationUpdate,
        ctx: &TransitionContext,
        now: DateTime<Utc>,
    ) -> Option<LastOperation> {
        let OperationUpdate {
            type_,
            event,
            description,
            progress,
        } = update;
        let progress = progress.min(100);

        let Some(previous) = previous else {
            let state = match event {
                OperationEvent::Converged => OperationState::Succeeded,
                OperationEvent::TransientError => OperationState::Pending,
                OperationEvent::ActionError => OperationState::Error,
                OperationEvent::FatalError => OperationState::Failed,
                _ => OperationState::Processing,
            };
            return Some(LastOperation {
                type_,
                state,
                progress,
                description,
                last_update_time: now,
            });
        };

        let type_ = if previous.type_ == OperationType::Delete {
            OperationType::Delete
        } else {
            type_
        };

        match self.transition(previous.state, event, ctx) {
            TransitionResult::Success { from, to, .. } => {
                let unchanged = previous.type_ == type_
                    && previous.state == to
                    && previous.description == description
                    && previous.progress == progress;
                if unchanged {
                    return Some(previous.clone());
                }
                debug!(%from, %to, %event, "last operation transition");
                Some(LastOperation {
                    type_,
                    state: to,
                    progress,
                    description,
                    last_update_time: now,
                })
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(%event, %reason, "last operation transition blocked by guard");
                None
            }
            TransitionResult::InvalidTransition { current, .. } => {
                debug!(%current, %event, "invalid last operation transition");
                None
            }
        }
    }
}

/// Event describing a planned action
pub fn event_for_action(action: &ConvergenceAction) -> OperationEvent {
    match action {
        ConvergenceAction::NoOp => OperationEvent::Converged,
        ConvergenceAction::Delete => OperationEvent::DeletionRequested,
        _ => OperationEvent::ActionStarted,
    }
}

/// Event describing a failed pass
pub fn event_for_error(error: &Error) -> OperationEvent {
    match error.operation_state() {
        OperationState::Failed => OperationEvent::FatalError,
        OperationState::Pending => OperationEvent::TransientError,
        _ => OperationEvent::ActionError,
    }
}

/// Operation type for a pass
pub fn operation_type(deleting: bool, creating: bool) -> OperationType {
    if deleting {
        OperationType::Delete
    } else if creating {
        OperationType::Create
    } else {
        OperationType::Reconcile
    }
}
