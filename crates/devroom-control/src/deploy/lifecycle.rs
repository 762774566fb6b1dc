//! Deployment state machine.
//!
//! ```text
//!   ┌─────────┐    ┌──────────┐    ┌───────────┐    ┌─────────┐
//!   │ Pending │───▶│ Building │───▶│ Deploying │───▶│ Success │
//!   └────┬────┘    └────┬─────┘    └─────┬─────┘    └─────────┘
//!        │              │                │
//!        │ (cancel)     │ (fault/cancel) │ (fault)
//!        ▼              ▼                ▼
//!   ┌─────────────────────────────────────────┐
//!   │                 Failed                  │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! `Success` and `Failed` are terminal. A fault is only recorded once the
//! pipeline has started building; `Pending` fails only through cancellation.

use devroom_core::DeploymentId;
use devroom_store::DeploymentStatus;

use crate::error::{ControlError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::NotApplicable` if the transition is not allowed.
pub fn validate_transition(
    deployment_id: &DeploymentId,
    from: DeploymentStatus,
    to: DeploymentStatus,
) -> Result<DeploymentStatus> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::NotApplicable(format!(
            "deployment {deployment_id} cannot move from {} to {}",
            label(from),
            label(to)
        )))
    }
}

/// Validates a cancellation and returns `Failed` if the deployment may still
/// be cancelled.
///
/// # Errors
///
/// Returns `ControlError::NotApplicable` once the deployment is deploying or
/// finished.
pub fn validate_cancel(deployment_id: &DeploymentId, from: DeploymentStatus) -> Result<DeploymentStatus> {
    if can_cancel(from) {
        Ok(DeploymentStatus::Failed)
    } else {
        Err(ControlError::NotApplicable(format!(
            "deployment {deployment_id} is {} and can no longer be cancelled",
            label(from)
        )))
    }
}

/// Check if a pipeline transition is valid according to the state machine.
///
/// Cancellation is not a pipeline transition; see [`validate_cancel`].
#[must_use]
pub const fn is_valid_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::{Building, Deploying, Failed, Pending, Success};

    matches!(
        (from, to),
        (Pending, Building)
            | (Building, Deploying)
            | (Deploying, Success)
            | (Building | Deploying, Failed)
    )
}

/// Returns true if a deployment in this state may still be cancelled.
#[must_use]
pub const fn can_cancel(status: DeploymentStatus) -> bool {
    matches!(status, DeploymentStatus::Pending | DeploymentStatus::Building)
}

/// Wire name of a status.
#[must_use]
pub const fn label(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Pending => "pending",
        DeploymentStatus::Building => "building",
        DeploymentStatus::Deploying => "deploying",
        DeploymentStatus::Success => "success",
        DeploymentStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    const ALL: [DeploymentStatus; 5] = [Pending, Building, Deploying, Success, Failed];

    #[test]
    fn happy_path() {
        assert!(is_valid_transition(Pending, Building));
        assert!(is_valid_transition(Building, Deploying));
        assert!(is_valid_transition(Deploying, Success));
    }

    #[test]
    fn faults_need_a_started_pipeline() {
        assert!(!is_valid_transition(Pending, Failed));
        assert!(is_valid_transition(Building, Failed));
        assert!(is_valid_transition(Deploying, Failed));
    }

    #[test]
    fn cancel_reaches_failed_from_pending_and_building() {
        let id = DeploymentId::generate();
        assert_eq!(validate_cancel(&id, Pending).unwrap(), Failed);
        assert_eq!(validate_cancel(&id, Building).unwrap(), Failed);
        for from in [Deploying, Success, Failed] {
            assert!(matches!(
                validate_cancel(&id, from),
                Err(ControlError::NotApplicable(_))
            ));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for to in ALL {
            assert!(!is_valid_transition(Success, to));
            assert!(!is_valid_transition(Failed, to));
        }
    }

    #[test]
    fn no_skipping_or_going_back() {
        assert!(!is_valid_transition(Pending, Deploying));
        assert!(!is_valid_transition(Building, Success));
        assert!(!is_valid_transition(Deploying, Building));
        assert!(!is_valid_transition(Building, Pending));
    }

    #[test]
    fn validate_transition_err() {
        let id = DeploymentId::generate();
        assert_eq!(validate_transition(&id, Pending, Building).unwrap(), Building);

        match validate_transition(&id, Success, Failed) {
            Err(ControlError::NotApplicable(message)) => {
                assert!(message.contains("success"));
            }
            other => panic!("expected NotApplicable, got {other:?}"),
        }
    }

    #[test]
    fn cancellable_states() {
        assert!(can_cancel(Pending));
        assert!(can_cancel(Building));
        assert!(!can_cancel(Deploying));
        assert!(!can_cancel(Success));
        assert!(!can_cancel(Failed));
    }
}
