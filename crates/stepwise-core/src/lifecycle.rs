//! Plan and step state machines
//!
//! Plans move forward only: pending -> planning -> executing, with
//! executing <-> replanning loops, ending in complete or failed. Steps move
//! pending -> running -> complete | failed; a running step may return to
//! pending when its run is cancelled.

use crate::error::LifecycleError;
use crate::types::{PlanStatus, StepStatus};

/// Validate a plan status transition
///
/// # Errors
/// Returns `LifecycleError::IllegalPlanTransition` if `to` is not reachable from `from`
pub fn validate_plan_transition(from: PlanStatus, to: PlanStatus) -> Result<(), LifecycleError> {
    if allowed_plan_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(LifecycleError::IllegalPlanTransition { from, to })
    }
}

/// States reachable from a plan status
#[must_use]
pub fn allowed_plan_transitions(from: PlanStatus) -> &'static [PlanStatus] {
    use PlanStatus::*;
    match from {
        Pending => &[Planning, Failed],
        Planning => &[Executing, Failed],
        Executing => &[Replanning, Complete, Failed],
        Replanning => &[Executing, Failed],
        Complete | Failed => &[],
    }
}

/// Validate a step status transition
///
/// # Errors
/// Returns `LifecycleError::IllegalStepTransition` if `to` is not reachable from `from`
pub fn validate_step_transition(from: StepStatus, to: StepStatus) -> Result<(), LifecycleError> {
    if allowed_step_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(LifecycleError::IllegalStepTransition { from, to })
    }
}

/// States reachable from a step status
#[must_use]
pub fn allowed_step_transitions(from: StepStatus) -> &'static [StepStatus] {
    use StepStatus::*;
    match from {
        Pending => &[Running],
        Running => &[Complete, Failed, Pending],
        Complete | Failed => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_cannot_skip_to_complete() {
        assert!(validate_plan_transition(PlanStatus::Planning, PlanStatus::Complete).is_err());
        assert!(validate_plan_transition(PlanStatus::Planning, PlanStatus::Executing).is_ok());
    }

    #[test]
    fn replanning_loops_back_to_executing() {
        assert!(validate_plan_transition(PlanStatus::Executing, PlanStatus::Replanning).is_ok());
        assert!(validate_plan_transition(PlanStatus::Replanning, PlanStatus::Executing).is_ok());
        assert!(validate_plan_transition(PlanStatus::Replanning, PlanStatus::Complete).is_err());
    }

    #[test]
    fn terminal_states_are_closed() {
        assert!(allowed_plan_transitions(PlanStatus::Complete).is_empty());
        assert!(allowed_plan_transitions(PlanStatus::Failed).is_empty());
        assert!(allowed_step_transitions(StepStatus::Complete).is_empty());
    }
}
