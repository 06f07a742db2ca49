use proptest::prelude::*;
use stepwise_core::lifecycle::{
    allowed_plan_transitions, allowed_step_transitions, validate_plan_transition,
    validate_step_transition,
};
use stepwise_core::{Identity, Plan, PlanStatus, StepStatus};

fn plan_status() -> impl Strategy<Value = PlanStatus> {
    prop_oneof![
        Just(PlanStatus::Pending),
        Just(PlanStatus::Planning),
        Just(PlanStatus::Executing),
        Just(PlanStatus::Replanning),
        Just(PlanStatus::Complete),
        Just(PlanStatus::Failed),
    ]
}

fn step_status() -> impl Strategy<Value = StepStatus> {
    prop_oneof![
        Just(StepStatus::Pending),
        Just(StepStatus::Running),
        Just(StepStatus::Complete),
        Just(StepStatus::Failed),
    ]
}

#[test]
fn test_happy_path() {
    let mut plan = Plan::new(Identity::new("t", "u", "s"), "task");
    for next in [
        PlanStatus::Planning,
        PlanStatus::Executing,
        PlanStatus::Replanning,
        PlanStatus::Executing,
        PlanStatus::Complete,
    ] {
        plan.transition(next).unwrap();
    }
    assert!(plan.is_terminal());
}

#[test]
fn test_infeasible_plan_never_executes() {
    // planning -> failed is allowed; failed -> executing is not
    assert!(validate_plan_transition(PlanStatus::Planning, PlanStatus::Failed).is_ok());
    assert!(validate_plan_transition(PlanStatus::Failed, PlanStatus::Executing).is_err());
}

#[test]
fn test_step_cannot_complete_without_running() {
    assert!(validate_step_transition(StepStatus::Pending, StepStatus::Complete).is_err());
    assert!(validate_step_transition(StepStatus::Running, StepStatus::Complete).is_ok());
}

proptest! {
    #[test]
    fn prop_plan_transitions_match_table(from in plan_status(), to in plan_status()) {
        let res = validate_plan_transition(from, to);
        prop_assert_eq!(res.is_ok(), allowed_plan_transitions(from).contains(&to));
    }

    #[test]
    fn prop_step_transitions_match_table(from in step_status(), to in step_status()) {
        let res = validate_step_transition(from, to);
        prop_assert_eq!(res.is_ok(), allowed_step_transitions(from).contains(&to));
    }

    #[test]
    fn prop_terminal_plans_reject_everything(to in plan_status()) {
        let mut plan = Plan::new(Identity::new("t", "u", "s"), "task");
        plan.transition(PlanStatus::Failed).unwrap();
        prop_assert!(plan.transition(to).is_err());
    }

    #[test]
    fn prop_no_transition_returns_to_pending(from in plan_status()) {
        prop_assert!(!allowed_plan_transitions(from).contains(&PlanStatus::Pending));
    }
}
