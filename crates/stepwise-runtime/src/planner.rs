//! Planner capability
//!
//! The decision logic that drafts plans lives outside this crate; the
//! runtime only fixes its contract:
//! - `plan` returns at most `max_steps` steps, or reports the task infeasible
//! - every step's return contract must be satisfiable by its skills
//! - `replan` returns replacement steps for the remaining slice only
//!
//! The orchestrator re-checks all of it with [`validate_plan`] and
//! [`verify_return_specs`] before a plan is persisted as executing.

use crate::error::PlannerError;
use crate::skill::{is_spawn_shaped, SkillCatalog};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use stepwise_core::{Identity, Persona, PlanError, ReplanTrigger, Step};

/// What a planner may look at
#[derive(Debug, Clone)]
pub struct PlanningContext {
    /// Caller
    pub identity: Identity,
    /// Tenant persona, when one is configured
    pub persona: Option<Persona>,
    /// Step bound
    pub max_steps: usize,
    /// Skill capabilities
    pub catalog: Arc<SkillCatalog>,
}

/// The step that triggered a replan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    /// Position
    pub step_index: u32,
    /// Step task
    pub task: String,
    /// Why it stopped
    pub reason: String,
    /// Split or retry hint from the executor
    pub suggestion: Option<String>,
    /// Trigger class
    pub trigger: ReplanTrigger,
}

/// Plan drafting capability
#[async_trait]
pub trait Planner: Send + Sync {
    /// Draft a plan for a task
    async fn plan(&self, task: &str, ctx: &PlanningContext) -> Result<Vec<Step>, PlannerError>;

    /// Draft replacement steps for the failed step and everything after it
    ///
    /// `completed` is read-only history; implementations never return
    /// replacements for it.
    async fn replan(
        &self,
        task: &str,
        completed: &[Step],
        failed: &FailedStep,
        remaining: &[Step],
        ctx: &PlanningContext,
    ) -> Result<Vec<Step>, PlannerError>;
}

/// Structural checks on a drafted or merged plan
///
/// # Errors
/// - `PlanError::Empty` / `TooManySteps` for size violations
/// - `PlanError::SpawnSkill` if any step lists a spawn-shaped skill
/// - `PlanError::DuplicateIndex` / `DanglingInput` for broken ordering
pub fn validate_plan(steps: &[Step], max_steps: usize) -> Result<(), PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }
    if steps.len() > max_steps {
        return Err(PlanError::TooManySteps {
            count: steps.len(),
            max: max_steps,
        });
    }
    let mut seen = HashSet::with_capacity(steps.len());
    for step in steps {
        if let Some(skill) = step.allowed_skills.iter().find(|s| is_spawn_shaped(s)) {
            return Err(PlanError::SpawnSkill {
                step_index: step.step_index,
                skill: skill.clone(),
            });
        }
        if let Some(from) = step.input_from_step {
            if from >= step.step_index || !seen.contains(&from) {
                return Err(PlanError::DanglingInput {
                    step_index: step.step_index,
                    input_from: from,
                });
            }
        }
        if !seen.insert(step.step_index) {
            return Err(PlanError::DuplicateIndex(step.step_index));
        }
    }
    Ok(())
}

/// Check every step's contract against its skills' declared outputs
///
/// # Errors
/// Returns `PlanError::Unsatisfiable` naming the first bad step and its missing keys
pub fn verify_return_specs(steps: &[Step], catalog: &SkillCatalog) -> Result<(), PlanError> {
    for step in steps {
        let missing_keys = catalog.missing_fields(&step.allowed_skills, &step.return_spec);
        if !missing_keys.is_empty() {
            return Err(PlanError::Unsatisfiable {
                step_index: step.step_index,
                missing_keys,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::SkillDescriptor;
    use stepwise_core::{FieldShape, ReturnSpec, MAX_PLAN_STEPS};

    fn step(index: u32) -> Step {
        Step::new(index, format!("step-{index}"))
            .with_skills(["skill_x"])
            .with_return_spec(ReturnSpec::new().with_field("value", FieldShape::String))
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_plan(&[], MAX_PLAN_STEPS), Err(PlanError::Empty));
    }

    #[test]
    fn rejects_more_than_max() {
        let steps: Vec<Step> = (1..=11).map(step).collect();
        let err = validate_plan(&steps, MAX_PLAN_STEPS).unwrap_err();
        assert_eq!(err.reason_code(), "plan_infeasible_over_max_steps");
    }

    #[test]
    fn rejects_spawn_skill() {
        let steps = vec![Step::new(1, "attempt subagent").with_skills(["spawn_subagent"])];
        let err = validate_plan(&steps, MAX_PLAN_STEPS).unwrap_err();
        assert_eq!(err.reason_code(), "subagent_spawning_not_allowed");
    }

    #[test]
    fn rejects_forward_and_missing_inputs() {
        let forward = vec![step(1).with_input_from(2), step(2)];
        assert!(matches!(
            validate_plan(&forward, MAX_PLAN_STEPS),
            Err(PlanError::DanglingInput { step_index: 1, input_from: 2 })
        ));
        let missing = vec![step(2), step(3).with_input_from(1)];
        assert!(validate_plan(&missing, MAX_PLAN_STEPS).is_err());
    }

    #[test]
    fn rejects_duplicate_index() {
        let steps = vec![step(1), step(1)];
        assert_eq!(
            validate_plan(&steps, MAX_PLAN_STEPS),
            Err(PlanError::DuplicateIndex(1))
        );
    }

    #[test]
    fn unsatisfiable_contract_lists_missing_keys() {
        let catalog = SkillCatalog::new().with_skill(SkillDescriptor::new("skill_x", ["other"]));
        let err = verify_return_specs(&[step(1)], &catalog).unwrap_err();
        assert_eq!(
            err,
            PlanError::Unsatisfiable {
                step_index: 1,
                missing_keys: vec!["value".into()]
            }
        );
    }
}
