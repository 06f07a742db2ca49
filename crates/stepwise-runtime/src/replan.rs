//! Replan controller
//!
//! Bounded recovery from step failures:
//! - under budget: count the attempt, ask the planner to revise the failed
//!   step and everything after it, splice the revision in, keep executing
//! - budget spent: fail the plan with its completed history and last failure
//! - a revision that breaks plan bounds fails the plan as infeasible
//!
//! Completed steps are never handed to the planner as mutable input and
//! never replaced.

use crate::error::RunError;
use crate::journal::PlanJournal;
use crate::planner::{validate_plan, verify_return_specs, FailedStep, Planner, PlanningContext};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use stepwise_core::telemetry::REPLANS;
use stepwise_core::{
    EventKind, Plan, PlanError, PlanStatus, ReplanRecord, ReplanTrigger, Step, StructuredFailure,
};

/// Reason given when the replan budget is spent
pub const REPLANS_EXHAUSTED: &str = "max replan attempts reached";

/// A step that stopped plan progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Position of the step in `plan.steps`
    pub position: usize,
    /// Trigger class
    pub trigger: ReplanTrigger,
    /// Reason code
    pub reason: String,
    /// Split or retry hint
    pub suggestion: Option<String>,
}

impl StepFailure {
    /// Create failure record
    #[inline]
    #[must_use]
    pub fn new(position: usize, trigger: ReplanTrigger, reason: impl Into<String>) -> Self {
        Self {
            position,
            trigger,
            reason: reason.into(),
            suggestion: None,
        }
    }

    /// With suggestion
    #[inline]
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

/// What happens after a step failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanDecision {
    /// Revision merged, plan is executing again
    Continue,
    /// Budget spent, plan failed
    Exhausted(StructuredFailure),
    /// Revision broke plan bounds or the planner gave up, plan failed
    Infeasible(StructuredFailure),
}

/// Replan controller
pub struct ReplanController {
    planner: Arc<dyn Planner>,
    max_replans: u32,
}

impl std::fmt::Debug for ReplanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplanController")
            .field("max_replans", &self.max_replans)
            .finish_non_exhaustive()
    }
}

impl ReplanController {
    /// Create controller
    #[must_use]
    pub fn new(planner: Arc<dyn Planner>, max_replans: u32) -> Self {
        Self {
            planner,
            max_replans,
        }
    }

    /// Replan budget
    #[inline]
    #[must_use]
    pub fn max_replans(&self) -> u32 {
        self.max_replans
    }

    /// Handle a failed step
    ///
    /// Drives the plan to `executing` on success or `failed` otherwise; the
    /// plan is persisted either way.
    ///
    /// # Errors
    /// Persistence or lifecycle errors, or `RunError::Internal` if
    /// `failure.position` is out of range
    #[tracing::instrument(skip_all, fields(plan_id = %plan.plan_id, trigger = failure.trigger.as_str()))]
    pub async fn on_step_failure(
        &self,
        plan: &mut Plan,
        journal: &PlanJournal,
        failure: &StepFailure,
        ctx: &PlanningContext,
    ) -> Result<ReplanDecision, RunError> {
        let failed = plan
            .steps
            .get(failure.position)
            .cloned()
            .ok_or_else(|| RunError::Internal(format!("no step at position {}", failure.position)))?;

        if plan.replan_count >= self.max_replans {
            tracing::warn!(
                step = failed.step_index,
                replans = plan.replan_count,
                "replan budget exhausted"
            );
            let report = StructuredFailure::for_plan(plan, REPLANS_EXHAUSTED)
                .with_last_failure(failed.step_index, &failure.reason);
            journal.transition(plan, PlanStatus::Failed, REPLANS_EXHAUSTED).await?;
            return Ok(ReplanDecision::Exhausted(report));
        }

        plan.replan_count += 1;
        let attempt = plan.replan_count;
        journal.transition(plan, PlanStatus::Replanning, &failure.reason).await?;
        metrics::counter!(REPLANS).increment(1);
        journal.emit(
            plan,
            EventKind::ReplanTriggered,
            json!({
                "attempt": attempt,
                "failed_step": failed.step_index,
                "reason": failure.reason,
                "trigger": failure.trigger.as_str(),
            }),
        );

        let completed: Vec<Step> = plan.completed_steps().cloned().collect();
        let failed_step = FailedStep {
            step_index: failed.step_index,
            task: failed.task.clone(),
            reason: failure.reason.clone(),
            suggestion: failure.suggestion.clone(),
            trigger: failure.trigger,
        };
        let revised = self
            .planner
            .replan(
                &plan.task,
                &completed,
                &failed_step,
                &plan.steps[failure.position..],
                ctx,
            )
            .await;

        let merged = match revised {
            Ok(steps) => merge(plan, failure.position, steps, ctx),
            Err(e) => Err(e.reason_code().to_string()),
        };
        let merged = match merged {
            Ok(merged) => merged,
            Err(reason) => {
                tracing::warn!(step = failed.step_index, %reason, "revision rejected");
                let report = StructuredFailure::for_plan(plan, &reason)
                    .with_last_failure(failed.step_index, &failure.reason);
                journal.transition(plan, PlanStatus::Failed, &reason).await?;
                return Ok(ReplanDecision::Infeasible(report));
            }
        };

        plan.steps = merged;
        plan.replan_history.push(ReplanRecord {
            attempt,
            trigger: failure.trigger,
            failed_step: failed.step_index,
            reason: failure.reason.clone(),
            revised_at: Utc::now(),
        });
        journal.transition(plan, PlanStatus::Executing, "revision merged").await?;
        tracing::info!(attempt, steps = plan.steps.len(), "plan revised");
        Ok(ReplanDecision::Continue)
    }
}

/// Merge a revision into a copy of the plan's steps and check the result
fn merge(
    plan: &Plan,
    position: usize,
    revised: Vec<Step>,
    ctx: &PlanningContext,
) -> Result<Vec<Step>, String> {
    let check = |r: Result<(), PlanError>| r.map_err(|e| e.reason_code().to_string());
    check(verify_return_specs(&revised, &ctx.catalog))?;
    let mut draft = plan.clone();
    check(draft.revise_remaining(position, revised, ctx.max_steps))?;
    check(validate_plan(&draft.steps, ctx.max_steps))?;
    Ok(draft.steps)
}
