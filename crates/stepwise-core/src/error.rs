//! Error types for Stepwise core
//!
//! Provides the shared error vocabulary:
//! - Illegal lifecycle transitions
//! - Plan infeasibility
//! - Return contract violations
//! - Configuration failures

use crate::types::{PlanId, PlanStatus, StepStatus};
use serde::{Deserialize, Serialize};

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Plan transition not in the allowed table
    #[error("illegal plan transition: {from:?} -> {to:?}")]
    IllegalPlanTransition {
        /// Current status
        from: PlanStatus,
        /// Requested status
        to: PlanStatus,
    },

    /// Step transition not in the allowed table
    #[error("illegal step transition: {from:?} -> {to:?}")]
    IllegalStepTransition {
        /// Current status
        from: StepStatus,
        /// Requested status
        to: StepStatus,
    },

    /// Plan already reached a terminal state
    #[error("plan {plan_id} is terminal ({status:?})")]
    TerminalPlan {
        /// Plan
        plan_id: PlanId,
        /// Terminal status
        status: PlanStatus,
    },
}

/// Reasons a plan cannot be executed as drafted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Planner returned no steps
    #[error("plan has no steps")]
    Empty,

    /// Plan exceeds the step bound
    #[error("plan needs {count} steps, limit is {max}")]
    TooManySteps {
        /// Steps requested
        count: usize,
        /// Configured bound
        max: usize,
    },

    /// A step lists a spawn-shaped skill
    #[error("step {step_index} requests spawn-shaped skill {skill}")]
    SpawnSkill {
        /// Offending step
        step_index: u32,
        /// Skill name
        skill: String,
    },

    /// A step's contract asks for fields none of its skills produce
    #[error("step {step_index} return spec not satisfiable, missing {missing_keys:?}")]
    Unsatisfiable {
        /// Offending step
        step_index: u32,
        /// Fields no allowed skill declares
        missing_keys: Vec<String>,
    },

    /// A step consumes a step that does not precede it
    #[error("step {step_index} reads from step {input_from}, which does not precede it")]
    DanglingInput {
        /// Offending step
        step_index: u32,
        /// Referenced step
        input_from: u32,
    },

    /// Two steps share an index
    #[error("duplicate step index {0}")]
    DuplicateIndex(u32),

    /// A revision tried to replace a completed step
    #[error("revision would replace completed step {0}")]
    CompletedStepReplaced(u32),

    /// Planner declared the task infeasible
    #[error("planner declared task infeasible: {0}")]
    Declared(String),
}

impl PlanError {
    /// Stable reason code for structured failures
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Empty => "plan_empty",
            Self::TooManySteps { .. } => "plan_infeasible_over_max_steps",
            Self::SpawnSkill { .. } => "subagent_spawning_not_allowed",
            Self::Unsatisfiable { .. } => "planner_return_spec_not_satisfiable",
            Self::DanglingInput { .. } => "plan_dangling_input",
            Self::DuplicateIndex(_) => "plan_duplicate_step_index",
            Self::CompletedStepReplaced(_) => "plan_revision_touches_completed_step",
            Self::Declared(_) => "plan_infeasible",
        }
    }
}

/// Data did not match its return contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("contract violation: expected {expected}, got {actual}")]
pub struct ContractViolation {
    /// Contract shape (`{"field": "string"}`)
    pub expected: serde_json::Value,
    /// Observed shape of the data
    pub actual: serde_json::Value,
    /// Validator messages
    #[serde(default)]
    pub details: Vec<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Loading or deserializing failed
    #[error("config load failed: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of range
    #[error("invalid config value {key}: {reason}")]
    Invalid {
        /// Dotted key
        key: &'static str,
        /// What is wrong
        reason: String,
    },

    /// Log subscriber could not be installed
    #[error("telemetry init failed: {0}")]
    Telemetry(String),
}

impl ConfigError {
    /// Create invalid-value error
    #[inline]
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(
            PlanError::TooManySteps { count: 11, max: 10 }.reason_code(),
            "plan_infeasible_over_max_steps"
        );
        assert_eq!(
            PlanError::SpawnSkill {
                step_index: 1,
                skill: "spawn_subagent".into()
            }
            .reason_code(),
            "subagent_spawning_not_allowed"
        );
    }

    #[test]
    fn lifecycle_error_display() {
        let err = LifecycleError::IllegalStepTransition {
            from: StepStatus::Pending,
            to: StepStatus::Complete,
        };
        assert!(err.to_string().contains("illegal step transition"));
    }
}
