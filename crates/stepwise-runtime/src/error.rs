//! Error types for the Stepwise runtime
//!
//! Recoverable step errors ([`SkillError`], [`ExecutorError`]) are absorbed
//! into step outcomes and drive replanning. Only [`RunError`] reaches the
//! caller, and its failure variant always carries a [`StructuredFailure`].

use std::time::Duration;
use stepwise_core::{ContractViolation, LifecycleError, PlanError, PlanId, StructuredFailure};
use stepwise_sandbox::SandboxError;
use stepwise_store::{MemoryError, RepositoryError, StoreError, TempStoreError};

/// Skill call errors
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    /// Skill is outside the step's allowed set
    #[error("skill {skill} is not allowed in step {step_index}")]
    NotAllowed {
        /// Requested skill
        skill: String,
        /// Step making the call
        step_index: u32,
    },

    /// Spawn-shaped request from an executor context
    #[error("executors cannot spawn agents (requested {0})")]
    SpawnForbidden(String),

    /// Provider does not know the skill
    #[error("unknown skill: {0}")]
    Unknown(String),

    /// Provider did not answer in time
    #[error("skill {skill} timed out after {after:?}")]
    Timeout {
        /// Skill
        skill: String,
        /// Elapsed time
        after: Duration,
    },

    /// Provider answered with an error
    #[error("skill {skill} rejected the call: {message}")]
    Rejected {
        /// Skill
        skill: String,
        /// Provider message
        message: String,
    },

    /// Connection-level failure
    #[error("skill transport error: {0}")]
    Transport(String),
}

impl SkillError {
    /// Stable reason code recorded as the step failure reason
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotAllowed { .. } => "skill_not_allowed",
            Self::SpawnForbidden(_) => "subagent_spawning_not_allowed",
            Self::Unknown(_) => "skill_unknown",
            Self::Timeout { .. } => "skill_timeout",
            Self::Rejected { .. } => "skill_rejected",
            Self::Transport(_) => "skill_transport_error",
        }
    }
}

/// Errors raised inside a step execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Skill call failed
    #[error(transparent)]
    Skill(#[from] SkillError),

    /// Extraction failed after the narrowing budget
    #[error("extraction failed: {0}")]
    Extraction(#[from] SandboxError),

    /// Extraction produced fields other than the contract's
    #[error("extraction result does not match the return contract")]
    ExtractionContract(ContractViolation),

    /// Payload could not be staged
    #[error(transparent)]
    Staging(#[from] TempStoreError),

    /// Memory note could not be saved
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Decision component failed
    #[error("step agent failed: {0}")]
    Agent(String),
}

impl ExecutorError {
    /// Stable reason code recorded as the step failure reason
    #[must_use]
    pub fn reason_code(&self) -> String {
        match self {
            Self::Skill(e) => e.reason_code().to_string(),
            Self::Extraction(e) => format!("extraction_{}", e.exit_status()),
            Self::ExtractionContract(_) => "extraction_contract_violation".to_string(),
            Self::Staging(_) => "temp_store_error".to_string(),
            Self::Memory(e) => e.reason_code().to_string(),
            Self::Agent(_) => "agent_error".to_string(),
        }
    }
}

/// Planner capability errors
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The task cannot be planned within bounds
    #[error(transparent)]
    Infeasible(#[from] PlanError),

    /// The decision component could not be reached
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

impl PlannerError {
    /// Stable reason code
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Infeasible(e) => e.reason_code(),
            Self::Unavailable(_) => "planner_unavailable",
        }
    }
}

/// Executor pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Pool was shut down
    #[error("executor pool closed")]
    Closed,
}

/// Errors returned to the caller of a run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Plan ended in failure; the structured payload explains why
    #[error("run failed: {}", .0.reason)]
    Failed(Box<StructuredFailure>),

    /// Session was cancelled; the plan stays resumable
    #[error("run cancelled")]
    Cancelled {
        /// Plan left in executing state, if one was created
        plan_id: Option<PlanId>,
    },

    /// Illegal state change (resuming a finished plan, for example)
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Plan persistence failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Memory access failed outside a step
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Executor pool failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    /// Wrap a structured failure
    #[inline]
    #[must_use]
    pub fn failed(failure: StructuredFailure) -> Self {
        Self::Failed(Box::new(failure))
    }

    /// Structured failure, if this is one
    #[must_use]
    pub fn failure(&self) -> Option<&StructuredFailure> {
        match self {
            Self::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Stable reason code
    #[must_use]
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Failed(f) => &f.reason,
            Self::Cancelled { .. } => "cancelled",
            Self::Lifecycle(LifecycleError::TerminalPlan { .. }) => "plan_terminal",
            Self::Lifecycle(_) => "illegal_transition",
            Self::Repository(RepositoryError::NotFound(_)) => "plan_not_found",
            Self::Repository(_) | Self::Memory(_) | Self::Pool(_) | Self::Internal(_) => {
                "internal_error"
            }
        }
    }
}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        Self::Repository(RepositoryError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_requests_share_the_validator_reason() {
        let e = SkillError::SpawnForbidden("spawn_subagent".into());
        assert_eq!(e.reason_code(), "subagent_spawning_not_allowed");
        assert_eq!(
            PlanError::SpawnSkill {
                step_index: 1,
                skill: "spawn_subagent".into()
            }
            .reason_code(),
            e.reason_code()
        );
    }

    #[test]
    fn extraction_codes_carry_exit_status() {
        let e = ExecutorError::Extraction(SandboxError::NetworkDenied("http://x".into()));
        assert_eq!(e.reason_code(), "extraction_network_denied");
    }

    #[test]
    fn structured_failure_is_exposed() {
        let e = RunError::failed(StructuredFailure::new("max replan attempts reached"));
        assert_eq!(e.reason_code(), "max replan attempts reached");
        assert!(e.failure().is_some());
        assert!(RunError::Cancelled { plan_id: None }.failure().is_none());
    }
}
