//! Step executor
//!
//! Runs exactly one step:
//! 1. hands the agent a [`StepContext`] under the step timeout
//! 2. projects the agent's output onto the return contract and self-checks it
//! 3. writes it through the memory gateway, retrying once on lock timeout
//! 4. drops the task's staged artifacts
//!
//! Every path ends in a [`StepOutcome`]; nothing is dropped silently.

use crate::context::{AgentOutcome, StepAgent, StepAssignment, StepContext, StepServices};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{shape, ContractViolation, StepwiseConfig};
use stepwise_store::{MemoryError, WriteTarget};
use tokio_util::sync::CancellationToken;

/// Reason recorded when the step budget runs out
pub const STEP_TIMEOUT: &str = "step_timeout";

/// How a step ended
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Output validated and written
    Ok {
        /// Full key of the stored output
        memory_key: String,
    },
    /// The step needs to be split
    Insufficient {
        /// Why
        reason: String,
        /// Split hint
        suggestion: Option<String>,
    },
    /// The step failed
    Failed {
        /// Reason code
        reason: String,
    },
    /// Output did not satisfy the return contract
    ContractViolation(ContractViolation),
    /// Session cancelled mid-step
    Cancelled,
}

impl StepOutcome {
    /// Status label for events
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "complete",
            Self::Insufficient { .. } => "insufficient",
            Self::Failed { .. } => "failed",
            Self::ContractViolation(_) => "contract_violation",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Single-step executor
pub struct StepExecutor {
    services: Arc<StepServices>,
    agent: Arc<dyn StepAgent>,
    timeout: Duration,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Create executor
    #[must_use]
    pub fn new(
        services: Arc<StepServices>,
        agent: Arc<dyn StepAgent>,
        cfg: &StepwiseConfig,
    ) -> Self {
        Self {
            services,
            agent,
            timeout: cfg.step_timeout(),
        }
    }

    /// Execute one step
    #[tracing::instrument(skip_all, fields(step = assignment.step.step_index, plan = %assignment.plan_id))]
    pub async fn execute(&self, assignment: StepAssignment, cancel: CancellationToken) -> StepOutcome {
        let ctx = StepContext::new(Arc::clone(&self.services), assignment, cancel.clone());
        let outcome = self.run(&ctx, &cancel).await;
        let dropped = self.services.temp.release_task(ctx.task_id()).await;
        tracing::debug!(status = outcome.status(), dropped, "step executed");
        outcome
    }

    async fn run(&self, ctx: &StepContext, cancel: &CancellationToken) -> StepOutcome {
        let agent_result = tokio::select! {
            biased;
            () = cancel.cancelled() => return StepOutcome::Cancelled,
            r = tokio::time::timeout(self.timeout, self.agent.execute(ctx)) => r,
        };
        let outcome = match agent_result {
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "step timed out");
                return StepOutcome::Failed {
                    reason: STEP_TIMEOUT.to_string(),
                };
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "step agent error");
                return StepOutcome::Failed {
                    reason: e.reason_code(),
                };
            }
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            AgentOutcome::Output(data) => self.store(ctx, data).await,
            AgentOutcome::Insufficient { reason, suggestion } => {
                StepOutcome::Insufficient { reason, suggestion }
            }
            AgentOutcome::Failed { reason } => StepOutcome::Failed { reason },
        }
    }

    async fn store(&self, ctx: &StepContext, data: Value) -> StepOutcome {
        let spec = ctx.return_spec();
        let output = shape::project(&data, spec);
        if let Err(violation) = shape::validate(&output, spec) {
            return StepOutcome::ContractViolation(violation);
        }

        let step = ctx.step();
        let identity = ctx.identity();
        let target = WriteTarget::new(&identity.tenant_id, &identity.session_id, ctx.task_id())
            .with_step(ctx.plan_id(), step.step_index);
        let label = step.memory_label();

        let mut retried = false;
        loop {
            match self.services.memory.write(&label, output.clone(), spec, &target).await {
                Ok(receipt) => {
                    return StepOutcome::Ok {
                        memory_key: receipt.memory_key,
                    }
                }
                Err(e) if e.is_retryable() && !retried => {
                    tracing::debug!(error = %e, "retrying memory write");
                    retried = true;
                }
                Err(MemoryError::ContractViolation(v)) => return StepOutcome::ContractViolation(v),
                Err(e) => {
                    return StepOutcome::Failed {
                        reason: e.reason_code().to_string(),
                    }
                }
            }
        }
    }
}
