//! Orchestrator
//!
//! The single mutator of a plan and the only holder of spawn authority:
//! - drafts a plan through the planner and re-checks it before executing
//! - runs steps in order, one executor per step, through the pool
//! - reads every step output back from memory, which also releases its lock
//! - hands failures to the replan controller
//! - fails the plan outright when a stored output can no longer be read
//! - synthesizes the response from memory values only
//!
//! # Workflow
//! 1. `pending -> planning`: planner drafts, bounds and contracts are checked
//! 2. `planning -> executing`: valid plan persisted
//! 3. `executing <-> replanning`: any step failure, bounded by the replan budget
//! 4. `complete` or `failed`

use crate::context::{StepAgent, StepAssignment, StepServices};
use crate::error::{PoolError, RunError};
use crate::executor::{StepExecutor, StepOutcome};
use crate::gate::{ContentGate, ContractProjection, ProcedureDeriver};
use crate::journal::PlanJournal;
use crate::planner::{validate_plan, verify_return_specs, Planner, PlanningContext};
use crate::pool::{ExecutorPool, PoolStats, SpawnAuthority};
use crate::replan::{ReplanController, ReplanDecision, StepFailure};
use crate::signal::{BroadcastBus, CancellationRegistry, Signal, SignalBus};
use crate::skill::{SkillCatalog, SkillClient};
use crate::synthesis::synthesize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use stepwise_core::telemetry::{CONTRACT_VIOLATIONS, PLANS_FINISHED};
use stepwise_core::{
    Credential, EventKind, EventSink, Identity, LifecycleError, Lineage, Plan, PlanId,
    PlanStatus, ReplanTrigger, RunRequest, RunResponse, StepStatus, StepwiseConfig,
    StructuredFailure, TaskId,
};
use stepwise_sandbox::{Sandbox, SandboxLimits};
use stepwise_store::{
    DocumentStore, EventLog, InMemoryDocumentStore, MemoryError, MemoryGateway, PersonaStore,
    PlanRepository, TempStore,
};
use tokio_util::sync::CancellationToken;

/// Reason given for malformed caller identity
pub const INVALID_IDENTITY: &str = "invalid_identity";

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Credential forwarded to skill calls
    pub credential: Option<Credential>,
    /// Cancellation for this run; defaults to the session token
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    /// With forwarded credential
    #[inline]
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// With explicit cancellation
    #[inline]
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    planner: Arc<dyn Planner>,
    agent: Arc<dyn StepAgent>,
    skills: Arc<dyn SkillClient>,
    catalog: SkillCatalog,
    config: StepwiseConfig,
    store: Option<Arc<dyn DocumentStore>>,
    events: Option<Arc<dyn EventSink>>,
    deriver: Option<Arc<dyn ProcedureDeriver>>,
    signals: Option<Arc<dyn SignalBus>>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// With skill catalog
    #[inline]
    #[must_use]
    pub fn catalog(mut self, catalog: SkillCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// With configuration
    #[inline]
    #[must_use]
    pub fn config(mut self, config: StepwiseConfig) -> Self {
        self.config = config;
        self
    }

    /// With document store (in-memory by default)
    #[inline]
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// With audit sink (a fresh event log by default)
    #[inline]
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// With procedure deriver for oversized responses
    #[inline]
    #[must_use]
    pub fn deriver(mut self, deriver: Arc<dyn ProcedureDeriver>) -> Self {
        self.deriver = Some(deriver);
        self
    }

    /// With signal bus
    #[inline]
    #[must_use]
    pub fn signals(mut self, signals: Arc<dyn SignalBus>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Assemble the orchestrator
    ///
    /// # Errors
    /// Returns `RunError::Internal` for invalid configuration or if the temp
    /// store cannot be created
    pub fn build(self) -> Result<Orchestrator, RunError> {
        let cfg = self.config;
        cfg.validate().map_err(|e| RunError::Internal(e.to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(EventLog::new()));
        let temp = Arc::new(TempStore::new(&cfg.temp).map_err(|e| RunError::Internal(e.to_string()))?);
        let memory = Arc::new(MemoryGateway::new(Arc::clone(&store), Arc::clone(&events), &cfg));

        let services = StepServices {
            skills: self.skills,
            temp: Arc::clone(&temp),
            sandbox: Sandbox::new(SandboxLimits::from_config(&cfg)),
            gate: ContentGate::from_config(&cfg),
            deriver: self.deriver.unwrap_or_else(|| Arc::new(ContractProjection)),
            events: Arc::clone(&events),
            memory: Arc::clone(&memory),
            extraction_retries: cfg.sandbox.extraction_retries,
        };
        let executor = StepExecutor::new(Arc::new(services), self.agent, &cfg);

        Ok(Orchestrator {
            journal: PlanJournal::new(PlanRepository::new(Arc::clone(&store)), events),
            planner: Arc::clone(&self.planner),
            replan: ReplanController::new(self.planner, cfg.limits.max_replans),
            catalog: Arc::new(self.catalog),
            personas: PersonaStore::new(store),
            memory,
            temp,
            pool: ExecutorPool::new(Arc::new(executor), cfg.limits.max_concurrent_executors),
            signals: self
                .signals
                .unwrap_or_else(|| Arc::new(BroadcastBus::default())),
            cancellations: Arc::new(CancellationRegistry::new()),
            authority: SpawnAuthority::mint(),
            max_steps: cfg.limits.max_steps,
        })
    }
}

/// Plan orchestrator
pub struct Orchestrator {
    journal: PlanJournal,
    planner: Arc<dyn Planner>,
    replan: ReplanController,
    catalog: Arc<SkillCatalog>,
    personas: PersonaStore,
    memory: Arc<MemoryGateway>,
    temp: Arc<TempStore>,
    pool: ExecutorPool,
    signals: Arc<dyn SignalBus>,
    cancellations: Arc<CancellationRegistry>,
    authority: SpawnAuthority,
    max_steps: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_steps", &self.max_steps)
            .field("replan", &self.replan)
            .field("pool", &self.pool.stats())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder(
        planner: Arc<dyn Planner>,
        agent: Arc<dyn StepAgent>,
        skills: Arc<dyn SkillClient>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            planner,
            agent,
            skills,
            catalog: SkillCatalog::new(),
            config: StepwiseConfig::default(),
            store: None,
            events: None,
            deriver: None,
            signals: None,
        }
    }

    /// Plan persistence
    #[inline]
    #[must_use]
    pub fn plans(&self) -> &PlanRepository {
        self.journal.repository()
    }

    /// Memory gateway
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &MemoryGateway {
        &self.memory
    }

    /// Persona store
    #[inline]
    #[must_use]
    pub fn personas(&self) -> &PersonaStore {
        &self.personas
    }

    /// Session cancellation
    #[inline]
    #[must_use]
    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Signal bus
    #[inline]
    #[must_use]
    pub fn signals(&self) -> &dyn SignalBus {
        self.signals.as_ref()
    }

    /// Skill capabilities
    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &SkillCatalog {
        &self.catalog
    }

    /// Executor pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Drop expired staged artifacts
    pub async fn sweep_temp(&self) -> usize {
        self.temp.sweep().await
    }

    /// Stop starting executors; later runs fail before any plan is created
    pub fn shutdown(&self) {
        self.pool.close();
        tracing::info!(stats = ?self.pool.stats(), "executor pool closed");
    }

    /// Run a task to completion
    ///
    /// # Errors
    /// - `RunError::Failed` with a structured failure for infeasible plans,
    ///   exhausted replans, or malformed identity
    /// - `RunError::Cancelled` if the session was cancelled; the plan stays resumable
    /// - persistence errors
    #[tracing::instrument(skip_all, fields(tenant = %request.tenant_id, session = %request.session_id))]
    pub async fn run(&self, request: &RunRequest, opts: RunOptions) -> Result<RunResponse, RunError> {
        let identity = request.identity();
        if !identity_is_valid(&identity) {
            return Err(RunError::failed(StructuredFailure::new(INVALID_IDENTITY)));
        }
        if self.pool.is_closed() {
            return Err(PoolError::Closed.into());
        }
        self.journal.emit_with(
            Lineage::new(&identity),
            EventKind::RunReceived,
            json!({
                "message_bytes": request.message.len(),
                "stream": request.stream,
                "credential_forwarded": opts.credential.is_some(),
            }),
        );

        let cancel = self.cancel_token(&identity, &opts);
        let result = self.plan_and_drive(request, identity.clone(), &opts, &cancel).await;
        if !matches!(result, Err(RunError::Cancelled { .. })) {
            self.cancellations
                .finish(&identity.tenant_id, &identity.session_id);
        }
        result
    }

    /// Continue a persisted, unfinished plan from its first incomplete step
    ///
    /// # Errors
    /// - `RunError::Lifecycle` if the plan is terminal or never got past planning
    /// - otherwise as [`Orchestrator::run`]
    #[tracing::instrument(skip_all, fields(%plan_id))]
    pub async fn resume(&self, plan_id: PlanId, opts: RunOptions) -> Result<RunResponse, RunError> {
        if self.pool.is_closed() {
            return Err(PoolError::Closed.into());
        }
        let mut plan = self.plans().get(plan_id).await?;
        match plan.status {
            PlanStatus::Complete | PlanStatus::Failed => {
                return Err(LifecycleError::TerminalPlan {
                    plan_id,
                    status: plan.status,
                }
                .into());
            }
            PlanStatus::Pending | PlanStatus::Planning => {
                return Err(LifecycleError::IllegalPlanTransition {
                    from: plan.status,
                    to: PlanStatus::Executing,
                }
                .into());
            }
            PlanStatus::Replanning => {
                self.journal
                    .transition(&mut plan, PlanStatus::Executing, "resumed")
                    .await?;
            }
            PlanStatus::Executing => {}
        }

        let mut interrupted = false;
        for step in plan.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
            step.mark_interrupted()?;
            interrupted = true;
        }
        if interrupted {
            self.journal.save(&mut plan).await?;
        }
        tracing::info!(replans = plan.replan_count, "resuming plan");

        let identity = plan.identity.clone();
        let ctx = self.planning_context(&identity).await?;
        let cancel = self.cancel_token(&identity, &opts);
        let result = self.drive(&mut plan, &ctx, &opts, &cancel).await;
        if !matches!(result, Err(RunError::Cancelled { .. })) {
            self.cancellations
                .finish(&identity.tenant_id, &identity.session_id);
        }
        result
    }

    async fn plan_and_drive(
        &self,
        request: &RunRequest,
        identity: Identity,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunResponse, RunError> {
        let mut plan = Plan::new(identity.clone(), &request.message);
        self.journal.create(&mut plan).await?;
        self.journal
            .transition(&mut plan, PlanStatus::Planning, "run accepted")
            .await?;

        let ctx = self.planning_context(&identity).await?;
        let drafted = match self.planner.plan(&request.message, &ctx).await {
            Ok(steps) => validate_plan(&steps, self.max_steps)
                .and_then(|()| verify_return_specs(&steps, &self.catalog))
                .map(|()| steps)
                .map_err(|e| e.reason_code().to_string()),
            Err(e) => Err(e.reason_code().to_string()),
        };
        let steps = match drafted {
            Ok(steps) => steps,
            Err(reason) => {
                tracing::warn!(%reason, "plan rejected");
                let report = StructuredFailure::for_plan(&plan, &reason);
                self.journal
                    .transition(&mut plan, PlanStatus::Failed, &reason)
                    .await?;
                self.finished(&plan);
                return Err(RunError::failed(report));
            }
        };

        plan.steps = steps;
        self.journal
            .transition(&mut plan, PlanStatus::Executing, "plan validated")
            .await?;
        self.drive(&mut plan, &ctx, opts, cancel).await
    }

    async fn drive(
        &self,
        plan: &mut Plan,
        ctx: &PlanningContext,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunResponse, RunError> {
        while let Some(position) = plan.next_pending_position() {
            if cancel.is_cancelled() {
                tracing::info!(plan_id = %plan.plan_id, "run cancelled before step start");
                return Err(RunError::Cancelled {
                    plan_id: Some(plan.plan_id),
                });
            }

            if plan.steps[position].status == StepStatus::Failed {
                let reason = plan.steps[position]
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "step_failed".to_string());
                self.recover(plan, ctx, StepFailure::new(position, ReplanTrigger::Failed, reason))
                    .await?;
                continue;
            }

            let failure = match self.run_step(plan, position, opts, cancel).await? {
                StepOutcome::Ok { memory_key } => {
                    if let Err(e) = self.memory.read_confirmed(&memory_key).await {
                        return Err(self.abandon(plan, Some(position), e).await);
                    }
                    let step = &mut plan.steps[position];
                    step.mark_complete(&memory_key)?;
                    let step_index = step.step_index;
                    self.journal.save(plan).await?;
                    self.signals.publish(Signal::StepCompleted {
                        plan_id: plan.plan_id,
                        step_index,
                        memory_key,
                    });
                    continue;
                }
                StepOutcome::Cancelled => {
                    plan.steps[position].mark_interrupted()?;
                    self.journal.save(plan).await?;
                    tracing::info!(plan_id = %plan.plan_id, "run cancelled mid-step");
                    return Err(RunError::Cancelled {
                        plan_id: Some(plan.plan_id),
                    });
                }
                StepOutcome::Insufficient { reason, suggestion } => {
                    self.emit_step(
                        plan,
                        position,
                        EventKind::StepInsufficient,
                        json!({"reason": reason, "suggestion": suggestion}),
                    );
                    StepFailure::new(position, ReplanTrigger::Insufficient, reason)
                        .with_suggestion(suggestion)
                }
                StepOutcome::Failed { reason } => {
                    StepFailure::new(position, ReplanTrigger::Failed, reason)
                }
                StepOutcome::ContractViolation(violation) => {
                    let step_index = plan.steps[position].step_index;
                    metrics::counter!(CONTRACT_VIOLATIONS).increment(1);
                    tracing::warn!(
                        plan_id = %plan.plan_id,
                        step_index,
                        expected = %violation.expected,
                        actual = %violation.actual,
                        "step output violated its return contract"
                    );
                    self.emit_step(
                        plan,
                        position,
                        EventKind::ContractViolation,
                        json!({
                            "expected_shape": violation.expected,
                            "actual_shape": violation.actual,
                            "step_index": step_index,
                            "details": violation.details,
                        }),
                    );
                    StepFailure::new(position, ReplanTrigger::ContractViolation, "contract_violation")
                }
            };

            plan.steps[position].mark_failed(&failure.reason)?;
            self.journal.save(plan).await?;
            self.recover(plan, ctx, failure).await?;
        }

        self.complete(plan).await
    }

    /// Start one step through the pool and wait for its report
    async fn run_step(
        &self,
        plan: &mut Plan,
        position: usize,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, RunError> {
        let input = match plan.steps[position].input_from_step {
            Some(from) => match self.step_output(plan, from).await {
                Ok(value) => Some(value),
                Err(RunError::Memory(e)) => return Err(self.abandon(plan, None, e).await),
                Err(e) => return Err(e),
            },
            None => None,
        };

        let task_id = TaskId::new();
        plan.steps[position].mark_running(task_id)?;
        self.journal.save(plan).await?;
        let step = plan.steps[position].clone();
        self.emit_step(
            plan,
            position,
            EventKind::StepStarted,
            json!({
                "task": step.task,
                "allowed_skills": step.allowed_skills,
                "input_from_step": step.input_from_step,
            }),
        );

        let assignment = StepAssignment {
            plan_id: plan.plan_id,
            identity: plan.identity.clone(),
            step,
            input,
            credential: opts.credential.clone(),
        };
        let started = Instant::now();
        let handle = self
            .pool
            .spawn(&self.authority, assignment, cancel.child_token())
            .await?;
        let outcome = handle.outcome().await;
        self.emit_step(
            plan,
            position,
            EventKind::StepFinished,
            json!({
                "status": outcome.status(),
                "duration_ms": crate::context::millis(started.elapsed()),
            }),
        );
        Ok(outcome)
    }

    async fn recover(
        &self,
        plan: &mut Plan,
        ctx: &PlanningContext,
        failure: StepFailure,
    ) -> Result<(), RunError> {
        match self
            .replan
            .on_step_failure(plan, &self.journal, &failure, ctx)
            .await?
        {
            ReplanDecision::Continue => Ok(()),
            ReplanDecision::Exhausted(report) | ReplanDecision::Infeasible(report) => {
                self.finished(plan);
                Err(RunError::failed(report))
            }
        }
    }

    async fn complete(&self, plan: &mut Plan) -> Result<RunResponse, RunError> {
        let mut outputs = Vec::with_capacity(plan.steps.len());
        let keys: Vec<String> = plan
            .completed_steps()
            .filter_map(|step| step.memory_key.clone())
            .collect();
        for key in &keys {
            match self.memory.read(key).await {
                Ok(value) => outputs.push(value),
                Err(e) => return Err(self.abandon(plan, None, e).await),
            }
        }
        let response = synthesize(&outputs, plan.completed_steps().next().is_some());
        self.journal
            .transition(plan, PlanStatus::Complete, "all steps complete")
            .await?;
        self.finished(plan);
        Ok(RunResponse {
            status: PlanStatus::Complete,
            response,
            plan_id: plan.plan_id,
        })
    }

    /// Fail the plan because a stored output is unreadable
    ///
    /// A running step at `position` is marked failed with the same reason.
    async fn abandon(
        &self,
        plan: &mut Plan,
        position: Option<usize>,
        error: MemoryError,
    ) -> RunError {
        let reason = error.reason_code();
        tracing::warn!(plan_id = %plan.plan_id, %error, "stored step output unreadable, failing plan");
        match self.fail_plan(plan, position, reason).await {
            Ok(report) => RunError::failed(report),
            Err(e) => e,
        }
    }

    async fn fail_plan(
        &self,
        plan: &mut Plan,
        position: Option<usize>,
        reason: &str,
    ) -> Result<StructuredFailure, RunError> {
        if let Some(step) = position
            .and_then(|p| plan.steps.get_mut(p))
            .filter(|s| s.status == StepStatus::Running)
        {
            step.mark_failed(reason)?;
        }
        let report = StructuredFailure::for_plan(plan, reason);
        self.journal
            .transition(plan, PlanStatus::Failed, reason)
            .await?;
        self.finished(plan);
        Ok(report)
    }

    async fn step_output(&self, plan: &Plan, step_index: u32) -> Result<Value, RunError> {
        let key = plan
            .step(step_index)
            .and_then(|s| s.memory_key.as_deref())
            .ok_or_else(|| {
                RunError::Internal(format!("step {step_index} has no stored output"))
            })?;
        Ok(self.memory.read(key).await?)
    }

    async fn planning_context(&self, identity: &Identity) -> Result<PlanningContext, RunError> {
        let persona = self
            .personas
            .get(&identity.tenant_id, Some(&identity.user_id))
            .await?;
        Ok(PlanningContext {
            identity: identity.clone(),
            persona,
            max_steps: self.max_steps,
            catalog: Arc::clone(&self.catalog),
        })
    }

    fn cancel_token(&self, identity: &Identity, opts: &RunOptions) -> CancellationToken {
        opts.cancel.clone().unwrap_or_else(|| {
            self.cancellations
                .token(&identity.tenant_id, &identity.session_id)
        })
    }

    fn finished(&self, plan: &Plan) {
        metrics::counter!(PLANS_FINISHED, "status" => plan.status.as_str()).increment(1);
        self.signals.publish(Signal::PlanFinished {
            plan_id: plan.plan_id,
            status: plan.status,
        });
    }

    fn emit_step(&self, plan: &Plan, position: usize, kind: EventKind, payload: Value) {
        let step = &plan.steps[position];
        self.journal.emit_with(
            Lineage::new(&plan.identity)
                .with_plan(plan.plan_id)
                .with_step(step.step_index, step.task_id),
            kind,
            payload,
        );
    }
}

fn identity_is_valid(identity: &Identity) -> bool {
    [&identity.tenant_id, &identity.user_id, &identity.session_id]
        .iter()
        .all(|s| !s.trim().is_empty() && !s.contains(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_segments_must_be_plain() {
        assert!(identity_is_valid(&Identity::new("t", "u", "s")));
        assert!(!identity_is_valid(&Identity::new("", "u", "s")));
        assert!(!identity_is_valid(&Identity::new("t", "u", "a:b")));
    }

    #[test]
    fn run_options_carry_redacted_credential() {
        let opts = RunOptions::default().with_credential(Credential::new("secret-token"));
        assert!(!format!("{opts:?}").contains("secret-token"));
    }
}
