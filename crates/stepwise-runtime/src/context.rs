//! Step execution context
//!
//! [`StepContext`] is everything a step agent may touch: its own step,
//! the output of the step it reads from, and skill calls limited to the
//! step's allowed skills. It has no spawn operation and no memory keys;
//! an agent may only remember notes about the user or its actions, and
//! gets back whether the note was new. Starting executors needs a
//! [`SpawnAuthority`](crate::pool::SpawnAuthority), which only the
//! orchestrator holds.
//!
//! Every skill response passes the content-length gate before the agent
//! sees it.

use crate::error::{ExecutorError, SkillError};
use crate::gate::{ContentGate, ProcedureDeriver, Route};
use crate::skill::{is_spawn_shaped, SkillClient, SkillRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use stepwise_core::telemetry::LARGE_RESPONSES;
use stepwise_core::{
    shape, Credential, Event, EventKind, EventSink, Identity, Lineage, PlanId, ReturnSpec, Step,
    TaskId,
};
use stepwise_sandbox::{ArtifactRef, ExtractionProcedure, Sandbox};
use stepwise_store::{MemoryGateway, NoteSaved, StagedArtifact, TempStore};
use tokio_util::sync::CancellationToken;

/// Shared services behind every step context
pub struct StepServices {
    /// Skill provider
    pub skills: Arc<dyn SkillClient>,
    /// Staging for oversized payloads
    pub temp: Arc<TempStore>,
    /// Extraction runner
    pub sandbox: Sandbox,
    /// Size gate
    pub gate: ContentGate,
    /// Procedure derivation for staged payloads
    pub deriver: Arc<dyn ProcedureDeriver>,
    /// Audit sink
    pub events: Arc<dyn EventSink>,
    /// Shared memory
    pub memory: Arc<MemoryGateway>,
    /// Narrow-and-retry budget per extraction
    pub extraction_retries: u32,
}

impl std::fmt::Debug for StepServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepServices")
            .field("gate", &self.gate)
            .field("sandbox", &self.sandbox)
            .field("extraction_retries", &self.extraction_retries)
            .finish_non_exhaustive()
    }
}

/// What the executor hands a step agent
#[derive(Debug, Clone)]
pub struct StepAssignment {
    /// Plan
    pub plan_id: PlanId,
    /// Caller
    pub identity: Identity,
    /// The step, with its task id set
    pub step: Step,
    /// Output of `step.input_from_step`, read by the orchestrator
    pub input: Option<Value>,
    /// Forwarded credential for skill calls
    pub credential: Option<Credential>,
}

impl StepAssignment {
    pub(crate) fn lineage(&self) -> Lineage {
        Lineage::new(&self.identity)
            .with_plan(self.plan_id)
            .with_step(self.step.step_index, self.step.task_id)
    }
}

/// How a step agent finished
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Output to validate and store
    Output(Value),
    /// The step needs to be split
    Insufficient {
        /// Why one step is not enough
        reason: String,
        /// How to split it
        suggestion: Option<String>,
    },
    /// The step could not be done
    Failed {
        /// Why
        reason: String,
    },
}

/// Whether a note added anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remembered {
    /// Stored as a new note
    Stored,
    /// An identical note already existed
    AlreadyKnown,
}

impl From<NoteSaved> for Remembered {
    fn from(saved: NoteSaved) -> Self {
        match saved {
            NoteSaved::Stored { .. } => Self::Stored,
            NoteSaved::Duplicate { .. } => Self::AlreadyKnown,
        }
    }
}

/// Decision component for a single step
#[async_trait]
pub trait StepAgent: Send + Sync {
    /// Produce the step's output
    ///
    /// # Errors
    /// Any error becomes a failed step with the error's reason code
    async fn execute(&self, ctx: &StepContext) -> Result<AgentOutcome, ExecutorError>;
}

/// Capability handed to a step agent
#[derive(Debug)]
pub struct StepContext {
    services: Arc<StepServices>,
    assignment: StepAssignment,
    task_id: TaskId,
    cancel: CancellationToken,
}

impl StepContext {
    pub(crate) fn new(
        services: Arc<StepServices>,
        mut assignment: StepAssignment,
        cancel: CancellationToken,
    ) -> Self {
        let task_id = *assignment.step.task_id.get_or_insert_with(TaskId::new);
        Self {
            services,
            assignment,
            task_id,
            cancel,
        }
    }

    /// The step being executed
    #[inline]
    #[must_use]
    pub fn step(&self) -> &Step {
        &self.assignment.step
    }

    /// Step task text
    #[inline]
    #[must_use]
    pub fn task(&self) -> &str {
        &self.assignment.step.task
    }

    /// Step return contract
    #[inline]
    #[must_use]
    pub fn return_spec(&self) -> &ReturnSpec {
        &self.assignment.step.return_spec
    }

    /// Output of the step this one reads from
    #[inline]
    #[must_use]
    pub fn input(&self) -> Option<&Value> {
        self.assignment.input.as_ref()
    }

    /// Execution identity
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Plan the step belongs to
    #[inline]
    #[must_use]
    pub fn plan_id(&self) -> PlanId {
        self.assignment.plan_id
    }

    /// Caller identity
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.assignment.identity
    }

    /// Session cancellation
    #[inline]
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Call an allowed skill; large responses come back already reduced to the contract
    ///
    /// # Errors
    /// - `SkillError::SpawnForbidden` for spawn-shaped skills
    /// - `SkillError::NotAllowed` for skills outside the step's set
    /// - provider errors, or extraction errors for oversized responses
    pub async fn call_skill(&self, skill_id: &str, arguments: Value) -> Result<Value, ExecutorError> {
        self.call(skill_id, arguments, None).await
    }

    /// Like [`StepContext::call_skill`], with an explicit procedure for oversized responses
    ///
    /// # Errors
    /// Same as [`StepContext::call_skill`]
    pub async fn call_skill_with(
        &self,
        skill_id: &str,
        arguments: Value,
        procedure: ExtractionProcedure,
    ) -> Result<Value, ExecutorError> {
        self.call(skill_id, arguments, Some(procedure)).await
    }

    async fn call(
        &self,
        skill_id: &str,
        arguments: Value,
        procedure: Option<ExtractionProcedure>,
    ) -> Result<Value, ExecutorError> {
        if is_spawn_shaped(skill_id) {
            tracing::warn!(skill = skill_id, step = self.step().step_index, "spawn request from executor");
            return Err(SkillError::SpawnForbidden(skill_id.to_string()).into());
        }
        if !self.step().allowed_skills.iter().any(|s| s == skill_id) {
            return Err(SkillError::NotAllowed {
                skill: skill_id.to_string(),
                step_index: self.step().step_index,
            }
            .into());
        }

        let request = SkillRequest {
            skill_id: skill_id.to_string(),
            arguments,
            identity: self.assignment.identity.clone(),
            credential: self.assignment.credential.clone(),
        };
        let started = Instant::now();
        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(SkillError::Transport("cancelled".to_string())),
            r = self.services.skills.call(&request) => r,
        };
        let body = result?;
        self.emit(
            EventKind::SkillCalled,
            json!({
                "skill_id": skill_id,
                "request_bytes": request.request_bytes(),
                "response_bytes": body.len(),
                "duration_ms": millis(started.elapsed()),
            }),
        );

        match self.services.gate.route(body.len()) {
            Route::Direct => Ok(parse_body(body)),
            Route::Extract => self.extract(body, procedure).await,
        }
    }

    /// Remember a fact about the caller for later sessions
    ///
    /// # Errors
    /// `ExecutorError::Memory` for non-object notes, bad labels or store failures
    pub async fn remember_for_user(
        &self,
        label: &str,
        note: Value,
    ) -> Result<Remembered, ExecutorError> {
        let saved = self
            .services
            .memory
            .save_user_memory(self.identity(), label, note, None)
            .await?;
        Ok(saved.into())
    }

    /// Record the outcome of an action for the rest of the session
    ///
    /// # Errors
    /// Same as [`StepContext::remember_for_user`]
    pub async fn record_action(
        &self,
        label: &str,
        note: Value,
    ) -> Result<Remembered, ExecutorError> {
        let saved = self
            .services
            .memory
            .save_action_memory(self.identity(), label, note, None)
            .await?;
        Ok(saved.into())
    }

    async fn extract(
        &self,
        body: String,
        procedure: Option<ExtractionProcedure>,
    ) -> Result<Value, ExecutorError> {
        let services = &self.services;
        let staged = services.temp.stage(self.task_id, body.into_bytes()).await?;
        metrics::counter!(LARGE_RESPONSES).increment(1);
        self.emit(
            EventKind::LargeResponseDetected,
            json!({
                "artifact_ref": staged.file_id.to_string(),
                "bytes": staged.byte_len,
                "strategy": "stage_sample_extract",
            }),
        );

        let sample = services
            .temp
            .sample(self.task_id, staged.file_id, 0, services.gate.sample_lines)
            .await?;
        let mut procedure = procedure
            .unwrap_or_else(|| services.deriver.derive(&sample, self.return_spec()));
        let artifact = artifact_ref(&staged);

        let mut attempt = 0;
        let report = loop {
            attempt += 1;
            let started = Instant::now();
            match services.sandbox.run(&procedure, &artifact, &self.cancel).await {
                Ok(report) => {
                    self.emit(
                        EventKind::ExtractionExecuted,
                        json!({
                            "procedure_hash": report.procedure_hash.to_string(),
                            "input_bytes": report.input_bytes,
                            "output_bytes": report.output_bytes,
                            "duration_ms": millis(report.duration),
                            "exit_status": "ok",
                            "attempt": attempt,
                        }),
                    );
                    break report;
                }
                Err(e) => {
                    self.emit(
                        EventKind::ExtractionExecuted,
                        json!({
                            "procedure_hash": procedure.hash().to_string(),
                            "input_bytes": artifact.byte_len,
                            "output_bytes": 0,
                            "duration_ms": millis(started.elapsed()),
                            "exit_status": e.exit_status(),
                            "attempt": attempt,
                        }),
                    );
                    let narrowed = procedure.narrowed().filter(|_| e.is_retryable());
                    match narrowed {
                        Some(next) if attempt <= services.extraction_retries => {
                            tracing::debug!(attempt, error = %e, "narrowing extraction procedure");
                            procedure = next;
                        }
                        _ => return Err(e.into()),
                    }
                }
            }
        };

        shape::validate_exact(&report.output, self.return_spec())
            .map_err(ExecutorError::ExtractionContract)?;
        Ok(report.output)
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        self.services
            .events
            .record(Event::new(kind, self.assignment.lineage(), payload));
    }
}

fn artifact_ref(staged: &StagedArtifact) -> ArtifactRef {
    ArtifactRef {
        path: staged.path().to_path_buf(),
        scope: staged.scope().to_path_buf(),
        byte_len: staged.byte_len,
    }
}

fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
