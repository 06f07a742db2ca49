//! Core types for Stepwise
//!
//! Defines the documents the orchestrator owns and persists:
//! - Identifiers (plan, task, staged file)
//! - Return contracts and their field shapes
//! - Plans, steps and replan history
//! - Run requests, responses and structured failures
//! - Personas

use crate::error::{LifecycleError, PlanError};
use crate::lifecycle::{validate_plan_transition, validate_step_transition};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Unique plan identifier (ULID for sortability)
    PlanId
);
ulid_id!(
    /// Identity of one step execution; also the memory lock owner
    TaskId
);
ulid_id!(
    /// Identifier of a staged temp artifact
    FileId
);

/// Caller identity propagated from the request boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Tenant namespace
    pub tenant_id: String,
    /// End user within the tenant
    pub user_id: String,
    /// Conversation session
    pub session_id: String,
}

impl Identity {
    /// Create identity
    #[inline]
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// Expected shape of one return field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldShape {
    /// JSON string
    String,
    /// JSON integer (booleans are not integers)
    Integer,
    /// Any JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// Unconstrained
    Any,
}

impl FieldShape {
    /// Parse a shape name; unknown names are unconstrained
    #[must_use]
    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "string" | "str" => Self::String,
            "int" | "integer" => Self::Integer,
            "float" | "number" => Self::Number,
            "bool" | "boolean" => Self::Boolean,
            "object" | "dict" | "map" => Self::Object,
            n if n.starts_with("array") || n.starts_with("list") => Self::Array,
            _ => Self::Any,
        }
    }

    /// Canonical shape name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

impl From<String> for FieldShape {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<FieldShape> for String {
    fn from(value: FieldShape) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for FieldShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Return contract of a step: named fields with expected shapes
///
/// Fixed when the plan (or a revision) is produced. Field order is kept so
/// that shape descriptions and extraction output are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnSpec {
    /// Field name to expected shape
    pub shape: IndexMap<String, FieldShape>,
    /// Why the planner asked for these fields
    #[serde(default)]
    pub rationale: String,
}

impl ReturnSpec {
    /// Create empty contract
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    #[inline]
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.shape.insert(name.into(), shape);
        self
    }

    /// Set rationale
    #[inline]
    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.shape.keys().map(String::as_str)
    }

    /// Whether the contract names a field
    #[inline]
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.shape.contains_key(field)
    }

    /// Number of fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    /// Whether the contract has no fields
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Expected shape as a JSON object (`{"field": "string"}`)
    #[must_use]
    pub fn expected_shape(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.shape
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
                .collect(),
        )
    }
}

/// Plan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, planner not yet invoked
    Pending,
    /// Planner producing the initial plan
    Planning,
    /// Steps running
    Executing,
    /// Planner revising remaining steps
    Replanning,
    /// All steps complete (terminal)
    Complete,
    /// Gave up (terminal)
    Failed,
}

impl PlanStatus {
    /// Terminal states accept no further mutation
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Wire name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Replanning => "replanning",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting to run
    Pending,
    /// Executor in flight
    Running,
    /// Output validated and written
    Complete,
    /// Gave up on this step
    Failed,
}

impl StepStatus {
    /// Wire name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// One unit of work in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Ordinal position, stable across replans of earlier steps
    pub step_index: u32,
    /// What the step must accomplish
    pub task: String,
    /// Skills this step may call
    #[serde(default)]
    pub allowed_skills: Vec<String>,
    /// Output contract
    #[serde(default)]
    pub return_spec: ReturnSpec,
    /// Step whose output this step consumes
    #[serde(default)]
    pub input_from_step: Option<u32>,
    /// Current status
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    /// Execution identity, assigned when the step starts
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Full memory key, set only after a validated write
    #[serde(default)]
    pub memory_key: Option<String>,
    /// Why the step failed
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// When execution began
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl Step {
    /// Create pending step
    #[inline]
    #[must_use]
    pub fn new(step_index: u32, task: impl Into<String>) -> Self {
        Self {
            step_index,
            task: task.into(),
            allowed_skills: Vec::new(),
            return_spec: ReturnSpec::default(),
            input_from_step: None,
            status: StepStatus::Pending,
            task_id: None,
            memory_key: None,
            failure_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// With allowed skills
    #[inline]
    #[must_use]
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// With return contract
    #[inline]
    #[must_use]
    pub fn with_return_spec(mut self, spec: ReturnSpec) -> Self {
        self.return_spec = spec;
        self
    }

    /// With input dependency
    #[inline]
    #[must_use]
    pub fn with_input_from(mut self, step_index: u32) -> Self {
        self.input_from_step = Some(step_index);
        self
    }

    /// Short memory label for this step's output
    #[inline]
    #[must_use]
    pub fn memory_label(&self) -> String {
        format!("step_{}_output", self.step_index)
    }

    /// Whether the step finished with a validated write
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }

    /// Pending -> Running, assigning the execution identity
    ///
    /// # Errors
    /// Returns `LifecycleError::IllegalStepTransition` unless pending
    pub fn mark_running(&mut self, task_id: TaskId) -> Result<(), LifecycleError> {
        validate_step_transition(self.status, StepStatus::Running)?;
        self.status = StepStatus::Running;
        self.task_id = Some(task_id);
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.failure_reason = None;
        Ok(())
    }

    /// Running -> Complete, recording the validated memory key
    ///
    /// # Errors
    /// Returns `LifecycleError::IllegalStepTransition` unless running
    pub fn mark_complete(&mut self, memory_key: impl Into<String>) -> Result<(), LifecycleError> {
        validate_step_transition(self.status, StepStatus::Complete)?;
        self.status = StepStatus::Complete;
        self.memory_key = Some(memory_key.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Failed
    ///
    /// # Errors
    /// Returns `LifecycleError::IllegalStepTransition` unless running
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), LifecycleError> {
        validate_step_transition(self.status, StepStatus::Failed)?;
        self.status = StepStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Pending after cancellation; the step can be resumed
    ///
    /// # Errors
    /// Returns `LifecycleError::IllegalStepTransition` unless running
    pub fn mark_interrupted(&mut self) -> Result<(), LifecycleError> {
        validate_step_transition(self.status, StepStatus::Pending)?;
        self.status = StepStatus::Pending;
        self.task_id = None;
        self.started_at = None;
        Ok(())
    }
}

/// What caused a replan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanTrigger {
    /// Step reported it needs to be split
    Insufficient,
    /// Skill error, timeout, or extraction failure
    Failed,
    /// Output did not match the return contract
    ContractViolation,
}

impl ReplanTrigger {
    /// Wire name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::Failed => "failed",
            Self::ContractViolation => "contract_violation",
        }
    }
}

/// Append-only record of one replan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanRecord {
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Trigger
    pub trigger: ReplanTrigger,
    /// Index of the step that failed
    pub failed_step: u32,
    /// Failure reason
    pub reason: String,
    /// When the revision was merged
    pub revised_at: DateTime<Utc>,
}

/// A bounded, persisted plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Identifier
    pub plan_id: PlanId,
    /// Caller identity
    #[serde(flatten)]
    pub identity: Identity,
    /// Original user task
    pub task: String,
    /// Lifecycle status
    pub status: PlanStatus,
    /// Ordered steps
    pub steps: Vec<Step>,
    /// Replans consumed
    pub replan_count: u32,
    /// Replan history (append-only)
    pub replan_history: Vec<ReplanRecord>,
    /// Snapshot version, bumped by the repository on every save
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    /// Create a pending plan with no steps
    #[must_use]
    pub fn new(identity: Identity, task: impl Into<String>) -> Self {
        Self {
            plan_id: PlanId::new(),
            identity,
            task: task.into(),
            status: PlanStatus::Pending,
            steps: Vec::new(),
            replan_count: 0,
            replan_history: Vec::new(),
            version: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a new status
    ///
    /// # Errors
    /// - `LifecycleError::TerminalPlan` if the plan already finished
    /// - `LifecycleError::IllegalPlanTransition` for any other disallowed move
    pub fn transition(&mut self, to: PlanStatus) -> Result<PlanStatus, LifecycleError> {
        if self.status.is_terminal() {
            return Err(LifecycleError::TerminalPlan {
                plan_id: self.plan_id,
                status: self.status,
            });
        }
        validate_plan_transition(self.status, to)?;
        let from = self.status;
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(from)
    }

    /// Whether the plan is finished
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Position of the first step that is not complete
    #[must_use]
    pub fn next_pending_position(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.is_complete())
    }

    /// Step by index
    #[must_use]
    pub fn step(&self, step_index: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_index == step_index)
    }

    /// Completed steps in order
    pub fn completed_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_complete())
    }

    /// Summaries of completed steps
    #[must_use]
    pub fn completed_summaries(&self) -> Vec<CompletedStep> {
        self.completed_steps().map(CompletedStep::from).collect()
    }
    /// Replace the steps from `position` onward with a revision
    ///
    /// Steps before `position` are kept untouched. Revised steps are renumbered
    /// from the index of the step they replace; `input_from_step` references
    /// between revised steps follow the renumbering, references to kept steps
    /// are left as they are.
    ///
    /// # Errors
    /// - `PlanError::Empty` if the revision has no steps
    /// - `PlanError::CompletedStepReplaced` if the replaced slice holds a completed step
    /// - `PlanError::TooManySteps` if the merged plan exceeds `max_steps`
    pub fn revise_remaining(
        &mut self,
        position: usize,
        revised: Vec<Step>,
        max_steps: usize,
    ) -> Result<(), PlanError> {
        if revised.is_empty() {
            return Err(PlanError::Empty);
        }
        if let Some(done) = self.steps.iter().skip(position).find(|s| s.is_complete()) {
            return Err(PlanError::CompletedStepReplaced(done.step_index));
        }
        let kept = position.min(self.steps.len());
        let count = kept + revised.len();
        if count > max_steps {
            return Err(PlanError::TooManySteps {
                count,
                max: max_steps,
            });
        }

        let base = self
            .steps
            .get(position)
            .map(|s| s.step_index)
            .or_else(|| self.steps.last().map(|s| s.step_index + 1))
            .unwrap_or(1);
        let renumbered: HashMap<u32, u32> = revised
            .iter()
            .zip(base..)
            .map(|(step, new_index)| (step.step_index, new_index))
            .collect();

        self.steps.truncate(kept);
        for (step, new_index) in revised.into_iter().zip(base..) {
            let input_from_step = step
                .input_from_step
                .map(|from| renumbered.get(&from).copied().unwrap_or(from));
            self.steps.push(Step {
                step_index: new_index,
                input_from_step,
                ..Step::new(new_index, step.task)
                    .with_skills(step.allowed_skills)
                    .with_return_spec(step.return_spec)
            });
        }
        Ok(())
    }
}

/// Run request as received at the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Tenant namespace
    #[serde(default)]
    pub tenant_id: String,
    /// End user
    #[serde(default)]
    pub user_id: String,
    /// Session
    #[serde(default)]
    pub session_id: String,
    /// User task text
    pub message: String,
    /// Whether the caller asked for streaming
    #[serde(default)]
    pub stream: bool,
}

impl RunRequest {
    /// Identity carried by the request
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(&self.tenant_id, &self.user_id, &self.session_id)
    }
}

/// Successful run result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    /// Always `complete`
    pub status: PlanStatus,
    /// Synthesized response text
    pub response: String,
    /// Plan that produced it
    pub plan_id: PlanId,
}

/// Completed step summary inside a structured failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    /// Step index
    pub step_index: u32,
    /// Step task
    pub task: String,
    /// Status (always complete)
    pub status: StepStatus,
    /// Where the output lives
    pub memory_key: Option<String>,
}

impl From<&Step> for CompletedStep {
    fn from(step: &Step) -> Self {
        Self {
            step_index: step.step_index,
            task: step.task.clone(),
            status: step.status,
            memory_key: step.memory_key.clone(),
        }
    }
}

/// The failure that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFailure {
    /// Step index
    pub step: u32,
    /// Reason
    pub reason: String,
}

/// User-visible failure carrying enough state to resume or explain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredFailure {
    /// Always `failed`
    pub status: PlanStatus,
    /// Reason code or message
    pub reason: String,
    /// Plan, when one was created
    pub plan_id: Option<PlanId>,
    /// Completed step history
    pub completed_steps: Vec<CompletedStep>,
    /// Last step failure, if any
    pub last_failure: Option<LastFailure>,
}

impl StructuredFailure {
    /// Failure with no step history
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::Failed,
            reason: reason.into(),
            plan_id: None,
            completed_steps: Vec::new(),
            last_failure: None,
        }
    }

    /// Failure carrying a plan's completed history
    #[must_use]
    pub fn for_plan(plan: &Plan, reason: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan.plan_id),
            completed_steps: plan.completed_summaries(),
            ..Self::new(reason)
        }
    }

    /// With last failure
    #[inline]
    #[must_use]
    pub fn with_last_failure(mut self, step: u32, reason: impl Into<String>) -> Self {
        self.last_failure = Some(LastFailure {
            step,
            reason: reason.into(),
        });
        self
    }
}

/// Tenant (or tenant+user) persona and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Tenant
    pub tenant_id: String,
    /// Optional user override
    #[serde(default)]
    pub user_id: Option<String>,
    /// Persona document
    #[serde(default)]
    pub persona: serde_json::Value,
    /// Policy document
    #[serde(default)]
    pub policies: serde_json::Value,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl Persona {
    /// Storage key: `tenant:user` or `tenant:*`
    #[must_use]
    pub fn key(tenant_id: &str, user_id: Option<&str>) -> String {
        format!("{tenant_id}:{}", user_id.unwrap_or("*"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::new("t1", "u1", "s1")
    }

    #[test]
    fn field_shape_aliases() {
        assert_eq!(FieldShape::parse("int"), FieldShape::Integer);
        assert_eq!(FieldShape::parse("float"), FieldShape::Number);
        assert_eq!(FieldShape::parse("bool"), FieldShape::Boolean);
        assert_eq!(FieldShape::parse("dict"), FieldShape::Object);
        assert_eq!(FieldShape::parse("array<string>"), FieldShape::Array);
        assert_eq!(FieldShape::parse("whatever"), FieldShape::Any);
    }

    #[test]
    fn return_spec_deserializes_short_names() {
        let spec: ReturnSpec = serde_json::from_value(json!({
            "shape": {"count": "int", "names": "array"},
            "rationale": "needed for ranking"
        }))
        .unwrap();
        assert_eq!(spec.shape["count"], FieldShape::Integer);
        assert_eq!(spec.expected_shape(), json!({"count": "integer", "names": "array"}));
    }

    #[test]
    fn step_lifecycle() {
        let mut step = Step::new(1, "list outlets");
        assert!(step.mark_complete("k").is_err());

        step.mark_running(TaskId::new()).unwrap();
        assert!(step.mark_running(TaskId::new()).is_err());

        step.mark_complete("t1:s1:x:step_1_output").unwrap();
        assert!(step.is_complete());
        assert_eq!(step.memory_key.as_deref(), Some("t1:s1:x:step_1_output"));
    }

    #[test]
    fn interrupted_step_returns_to_pending() {
        let mut step = Step::new(1, "x");
        step.mark_running(TaskId::new()).unwrap();
        step.mark_interrupted().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.task_id.is_none());
    }

    #[test]
    fn next_pending_skips_completed() {
        let mut plan = Plan::new(identity(), "task");
        let mut first = Step::new(1, "a");
        first.mark_running(TaskId::new()).unwrap();
        first.mark_complete("k1").unwrap();
        plan.steps = vec![first, Step::new(2, "b")];
        assert_eq!(plan.next_pending_position(), Some(1));
    }

    fn completed(index: u32) -> Step {
        let mut step = Step::new(index, format!("step {index}"));
        step.mark_running(TaskId::new()).unwrap();
        step.mark_complete(format!("t1:s1:x:step_{index}_output")).unwrap();
        step
    }

    #[test]
    fn revise_remaining_keeps_completed_prefix() {
        let mut plan = Plan::new(identity(), "task");
        plan.steps = vec![completed(1), Step::new(2, "rank"), Step::new(3, "summarize").with_input_from(2)];
        let before = plan.steps[0].clone();

        let revised = vec![
            Step::new(7, "rank top 20"),
            Step::new(8, "summarize").with_input_from(7),
        ];
        plan.revise_remaining(1, revised, 10).unwrap();

        assert_eq!(plan.steps[0], before);
        assert_eq!(plan.steps[1].step_index, 2);
        assert_eq!(plan.steps[1].task, "rank top 20");
        assert_eq!(plan.steps[2].step_index, 3);
        assert_eq!(plan.steps[2].input_from_step, Some(2));
    }

    #[test]
    fn revise_remaining_rejects_overflow_and_completed() {
        let mut plan = Plan::new(identity(), "task");
        plan.steps = vec![completed(1), Step::new(2, "b")];
        let many: Vec<Step> = (0..10).map(|i| Step::new(i, "x")).collect();
        assert!(matches!(
            plan.revise_remaining(1, many, 10),
            Err(PlanError::TooManySteps { count: 11, max: 10 })
        ));
        assert!(matches!(
            plan.revise_remaining(0, vec![Step::new(1, "x")], 10),
            Err(PlanError::CompletedStepReplaced(1))
        ));
        assert!(matches!(plan.revise_remaining(1, vec![], 10), Err(PlanError::Empty)));
    }

    #[test]
    fn terminal_plan_rejects_transition() {
        let mut plan = Plan::new(identity(), "task");
        plan.transition(PlanStatus::Failed).unwrap();
        assert!(plan.completed_at.is_some());
        assert!(matches!(
            plan.transition(PlanStatus::Executing),
            Err(LifecycleError::TerminalPlan { .. })
        ));
    }

    #[test]
    fn structured_failure_serializes_status() {
        let failure = StructuredFailure::new("max replan attempts reached").with_last_failure(2, "timeout");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["last_failure"]["step"], 2);
    }

    #[test]
    fn persona_key() {
        assert_eq!(Persona::key("t1", None), "t1:*");
        assert_eq!(Persona::key("t1", Some("u1")), "t1:u1");
    }

    #[test]
    fn plan_id_round_trips_through_display() {
        let id = PlanId::new();
        assert_eq!(id.to_string().parse::<PlanId>().unwrap(), id);
    }
}
