//! Testing utilities for the Stepwise workspace
//!
//! Scripted stand-ins for the decision components and the skill provider,
//! plus fixtures for assembling an orchestrator over in-memory stores.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{FieldShape, PlanError, ReturnSpec, RunRequest, Step, StepwiseConfig};
use stepwise_runtime::{
    AgentOutcome, ExecutorError, FailedStep, Orchestrator, Planner, PlannerError, PlanningContext,
    SkillCatalog, SkillClient, SkillDescriptor, SkillError, SkillRequest, StepAgent, StepContext,
};
use stepwise_store::EventLog;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const TENANT: &str = "tenant-a";
pub const USER: &str = "user-1";
pub const SESSION: &str = "session-1";

pub fn request(message: &str) -> RunRequest {
    RunRequest {
        tenant_id: TENANT.into(),
        user_id: USER.into(),
        session_id: SESSION.into(),
        message: message.into(),
        stream: false,
    }
}

pub fn step(index: u32, task: &str, skill: &str, fields: &[(&str, FieldShape)]) -> Step {
    let spec = fields
        .iter()
        .fold(ReturnSpec::new(), |spec, (name, shape)| spec.with_field(*name, *shape));
    Step::new(index, task).with_skills([skill]).with_return_spec(spec)
}

/// Catalog covering the skills the fixtures use
pub fn catalog() -> SkillCatalog {
    SkillCatalog::new()
        .with_skill(SkillDescriptor::new("skill_intent_analyzer", ["intent"]))
        .with_skill(SkillDescriptor::new("skill_response_builder", ["response_text"]))
        .with_skill(SkillDescriptor::new("skill_outlets", ["outlets", "count"]))
        .with_skill(SkillDescriptor::new("skill_engagement", ["ranking", "response_text"]))
        .with_skill(SkillDescriptor::new("skill_engagement_lite", ["ranking", "response_text"]))
}

/// Outlets-then-ranking plan: step 2 reads step 1
pub fn outlets_then_ranking() -> Vec<Step> {
    vec![
        step(1, "list outlets", "skill_outlets", &[("outlets", FieldShape::Array)]),
        step(
            2,
            "rank outlets by engagement",
            "skill_engagement",
            &[("ranking", FieldShape::Array), ("response_text", FieldShape::String)],
        )
        .with_input_from(1),
    ]
}

/// Placeholder output satisfying a step's contract
pub fn contract_output(step: &Step) -> Value {
    let mut out = Map::new();
    for (name, shape) in &step.return_spec.shape {
        let value = match shape {
            FieldShape::String if name == "response_text" => json!("Mock execution successful"),
            FieldShape::String | FieldShape::Any => json!(format!("mock_{}", step.step_index)),
            FieldShape::Integer => json!(step.step_index),
            FieldShape::Number => json!(f64::from(step.step_index)),
            FieldShape::Boolean => json!(true),
            FieldShape::Array => json!([format!("mock_{}", step.step_index)]),
            FieldShape::Object => json!({}),
        };
        out.insert(name.clone(), value);
    }
    Value::Object(out)
}

pub struct TestRig {
    pub orchestrator: Orchestrator,
    pub events: Arc<EventLog>,
    pub planner: Arc<ScriptedPlanner>,
    pub agent: Arc<ScriptedAgent>,
    pub skills: Arc<FakeSkills>,
}

pub fn rig(planner: ScriptedPlanner, agent: ScriptedAgent, skills: FakeSkills) -> TestRig {
    rig_with_config(planner, agent, skills, StepwiseConfig::default())
}

pub fn rig_with_config(
    planner: ScriptedPlanner,
    agent: ScriptedAgent,
    skills: FakeSkills,
    config: StepwiseConfig,
) -> TestRig {
    let planner = Arc::new(planner);
    let agent = Arc::new(agent);
    let skills = Arc::new(skills);
    let events = Arc::new(EventLog::new());
    let orchestrator = Orchestrator::builder(planner.clone(), agent.clone(), skills.clone())
        .catalog(catalog())
        .config(config)
        .events(events.clone())
        .build()
        .unwrap();
    TestRig {
        orchestrator,
        events,
        planner,
        agent,
        skills,
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReplanCall {
    pub completed: Vec<Step>,
    pub failed: FailedStep,
    pub remaining: Vec<Step>,
}

/// Planner returning a fixed draft and queued revisions
///
/// With no queued revision, `replan` hands back the remaining slice unchanged.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    draft: Mutex<Option<Result<Vec<Step>, PlanError>>>,
    revisions: Mutex<VecDeque<Vec<Step>>>,
    replan_calls: Mutex<Vec<ReplanCall>>,
}

impl ScriptedPlanner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            draft: Mutex::new(Some(Ok(steps))),
            ..Self::default()
        }
    }

    pub fn infeasible(error: PlanError) -> Self {
        Self {
            draft: Mutex::new(Some(Err(error))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn then_revise(self, steps: Vec<Step>) -> Self {
        self.revisions.lock().push_back(steps);
        self
    }

    pub fn replan_calls(&self) -> Vec<ReplanCall> {
        self.replan_calls.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _task: &str, _ctx: &PlanningContext) -> Result<Vec<Step>, PlannerError> {
        match self.draft.lock().clone() {
            Some(Ok(steps)) => Ok(steps),
            Some(Err(e)) => Err(PlannerError::Infeasible(e)),
            None => Err(PlannerError::Unavailable("no draft scripted".into())),
        }
    }

    async fn replan(
        &self,
        _task: &str,
        completed: &[Step],
        failed: &FailedStep,
        remaining: &[Step],
        _ctx: &PlanningContext,
    ) -> Result<Vec<Step>, PlannerError> {
        self.replan_calls.lock().push(ReplanCall {
            completed: completed.to_vec(),
            failed: failed.clone(),
            remaining: remaining.to_vec(),
        });
        Ok(self
            .revisions
            .lock()
            .pop_front()
            .unwrap_or_else(|| remaining.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Step agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    /// Return this output as is
    Output(Value),
    /// Return the contract placeholder
    Contract,
    /// Call the step's first allowed skill and return the result
    CallSkill,
    Insufficient(String, Option<String>),
    Fail(String),
    /// Sleep past any step budget
    Stall(Duration),
    /// Sleep, then return the contract placeholder
    Slow(Duration),
}

/// Step agent following per-step-index scripts, then contract placeholders
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<u32, VecDeque<Script>>>,
    executed: Mutex<Vec<u32>>,
    inputs: Mutex<Vec<(u32, Option<Value>)>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(self, step_index: u32, script: Script) -> Self {
        self.scripts
            .lock()
            .entry(step_index)
            .or_default()
            .push_back(script);
        self
    }

    pub fn executed(&self) -> Vec<u32> {
        self.executed.lock().clone()
    }

    pub fn inputs(&self) -> Vec<(u32, Option<Value>)> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl StepAgent for ScriptedAgent {
    async fn execute(&self, ctx: &StepContext) -> Result<AgentOutcome, ExecutorError> {
        let index = ctx.step().step_index;
        self.executed.lock().push(index);
        self.inputs.lock().push((index, ctx.input().cloned()));
        let script = self
            .scripts
            .lock()
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Contract);

        match script {
            Script::Output(value) => Ok(AgentOutcome::Output(value)),
            Script::Contract => Ok(AgentOutcome::Output(contract_output(ctx.step()))),
            Script::CallSkill => {
                let skill = ctx
                    .step()
                    .allowed_skills
                    .first()
                    .cloned()
                    .unwrap_or_default();
                let value = ctx.call_skill(&skill, json!({"task": ctx.task()})).await?;
                Ok(AgentOutcome::Output(value))
            }
            Script::Insufficient(reason, suggestion) => {
                Ok(AgentOutcome::Insufficient { reason, suggestion })
            }
            Script::Fail(reason) => Ok(AgentOutcome::Failed { reason }),
            Script::Slow(duration) => {
                tokio::time::sleep(duration).await;
                Ok(AgentOutcome::Output(contract_output(ctx.step())))
            }
            Script::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(AgentOutcome::Failed {
                    reason: "stalled".into(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SkillCall {
    pub skill_id: String,
    pub tenant_id: String,
    pub credential_forwarded: bool,
}

/// Skill provider answering from fixed bodies
#[derive(Debug, Default)]
pub struct FakeSkills {
    bodies: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<SkillCall>>,
}

impl FakeSkills {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn respond(self, skill: &str, body: impl Into<String>) -> Self {
        self.bodies.lock().insert(skill.into(), body.into());
        self
    }

    /// Make a skill fail with a provider message
    #[must_use]
    pub fn reject(self, skill: &str, message: &str) -> Self {
        self.failures.lock().insert(skill.into(), message.into());
        self
    }

    pub fn calls(&self) -> Vec<SkillCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SkillClient for FakeSkills {
    async fn call(&self, request: &SkillRequest) -> Result<String, SkillError> {
        self.calls.lock().push(SkillCall {
            skill_id: request.skill_id.clone(),
            tenant_id: request.identity.tenant_id.clone(),
            credential_forwarded: request.credential.is_some(),
        });
        if let Some(message) = self.failures.lock().get(&request.skill_id) {
            return Err(SkillError::Rejected {
                skill: request.skill_id.clone(),
                message: message.clone(),
            });
        }
        self.bodies
            .lock()
            .get(&request.skill_id)
            .cloned()
            .ok_or_else(|| SkillError::Unknown(request.skill_id.clone()))
    }
}
