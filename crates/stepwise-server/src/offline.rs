//! Offline decision components
//!
//! Used when no decision service or skill provider is configured, so the
//! server can be exercised end to end on one machine:
//! - [`KeywordPlanner`]: a fixed analyze-then-respond plan
//! - [`TemplateAgent`]: fills each contract with placeholder values,
//!   steered by keywords in the task
//! - [`LocalSkills`]: answers the two built-in skills locally

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stepwise_core::{FieldShape, ReturnSpec, Step};
use stepwise_runtime::{
    AgentOutcome, ExecutorError, FailedStep, Planner, PlannerError, PlanningContext,
    SkillCatalog, SkillClient, SkillDescriptor, SkillError, SkillRequest, StepAgent, StepContext,
};

/// Intent analysis skill
pub const INTENT_SKILL: &str = "skill_intent_analyzer";
/// Response building skill
pub const RESPONSE_SKILL: &str = "skill_response_builder";

/// Catalog of the built-in skills
#[must_use]
pub fn catalog() -> SkillCatalog {
    SkillCatalog::new()
        .with_skill(
            SkillDescriptor::new(INTENT_SKILL, ["intent"])
                .with_description("Classify what the user is asking for"),
        )
        .with_skill(
            SkillDescriptor::new(RESPONSE_SKILL, ["response_text"])
                .with_description("Compose the user-facing answer"),
        )
}

/// Planner returning the same analyze-then-respond plan for every task
///
/// The user message is carried in the first step's task.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPlanner;

impl KeywordPlanner {
    fn draft(task: &str) -> Vec<Step> {
        vec![
            Step::new(1, format!("Analyze request intent: {task}"))
                .with_skills([INTENT_SKILL])
                .with_return_spec(
                    ReturnSpec::new()
                        .with_field("intent", FieldShape::String)
                        .with_rationale("Used in step 2"),
                ),
            Step::new(2, "Build actionable response")
                .with_skills([RESPONSE_SKILL])
                .with_input_from(1)
                .with_return_spec(
                    ReturnSpec::new()
                        .with_field("response_text", FieldShape::String)
                        .with_rationale("Final user output synthesis"),
                ),
        ]
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, task: &str, _ctx: &PlanningContext) -> Result<Vec<Step>, PlannerError> {
        Ok(Self::draft(task))
    }

    /// Retry the failed step once, keeping its contract and skills
    async fn replan(
        &self,
        _task: &str,
        _completed: &[Step],
        failed: &FailedStep,
        remaining: &[Step],
        _ctx: &PlanningContext,
    ) -> Result<Vec<Step>, PlannerError> {
        let mut revised = remaining.to_vec();
        if let Some(first) = revised.first_mut() {
            let task = failed.task.strip_prefix("Retry: ").unwrap_or(&failed.task);
            first.task = format!("Retry: {task}");
        }
        Ok(revised)
    }
}

/// Step agent producing placeholder outputs
///
/// A step task mentioning `insufficient` asks to be split; one mentioning
/// `fail` fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateAgent;

impl TemplateAgent {
    fn fill(step: &Step) -> Value {
        let mut out = Map::new();
        for (i, (name, shape)) in step.return_spec.shape.iter().enumerate() {
            let value = match shape {
                FieldShape::String if name == "response_text" => json!("Mock execution successful"),
                FieldShape::Integer => json!(i),
                FieldShape::Number => json!(0.0),
                FieldShape::Boolean => json!(false),
                FieldShape::Array => json!([]),
                FieldShape::Object => json!({}),
                FieldShape::String | FieldShape::Any => json!(format!("mock_{i}")),
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}

#[async_trait]
impl StepAgent for TemplateAgent {
    async fn execute(&self, ctx: &StepContext) -> Result<AgentOutcome, ExecutorError> {
        let message = ctx.task().to_lowercase();
        if message.contains("insufficient") {
            return Ok(AgentOutcome::Insufficient {
                reason: "single step cannot complete".to_string(),
                suggestion: Some("split task".to_string()),
            });
        }
        if message.contains("fail") {
            return Ok(AgentOutcome::Failed {
                reason: "simulated_failure".to_string(),
            });
        }

        let mut output = Self::fill(ctx.step());
        if let Some(skill) = ctx.step().allowed_skills.first() {
            let called = ctx
                .call_skill(skill, json!({"task": ctx.task(), "input": ctx.input()}))
                .await?;
            if let (Value::Object(out), Value::Object(called)) = (&mut output, called) {
                for (k, v) in called {
                    if out.contains_key(&k) {
                        out.insert(k, v);
                    }
                }
            }
        }
        Ok(AgentOutcome::Output(output))
    }
}

/// Local answers for the built-in skills
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSkills;

#[async_trait]
impl SkillClient for LocalSkills {
    async fn call(&self, request: &SkillRequest) -> Result<String, SkillError> {
        let task = request
            .arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = match request.skill_id.as_str() {
            INTENT_SKILL => json!({"intent": classify(task)}),
            RESPONSE_SKILL => json!({"response_text": "Mock execution successful"}),
            other => return Err(SkillError::Unknown(other.to_string())),
        };
        Ok(body.to_string())
    }
}

fn classify(text: &str) -> &'static str {
    let text = text.to_lowercase();
    if text.contains('?') || text.starts_with("what") || text.starts_with("how") {
        "question"
    } else {
        "request"
    }
}
