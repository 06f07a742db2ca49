//! Remote skill provider and decision service clients
//!
//! Skill provider:
//! - `GET  {skill_endpoint}/skills` lists skill descriptors
//! - `POST {skill_endpoint}/skills/{skill_id}` performs a call; the forwarded
//!   credential goes out as a bearer token and nowhere else
//!
//! Decision service:
//! - `POST {decision_endpoint}/plan` and `/replan` draft steps
//! - `POST {decision_endpoint}/step` answers one turn of a step: call a
//!   skill, return an output, or give up

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use stepwise_core::{PlanError, Step};
use stepwise_runtime::{
    AgentOutcome, ExecutorError, FailedStep, Planner, PlannerError, PlanningContext,
    SkillCatalog, SkillClient, SkillDescriptor, SkillError, SkillRequest, StepAgent, StepContext,
};

/// Skill calls one step may make before it must answer
pub const MAX_SKILL_ROUNDS: usize = 8;

const MAX_ERROR_BODY: usize = 512;

fn client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn clip(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

// ---------------------------------------------------------------------------
// Skill provider
// ---------------------------------------------------------------------------

/// Skill provider over HTTP
#[derive(Debug, Clone)]
pub struct HttpSkillClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSkillClient {
    /// Client for a provider base URL
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: client(timeout),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Fetch the provider's skill descriptors
    ///
    /// # Errors
    /// Returns `SkillError::Transport` if the listing cannot be fetched or parsed
    pub async fn catalog(&self) -> Result<SkillCatalog, SkillError> {
        let descriptors: Vec<SkillDescriptor> = self
            .client
            .get(join(&self.endpoint, "skills"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SkillError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| SkillError::Transport(e.to_string()))?;
        Ok(descriptors
            .into_iter()
            .fold(SkillCatalog::new(), SkillCatalog::with_skill))
    }
}

#[async_trait]
impl SkillClient for HttpSkillClient {
    async fn call(&self, request: &SkillRequest) -> Result<String, SkillError> {
        let body = json!({
            "arguments": request.arguments,
            "tenant_id": request.identity.tenant_id,
            "user_id": request.identity.user_id,
            "session_id": request.identity.session_id,
        });
        let mut outbound = self
            .client
            .post(join(&self.endpoint, &format!("skills/{}", request.skill_id)))
            .json(&body);
        if let Some(credential) = &request.credential {
            outbound = outbound.bearer_auth(credential.expose());
        }

        let response = outbound.send().await.map_err(|e| {
            if e.is_timeout() {
                SkillError::Timeout {
                    skill: request.skill_id.clone(),
                    after: self.timeout,
                }
            } else {
                SkillError::Transport(e.without_url().to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SkillError::Transport(e.without_url().to_string()))?;
        match status {
            s if s.is_success() => Ok(text),
            StatusCode::NOT_FOUND => Err(SkillError::Unknown(request.skill_id.clone())),
            StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => Err(SkillError::Timeout {
                skill: request.skill_id.clone(),
                after: self.timeout,
            }),
            s => Err(SkillError::Rejected {
                skill: request.skill_id.clone(),
                message: format!("HTTP {s}: {}", clip(text)),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision service
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PlanBody<'a> {
    task: &'a str,
    tenant_id: &'a str,
    user_id: &'a str,
    session_id: &'a str,
    persona: Option<&'a Value>,
    policies: Option<&'a Value>,
    max_steps: usize,
    skills: Vec<&'a SkillDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed: Option<&'a [Step]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<&'a FailedStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<&'a [Step]>,
}

impl<'a> PlanBody<'a> {
    fn new(task: &'a str, ctx: &'a PlanningContext) -> Self {
        Self {
            task,
            tenant_id: &ctx.identity.tenant_id,
            user_id: &ctx.identity.user_id,
            session_id: &ctx.identity.session_id,
            persona: ctx.persona.as_ref().map(|p| &p.persona),
            policies: ctx.persona.as_ref().map(|p| &p.policies),
            max_steps: ctx.max_steps,
            skills: ctx.catalog.iter().collect(),
            completed: None,
            failed: None,
            remaining: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum PlanReply {
    Planned { steps: Vec<Step> },
    Infeasible { reason: String },
}

/// Planner backed by the decision service
#[derive(Debug, Clone)]
pub struct HttpPlanner {
    client: Client,
    endpoint: String,
}

impl HttpPlanner {
    /// Planner for a decision service base URL
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: client(timeout),
            endpoint: endpoint.into(),
        }
    }

    async fn ask(&self, path: &str, body: &PlanBody<'_>) -> Result<Vec<Step>, PlannerError> {
        let reply: PlanReply = self
            .client
            .post(join(&self.endpoint, path))
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PlannerError::Unavailable(e.without_url().to_string()))?
            .json()
            .await
            .map_err(|e| PlannerError::Unavailable(format!("malformed reply: {e}")))?;
        match reply {
            PlanReply::Planned { steps } => Ok(steps),
            PlanReply::Infeasible { reason } => Err(PlanError::Declared(reason).into()),
        }
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, task: &str, ctx: &PlanningContext) -> Result<Vec<Step>, PlannerError> {
        self.ask("plan", &PlanBody::new(task, ctx)).await
    }

    async fn replan(
        &self,
        task: &str,
        completed: &[Step],
        failed: &FailedStep,
        remaining: &[Step],
        ctx: &PlanningContext,
    ) -> Result<Vec<Step>, PlannerError> {
        let body = PlanBody {
            completed: Some(completed),
            failed: Some(failed),
            remaining: Some(remaining),
            ..PlanBody::new(task, ctx)
        };
        self.ask("replan", &body).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StepReply {
    CallSkill {
        skill: String,
        #[serde(default)]
        arguments: Value,
    },
    Output {
        output: Value,
    },
    Insufficient {
        reason: String,
        #[serde(default)]
        suggestion: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// Step agent backed by the decision service
///
/// Each turn posts the step, its input and the skill results so far; the
/// service answers with the next skill call or a final outcome.
#[derive(Debug, Clone)]
pub struct HttpStepAgent {
    client: Client,
    endpoint: String,
}

impl HttpStepAgent {
    /// Agent for a decision service base URL
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: client(timeout),
            endpoint: endpoint.into(),
        }
    }

    async fn turn(&self, ctx: &StepContext, transcript: &[Value]) -> Result<StepReply, ExecutorError> {
        let body = json!({
            "plan_id": ctx.plan_id(),
            "tenant_id": ctx.identity().tenant_id,
            "session_id": ctx.identity().session_id,
            "step": ctx.step(),
            "input": ctx.input(),
            "transcript": transcript,
        });
        self.client
            .post(join(&self.endpoint, "step"))
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExecutorError::Agent(e.without_url().to_string()))?
            .json()
            .await
            .map_err(|e| ExecutorError::Agent(format!("malformed reply: {e}")))
    }
}

#[async_trait]
impl StepAgent for HttpStepAgent {
    async fn execute(&self, ctx: &StepContext) -> Result<AgentOutcome, ExecutorError> {
        let mut transcript = Vec::new();
        for _ in 0..MAX_SKILL_ROUNDS {
            match self.turn(ctx, &transcript).await? {
                StepReply::CallSkill { skill, arguments } => {
                    let result = ctx.call_skill(&skill, arguments).await?;
                    transcript.push(json!({"skill": skill, "result": result}));
                }
                StepReply::Output { output } => return Ok(AgentOutcome::Output(output)),
                StepReply::Insufficient { reason, suggestion } => {
                    return Ok(AgentOutcome::Insufficient { reason, suggestion });
                }
                StepReply::Failed { reason } => return Ok(AgentOutcome::Failed { reason }),
            }
        }
        tracing::warn!(step = ctx.step().step_index, rounds = MAX_SKILL_ROUNDS, "step did not settle");
        Ok(AgentOutcome::Failed {
            reason: "step_round_limit".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn join_normalizes_slashes() {
        assert_eq!(join("http://h:1/", "/skills"), "http://h:1/skills");
        assert_eq!(join("http://h:1", "skills/x"), "http://h:1/skills/x");
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let clipped = clip(body);
        assert!(clipped.len() <= MAX_ERROR_BODY);
        assert!(clipped.chars().all(|c| c == 'é'));
    }

    #[test]
    fn step_replies_decode() {
        let call: StepReply =
            serde_json::from_value(json!({"action": "call_skill", "skill": "s"})).unwrap();
        assert!(matches!(call, StepReply::CallSkill { arguments: Value::Null, .. }));

        let split: StepReply = serde_json::from_value(
            json!({"action": "insufficient", "reason": "too big", "suggestion": "split"}),
        )
        .unwrap();
        assert!(matches!(split, StepReply::Insufficient { suggestion: Some(_), .. }));
    }

    #[test]
    fn infeasible_plan_reply_decodes() {
        let reply: PlanReply =
            serde_json::from_value(json!({"status": "infeasible", "reason": "needs 14 steps"}))
                .unwrap();
        assert!(matches!(reply, PlanReply::Infeasible { .. }));
    }
}
