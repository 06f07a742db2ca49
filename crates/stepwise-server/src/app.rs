//! HTTP routes
//!
//! Identity headers (`X-Tenant-Id`, `X-User-Id`, `X-Session-Id`) override
//! body and query values. `X-Skill-Credential` is wrapped in a
//! [`Credential`] as soon as it is read and only leaves it on the outbound
//! skill call.
//!
//! Every response carries `X-Request-Id`: the caller's value when it sent a
//! usable one, a fresh ULID otherwise. The id is recorded on the request span.

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use stepwise_core::{Credential, Event, Persona, Plan, PlanId, RunRequest, RunResponse};
use stepwise_runtime::{Orchestrator, RunError, RunOptions};
use stepwise_store::{
    EventLog, MemoryEntry, MemoryError, MemoryKind, MemoryQuery, NoteSaved, QueryScope,
    RepositoryError, DEFAULT_QUERY_LIMIT,
};
use tracing::Instrument;

/// Tenant header
pub const TENANT_HEADER: &str = "x-tenant-id";
/// User header
pub const USER_HEADER: &str = "x-user-id";
/// Session header
pub const SESSION_HEADER: &str = "x-session-id";
/// Forwarded skill credential header
pub const CREDENTIAL_HEADER: &str = "x-skill-credential";
/// Request correlation header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

const MAX_QUERY_LIMIT: usize = 100;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Plan orchestrator
    pub orchestrator: Arc<Orchestrator>,
    /// Audit log the orchestrator writes to
    pub events: Arc<EventLog>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Handler errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Run or resume did not succeed
    #[error(transparent)]
    Run(#[from] RunError),

    /// Unknown resource, or one owned by another tenant
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Run(RunError::Failed(failure)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!(failure))).into_response()
            }
            Self::Run(RunError::Cancelled { plan_id }) => (
                StatusCode::CONFLICT,
                Json(json!({"status": "cancelled", "plan_id": plan_id})),
            )
                .into_response(),
            Self::Run(e @ RunError::Lifecycle(_)) => (
                StatusCode::CONFLICT,
                Json(json!({"status": "failed", "reason": e.reason_code()})),
            )
                .into_response(),
            Self::Run(RunError::Repository(RepositoryError::NotFound(id))) => {
                Self::NotFound(format!("plan {id}")).into_response()
            }
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("{what} not found")})),
            )
                .into_response(),
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "failed", "reason": "internal_error"})),
                )
                    .into_response()
            }
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::InvalidNamespace(_)
            | MemoryError::InvalidLabel(_)
            | MemoryError::InvalidNote(_)
            | MemoryError::ContractViolation(_) => {
                Self::BadRequest(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => Self::NotFound(format!("plan {id}")),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agent/run", post(run_agent))
        .route("/agent/plans/:plan_id", get(get_plan))
        .route("/agent/plans/:plan_id/trace", get(plan_trace))
        .route("/agent/plans/:plan_id/resume", post(resume_plan))
        .route("/agent/sessions/:session_id/trace", get(session_trace))
        .route("/agent/sessions/:session_id/cancel", post(cancel_session))
        .route("/agent/personas/:tenant_id", put(upsert_persona))
        .route("/agent/memory/query", get(query_memory))
        .route("/agent/memory/notes", post(save_note))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

async fn request_id(request: Request, next: Next) -> Response {
    let id = header(request.headers(), REQUEST_ID_HEADER)
        .filter(|v| v.len() <= MAX_REQUEST_ID_LEN)
        .map_or_else(|| ulid::Ulid::new().to_string(), str::to_string);
    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn credential(headers: &HeaderMap) -> RunOptions {
    header(headers, CREDENTIAL_HEADER).map_or_else(RunOptions::default, |c| {
        RunOptions::default().with_credential(Credential::new(c))
    })
}

fn parse_plan_id(raw: &str) -> Result<PlanId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("malformed plan id {raw:?}")))
}

/// Load a plan, hiding plans of other tenants when a tenant header is present
async fn visible_plan(state: &AppState, headers: &HeaderMap, raw: &str) -> Result<Plan, ApiError> {
    let plan_id = parse_plan_id(raw)?;
    let plan = state.orchestrator.plans().get(plan_id).await?;
    match header(headers, TENANT_HEADER) {
        Some(tenant) if tenant != plan.identity.tenant_id => {
            Err(ApiError::NotFound(format!("plan {plan_id}")))
        }
        _ => Ok(plan),
    }
}

async fn run_agent(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    if let Some(tenant) = header(&headers, TENANT_HEADER) {
        request.tenant_id = tenant.to_string();
    }
    if let Some(user) = header(&headers, USER_HEADER) {
        request.user_id = user.to_string();
    }
    if let Some(session) = header(&headers, SESSION_HEADER) {
        request.session_id = session.to_string();
    }

    let response = st.orchestrator.run(&request, credential(&headers)).await?;
    Ok(Json(response))
}

async fn get_plan(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<Plan>, ApiError> {
    visible_plan(&st, &headers, &plan_id).await.map(Json)
}

async fn plan_trace(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let plan = visible_plan(&st, &headers, &plan_id).await?;
    Ok(Json(st.events.for_plan(plan.plan_id)))
}

async fn resume_plan(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let plan = visible_plan(&st, &headers, &plan_id).await?;
    let response = st
        .orchestrator
        .resume(plan.plan_id, credential(&headers))
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct TenantParams {
    #[serde(default)]
    tenant_id: Option<String>,
}

fn tenant_of(headers: &HeaderMap, fallback: Option<&str>) -> Result<String, ApiError> {
    header(headers, TENANT_HEADER)
        .or(fallback)
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("tenant_id is required".to_string()))
}

async fn session_trace(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<TenantParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let tenant = tenant_of(&headers, params.tenant_id.as_deref())?;
    Ok(Json(st.events.for_session(&tenant, &session_id)))
}

async fn cancel_session(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<TenantParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = tenant_of(&headers, params.tenant_id.as_deref())?;
    let cancelled = st.orchestrator.cancellations().cancel(&tenant, &session_id);
    tracing::info!(tenant = %tenant, session = %session_id, cancelled, "session cancel requested");
    Ok(Json(json!({"session_id": session_id, "cancelled": cancelled})))
}

#[derive(Debug, Deserialize)]
struct PersonaPayload {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    persona: Value,
    #[serde(default)]
    policies: Value,
}

async fn upsert_persona(
    State(st): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<PersonaPayload>,
) -> Result<Json<Persona>, ApiError> {
    if tenant_id.contains(':') {
        return Err(ApiError::BadRequest(format!("malformed tenant id {tenant_id:?}")));
    }
    st.orchestrator
        .personas()
        .upsert(
            &tenant_id,
            payload.user_id.as_deref(),
            payload.persona,
            payload.policies,
        )
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct MemoryParams {
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    kind: Option<MemoryKind>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    contains: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn query_memory(
    State(st): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MemoryParams>,
) -> Result<Json<Vec<MemoryEntry>>, ApiError> {
    let tenant = tenant_of(&headers, params.tenant_id.as_deref())?;
    let scope = match params.scope.as_deref().unwrap_or("session") {
        "tenant" => QueryScope::Tenant,
        "session" => {
            let session = header(&headers, SESSION_HEADER)
                .or(params.session_id.as_deref())
                .ok_or_else(|| {
                    ApiError::BadRequest("session scope needs a session_id".to_string())
                })?;
            QueryScope::Session(session.to_string())
        }
        "user" => {
            let user = header(&headers, USER_HEADER)
                .or(params.user_id.as_deref())
                .ok_or_else(|| ApiError::BadRequest("user scope needs a user_id".to_string()))?;
            QueryScope::User(user.to_string())
        }
        other => return Err(ApiError::BadRequest(format!("unknown scope {other:?}"))),
    };

    let mut query = MemoryQuery::new(scope).with_limit(
        params
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT),
    );
    if let Some(label) = params.label {
        query = query.with_label(label);
    }
    if let Some(text) = params.contains {
        query = query.containing(text);
    }
    if let Some(kind) = params.kind {
        query = query.of_kind(kind);
    }
    Ok(Json(st.orchestrator.memory().query(&tenant, &query).await?))
}

#[derive(Debug, Deserialize)]
struct NotePayload {
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    kind: MemoryKind,
    label: String,
    data: Value,
}

async fn save_note(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NotePayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let field = |name: &str, body: Option<&str>| {
        header(&headers, name)
            .or(body)
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest(format!("missing {name}")))
    };
    let identity = stepwise_core::Identity::new(
        field(TENANT_HEADER, payload.tenant_id.as_deref())?,
        field(USER_HEADER, payload.user_id.as_deref())?,
        field(SESSION_HEADER, payload.session_id.as_deref())?,
    );
    let memory = st.orchestrator.memory();
    let saved = match payload.kind {
        MemoryKind::User => {
            memory
                .save_user_memory(&identity, &payload.label, payload.data, None)
                .await?
        }
        MemoryKind::Action => {
            memory
                .save_action_memory(&identity, &payload.label, payload.data, None)
                .await?
        }
        MemoryKind::StepOutput => {
            return Err(ApiError::BadRequest(
                "step outputs are written by executors only".to_string(),
            ))
        }
    };
    Ok(match saved {
        NoteSaved::Stored { memory_key } => (
            StatusCode::CREATED,
            Json(json!({"status": "stored", "memory_key": memory_key})),
        ),
        NoteSaved::Duplicate { memory_key } => (
            StatusCode::OK,
            Json(json!({"status": "duplicate", "memory_key": memory_key})),
        ),
    })
}
