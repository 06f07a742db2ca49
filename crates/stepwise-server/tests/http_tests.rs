//! HTTP boundary tests against the in-process router

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use stepwise_core::PlanError;
use stepwise_server::{router, AppState};
use stepwise_test_utils::{
    outlets_then_ranking, rig, FakeSkills, Script, ScriptedAgent, ScriptedPlanner, TestRig,
    SESSION, TENANT, USER,
};
use tower::ServiceExt;

fn app(rig: TestRig) -> (Router, Arc<FakeSkills>) {
    let skills = rig.skills.clone();
    let state = AppState {
        orchestrator: Arc::new(rig.orchestrator),
        events: rig.events,
    };
    (router(state), skills)
}

fn happy() -> (Router, Arc<FakeSkills>) {
    app(rig(
        ScriptedPlanner::new(outlets_then_ranking()),
        ScriptedAgent::new(),
        FakeSkills::new(),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str, tenant: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header("X-Tenant-Id", tenant);
    }
    builder.body(Body::empty()).unwrap()
}

fn run_request() -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/agent/run")
        .header("content-type", "application/json")
}

async fn run(app: &Router) -> Value {
    let body = json!({
        "tenant_id": TENANT,
        "user_id": USER,
        "session_id": SESSION,
        "message": "rank my outlets",
    });
    let (status, body) = send(
        app,
        run_request().body(Body::from(body.to_string())).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn health_answers_ok() {
    let (app, _) = happy();
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn run_returns_response_and_plan_is_readable() {
    let (app, _) = happy();
    let body = run(&app).await;
    assert_eq!(body["status"], "complete");
    assert_eq!(body["response"], "Mock execution successful");

    let plan_id = body["plan_id"].as_str().unwrap();
    let (status, plan) = send(&app, get(&format!("/agent/plans/{plan_id}"), Some(TENANT))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["status"], "complete");
    assert_eq!(plan["steps"].as_array().unwrap().len(), 2);
    assert_eq!(plan["replan_count"], 0);
}

#[tokio::test]
async fn plans_of_other_tenants_are_hidden() {
    let (app, _) = happy();
    let body = run(&app).await;
    let plan_id = body["plan_id"].as_str().unwrap();

    let (status, _) = send(&app, get(&format!("/agent/plans/{plan_id}"), Some("tenant-b"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &app,
        get(&format!("/agent/plans/{plan_id}/trace"), Some("tenant-b")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn identity_headers_override_body() {
    let (app, _) = happy();
    let body = json!({
        "tenant_id": "body-tenant",
        "user_id": "body-user",
        "session_id": "body-session",
        "message": "rank my outlets",
    });
    let request = run_request()
        .header("X-Tenant-Id", TENANT)
        .header("X-User-Id", USER)
        .header("X-Session-Id", "header-session")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, result) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let plan_id = result["plan_id"].as_str().unwrap();
    let (_, plan) = send(&app, get(&format!("/agent/plans/{plan_id}"), None)).await;
    assert_eq!(plan["tenant_id"], TENANT);
    assert_eq!(plan["user_id"], USER);
    assert_eq!(plan["session_id"], "header-session");
}

#[tokio::test]
async fn infeasible_plan_maps_to_422_with_structured_failure() {
    let (app, _) = app(rig(
        ScriptedPlanner::infeasible(PlanError::TooManySteps { count: 14, max: 10 }),
        ScriptedAgent::new(),
        FakeSkills::new(),
    ));
    let body = json!({"tenant_id": TENANT, "user_id": USER, "session_id": SESSION, "message": "x"});
    let (status, failure) = send(
        &app,
        run_request().body(Body::from(body.to_string())).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(failure["status"], "failed");
    assert_eq!(failure["reason"], "plan_infeasible_over_max_steps");
    assert_eq!(failure["completed_steps"], json!([]));
}

#[tokio::test]
async fn missing_identity_is_a_structured_failure() {
    let (app, _) = happy();
    let body = json!({"message": "no identity"});
    let (status, failure) = send(
        &app,
        run_request().body(Body::from(body.to_string())).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(failure["reason"], "invalid_identity");
}

#[tokio::test]
async fn traces_are_ordered_and_scoped() {
    let (app, _) = happy();
    let body = run(&app).await;
    let plan_id = body["plan_id"].as_str().unwrap();

    let (status, trace) = send(&app, get(&format!("/agent/plans/{plan_id}/trace"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = trace
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"plan.transition"));
    assert_eq!(kinds.last(), Some(&"plan.transition"));
    assert!(kinds.contains(&"memory.written"));
    assert!(kinds.contains(&"step.finished"));

    let (status, session) = send(
        &app,
        get(&format!("/agent/sessions/{SESSION}/trace?tenant_id={TENANT}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session[0]["kind"], "run.received");

    let (_, foreign) = send(
        &app,
        get(&format!("/agent/sessions/{SESSION}/trace"), Some("tenant-b")),
    )
    .await;
    assert_eq!(foreign, json!([]));

    let (status, _) = send(&app, get(&format!("/agent/sessions/{SESSION}/trace"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn persona_upsert_round_trips() {
    let (app, _) = happy();
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/agent/personas/{TENANT}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"persona": {"tone": "brief"}, "policies": {"max_links": 3}}).to_string(),
        ))
        .unwrap();
    let (status, persona) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(persona["tenant_id"], TENANT);
    assert_eq!(persona["user_id"], Value::Null);
    assert_eq!(persona["persona"]["tone"], "brief");
    assert_eq!(persona["policies"]["max_links"], 3);
}

#[tokio::test]
async fn memory_query_never_crosses_tenants() {
    let (app, _) = happy();
    run(&app).await;

    let (status, own) = send(&app, get("/agent/memory/query?scope=tenant", Some(TENANT))).await;
    assert_eq!(status, StatusCode::OK);
    let labels: Vec<&str> = own
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels.len(), 2);
    assert!(labels.contains(&"step_1_output"));

    let (_, labelled) = send(
        &app,
        get(
            &format!("/agent/memory/query?session_id={SESSION}&label=step_2_output"),
            Some(TENANT),
        ),
    )
    .await;
    assert_eq!(labelled.as_array().unwrap().len(), 1);
    assert_eq!(labelled[0]["value"]["response_text"], "Mock execution successful");

    let (_, foreign) = send(&app, get("/agent/memory/query?scope=tenant", Some("tenant-b"))).await;
    assert_eq!(foreign, json!([]));

    let (status, _) = send(&app, get("/agent/memory/query?scope=tenant", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/agent/memory/query?scope=galaxy", Some(TENANT))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_without_run_in_flight_reports_nothing_cancelled() {
    let (app, _) = happy();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/agent/sessions/{SESSION}/cancel"))
        .header("X-Tenant-Id", TENANT)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn resuming_a_finished_plan_conflicts() {
    let (app, _) = happy();
    let body = run(&app).await;
    let plan_id = body["plan_id"].as_str().unwrap();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/agent/plans/{plan_id}/resume"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "plan_terminal");

    let (status, _) = send(&app, get("/agent/plans/not-a-ulid", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forwarded_credential_reaches_skills_but_not_the_trace() {
    let (app, skills) = app(rig(
        ScriptedPlanner::new(outlets_then_ranking()),
        ScriptedAgent::new().on(1, Script::CallSkill),
        FakeSkills::new().respond("skill_outlets", r#"{"outlets":["north","south"],"count":2}"#),
    ));
    let body = json!({"tenant_id": TENANT, "user_id": USER, "session_id": SESSION, "message": "m"});
    let request = run_request()
        .header("X-Skill-Credential", "sk-live-secret")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, result) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let calls = skills.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].credential_forwarded);

    let plan_id = result["plan_id"].as_str().unwrap();
    let (_, trace) = send(&app, get(&format!("/agent/plans/{plan_id}/trace"), None)).await;
    let (_, session) = send(
        &app,
        get(&format!("/agent/sessions/{SESSION}/trace"), Some(TENANT)),
    )
    .await;
    assert!(!trace.to_string().contains("sk-live-secret"));
    assert!(!session.to_string().contains("sk-live-secret"));
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let (app, _) = happy();
    let echoed = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("X-Request-Id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(echoed.headers()["x-request-id"], "req-42");

    let fresh = app.clone().oneshot(get("/health", None)).await.unwrap();
    let id = fresh.headers()["x-request-id"].to_str().unwrap().to_string();
    assert_eq!(id.len(), 26);
    assert!(id.parse::<ulid::Ulid>().is_ok());

    let failed = app.oneshot(get("/agent/plans/not-a-plan", None)).await.unwrap();
    assert_eq!(failed.status(), StatusCode::BAD_REQUEST);
    assert!(failed.headers().contains_key("x-request-id"));
}

fn note(kind: &str, session: &str, data: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/agent/memory/notes")
        .header("content-type", "application/json")
        .header("X-Tenant-Id", TENANT)
        .header("X-User-Id", USER)
        .header("X-Session-Id", session)
        .body(Body::from(json!({"kind": kind, "label": "diet", "data": data}).to_string()))
        .unwrap()
}

#[tokio::test]
async fn user_notes_are_deduplicated_and_queryable_across_sessions() {
    let (app, _) = happy();
    let (status, first) = send(&app, note("user", "s1", json!({"vegetarian": true}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = send(&app, note("user", "s2", json!({"vegetarian": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["memory_key"], first["memory_key"]);

    let mut req = get("/agent/memory/query?scope=user", Some(TENANT));
    req.headers_mut().insert("x-user-id", USER.parse().unwrap());
    let (status, hits) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["label"], "user.diet");
    assert_eq!(hits[0]["kind"], "user");

    let (status, _) = send(&app, note("user", "s1", json!(["not", "an", "object"]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, note("step_output", "s1", json!({"x": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
