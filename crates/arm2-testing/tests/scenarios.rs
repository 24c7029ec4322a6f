//! End-to-end scenarios (§8) driven over HTTP exactly as a CLI/GUI
//! client would: create a session, load a program, run or step it, and
//! assert on the observable state -- never touching `arm2-core` types
//! directly.

use std::sync::Arc;

use arm2d::api::create_router;
use arm2d::config::DaemonConfig;
use arm2d::registry::SessionRegistry;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let registry = Arc::new(SessionRegistry::new(DaemonConfig::default()));
    create_router(registry)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(v) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&v).unwrap()))
            .unwrap(),
        None => Request::builder().method(method).uri(uri).body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

async fn create_session(app: &Router) -> String {
    let (status, body) = send(app, "POST", "/api/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    body["sessionId"].as_str().unwrap().to_string()
}

async fn load(app: &Router, id: &str, source: &str) -> (StatusCode, Value) {
    send(app, "POST", &format!("/api/v1/sessions/{id}/load"), Some(json!({ "source": source }))).await
}

async fn run_and_settle(app: &Router, id: &str) {
    let (status, _) = send(app, "POST", &format!("/api/v1/sessions/{id}/run"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // `run` fires a background worker; poll status until it leaves `running`.
    for _ in 0..200 {
        let (_, body) = send(app, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
        if body["state"] != "running" {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("session {id} never left running state");
}

// Scenario 1: MOV/ADD/SWI#0 halts with R0=5, R1=3, R2=8.
#[tokio::test]
async fn add_two_immediates_then_halts() {
    let app = app();
    let id = create_session(&app).await;
    let (status, _) = load(&app, &id, "MOV R0, #5\nMOV R1, #3\nADD R2, R0, R1\nSWI #0\n").await;
    assert_eq!(status, StatusCode::OK);

    run_and_settle(&app, &id).await;

    let (status, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "halted");

    let (status, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/registers"), None).await;
    assert_eq!(status, StatusCode::OK);
    let regs = body["registers"].as_array().unwrap();
    assert_eq!(regs[0], 5);
    assert_eq!(regs[1], 3);
    assert_eq!(regs[2], 8);
}

// Scenario 2: ADDS of 0x80000000 with itself sets Z, C, V and clears N.
#[tokio::test]
async fn overflow_doubling_sets_zcv_flags() {
    let app = app();
    let id = create_session(&app).await;
    let (status, _) = load(&app, &id, "MOV R0, #0x80000000\nADDS R0, R0, R0\nSWI #0\n").await;
    assert_eq!(status, StatusCode::OK);

    run_and_settle(&app, &id).await;

    let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/registers"), None).await;
    assert_eq!(body["registers"][0], 0);
    assert_eq!(body["cpsr"]["z"], true);
    assert_eq!(body["cpsr"]["c"], true);
    assert_eq!(body["cpsr"]["v"], true);
    assert_eq!(body["cpsr"]["n"], false);
}

// Scenario 3: LDR Rd, =value synthesizes a nearby literal pool entry.
#[tokio::test]
async fn ldr_equals_pseudo_op_uses_literal_pool() {
    let app = app();
    let id = create_session(&app).await;
    let (status, body) = load(&app, &id, "LDR R0, =0x12345678\nSWI #0\n").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instructionCount"], 2);

    run_and_settle(&app, &id).await;

    let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/registers"), None).await;
    assert_eq!(body["registers"][0], 0x1234_5678u32);
}

// Scenario 4: a breakpoint at the third instruction's address stops `run`
// there with a hit count of one.
#[tokio::test]
async fn breakpoint_stops_run_at_target_address() {
    let app = app();
    let id = create_session(&app).await;
    let (_, body) =
        load(&app, &id, "MOV R0, #1\nMOV R1, #2\nADD R2, R0, R1\nSWI #0\n").await;
    let third_line_addr = body["lineToAddress"]["3"].as_u64().unwrap() as u32;

    let (status, bp) = send(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/breakpoints"),
        Some(json!({ "address": third_line_addr })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bp["hitCount"], 0);

    run_and_settle(&app, &id).await;

    let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
    assert_eq!(body["state"], "breakpoint");
    assert_eq!(body["pc"], third_line_addr);

    let (_, bps) = send(&app, "GET", &format!("/api/v1/sessions/{id}/breakpoints"), None).await;
    assert_eq!(bps[0]["hitCount"], 1);
}

// Scenario 5: an unrecognized mnemonic is rejected with a 422 and a
// diagnostic pointing at the offending token.
#[tokio::test]
async fn invalid_mnemonic_reports_parse_diagnostic() {
    let app = app();
    let id = create_session(&app).await;
    let (status, body) = load(&app, &id, "FOO R0\n").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let details = body["details"].as_array().unwrap();
    assert_eq!(details[0]["line"], 1);
}

// Scenario 6: SWI-driven stdin read parks the VM in `waiting-for-input`
// until `/stdin` supplies a line, then resumes with the byte count in R0.
#[tokio::test]
async fn stdin_read_parks_then_resumes_with_length() {
    let app = app();
    let id = create_session(&app).await;
    let (status, _) =
        load(&app, &id, "LDR R0, =buf\nMOV R1, #16\nSWI #5\nSWI #0\nbuf: .space 16\n").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "POST", &format!("/api/v1/sessions/{id}/run"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut waiting = false;
    for _ in 0..200 {
        let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
        if body["state"] == "waiting-for-input" {
            waiting = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(waiting, "session never reached waiting-for-input");

    let (status, _) = send(&app, "POST", &format!("/api/v1/sessions/{id}/stdin"), Some(json!({ "data": "hi\n" }))).await;
    assert_eq!(status, StatusCode::OK);

    run_and_settle(&app, &id).await;

    let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/registers"), None).await;
    // `read_stdin_line` (SWI #5) includes the terminating newline in the
    // byte count it returns, so "hi\n" reads back as length 3.
    assert_eq!(body["registers"][0], 3);
}

#[tokio::test]
async fn destroying_unknown_session_returns_404() {
    let app = app();
    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app, "DELETE", &format!("/api/v1/sessions/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reset_twice_is_idempotent() {
    let app = app();
    let id = create_session(&app).await;
    load(&app, &id, "MOV R0, #5\nSWI #0\n").await;

    let (status, _) = send(&app, "POST", &format!("/api/v1/sessions/{id}/reset"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "POST", &format!("/api/v1/sessions/{id}/reset"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", &format!("/api/v1/sessions/{id}/registers"), None).await;
    assert_eq!(body["registers"][0], 0);
}
