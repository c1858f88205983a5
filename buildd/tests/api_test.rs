//! Build API Integration Tests

#![cfg(unix)]

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use buildd::AppState;
use engine::{BuildEngine, EngineConfig};
use shared_types::{ProjectSpec, WorkflowResult};

const BUILD_OK: &str = r#"sh -c "mkdir -p dist && echo '<html>ok</html>' > dist/index.html""#;

fn test_config(temp_dir: &tempfile::TempDir, build_cmd: &str) -> EngineConfig {
    let root = temp_dir.path().join("src");
    std::fs::create_dir_all(root.join("apps/portal")).unwrap();

    let mut config = EngineConfig::new(&root, temp_dir.path().join("www"));
    config.logs_dir = temp_dir.path().join("logs");
    config.database_path = temp_dir.path().join("data/builds.db");
    config.projects.push(ProjectSpec {
        name: "portal".to_string(),
        path: "apps/portal".to_string(),
        group: Some("emergency".to_string()),
        node_modules_dir: None,
        build_cmd: build_cmd.to_string(),
        dist_dir: None,
        publish: true,
        node_version: None,
    });
    config
}

async fn setup_test_app(build_cmd: &str) -> (axum::Router, AppState, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let engine = BuildEngine::open(test_config(&temp_dir, build_cmd)).await;
    let state = AppState::new(engine);
    (buildd::app(state.clone()), state, temp_dir)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(app: &axum::Router, req: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    (status, content_type, body.to_vec())
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = body_bytes(app, req).await;
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

#[tokio::test]
async fn test_health_and_projects() {
    let (app, _state, _temp_dir) = setup_test_app(BUILD_OK).await;

    let (status, body) = json_response(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = json_response(&app, get("/api/projects")).await;
    assert_eq!(status, StatusCode::OK);
    let projects = body.as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["name"], "portal");
    assert_eq!(projects[0]["group"], "emergency");
}

#[tokio::test]
async fn test_deploy_then_browse_history() {
    let (app, _state, temp_dir) = setup_test_app(BUILD_OK).await;

    let (status, _, body) = body_bytes(&app, post("/api/builds/deploy")).await;
    assert_eq!(status, StatusCode::OK);
    let result: WorkflowResult = serde_json::from_slice(&body).unwrap();
    assert!(result.success, "{:?}", result.logs);
    let run_id = result.run_id.expect("run recorded");
    assert!(temp_dir
        .path()
        .join("www/emergency/portal/index.html")
        .is_file());

    let (status, body) = json_response(&app, get("/api/builds")).await;
    assert_eq!(status, StatusCode::OK);
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], run_id);
    assert_eq!(runs[0]["status"], "completed");

    let (status, body) = json_response(&app, get(&format!("/api/builds/{run_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["total_projects"], 1);
    let project_id = body["projects"][0]["id"].as_i64().unwrap();
    assert_eq!(body["projects"][0]["project_name"], "portal");

    let (status, content_type, log) =
        body_bytes(&app, get(&format!("/api/builds/{run_id}/log"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    let log = String::from_utf8(log).unwrap();
    assert!(log.starts_with("=== BUILD LOGS ==="));
    assert!(log.contains("--- Project: portal ---"));

    let (status, content_type, log) =
        body_bytes(&app, get(&format!("/api/builds/projects/{project_id}/log"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    assert!(String::from_utf8(log).unwrap().contains("[EXIT] 0"));

    let (status, body) = json_response(&app, get("/api/builds/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_runs"], 1);
    assert_eq!(body["successful_runs"], 1);
    assert_eq!(body["in_progress_runs"], 0);
}

#[tokio::test]
async fn test_unknown_ids_return_not_found() {
    let (app, _state, _temp_dir) = setup_test_app(BUILD_OK).await;

    let (status, _, _) = body_bytes(&app, get("/api/builds/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, body) = body_bytes(&app, get("/api/builds/42/log")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, b"Log not found");
    let (status, _, _) = body_bytes(&app, get("/api/builds/projects/42/log")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_limit_is_clamped() {
    let (app, state, _temp_dir) = setup_test_app(BUILD_OK).await;
    for _ in 0..3 {
        state.engine.run_workflow().await;
    }

    let (status, body) = json_response(&app, get("/api/builds?limit=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = json_response(&app, get("/api/builds?limit=100000")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, _, _) = body_bytes(&app, get("/api/builds?limit=lots")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_second_deploy_is_refused_while_running() {
    let (app, state, _temp_dir) = setup_test_app(r#"sh -c "sleep 2""#).await;

    let engine = state.engine.clone();
    let running = tokio::spawn(async move { engine.run_workflow().await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, _, body) = body_bytes(&app, post("/api/builds/deploy")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, b"A build is already in progress");

    let first = running.await.unwrap();
    assert!(first.run_id.is_some());
}

#[tokio::test]
async fn test_history_unavailable_without_ledger() {
    let temp_dir = tempfile::tempdir().unwrap();
    let engine = BuildEngine::with_ledger(test_config(&temp_dir, BUILD_OK), None);
    let app = buildd::app(AppState::new(engine));

    let (status, _, _) = body_bytes(&app, get("/api/builds")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _, _) = body_bytes(&app, get("/api/builds/stats")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Deploys still run, just untracked.
    let (status, body) = json_response(&app, post("/api/builds/deploy")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["run_id"].is_null());
}
