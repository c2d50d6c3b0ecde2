//! API integration tests.
//!
//! These tests drive the router in-process with `tower::ServiceExt::oneshot`.

use crate::common::{PIPELINE_YML, replica};
use pipecron::api::{ApiState, build_router, create_api_state};
use pipecron::coordination::InMemoryCoordinator;
use pipecron::testing::RecordingTrigger;
use pipecron::{CronService, InMemoryStorage};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApi {
    state: ApiState<InMemoryStorage>,
    coordinator: Arc<InMemoryCoordinator>,
}

impl TestApi {
    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    fn signals(&self) -> Vec<String> {
        self.coordinator
            .keys_with_prefix(pipecron::coordination::DEFAULT_SIGNAL_PREFIX)
            .unwrap()
    }
}

fn create_test_api() -> TestApi {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let crond = replica(&storage, &coordinator, &trigger, "api");
    TestApi {
        state: create_api_state(CronService::new(storage, crond)),
        coordinator,
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn create_cron(api: &TestApi, yml_name: &str, expr: &str) -> Value {
    let (status, json) = send(
        api.router(),
        with_json(
            "POST",
            "/api/crons",
            json!({
                "pipeline_source": "dice",
                "pipeline_yml_name": yml_name,
                "pipeline_yml": PIPELINE_YML,
                "cron_expr": expr,
                "cluster_name": "terminus",
                "incoming_secrets": {"token": "hidden"},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", json);
    json
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let api = create_test_api();
    let (status, json) = send(api.router(), get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Test: Creating a definition returns it without secrets and signals the
/// replicas.
#[tokio::test]
async fn test_create_endpoint() {
    let api = create_test_api();
    let json = create_cron(&api, "nightly.yml", "0 0 2 * * *").await;

    assert_eq!(json["pipeline_yml_name"], "nightly.yml");
    assert_eq!(json["cron_expr"], "0 0 2 * * *");
    assert_eq!(json["enable"], true);
    assert_eq!(json["cluster_name"], "terminus");
    assert!(json["next_trigger_at"].is_string());
    assert!(json.get("incoming_secrets").is_none());
    assert!(!json.to_string().contains("hidden"));

    let id = json["id"].as_u64().unwrap();
    assert!(api.signals().iter().any(|k| k.ends_with(&format!("/add/{}", id))));
}

/// Test: A malformed expression is rejected with 400.
#[tokio::test]
async fn test_create_rejects_bad_expression() {
    let api = create_test_api();
    let (status, json) = send(
        api.router(),
        with_json(
            "POST",
            "/api/crons",
            json!({
                "pipeline_source": "dice",
                "pipeline_yml_name": "bad.yml",
                "pipeline_yml": PIPELINE_YML,
                "cron_expr": "every monday",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_PARAMETER");
    assert!(api.signals().is_empty());
}

/// Test: Get returns a stored definition; unknown and malformed ids fail.
#[tokio::test]
async fn test_get_endpoint() {
    let api = create_test_api();
    let created = create_cron(&api, "a.yml", "0 0 2 * * *").await;
    let id = created["id"].as_u64().unwrap();

    let (status, json) = send(api.router(), get(&format!("/api/crons/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);

    let (status, json) = send(api.router(), get("/api/crons/9999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, _) = send(api.router(), get("/api/crons/not-a-number")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Test: List filters by yml name and pages results.
#[tokio::test]
async fn test_list_endpoint() {
    let api = create_test_api();
    for name in ["a.yml", "b.yml", "c.yml"] {
        create_cron(&api, name, "0 0 2 * * *").await;
    }

    let (status, json) = send(api.router(), get("/api/crons")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["data"].as_array().unwrap().len(), 3);

    let (_, json) = send(api.router(), get("/api/crons?yml_names=a.yml,c.yml")).await;
    assert_eq!(json["total"], 2);

    let (_, json) = send(api.router(), get("/api/crons?page_no=2&page_size=2")).await;
    assert_eq!(json["total"], 3);
    assert_eq!(json["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(api.router(), get("/api/crons?page_size=-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Test: Update changes the expression and merges namespaces.
#[tokio::test]
async fn test_update_endpoint() {
    let api = create_test_api();
    let created = create_cron(&api, "a.yml", "0 0 2 * * *").await;
    let id = created["id"].as_u64().unwrap();

    let (status, json) = send(
        api.router(),
        with_json(
            "PUT",
            &format!("/api/crons/{}", id),
            json!({
                "cron_expr": "0 30 4 * * *",
                "pipeline_yml": PIPELINE_YML,
                "config_manage_namespaces": ["ns-1"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["cron_expr"], "0 30 4 * * *");
    assert_eq!(json["config_manage_namespaces"], json!(["ns-1"]));

    let (status, _) = send(
        api.router(),
        with_json("PUT", "/api/crons/9999", json!({"cron_expr": "0 0 * * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Stop and start toggle the enabled flag.
#[tokio::test]
async fn test_start_stop_endpoints() {
    let api = create_test_api();
    let created = create_cron(&api, "a.yml", "0 0 2 * * *").await;
    let id = created["id"].as_u64().unwrap();

    let (status, json) = send(api.router(), post(&format!("/api/crons/{}/stop", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enable"], false);
    assert!(json["next_trigger_at"].is_null());
    assert!(api.signals().iter().any(|k| k.ends_with(&format!("/delete/{}", id))));

    let (status, json) = send(api.router(), post(&format!("/api/crons/{}/start", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enable"], true);

    let (status, _) = send(api.router(), post("/api/crons/9999/start")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Delete removes the definition.
#[tokio::test]
async fn test_delete_endpoint() {
    let api = create_test_api();
    let created = create_cron(&api, "a.yml", "0 0 2 * * *").await;
    let id = created["id"].as_u64().unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/crons/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(api.router(), request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(api.router(), get(&format!("/api/crons/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Reload rebuilds the local engine and entries reflect it.
#[tokio::test]
async fn test_reload_and_entries_endpoints() {
    let api = create_test_api();
    let created = create_cron(&api, "a.yml", "0 0 2 * * *").await;
    let id = created["id"].as_u64().unwrap();

    let (status, json) = send(api.router(), post("/api/crond/reload")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["logs"].as_array().unwrap().len(), 2);

    let (status, json) = send(api.router(), get("/api/crond/entries")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    let names: Vec<&str> = json["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert!(names.iter().any(|n| n.ends_with(&id.to_string())));

    api.state.service.crond().shutdown().await;
}
