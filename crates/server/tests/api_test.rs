// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the HTTP surface: operator API and agent wire
//! protocol against a fully wired in-process control plane.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use phoenix_analyzer::{
    Analyzer, DiscardIngest, Matrix, MetricsQuery, QueryError, QueryValue, Series,
};
use phoenix_config::ControlPlaneSettings;
use phoenix_events::EventBus;
use phoenix_lifecycle::Controller;
use phoenix_server::AppState;
use phoenix_store::Store;
use phoenix_tasks::{Dispatcher, TaskQueue};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct WinningBackend;

#[async_trait::async_trait]
impl MetricsQuery for WinningBackend {
    async fn query_instant(
        &self,
        expr: &str,
        _at: chrono::DateTime<chrono::Utc>,
    ) -> Result<QueryValue, QueryError> {
        let baseline = expr.contains("variant=\"baseline\"");
        if expr.contains("phoenix_pipeline_output") {
            Ok(QueryValue::Scalar(if baseline { 1000.0 } else { 400.0 }))
        } else {
            Ok(QueryValue::Scalar(if baseline { 1.0 } else { 1.05 }))
        }
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
        _step: std::time::Duration,
    ) -> Result<Matrix, QueryError> {
        let value = if expr.contains("variant=\"baseline\"") { 100.0 } else { 102.0 };
        Ok(vec![Series {
            labels: BTreeMap::new(),
            points: vec![(chrono::Utc::now(), value)],
        }])
    }
}

struct Fixture {
    app: Router,
    controller: Arc<Controller>,
    queue: Arc<TaskQueue>,
}

fn fixture() -> Fixture {
    let settings = Arc::new(ControlPlaneSettings::default());
    let bus = EventBus::new(settings.events.subscriber_buffer);
    let store = Arc::new(Store::new(bus.clone()));
    let queue = Arc::new(TaskQueue::new(Arc::clone(&store), settings.queue));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        settings.dispatch,
        settings.heartbeat,
    ));
    let analyzer = Arc::new(Analyzer::new(
        Arc::new(WinningBackend),
        settings.analyzer.clone(),
    ));
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        analyzer,
        settings.scheduler,
        CancellationToken::new(),
    );
    let state = AppState {
        store,
        queue: Arc::clone(&queue),
        dispatcher,
        controller: Arc::clone(&controller),
        bus,
        ingest: Arc::new(DiscardIngest),
        settings,
        workers_ready: Arc::new(AtomicBool::new(true)),
    };
    Fixture {
        app: phoenix_server::router(state),
        controller,
        queue,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn agent_request(method: &str, uri: &str, host: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-agent-host-id", host)
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

fn experiment_body(hosts: &[&str]) -> Value {
    json!({
        "name": "cardinality cut",
        "description": "baseline vs optimized pipeline",
        "config": {
            "target_hosts": hosts,
            "baseline_pipeline": "p-base",
            "candidate_pipeline": "p-cand",
            "duration": "2m",
            "warmup": "30s",
            "success_criteria": {
                "min_cardinality_reduction": 40.0,
                "max_cpu_overhead": 10.0,
                "max_memory_overhead": 10.0,
                "min_critical_coverage": 95.0
            }
        }
    })
}

#[tokio::test]
async fn create_validates_and_returns_created() {
    let f = fixture();
    let (status, body) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1"]))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["phase"], "pending");
    assert_eq!(body["version"], 0);

    // Empty host set is a validation error.
    let (status, body) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn overlapping_hosts_conflict_unless_forced() {
    let f = fixture();
    let (_, first) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1", "h2"]))).await;
    let id = first["id"].as_str().expect("id");
    let (status, _) = send(&f.app, post_json(&format!("/api/v1/experiments/{id}/start"), &json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h2", "h3"]))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let mut forced = experiment_body(&["h2", "h3"]);
    forced["force"] = json!(true);
    let (status, _) = send(&f.app, post_json("/api/v1/experiments", &forced)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn start_in_wrong_phase_conflicts() {
    let f = fixture();
    let (_, created) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1"]))).await;
    let id = created["id"].as_str().expect("id");
    let start_uri = format!("/api/v1/experiments/{id}/start");

    let (status, _) = send(&f.app, post_json(&start_uri, &json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = send(&f.app, post_json(&start_uri, &json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "precondition");
}

#[tokio::test]
async fn agent_poll_delivers_and_status_reports_advance() {
    let f = fixture();
    let (_, created) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1"]))).await;
    let id = created["id"].as_str().expect("id").to_owned();
    let (_, _) = send(&f.app, post_json(&format!("/api/v1/experiments/{id}/start"), &json!({}))).await;

    // The agent pulls both deploy tasks.
    let (status, tasks) = send(
        &f.app,
        agent_request("GET", "/api/v1/agent/tasks?max_wait=0&max_tasks=8", "h1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tasks = tasks.as_array().expect("array").clone();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t["status"] == "assigned"));
    assert!(tasks.iter().all(|t| t["action"]["kind"] == "deploy_pipeline"));

    // A report from the wrong host is rejected as a client error.
    let task_id = tasks[0]["id"].as_str().expect("task id");
    let (status, body) = send(
        &f.app,
        agent_request(
            "POST",
            &format!("/api/v1/agent/tasks/{task_id}/status"),
            "h2",
            Some(&json!({"status": "completed"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");

    // Both confirmations advance the experiment to warming_up.
    for task in &tasks {
        let task_id = task["id"].as_str().expect("task id");
        let (status, _) = send(
            &f.app,
            agent_request(
                "POST",
                &format!("/api/v1/agent/tasks/{task_id}/status"),
                "h1",
                Some(&json!({"status": "completed"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (_, detail) = send(&f.app, get(&format!("/api/v1/experiments/{id}"))).await;
    assert_eq!(detail["phase"], "warming_up");
    assert_eq!(detail["tasks"].as_array().expect("tasks").len(), 2);
}

#[tokio::test]
async fn analysis_is_conflict_until_ready() {
    let f = fixture();
    let (_, created) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1"]))).await;
    let id = created["id"].as_str().expect("id");

    let (status, body) = send(&f.app, get(&format!("/api/v1/experiments/{id}/analysis"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "precondition");

    let (status, _) = send(&f.app, get("/api/v1/experiments/unknown/analysis")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stop_cancels_and_records_actor() {
    let f = fixture();
    let (_, created) = send(&f.app, post_json("/api/v1/experiments", &experiment_body(&["h1"]))).await;
    let id = created["id"].as_str().expect("id");
    let (_, _) = send(&f.app, post_json(&format!("/api/v1/experiments/{id}/start"), &json!({}))).await;

    let (status, body) = send(
        &f.app,
        post_json(&format!("/api/v1/experiments/{id}/stop"), &json!({"actor": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["phase"], "cancelled");
    assert_eq!(body["cancelled_by"], "alice");

    let (status, body) = send(
        &f.app,
        post_json(&format!("/api/v1/experiments/{id}/stop"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "precondition");
}

#[tokio::test]
async fn heartbeat_and_fleet_status_roll_up() {
    let f = fixture();
    let heartbeat = json!({
        "agent_version": "0.9.2",
        "status": "ok",
        "active_tasks": [],
        "resource_usage": {"cpu_percent": 12.5, "memory_percent": 40.0, "memory_bytes": 1073741824u64},
        "labels": {"zone": "eu-1"}
    });
    let (status, _) = send(
        &f.app,
        agent_request("POST", "/api/v1/agent/heartbeat", "h1", Some(&heartbeat)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&f.app, get("/api/v1/fleet/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_hosts"], 1);
    assert_eq!(body["counts"]["healthy"], 1);
    assert_eq!(body["hosts"][0]["id"], "h1");
    assert_eq!(body["hosts"][0]["health"], "healthy");
    assert_eq!(body["hosts"][0]["agent_version"], "0.9.2");
    assert_eq!(body["hosts"][0]["labels"]["zone"], "eu-1");
}

#[tokio::test]
async fn agent_requests_require_identity() {
    let f = fixture();
    let (status, body) = send(&f.app, get("/api/v1/agent/tasks?max_wait=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn metrics_are_forwarded_with_no_content() {
    let f = fixture();
    let samples = json!([
        {"name": "proc_cpu", "value": 0.5, "timestamp": chrono::Utc::now(), "labels": {"process": "sshd"}}
    ]);
    let (status, _) = send(
        &f.app,
        agent_request("POST", "/api/v1/agent/metrics", "h1", Some(&samples)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn deployment_crud_round_trip() {
    let f = fixture();
    let body = json!({
        "name": "fleet rollout",
        "pipeline": "p-optimized",
        "host_selector": {"hosts": ["h1", "h2"]}
    });
    let (status, created) = send(&f.app, post_json("/api/v1/pipelines/deployments", &body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "deploying");
    let id = created["id"].as_str().expect("id");

    let (status, patched) = send(
        &f.app,
        Request::builder()
            .method("PATCH")
            .uri(format!("/api/v1/pipelines/deployments/{id}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"name": "renamed"}).to_string()))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["name"], "renamed");

    let (status, _) = send(
        &f.app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/pipelines/deployments/{id}"))
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, fetched) = send(&f.app, get(&format!("/api/v1/pipelines/deployments/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "rolled_back");

    let (status, _) = send(&f.app, get("/api/v1/pipelines/deployments/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn probes_respond() {
    let f = fixture();
    let (status, body) = send(&f.app, get("/livez")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, _) = send(&f.app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn full_experiment_lifecycle_over_http() {
    let f = fixture();
    // Short windows so the scheduler edges fire immediately.
    let mut body = experiment_body(&["h1"]);
    body["config"]["warmup"] = json!("0s");
    body["config"]["duration"] = json!("1ms");
    let (_, created) = send(&f.app, post_json("/api/v1/experiments", &body)).await;
    let id = created["id"].as_str().expect("id").to_owned();
    let (_, _) = send(&f.app, post_json(&format!("/api/v1/experiments/{id}/start"), &json!({}))).await;

    // Agent confirms both deploys.
    let (_, tasks) = send(
        &f.app,
        agent_request("GET", "/api/v1/agent/tasks?max_wait=0&max_tasks=8", "h1", None),
    )
    .await;
    for task in tasks.as_array().expect("tasks") {
        let task_id = task["id"].as_str().expect("task id");
        let (_, _) = send(
            &f.app,
            agent_request(
                "POST",
                &format!("/api/v1/agent/tasks/{task_id}/status"),
                "h1",
                Some(&json!({"status": "completed"})),
            ),
        )
        .await;
    }

    // Drive the scheduler until completion, acknowledging whatever the
    // control plane queues on the way (the candidate stop task).
    for _ in 0..200 {
        f.controller.tick();
        let claimed = f.queue.claim_for_host(&"h1".to_owned(), 8);
        for task in claimed {
            let _ = f
                .queue
                .update_status(
                    &task.id,
                    &"h1".to_owned(),
                    phoenix_model::TaskStatus::Completed,
                    None,
                )
                .expect("complete");
        }
        let (_, detail) = send(&f.app, get(&format!("/api/v1/experiments/{id}"))).await;
        if detail["phase"] == "completed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let (status, result) = send(&f.app, get(&format!("/api/v1/experiments/{id}/analysis"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["verdict"], "pass");
    assert_eq!(result["kpis"]["cardinality_reduction"].as_f64().expect("kpi").round(), 60.0);

    // Promote the winner and let the agent acknowledge the rollout.
    let (status, promoted) = send(
        &f.app,
        post_json(
            &format!("/api/v1/experiments/{id}/promote"),
            &json!({"variant": "candidate"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(promoted["phase"], "promoting");

    let (_, tasks) = send(
        &f.app,
        agent_request("GET", "/api/v1/agent/tasks?max_wait=0&max_tasks=8", "h1", None),
    )
    .await;
    for task in tasks.as_array().expect("tasks") {
        let task_id = task["id"].as_str().expect("task id");
        let (_, _) = send(
            &f.app,
            agent_request(
                "POST",
                &format!("/api/v1/agent/tasks/{task_id}/status"),
                "h1",
                Some(&json!({"status": "completed"})),
            ),
        )
        .await;
    }
    f.controller.tick();
    let (_, detail) = send(&f.app, get(&format!("/api/v1/experiments/{id}"))).await;
    assert_eq!(detail["phase"], "promoted");
}
