// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The pull-based agent wire protocol.
//!
//! Agent identity is the `X-Agent-Host-ID` header on every request; hosts are
//! trusted by identifier.
//!
//! - GET `/api/v1/agent/tasks?max_wait=<s>&max_tasks=<n>` - long poll
//! - POST `/api/v1/agent/tasks/{id}/status` - report execution status (204)
//! - POST `/api/v1/agent/heartbeat` - update the host record (204)
//! - POST `/api/v1/agent/metrics` - forward samples to the ingest adapter (204)

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use phoenix_analyzer::MetricSample;
use phoenix_model::{HostId, ResourceUsage, Task, TaskStatus};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the agent's host identity.
pub const HOST_ID_HEADER: &str = "x-agent-host-id";

/// All the routes for the agent wire protocol.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/agent/tasks", get(poll_tasks))
        .route("/api/v1/agent/tasks/{id}/status", post(report_status))
        .route("/api/v1/agent/heartbeat", post(heartbeat))
        .route("/api/v1/agent/metrics", post(push_metrics))
}

fn host_id(headers: &HeaderMap) -> Result<HostId, ApiError> {
    headers
        .get(HOST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::validation("missing X-Agent-Host-ID header"))
}

#[derive(Deserialize)]
struct PollParams {
    /// Seconds to wait for tasks; server-clamped.
    max_wait: Option<u64>,
    /// Maximum batch size; server-clamped.
    max_tasks: Option<usize>,
}

async fn poll_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PollParams>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let host = host_id(&headers)?;
    let batch = state
        .dispatcher
        .long_poll(
            &host,
            params.max_wait.map(Duration::from_secs),
            params.max_tasks,
        )
        .await;
    Ok(Json(batch.into_tasks()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusBody {
    status: TaskStatus,
    #[serde(default)]
    error_message: Option<String>,
}

async fn report_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<StatusCode, ApiError> {
    let host = host_id(&headers)?;
    let transition = state
        .queue
        .update_status(&task_id, &host, body.status, body.error_message)?;
    state.controller.on_task_transition(&transition);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HeartbeatBody {
    #[serde(default)]
    agent_version: Option<String>,
    /// Agent-reported status string; accepted, not interpreted.
    #[serde(default)]
    status: Option<String>,
    /// Tasks the agent believes it is executing; accepted, not interpreted.
    #[serde(default)]
    active_tasks: Vec<String>,
    #[serde(default)]
    resource_usage: Option<ResourceUsage>,
    /// Labels to add to the host. Existing labels are never changed.
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatBody>,
) -> Result<StatusCode, ApiError> {
    let host = host_id(&headers)?;
    tracing::debug!(
        host = %host,
        status = body.status.as_deref().unwrap_or("-"),
        active_tasks = body.active_tasks.len(),
        "agent heartbeat"
    );
    let _ = state.store.record_heartbeat(
        &host,
        &body.labels,
        body.agent_version.as_deref(),
        body.resource_usage,
        state.settings.heartbeat.healthy_window,
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn push_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(samples): Json<Vec<MetricSample>>,
) -> Result<StatusCode, ApiError> {
    let _ = host_id(&headers)?;
    state.ingest.ingest(samples).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_requires_nonempty_header() {
        let mut headers = HeaderMap::new();
        assert!(host_id(&headers).is_err());

        let _ = headers.insert(HOST_ID_HEADER, "".parse().expect("value"));
        assert!(host_id(&headers).is_err());

        let _ = headers.insert(HOST_ID_HEADER, "h1".parse().expect("value"));
        assert_eq!(host_id(&headers).expect("host"), "h1");
    }
}
