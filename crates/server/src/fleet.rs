// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Fleet roll-up and probe endpoints.
//!
//! - GET `/api/v1/fleet/status` - per-host health roll-up
//! - GET `/livez` - liveness probe
//! - GET `/readyz` - readiness probe (background workers running)

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use phoenix_model::{HostHealth, ResourceUsage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use crate::AppState;

/// All the routes for fleet status and probes.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/fleet/status", get(fleet_status))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
}

#[derive(Serialize)]
struct FleetHost {
    id: String,
    health: HostHealth,
    labels: BTreeMap<String, String>,
    agent_version: String,
    last_heartbeat: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<ResourceUsage>,
}

#[derive(Serialize, Default)]
struct FleetCounts {
    healthy: usize,
    stale: usize,
    offline: usize,
}

#[derive(Serialize)]
struct FleetResponse {
    generated_at: chrono::DateTime<Utc>,
    total_hosts: usize,
    counts: FleetCounts,
    hosts: Vec<FleetHost>,
}

#[derive(Serialize)]
struct ProbeResponse {
    probe: &'static str,
    status: &'static str,
    generated_at: String,
}

async fn fleet_status(State(state): State<AppState>) -> Json<FleetResponse> {
    let now = Utc::now();
    let window = state.settings.heartbeat.healthy_window;
    let mut counts = FleetCounts::default();
    let hosts: Vec<FleetHost> = state
        .store
        .list_hosts()
        .into_iter()
        .map(|host| {
            let health = host.health(now, window);
            match health {
                HostHealth::Healthy => counts.healthy += 1,
                HostHealth::Stale => counts.stale += 1,
                HostHealth::Offline => counts.offline += 1,
            }
            FleetHost {
                id: host.id,
                health,
                labels: host.labels,
                agent_version: host.agent_version,
                last_heartbeat: host.last_heartbeat,
                resources: host.resources,
            }
        })
        .collect();
    Json(FleetResponse {
        generated_at: now,
        total_hosts: hosts.len(),
        counts,
        hosts,
    })
}

async fn livez() -> (StatusCode, Json<ProbeResponse>) {
    (
        StatusCode::OK,
        Json(ProbeResponse {
            probe: "livez",
            status: "ok",
            generated_at: Utc::now().to_rfc3339(),
        }),
    )
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    if state.workers_ready.load(Ordering::SeqCst) {
        (
            StatusCode::OK,
            Json(ProbeResponse {
                probe: "readyz",
                status: "ok",
                generated_at: Utc::now().to_rfc3339(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                probe: "readyz",
                status: "failed",
                generated_at: Utc::now().to_rfc3339(),
            }),
        )
    }
}
