// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Operator experiment endpoints.
//!
//! - POST `/api/v1/experiments` - create (201; 400 validation, 409 host-overlap)
//! - GET `/api/v1/experiments` - list, cursor-paginated
//! - GET `/api/v1/experiments/{id}` - read, with task summaries
//! - POST `/api/v1/experiments/{id}/start` - pending -> initializing (202; 409 wrong phase)
//! - POST `/api/v1/experiments/{id}/stop` - -> cancelled (202; 409 terminal)
//! - POST `/api/v1/experiments/{id}/promote` - completed -> promoting (202)
//! - GET `/api/v1/experiments/{id}/analysis` - read the result (409 until ready)

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use phoenix_lifecycle::{CreateExperiment, PromoteRequest};
use phoenix_model::{
    Experiment, ExperimentConfig, ExperimentResult, HostId, Task, Variant,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// All the routes for operator experiment control.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/experiments", post(create).get(list))
        .route("/api/v1/experiments/{id}", get(show))
        .route("/api/v1/experiments/{id}/start", post(start))
        .route("/api/v1/experiments/{id}/stop", post(stop))
        .route("/api/v1/experiments/{id}/promote", post(promote))
        .route("/api/v1/experiments/{id}/analysis", get(analysis))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_owner")]
    owner: String,
    config: ExperimentConfig,
    #[serde(default)]
    force: bool,
}

fn default_owner() -> String {
    "operator".to_owned()
}

#[derive(Deserialize)]
struct ListParams {
    cursor: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<Experiment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

/// Compact task view embedded in the experiment detail.
#[derive(Serialize)]
struct TaskSummary {
    id: String,
    host: String,
    kind: &'static str,
    status: phoenix_model::TaskStatus,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            host: task.host.clone(),
            kind: task.action.kind(),
            status: task.status,
            attempts: task.attempts,
            last_error: task.last_error.clone(),
        }
    }
}

#[derive(Serialize)]
struct ExperimentDetail {
    #[serde(flatten)]
    experiment: Experiment,
    tasks: Vec<TaskSummary>,
}

#[derive(Deserialize, Default)]
struct StopBody {
    #[serde(default = "default_owner")]
    actor: String,
}

#[derive(Deserialize)]
struct PromoteBody {
    variant: Variant,
    #[serde(default)]
    hosts: Option<Vec<HostId>>,
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = state.controller.create(CreateExperiment {
        name: body.name,
        description: body.description,
        owner: body.owner,
        config: body.config,
        force: body.force,
    })?;
    Ok((StatusCode::CREATED, Json(experiment)))
}

async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let page = state
        .store
        .list_experiments(params.cursor.as_deref(), params.limit.unwrap_or(50))?;
    Ok(Json(ListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
    }))
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentDetail>, ApiError> {
    let experiment = state.controller.get(&id)?;
    let tasks = state.queue.by_experiment(&id);
    Ok(Json(ExperimentDetail {
        experiment,
        tasks: tasks.iter().map(TaskSummary::from).collect(),
    }))
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = state.controller.start(&id)?;
    Ok((StatusCode::ACCEPTED, Json(experiment)))
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    // The body is optional; a bare POST cancels as the default operator.
    body: Result<Json<StopBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let actor = body.map(|Json(b)| b.actor).unwrap_or_else(|_| default_owner());
    let experiment = state.controller.stop(&id, &actor)?;
    Ok((StatusCode::ACCEPTED, Json(experiment)))
}

async fn promote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PromoteBody>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = state.controller.promote(
        &id,
        PromoteRequest {
            variant: body.variant,
            hosts: body.hosts,
        },
    )?;
    Ok((StatusCode::ACCEPTED, Json(experiment)))
}

async fn analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentResult>, ApiError> {
    Ok(Json(state.controller.analysis(&id)?))
}
