// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Standalone deployment endpoints.
//!
//! - POST `/api/v1/pipelines/deployments` - create (201; 400 validation)
//! - GET `/api/v1/pipelines/deployments` - list
//! - GET `/api/v1/pipelines/deployments/{id}` - read
//! - PATCH `/api/v1/pipelines/deployments/{id}` - update name/parameters
//! - DELETE `/api/v1/pipelines/deployments/{id}` - roll back and delete (204)

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use phoenix_lifecycle::{CreateDeployment, DeploymentPatch};
use phoenix_model::{HostSelector, PipelineDeployment, PipelineId};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::AppState;
use crate::error::ApiError;

/// All the routes for standalone deployments.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/pipelines/deployments", post(create).get(list))
        .route(
            "/api/v1/pipelines/deployments/{id}",
            get(show).patch(patch).delete(delete),
        )
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateBody {
    name: String,
    pipeline: PipelineId,
    host_selector: HostSelector,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchBody {
    name: Option<String>,
    parameters: Option<BTreeMap<String, String>>,
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<PipelineDeployment>), ApiError> {
    let deployment = state.controller.create_deployment(CreateDeployment {
        name: body.name,
        pipeline: body.pipeline,
        host_selector: body.host_selector,
        parameters: body.parameters,
    })?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn list(State(state): State<AppState>) -> Json<Vec<PipelineDeployment>> {
    Json(state.controller.list_deployments())
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    Ok(Json(state.controller.get_deployment(&id)?))
}

async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchBody>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    let deployment = state.controller.patch_deployment(
        &id,
        DeploymentPatch {
            name: body.name,
            parameters: body.parameters,
        },
    )?;
    Ok(Json(deployment))
}

async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let _ = state.controller.delete_deployment(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
