// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! HTTP server exposing the control plane.
//!
//! Three surfaces share one router: the operator REST API
//! (`/api/v1/experiments`, `/api/v1/pipelines/deployments`,
//! `/api/v1/fleet/status`), the pull-based agent wire protocol
//! (`/api/v1/agent/...`), and the realtime WebSocket event stream
//! (`/api/v1/ws`). Probe endpoints (`/livez`, `/readyz`) sit outside the API
//! prefix.

pub mod agent;
pub mod deployments;
pub mod error;
pub mod experiments;
pub mod fleet;
pub mod ws;

use axum::Router;
use phoenix_analyzer::MetricsIngest;
use phoenix_config::ControlPlaneSettings;
use phoenix_events::EventBus;
use phoenix_lifecycle::Controller;
use phoenix_store::Store;
use phoenix_tasks::{Dispatcher, TaskQueue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;

use crate::error::Error;

/// Shared state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// The durable store.
    pub store: Arc<Store>,
    /// The task queue.
    pub queue: Arc<TaskQueue>,
    /// The long-poll dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// The experiment/deployment controller.
    pub controller: Arc<Controller>,
    /// The event bus feeding the WebSocket stream.
    pub bus: EventBus,
    /// The metrics ingest adapter agent samples are forwarded to.
    pub ingest: Arc<dyn MetricsIngest>,
    /// Process settings.
    pub settings: Arc<ControlPlaneSettings>,
    /// Set once the background workers are running; gates readiness.
    pub workers_ready: Arc<AtomicBool>,
}

/// Builds the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(experiments::routes())
        .merge(deployments::routes())
        .merge(fleet::routes())
        .merge(agent::routes())
        .merge(ws::routes())
        .layer(ServiceBuilder::new())
        .with_state(state)
}

/// Run the API server until shutdown is requested.
pub async fn run(
    state: AppState,
    bind_address: &str,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let app = router(state);

    let addr = bind_address
        .parse::<SocketAddr>()
        .map_err(|e| Error::InvalidBindAddress {
            bind_address: bind_address.to_owned(),
            details: e.to_string(),
        })?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::BindFailed {
            addr: addr.to_string(),
            details: e.to_string(),
        })?;

    tracing::info!(endpoint = %addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .map_err(|e| Error::ServerError {
            addr: addr.to_string(),
            details: e.to_string(),
        })
}
