// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! `phoenixd` - the Phoenix control plane daemon.
//!
//! Wires the store, task queue, dispatcher, controller, and analyzer
//! together, spawns the background workers (scheduler, lease expiry), and
//! serves the HTTP/WebSocket API until interrupted.

use clap::Parser;
use phoenix_analyzer::{Analyzer, DiscardIngest, Matrix, MetricsQuery, QueryError, QueryValue};
use phoenix_config::ControlPlaneSettings;
use phoenix_events::EventBus;
use phoenix_lifecycle::{Controller, Scheduler};
use phoenix_server::AppState;
use phoenix_store::Store;
use phoenix_tasks::{Dispatcher, LeaseExpiryWorker, TaskQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Phoenix observability cost-optimization control plane.
#[derive(Parser, Debug)]
#[command(name = "phoenixd", version, about)]
struct Args {
    /// Path to a YAML settings file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured HTTP bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

/// Metrics backend placeholder used until a TSDB adapter is configured.
/// Returns empty results, which the analyzer reports as `inconclusive`.
///
/// TODO: replace with the PromQL HTTP adapter once the query gateway is
/// deployed.
struct UnconfiguredBackend;

#[async_trait::async_trait]
impl MetricsQuery for UnconfiguredBackend {
    async fn query_instant(
        &self,
        _expr: &str,
        _at: chrono::DateTime<chrono::Utc>,
    ) -> Result<QueryValue, QueryError> {
        Ok(QueryValue::Vector(Vec::new()))
    }

    async fn query_range(
        &self,
        _expr: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
        _step: std::time::Duration,
    ) -> Result<Matrix, QueryError> {
        Ok(Vec::new())
    }
}

fn load_settings(args: &Args) -> Result<ControlPlaneSettings, Box<dyn std::error::Error>> {
    let mut settings = match &args.config {
        Some(path) => phoenix_config::io::load_settings(path)?,
        None => ControlPlaneSettings::default(),
    };
    if let Some(bind) = &args.bind {
        settings.http.bind_address = bind.clone();
    }
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Arc::new(load_settings(&args)?);

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
        Arc::new(UnconfiguredBackend),
        settings.analyzer.clone(),
    ));

    let shutdown = CancellationToken::new();
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        analyzer,
        settings.scheduler,
        shutdown.clone(),
    );

    let scheduler = Scheduler::new(Arc::clone(&controller), settings.scheduler.tick_interval);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let expiry_worker = LeaseExpiryWorker::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        settings.queue,
        settings.dispatch,
    );
    let expiry_handle = tokio::spawn(expiry_worker.run(shutdown.clone()));

    let workers_ready = Arc::new(AtomicBool::new(true));
    let state = AppState {
        store,
        queue,
        dispatcher,
        controller,
        bus: bus.clone(),
        ingest: Arc::new(DiscardIngest),
        settings: Arc::clone(&settings),
        workers_ready: Arc::clone(&workers_ready),
    };

    let server_cancel = shutdown.clone();
    let ctrlc_cancel = shutdown.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrlc_cancel.cancel();
        }
    });

    let result = phoenix_server::run(state, &settings.http.bind_address, server_cancel).await;

    // Drain the workers and close the bus so WebSocket subscribers end.
    workers_ready.store(false, Ordering::SeqCst);
    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = expiry_handle.await;
    bus.close();

    result?;
    Ok(())
}
