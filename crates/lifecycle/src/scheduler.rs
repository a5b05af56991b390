// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The periodic scheduler tick.
//!
//! Time-driven transitions (warmup end, duration end, initialization
//! timeout) only happen when somebody looks at the clock; this worker is
//! that somebody. It also re-reconciles after lease-expiry abandons, which
//! the expiry worker records on tasks but never applies to experiments.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::controller::Controller;

/// Periodic driver of [`Controller::tick`].
pub struct Scheduler {
    controller: Arc<Controller>,
    tick_interval: std::time::Duration,
}

impl Scheduler {
    /// Creates the scheduler.
    #[must_use]
    pub fn new(controller: Arc<Controller>, tick_interval: std::time::Duration) -> Self {
        Self {
            controller,
            tick_interval,
        }
    }

    /// Runs the tick loop until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.tick_interval, "scheduler started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.controller.tick(),
            }
        }
        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_analyzer::{Analyzer, Matrix, MetricsQuery, QueryError, QueryValue};
    use phoenix_config::{AnalyzerSettings, SchedulerSettings, TaskQueueSettings};
    use phoenix_events::EventBus;
    use phoenix_store::Store;
    use phoenix_tasks::TaskQueue;

    struct NullBackend;

    #[async_trait::async_trait]
    impl MetricsQuery for NullBackend {
        async fn query_instant(
            &self,
            _expr: &str,
            _at: chrono::DateTime<chrono::Utc>,
        ) -> Result<QueryValue, QueryError> {
            Ok(QueryValue::Scalar(0.0))
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

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(Store::new(EventBus::new(4)));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            TaskQueueSettings::default(),
        ));
        let analyzer = Arc::new(Analyzer::new(
            Arc::new(NullBackend),
            AnalyzerSettings::default(),
        ));
        let controller = Controller::new(
            store,
            queue,
            analyzer,
            SchedulerSettings::default(),
            CancellationToken::new(),
        );
        let scheduler = Scheduler::new(controller, std::time::Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.expect("scheduler must stop");
    }
}
