// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The lease-expiry background worker.
//!
//! Ticks at a quarter of the lease length (configurable). Each tick sweeps
//! lapsed leases, returning retryable tasks to `pending` and abandoning the
//! rest, then reclaims idle per-host wake-up channels.

use chrono::Utc;
use phoenix_config::{DispatchSettings, TaskQueueSettings};
use phoenix_store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::queue::TaskQueue;

/// Background sweeper for lapsed task leases.
pub struct LeaseExpiryWorker {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    queue_settings: TaskQueueSettings,
    dispatch_settings: DispatchSettings,
}

impl LeaseExpiryWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        queue_settings: TaskQueueSettings,
        dispatch_settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            queue,
            queue_settings,
            dispatch_settings,
        }
    }

    /// Runs the sweep loop until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let tick = self.queue_settings.effective_expiry_tick();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(tick = ?tick, "lease-expiry worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep(),
            }
        }
        tracing::info!("lease-expiry worker stopped");
    }

    /// One sweep: expire leases and reclaim idle channels.
    pub fn sweep(&self) {
        let outcome = self.queue.expire_leases(Utc::now());
        if !outcome.retried.is_empty() || !outcome.abandoned.is_empty() {
            tracing::info!(
                retried = outcome.retried.len(),
                abandoned = outcome.abandoned.len(),
                "lease sweep"
            );
        }
        let reclaimed = self
            .store
            .sweep_idle_channels(self.dispatch_settings.idle_channel_ttl);
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "idle host channels reclaimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_events::EventBus;
    use phoenix_model::{NewTask, TaskAction, TaskStatus};

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(Store::new(EventBus::new(4)));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            TaskQueueSettings::default(),
        ));
        let worker = LeaseExpiryWorker::new(
            store,
            queue,
            TaskQueueSettings::default(),
            DispatchSettings::default(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        cancel.cancel();
        handle.await.expect("worker must stop");
    }

    #[tokio::test]
    async fn sweep_abandons_exhausted_tasks() {
        let store = Arc::new(Store::new(EventBus::new(4)));
        let settings = TaskQueueSettings {
            lease: std::time::Duration::from_secs(0),
            retry_ceiling: 1,
            expiry_tick: Some(std::time::Duration::from_secs(1)),
        };
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), settings));
        let task = queue.enqueue(NewTask::for_experiment(
            "e1".to_owned(),
            "h1".to_owned(),
            TaskAction::CollectSnapshot,
        ));
        // Single permitted issuance with an already-lapsed lease.
        let claimed = queue.claim_for_host(&"h1".to_owned(), 1);
        assert_eq!(claimed.len(), 1);

        let worker = LeaseExpiryWorker::new(
            Arc::clone(&store),
            queue,
            settings,
            DispatchSettings::default(),
        );
        worker.sweep();
        let task = store.get_task(&task.id).expect("get");
        assert_eq!(task.status, TaskStatus::Abandoned);
    }
}
