// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Agent long-poll dispatch.
//!
//! A poll blocks until the host has claimable tasks or the wait lapses. The
//! wait suspends on the host's wake-up channel, so an enqueue for the host
//! ends the wait immediately instead of at the next poll cycle. Every
//! successful poll doubles as a heartbeat.
//!
//! Cancellation: the claim happens inside the poll, so a caller that goes
//! away between claim and delivery would leak leased tasks until expiry. The
//! returned [`ClaimedBatch`] therefore reverts the claim on drop unless the
//! batch was explicitly taken for delivery.

use chrono::Utc;
use phoenix_config::{DispatchSettings, HeartbeatSettings};
use phoenix_model::{HostId, Task, TaskId};
use phoenix_store::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::TaskQueue;

/// Long-poll dispatcher for agent task delivery.
pub struct Dispatcher {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    settings: DispatchSettings,
    heartbeat: HeartbeatSettings,
}

impl Dispatcher {
    /// Creates a dispatcher over the shared queue.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        settings: DispatchSettings,
        heartbeat: HeartbeatSettings,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
            heartbeat,
        }
    }

    /// Clamps an agent-requested wait to the configured ceiling.
    #[must_use]
    pub fn clamp_wait(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.settings.default_max_wait)
            .min(self.settings.max_wait_ceiling)
    }

    /// Clamps an agent-requested batch size to the configured ceiling.
    #[must_use]
    pub fn clamp_tasks(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.max_tasks_ceiling)
            .clamp(1, self.settings.max_tasks_ceiling)
    }

    /// Blocks until tasks are claimable for `host` or `max_wait` lapses.
    ///
    /// Returns whatever was claimed, possibly nothing. Tasks in the batch are
    /// `assigned` with a live lease; dropping the batch without taking it
    /// reverts them to `pending` as if the claim never happened.
    ///
    /// For a single host, tasks observed across successive polls follow the
    /// claim order (priority desc, creation asc). Across hosts there is no
    /// ordering guarantee.
    pub async fn long_poll(
        &self,
        host: &HostId,
        max_wait: Option<Duration>,
        max_tasks: Option<usize>,
    ) -> ClaimedBatch {
        let max_wait = self.clamp_wait(max_wait);
        let max_tasks = self.clamp_tasks(max_tasks);
        let deadline = tokio::time::Instant::now() + max_wait;

        let channel = self.store.host_channel(host);
        let _poll_guard = channel.enter_poll(Utc::now());

        loop {
            // Register interest before checking the queue so an enqueue
            // between the check and the await cannot be missed.
            let notified = channel.notify().notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            let claimed = self.queue.claim_for_host(host, max_tasks);
            if !claimed.is_empty() {
                self.touch_host(host);
                return ClaimedBatch::new(Arc::clone(&self.store), host.clone(), claimed);
            }

            tokio::select! {
                () = notified.as_mut() => {}
                () = tokio::time::sleep_until(deadline) => {
                    let claimed = self.queue.claim_for_host(host, max_tasks);
                    self.touch_host(host);
                    return ClaimedBatch::new(Arc::clone(&self.store), host.clone(), claimed);
                }
            }
        }
    }

    /// The heartbeat side effect of a successful poll.
    fn touch_host(&self, host: &HostId) {
        let _ = self.store.record_heartbeat(
            host,
            &BTreeMap::new(),
            None,
            None,
            self.heartbeat.healthy_window,
        );
    }
}

/// A claimed task batch pending delivery.
///
/// Dropping the batch before [`ClaimedBatch::into_tasks`] reverts every task
/// to `pending` with its lease cleared and its attempt counter restored, so a
/// caller disconnect claims nothing.
pub struct ClaimedBatch {
    store: Arc<Store>,
    host: HostId,
    tasks: Vec<Task>,
    delivered: bool,
}

impl ClaimedBatch {
    fn new(store: Arc<Store>, host: HostId, tasks: Vec<Task>) -> Self {
        Self {
            store,
            host,
            tasks,
            delivered: false,
        }
    }

    /// The claimed tasks, in claim order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Returns true when nothing was claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Takes the batch for delivery, committing the claim.
    #[must_use]
    pub fn into_tasks(mut self) -> Vec<Task> {
        self.delivered = true;
        std::mem::take(&mut self.tasks)
    }
}

impl Drop for ClaimedBatch {
    fn drop(&mut self) {
        if self.delivered || self.tasks.is_empty() {
            return;
        }
        let ids: Vec<TaskId> = self.tasks.iter().map(|t| t.id.clone()).collect();
        tracing::debug!(
            host = %self.host,
            reverted = ids.len(),
            "poll abandoned before delivery, reverting claim"
        );
        self.store.revert_claim(&self.host, &ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_config::TaskQueueSettings;
    use phoenix_events::EventBus;
    use phoenix_model::{NewTask, TaskAction, TaskStatus};
    use pretty_assertions::assert_eq;

    fn fixture() -> (Arc<Store>, Arc<TaskQueue>, Dispatcher) {
        let store = Arc::new(Store::new(EventBus::new(16)));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            TaskQueueSettings::default(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            DispatchSettings::default(),
            HeartbeatSettings::default(),
        );
        (store, queue, dispatcher)
    }

    fn snapshot(host: &str) -> NewTask {
        NewTask::for_experiment("e1".to_owned(), host.to_owned(), TaskAction::CollectSnapshot)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_returns_after_deadline() {
        let (_store, _queue, dispatcher) = fixture();
        let batch = dispatcher
            .long_poll(&"h1".to_owned(), Some(Duration::from_secs(5)), None)
            .await;
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_wakes_a_parked_poll() {
        let (_store, queue, dispatcher) = fixture();
        let queue_for_producer = Arc::clone(&queue);

        let poll = tokio::spawn(async move {
            dispatcher
                .long_poll(&"h1".to_owned(), Some(Duration::from_secs(30)), None)
                .await
                .into_tasks()
        });
        // Let the poll park on the host channel, then enqueue.
        tokio::task::yield_now().await;
        let task = queue_for_producer.enqueue(snapshot("h1"));

        let delivered = poll.await.expect("join");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, task.id);
        assert_eq!(delivered[0].status, TaskStatus::Assigned);
        assert!(delivered[0].lease_deadline.is_some());
        assert!(delivered[0].assigned_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn successive_polls_preserve_claim_order() {
        let (_store, queue, dispatcher) = fixture();
        let first = queue.enqueue(snapshot("h1"));
        let urgent = queue.enqueue(snapshot("h1").with_priority(9));
        let last = queue.enqueue(snapshot("h1"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = dispatcher
                .long_poll(&"h1".to_owned(), Some(Duration::from_secs(1)), Some(1))
                .await;
            seen.extend(batch.into_tasks().into_iter().map(|t| t.id));
        }
        assert_eq!(seen, vec![urgent.id, first.id, last.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_batch_reverts_to_pending() {
        let (store, queue, dispatcher) = fixture();
        let task = queue.enqueue(snapshot("h1"));

        let batch = dispatcher
            .long_poll(&"h1".to_owned(), Some(Duration::from_secs(1)), None)
            .await;
        assert_eq!(batch.tasks().len(), 1);
        drop(batch);

        let reverted = store.get_task(&task.id).expect("get");
        assert_eq!(reverted.status, TaskStatus::Pending);
        assert_eq!(reverted.attempts, 0);
        assert!(reverted.lease_deadline.is_none());

        // The task is claimable again by the next poll.
        let batch = dispatcher
            .long_poll(&"h1".to_owned(), Some(Duration::from_secs(1)), None)
            .await;
        let redelivered = batch.into_tasks();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_updates_host_heartbeat() {
        let (store, _queue, dispatcher) = fixture();
        let batch = dispatcher
            .long_poll(&"h1".to_owned(), Some(Duration::from_secs(1)), None)
            .await;
        assert!(batch.is_empty());
        assert!(store.get_host(&"h1".to_owned()).is_some(), "poll registers host");
    }

    #[test]
    fn clamps_apply_ceilings() {
        let store = Arc::new(Store::new(EventBus::new(4)));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            TaskQueueSettings::default(),
        ));
        let dispatcher = Dispatcher::new(
            store,
            queue,
            DispatchSettings::default(),
            HeartbeatSettings::default(),
        );
        assert_eq!(dispatcher.clamp_wait(None), Duration::from_secs(30));
        assert_eq!(
            dispatcher.clamp_wait(Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
        assert_eq!(dispatcher.clamp_tasks(None), 16);
        assert_eq!(dispatcher.clamp_tasks(Some(0)), 1);
        assert_eq!(dispatcher.clamp_tasks(Some(99)), 16);
    }
}
