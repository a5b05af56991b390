// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Queue operations over the store's task table.

use chrono::{DateTime, Utc};
use phoenix_config::TaskQueueSettings;
use phoenix_model::{ExperimentId, HostId, NewTask, Task, TaskId, TaskStatus};
use phoenix_store::{Error as StoreError, ExpiryOutcome, Store, TaskTransition};
use std::sync::Arc;

/// Per-host FIFO of pending actions with lease + retry semantics.
///
/// All mutation funnels through the store so that claims stay serialized per
/// host and status changes are observed atomically.
pub struct TaskQueue {
    store: Arc<Store>,
    settings: TaskQueueSettings,
}

impl TaskQueue {
    /// Creates a queue over `store` with the given lease discipline.
    #[must_use]
    pub fn new(store: Arc<Store>, settings: TaskQueueSettings) -> Self {
        Self { store, settings }
    }

    /// The configured retry ceiling R.
    #[must_use]
    pub fn retry_ceiling(&self) -> u32 {
        self.settings.retry_ceiling
    }

    /// The configured lease length L.
    #[must_use]
    pub fn lease(&self) -> std::time::Duration {
        self.settings.lease
    }

    /// Enqueues one task, waking the target host's pollers.
    pub fn enqueue(&self, spec: NewTask) -> Task {
        self.store
            .enqueue_tasks(vec![spec])
            .into_iter()
            .next()
            .unwrap_or_else(|| unreachable!("enqueue of one spec yields one task"))
    }

    /// Enqueues a batch of tasks.
    pub fn enqueue_all(&self, specs: Vec<NewTask>) -> Vec<Task> {
        self.store.enqueue_tasks(specs)
    }

    /// Atomically claims up to `max` dispatchable tasks for `host`, stamping
    /// each `assigned` with a fresh lease. Claim order is priority desc,
    /// creation asc.
    pub fn claim_for_host(&self, host: &HostId, max: usize) -> Vec<Task> {
        self.store
            .claim_for_host(host, max, Utc::now(), self.settings.lease)
    }

    /// Applies an agent status report.
    ///
    /// A `failed` report consumes one attempt: the task returns to `pending`
    /// while attempts are below the retry ceiling, and is abandoned on the
    /// final failure.
    ///
    /// # Errors
    ///
    /// Rejects reports from a host the task is not assigned to, reports for
    /// terminal tasks, and statuses agents may not set. Rejections are client
    /// errors and never retried.
    pub fn update_status(
        &self,
        task_id: &TaskId,
        caller: &HostId,
        status: TaskStatus,
        error_msg: Option<String>,
    ) -> Result<TaskTransition, StoreError> {
        self.store.report_task_status(
            task_id,
            caller,
            status,
            error_msg,
            self.settings.retry_ceiling,
        )
    }

    /// Sweeps leases expired at `now`: tasks below the retry ceiling return
    /// to `pending`, the rest are abandoned, in `lease_deadline asc` order.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> ExpiryOutcome {
        self.store.expire_leases(now, self.settings.retry_ceiling)
    }

    /// All tasks of one experiment, in creation order.
    #[must_use]
    pub fn by_experiment(&self, id: &ExperimentId) -> Vec<Task> {
        self.store.tasks_for_experiment(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_events::EventBus;
    use phoenix_model::TaskAction;

    fn queue() -> TaskQueue {
        let store = Arc::new(Store::new(EventBus::new(16)));
        TaskQueue::new(store, TaskQueueSettings::default())
    }

    fn deploy(host: &str) -> NewTask {
        NewTask::for_experiment(
            "e1".to_owned(),
            host.to_owned(),
            TaskAction::DeployPipeline {
                pipeline: "p-cand".to_owned(),
                variant: None,
                parameters: Default::default(),
            },
        )
    }

    #[test]
    fn claims_are_isolated_per_host() {
        let queue = queue();
        let _ = queue.enqueue(deploy("h1"));
        let _ = queue.enqueue(deploy("h2"));

        let h1 = queue.claim_for_host(&"h1".to_owned(), 10);
        assert_eq!(h1.len(), 1);
        assert_eq!(h1[0].host, "h1");
        let h2 = queue.claim_for_host(&"h2".to_owned(), 10);
        assert_eq!(h2.len(), 1);
        assert_eq!(h2[0].host, "h2");
    }

    #[test]
    fn completed_report_closes_the_task() {
        let queue = queue();
        let task = queue.enqueue(deploy("h1"));
        let _ = queue.claim_for_host(&"h1".to_owned(), 1);
        let transition = queue
            .update_status(&task.id, &"h1".to_owned(), TaskStatus::Completed, None)
            .expect("report");
        let task = transition.task();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.lease_deadline.is_none());
    }
}
