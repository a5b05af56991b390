// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-host task table.
//!
//! Tasks are sharded by target host; every mutation of a host's queue runs
//! under that host's mutex and nothing else, so claims for different hosts
//! never contend. A global id index locates a task's shard for status
//! reports. Shards are never removed: terminal tasks remain readable for the
//! lifetime of the process.

use crate::error::Error;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use phoenix_model::{
    DeploymentId, ExperimentId, HostId, NewTask, Task, TaskId, TaskStatus, new_id,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The entity a task was issued on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOwner {
    /// Owned by an experiment.
    Experiment(ExperimentId),
    /// Owned by a standalone deployment.
    Deployment(DeploymentId),
}

impl TaskOwner {
    fn matches(&self, task: &Task) -> bool {
        match self {
            TaskOwner::Experiment(id) => task.experiment.as_ref() == Some(id),
            TaskOwner::Deployment(id) => task.deployment.as_ref() == Some(id),
        }
    }
}

/// Outcome of an agent status report, carrying the updated task.
#[derive(Debug, Clone)]
pub enum TaskTransition {
    /// The agent reported execution in progress.
    Started(Task),
    /// The agent reported success.
    Completed(Task),
    /// The attempt failed with retry budget remaining; the task is pending
    /// again.
    Retried(Task),
    /// The attempt failed and the retry ceiling is exhausted.
    Abandoned(Task),
}

impl TaskTransition {
    /// The task after the transition.
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            TaskTransition::Started(t)
            | TaskTransition::Completed(t)
            | TaskTransition::Retried(t)
            | TaskTransition::Abandoned(t) => t,
        }
    }
}

/// Tasks touched by one lease-expiry sweep, ordered by expired deadline.
#[derive(Debug, Default)]
pub struct ExpiryOutcome {
    /// Tasks returned to `pending` for a further issuance.
    pub retried: Vec<Task>,
    /// Tasks abandoned because the retry ceiling was exhausted.
    pub abandoned: Vec<Task>,
}

struct HostShard {
    queue: Mutex<Vec<Task>>,
}

/// Sharded task storage. Crate-internal; exposed through [`crate::Store`].
#[derive(Default)]
pub(crate) struct TaskTable {
    shards: RwLock<HashMap<HostId, Arc<HostShard>>>,
    index: RwLock<HashMap<TaskId, HostId>>,
}

impl TaskTable {
    fn shard(&self, host: &HostId) -> Arc<HostShard> {
        if let Some(shard) = self.shards.read().get(host) {
            return Arc::clone(shard);
        }
        let mut shards = self.shards.write();
        Arc::clone(shards.entry(host.clone()).or_insert_with(|| {
            Arc::new(HostShard {
                queue: Mutex::new(Vec::new()),
            })
        }))
    }

    fn existing_shard(&self, host: &HostId) -> Option<Arc<HostShard>> {
        self.shards.read().get(host).map(Arc::clone)
    }

    fn all_shards(&self) -> Vec<Arc<HostShard>> {
        self.shards.read().values().map(Arc::clone).collect()
    }

    /// Materializes and stores new tasks, returning them in insertion order.
    pub(crate) fn insert(&self, specs: Vec<NewTask>, now: DateTime<Utc>) -> Vec<Task> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = Task {
                id: new_id(),
                experiment: spec.experiment,
                deployment: spec.deployment,
                host: spec.host,
                action: spec.action,
                status: TaskStatus::Pending,
                attempts: 0,
                last_error: None,
                priority: spec.priority,
                created_at: now,
                assigned_at: None,
                completed_at: None,
                lease_deadline: None,
            };
            let shard = self.shard(&task.host);
            let _ = self
                .index
                .write()
                .insert(task.id.clone(), task.host.clone());
            shard.queue.lock().push(task.clone());
            created.push(task);
        }
        created
    }

    /// Atomically claims up to `max` dispatchable tasks for `host`.
    ///
    /// Selection order is `(priority desc, created_at asc, id asc)`. Each
    /// claimed task is stamped `assigned` with a fresh lease, and its attempt
    /// counter is incremented: attempts count issuances to the host.
    pub(crate) fn claim(
        &self,
        host: &HostId,
        max: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Vec<Task> {
        let Some(shard) = self.existing_shard(host) else {
            return Vec::new();
        };
        let mut queue = shard.queue.lock();
        let mut candidates: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, t)| t.claimable(now))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|&a, &b| {
            let (ta, tb) = (&queue[a], &queue[b]);
            tb.priority
                .cmp(&ta.priority)
                .then(ta.created_at.cmp(&tb.created_at))
                .then(ta.id.cmp(&tb.id))
        });
        candidates.truncate(max);

        let deadline = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let mut claimed = Vec::with_capacity(candidates.len());
        for i in candidates {
            let task = &mut queue[i];
            task.status = TaskStatus::Assigned;
            task.attempts += 1;
            task.assigned_at = Some(now);
            task.lease_deadline = Some(deadline);
            claimed.push(task.clone());
        }
        claimed
    }

    /// Undoes a claim whose caller went away before the batch was delivered:
    /// the tasks return to `pending` as if the claim never happened.
    pub(crate) fn revert_claim(&self, host: &HostId, ids: &[TaskId]) {
        let Some(shard) = self.existing_shard(host) else {
            return;
        };
        let mut queue = shard.queue.lock();
        for task in queue.iter_mut() {
            if ids.contains(&task.id) && task.status == TaskStatus::Assigned {
                task.status = TaskStatus::Pending;
                task.attempts = task.attempts.saturating_sub(1);
                task.assigned_at = None;
                task.lease_deadline = None;
            }
        }
    }

    /// Applies an agent status report.
    pub(crate) fn report(
        &self,
        task_id: &TaskId,
        caller: &HostId,
        status: TaskStatus,
        error_msg: Option<String>,
        now: DateTime<Utc>,
        retry_ceiling: u32,
    ) -> Result<TaskTransition, Error> {
        let host = self
            .index
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.clone(),
            })?;
        let shard = self.existing_shard(&host).ok_or_else(|| Error::TaskNotFound {
            id: task_id.clone(),
        })?;
        let mut queue = shard.queue.lock();
        let task = queue
            .iter_mut()
            .find(|t| &t.id == task_id)
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.clone(),
            })?;

        if &task.host != caller {
            return Err(Error::TaskHostMismatch {
                task: task_id.clone(),
                expected: task.host.clone(),
                caller: caller.clone(),
            });
        }
        if task.status.is_terminal() {
            return Err(Error::TaskTerminal {
                task: task_id.clone(),
                status: task.status,
            });
        }

        match status {
            TaskStatus::Running => {
                task.status = TaskStatus::Running;
                Ok(TaskTransition::Started(task.clone()))
            }
            TaskStatus::Completed => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.lease_deadline = None;
                Ok(TaskTransition::Completed(task.clone()))
            }
            TaskStatus::Failed => {
                task.last_error = error_msg;
                if task.attempts >= retry_ceiling {
                    task.status = TaskStatus::Abandoned;
                    task.completed_at = Some(now);
                    task.lease_deadline = None;
                    Ok(TaskTransition::Abandoned(task.clone()))
                } else {
                    task.status = TaskStatus::Pending;
                    task.assigned_at = None;
                    task.lease_deadline = None;
                    Ok(TaskTransition::Retried(task.clone()))
                }
            }
            other => Err(Error::InvalidStatusReport {
                task: task_id.clone(),
                status: other,
            }),
        }
    }

    /// Sweeps expired leases: tasks below the retry ceiling return to
    /// `pending` (their attempt counter is incremented by the next claim),
    /// the rest are abandoned. Results are ordered by expired deadline.
    pub(crate) fn expire(&self, now: DateTime<Utc>, retry_ceiling: u32) -> ExpiryOutcome {
        let mut touched: Vec<(DateTime<Utc>, bool, Task)> = Vec::new();
        for shard in self.all_shards() {
            let mut queue = shard.queue.lock();
            for task in queue.iter_mut() {
                if !task.lease_expired(now) {
                    continue;
                }
                let deadline = task.lease_deadline.unwrap_or(now);
                if task.attempts < retry_ceiling {
                    task.status = TaskStatus::Pending;
                    task.assigned_at = None;
                    task.lease_deadline = None;
                    touched.push((deadline, false, task.clone()));
                } else {
                    task.status = TaskStatus::Abandoned;
                    task.completed_at = Some(now);
                    task.lease_deadline = None;
                    if task.last_error.is_none() {
                        task.last_error = Some("lease expired after final attempt".to_owned());
                    }
                    touched.push((deadline, true, task.clone()));
                }
            }
        }
        touched.sort_by(|a, b| a.0.cmp(&b.0));
        let mut outcome = ExpiryOutcome::default();
        for (_, abandoned, task) in touched {
            if abandoned {
                outcome.abandoned.push(task);
            } else {
                outcome.retried.push(task);
            }
        }
        outcome
    }

    /// Reads a task by id.
    pub(crate) fn get(&self, task_id: &TaskId) -> Result<Task, Error> {
        let host = self
            .index
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.clone(),
            })?;
        let shard = self.existing_shard(&host).ok_or_else(|| Error::TaskNotFound {
            id: task_id.clone(),
        })?;
        let queue = shard.queue.lock();
        queue
            .iter()
            .find(|t| &t.id == task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.clone(),
            })
    }

    /// All tasks owned by `owner`, in creation order.
    pub(crate) fn for_owner(&self, owner: &TaskOwner) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .all_shards()
            .into_iter()
            .flat_map(|shard| {
                let queue = shard.queue.lock();
                queue
                    .iter()
                    .filter(|t| owner.matches(t))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Terminally fails every outstanding task of `owner`, returning the
    /// tasks that were failed.
    pub(crate) fn fail_outstanding(
        &self,
        owner: &TaskOwner,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<Task> {
        let mut failed = Vec::new();
        for shard in self.all_shards() {
            let mut queue = shard.queue.lock();
            for task in queue.iter_mut() {
                if owner.matches(task) && task.status.is_outstanding() {
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(reason.to_owned());
                    task.completed_at = Some(now);
                    task.lease_deadline = None;
                    failed.push(task.clone());
                }
            }
        }
        failed
    }

    /// Returns true when `host` has at least one claimable or leased task.
    pub(crate) fn has_outstanding(&self, host: &HostId) -> bool {
        self.existing_shard(host)
            .is_some_and(|shard| shard.queue.lock().iter().any(|t| t.status.is_outstanding()))
    }
}
