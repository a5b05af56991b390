// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The store proper: typed CRUD plus the transactional phase CAS.
//!
//! Every experiment transition goes through [`Store::compare_and_swap_phase`]:
//! the phase bump, task enqueues, result write, and event emission all happen
//! under the experiments lock, so a lost CAS produces no observable change
//! and a won CAS is never observed half-applied.

use crate::cursor;
use crate::cursor::Page;
use crate::error::Error;
use crate::notify::{HostChannel, Notifiers};
use crate::tasks::{ExpiryOutcome, TaskOwner, TaskTable, TaskTransition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use phoenix_events::{Event, EventBus, experiment_topic, host_topic};
use phoenix_model::{
    DeploymentId, Experiment, ExperimentId, ExperimentPhase, ExperimentResult, Host, HostHealth,
    HostId, NewTask, PipelineDeployment, ResourceUsage, Task, TaskId, TaskStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Side effects committed atomically with a phase bump.
///
/// Effects apply only when the CAS wins; a version or overlap conflict leaves
/// the store untouched.
#[derive(Default)]
pub struct PhaseEffects {
    /// Tasks to enqueue.
    pub enqueue: Vec<NewTask>,
    /// Analysis result to write (entering `completed`, or `failed` after the
    /// analyzer ran).
    pub result: Option<ExperimentResult>,
    /// Failure reason to record (entering `failed` before analysis).
    pub failure_reason: Option<String>,
    /// Cancelling actor (entering `cancelled`).
    pub cancelled_by: Option<String>,
    /// When set, every outstanding task of the experiment is terminally
    /// failed with this reason before the new tasks are enqueued.
    pub cancel_outstanding: Option<String>,
    /// Re-verify that no non-terminal peer holds any of the target hosts
    /// (the `pending -> initializing` recheck).
    pub check_host_overlap: bool,
    /// Events to publish once the swap is committed.
    pub events: Vec<(String, Event)>,
}

/// A committed CAS: the updated experiment and the tasks it enqueued.
#[derive(Debug, Clone)]
pub struct CasOutcome {
    /// The experiment after the transition.
    pub experiment: Experiment,
    /// Tasks created as part of the transition.
    pub enqueued: Vec<Task>,
}

/// Outcome of recording a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    /// The host after the update.
    pub host: Host,
    /// Health transition caused by this heartbeat, if any.
    pub health_changed: Option<(HostHealth, HostHealth)>,
}

/// In-memory implementation of the durable-store contract.
pub struct Store {
    experiments: RwLock<HashMap<ExperimentId, Experiment>>,
    deployments: RwLock<HashMap<DeploymentId, PipelineDeployment>>,
    hosts: RwLock<HashMap<HostId, Host>>,
    tasks: TaskTable,
    notifiers: Notifiers,
    bus: EventBus,
}

impl Store {
    /// Creates an empty store publishing committed events on `bus`.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            experiments: RwLock::new(HashMap::new()),
            deployments: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            tasks: TaskTable::default(),
            notifiers: Notifiers::default(),
            bus,
        }
    }

    /// The bus committed events are published on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // --- Experiments -----------------------------------------------------

    /// Persists a new experiment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateId`] when the id is already taken.
    pub fn create_experiment(&self, experiment: Experiment) -> Result<Experiment, Error> {
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&experiment.id) {
            return Err(Error::DuplicateId {
                id: experiment.id.clone(),
            });
        }
        let _ = experiments.insert(experiment.id.clone(), experiment.clone());
        Ok(experiment)
    }

    /// Reads an experiment by id.
    pub fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, Error> {
        self.experiments
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ExperimentNotFound { id: id.clone() })
    }

    /// Lists experiments ordered by `(created_at, id)`, cursor-paginated.
    pub fn list_experiments(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Experiment>, Error> {
        let after = cursor.map(cursor::decode).transpose()?;
        let mut all: Vec<Experiment> = self.experiments.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let items: Vec<Experiment> = all
            .into_iter()
            .filter(|e| {
                after
                    .as_ref()
                    .is_none_or(|(ts, id)| (e.created_at, e.id.as_str()) > (*ts, id.as_str()))
            })
            .take(limit.max(1))
            .collect();
        let next_cursor = (items.len() == limit.max(1))
            .then(|| items.last().map(|e| cursor::encode(e.created_at, &e.id)))
            .flatten();
        Ok(Page { items, next_cursor })
    }

    /// Every experiment not yet in a terminal phase.
    #[must_use]
    pub fn non_terminal_experiments(&self) -> Vec<Experiment> {
        self.experiments
            .read()
            .values()
            .filter(|e| !e.phase.is_terminal())
            .cloned()
            .collect()
    }

    /// Finds a non-terminal experiment (other than `exclude`) whose host set
    /// intersects `hosts`, returning it with the intersection.
    #[must_use]
    pub fn find_host_overlap(
        &self,
        hosts: &std::collections::BTreeSet<HostId>,
        exclude: Option<&ExperimentId>,
    ) -> Option<(ExperimentId, Vec<HostId>)> {
        let experiments = self.experiments.read();
        Self::overlap_in(&experiments, hosts, exclude)
    }

    fn overlap_in(
        experiments: &HashMap<ExperimentId, Experiment>,
        hosts: &std::collections::BTreeSet<HostId>,
        exclude: Option<&ExperimentId>,
    ) -> Option<(ExperimentId, Vec<HostId>)> {
        experiments
            .values()
            .filter(|e| Some(&e.id) != exclude && !e.phase.is_terminal())
            .find_map(|e| {
                let shared: Vec<HostId> = e
                    .config
                    .target_hosts
                    .intersection(hosts)
                    .cloned()
                    .collect();
                (!shared.is_empty()).then(|| (e.id.clone(), shared))
            })
    }

    /// Transitions an experiment's phase with optimistic concurrency.
    ///
    /// Exactly one of concurrent attempts at the same version wins. Side
    /// effects (task enqueues, result write, task cancellation, event
    /// emission) commit with the phase bump or not at all.
    ///
    /// # Errors
    ///
    /// [`Error::VersionConflict`] when a concurrent transition won (retryable
    /// by re-reading), [`Error::IllegalTransition`] when the edge is not in
    /// the lifecycle graph, [`Error::HostOverlap`] when the start recheck
    /// finds a non-terminal peer on the same hosts.
    pub fn compare_and_swap_phase(
        &self,
        id: &ExperimentId,
        expected_version: u64,
        new_phase: ExperimentPhase,
        effects: PhaseEffects,
    ) -> Result<CasOutcome, Error> {
        let now = Utc::now();
        let mut experiments = self.experiments.write();

        // Preconditions, checked before any mutation.
        {
            let exp = experiments
                .get(id)
                .ok_or_else(|| Error::ExperimentNotFound { id: id.clone() })?;
            if exp.version != expected_version {
                return Err(Error::VersionConflict {
                    id: id.clone(),
                    expected: expected_version,
                    actual: exp.version,
                });
            }
            if !exp.phase.permits(new_phase) {
                return Err(Error::IllegalTransition {
                    id: id.clone(),
                    from: exp.phase,
                    to: new_phase,
                });
            }
            if effects.check_host_overlap
                && let Some((conflicting, hosts)) =
                    Self::overlap_in(&experiments, &exp.config.target_hosts, Some(id))
            {
                return Err(Error::HostOverlap {
                    id: id.clone(),
                    conflicting,
                    hosts,
                });
            }
        }

        let exp = experiments
            .get_mut(id)
            .ok_or_else(|| Error::ExperimentNotFound { id: id.clone() })?;
        exp.phase = new_phase;
        exp.version += 1;
        exp.updated_at = now;
        match new_phase {
            ExperimentPhase::Initializing => {
                let _ = exp.started_at.get_or_insert(now);
            }
            ExperimentPhase::Completed | ExperimentPhase::Failed => {
                let _ = exp.ended_at.get_or_insert(now);
            }
            ExperimentPhase::Cancelled => {
                let _ = exp.ended_at.get_or_insert(now);
                exp.cancelled_at = Some(now);
                exp.cancelled_by = effects.cancelled_by.clone();
            }
            _ => {}
        }
        if let Some(result) = &effects.result {
            exp.results = Some(result.clone());
        }
        if let Some(reason) = &effects.failure_reason {
            exp.failure_reason = Some(reason.clone());
        }
        let experiment = exp.clone();

        // Task effects, still under the experiments lock so the transition is
        // observed all-or-nothing. Task locks nest inside the experiments
        // lock and never the other way around.
        let mut events = effects.events;
        if let Some(reason) = &effects.cancel_outstanding {
            let owner = TaskOwner::Experiment(id.clone());
            for task in self.tasks.fail_outstanding(&owner, reason, now) {
                events.push((experiment_topic(id), Event::task_failed(&task)));
            }
        }
        let enqueued = self.insert_tasks_inner(effects.enqueue, now);

        for (topic, event) in events {
            self.bus.publish(&topic, event);
        }
        drop(experiments);

        Ok(CasOutcome {
            experiment,
            enqueued,
        })
    }

    // --- Tasks -----------------------------------------------------------

    fn insert_tasks_inner(&self, specs: Vec<NewTask>, now: DateTime<Utc>) -> Vec<Task> {
        let created = self.tasks.insert(specs, now);
        for task in &created {
            self.notifiers.wake(&task.host);
        }
        created
    }

    /// Enqueues tasks outside any phase transition (standalone deployments,
    /// re-issued teardown work).
    pub fn enqueue_tasks(&self, specs: Vec<NewTask>) -> Vec<Task> {
        self.insert_tasks_inner(specs, Utc::now())
    }

    /// Atomically claims up to `max` dispatchable tasks for `host`,
    /// stamping each with a lease of `lease`.
    pub fn claim_for_host(
        &self,
        host: &HostId,
        max: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Vec<Task> {
        self.tasks.claim(host, max, now, lease)
    }

    /// Reverts a claim whose caller disconnected before delivery.
    pub fn revert_claim(&self, host: &HostId, ids: &[TaskId]) {
        self.tasks.revert_claim(host, ids);
        self.notifiers.wake(host);
    }

    /// Applies an agent status report and publishes the matching event.
    pub fn report_task_status(
        &self,
        task_id: &TaskId,
        caller: &HostId,
        status: TaskStatus,
        error_msg: Option<String>,
        retry_ceiling: u32,
    ) -> Result<TaskTransition, Error> {
        let transition = self
            .tasks
            .report(task_id, caller, status, error_msg, Utc::now(), retry_ceiling)?;
        match &transition {
            TaskTransition::Completed(task) => {
                self.bus.publish(&task_topic(task), Event::task_completed(task));
            }
            TaskTransition::Abandoned(task) => {
                self.bus.publish(&task_topic(task), Event::task_failed(task));
            }
            TaskTransition::Retried(task) => {
                // The task is claimable again; wake its host's pollers.
                self.notifiers.wake(&task.host);
            }
            TaskTransition::Started(_) => {}
        }
        Ok(transition)
    }

    /// Sweeps expired leases, publishing failure events for abandoned tasks
    /// and waking hosts whose tasks became claimable again.
    pub fn expire_leases(&self, now: DateTime<Utc>, retry_ceiling: u32) -> ExpiryOutcome {
        let outcome = self.tasks.expire(now, retry_ceiling);
        for task in &outcome.retried {
            self.notifiers.wake(&task.host);
        }
        for task in &outcome.abandoned {
            self.bus.publish(&task_topic(task), Event::task_failed(task));
        }
        outcome
    }

    /// Reads a task by id.
    pub fn get_task(&self, task_id: &TaskId) -> Result<Task, Error> {
        self.tasks.get(task_id)
    }

    /// All tasks owned by an experiment, in creation order.
    #[must_use]
    pub fn tasks_for_experiment(&self, id: &ExperimentId) -> Vec<Task> {
        self.tasks.for_owner(&TaskOwner::Experiment(id.clone()))
    }

    /// All tasks owned by a standalone deployment, in creation order.
    #[must_use]
    pub fn tasks_for_deployment(&self, id: &DeploymentId) -> Vec<Task> {
        self.tasks.for_owner(&TaskOwner::Deployment(id.clone()))
    }

    /// Terminally fails every outstanding task of a deployment.
    pub fn fail_deployment_tasks(&self, id: &DeploymentId, reason: &str) -> Vec<Task> {
        let failed = self.tasks.fail_outstanding(
            &TaskOwner::Deployment(id.clone()),
            reason,
            Utc::now(),
        );
        for task in &failed {
            self.bus.publish(&task_topic(task), Event::task_failed(task));
        }
        failed
    }

    // --- Host notification channels --------------------------------------

    /// The wake-up channel for `host`, created lazily.
    #[must_use]
    pub fn host_channel(&self, host: &HostId) -> Arc<HostChannel> {
        self.notifiers.channel(host, Utc::now())
    }

    /// Drops wake-up channels idle longer than `ttl` whose hosts have no
    /// poller and no outstanding tasks. Returns how many were reclaimed.
    pub fn sweep_idle_channels(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_default();
        self.notifiers
            .sweep_idle(Utc::now(), ttl, |host| self.tasks.has_outstanding(host))
    }

    // --- Hosts -----------------------------------------------------------

    /// Records an agent heartbeat, registering the host on first contact.
    ///
    /// Labels are add-only after registration. The previous derived
    /// health is compared against the post-heartbeat health; a change is
    /// reported and published as a host event.
    pub fn record_heartbeat(
        &self,
        id: &HostId,
        labels: &BTreeMap<String, String>,
        agent_version: Option<&str>,
        resources: Option<ResourceUsage>,
        healthy_window: Duration,
    ) -> HeartbeatOutcome {
        let now = Utc::now();
        let mut hosts = self.hosts.write();
        let outcome = match hosts.get_mut(id) {
            Some(host) => {
                let previous = host.health(now, healthy_window);
                host.merge_labels(labels);
                if let Some(version) = agent_version {
                    host.agent_version = version.to_owned();
                }
                if resources.is_some() {
                    host.resources = resources;
                }
                host.last_heartbeat = now;
                let current = host.health(now, healthy_window);
                HeartbeatOutcome {
                    host: host.clone(),
                    health_changed: (previous != current).then_some((previous, current)),
                }
            }
            None => {
                let host = Host {
                    id: id.clone(),
                    labels: labels.clone(),
                    agent_version: agent_version.unwrap_or_default().to_owned(),
                    last_heartbeat: now,
                    resources,
                    registered_at: now,
                };
                let _ = hosts.insert(id.clone(), host.clone());
                HeartbeatOutcome {
                    host,
                    health_changed: None,
                }
            }
        };
        drop(hosts);
        if let Some((from, to)) = outcome.health_changed {
            self.bus
                .publish(&host_topic(id), Event::host_health_changed(id, from, to));
        }
        outcome
    }

    /// Reads a host by id.
    pub fn get_host(&self, id: &HostId) -> Option<Host> {
        self.hosts.read().get(id).cloned()
    }

    /// All registered hosts, ordered by id.
    #[must_use]
    pub fn list_hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.read().values().cloned().collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    /// Hosts carrying every label in `labels`.
    #[must_use]
    pub fn hosts_matching_labels(&self, labels: &BTreeMap<String, String>) -> Vec<HostId> {
        self.hosts
            .read()
            .values()
            .filter(|h| labels.iter().all(|(k, v)| h.labels.get(k) == Some(v)))
            .map(|h| h.id.clone())
            .collect()
    }

    // --- Deployments ------------------------------------------------------

    /// Persists a new standalone deployment.
    pub fn create_deployment(
        &self,
        deployment: PipelineDeployment,
    ) -> Result<PipelineDeployment, Error> {
        let mut deployments = self.deployments.write();
        if deployments.contains_key(&deployment.id) {
            return Err(Error::DuplicateId {
                id: deployment.id.clone(),
            });
        }
        let _ = deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    /// Reads a deployment by id.
    pub fn get_deployment(&self, id: &DeploymentId) -> Result<PipelineDeployment, Error> {
        self.deployments
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeploymentNotFound { id: id.clone() })
    }

    /// All deployments, ordered by creation.
    #[must_use]
    pub fn list_deployments(&self) -> Vec<PipelineDeployment> {
        let mut all: Vec<PipelineDeployment> =
            self.deployments.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Mutates a deployment under the store lock.
    pub fn update_deployment<R>(
        &self,
        id: &DeploymentId,
        f: impl FnOnce(&mut PipelineDeployment) -> R,
    ) -> Result<(PipelineDeployment, R), Error> {
        let mut deployments = self.deployments.write();
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| Error::DeploymentNotFound { id: id.clone() })?;
        let out = f(deployment);
        deployment.updated_at = Utc::now();
        Ok((deployment.clone(), out))
    }
}

/// The topic a task's events belong on: its experiment when owned, otherwise
/// its host.
fn task_topic(task: &Task) -> String {
    match &task.experiment {
        Some(experiment) => experiment_topic(experiment),
        None => host_topic(&task.host),
    }
}
