// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The experiment controller: operator actions and reconciliation.
//!
//! Reconciliation is idempotent and convergent: it reads the experiment
//! fresh, decides at most one transition, and commits it through the store
//! CAS. It runs from the scheduler tick, from agent status reports, and
//! from analyzer completion; a lost race in any of them is simply retried
//! at the next occasion.

use chrono::Utc;
use parking_lot::Mutex;
use phoenix_analyzer::Analyzer;
use phoenix_config::SchedulerSettings;
use phoenix_events::{Event, experiment_topic};
use phoenix_model::{
    Experiment, ExperimentConfig, ExperimentId, ExperimentPhase, ExperimentResult, HostId,
    NewTask, Task, TaskAction, TaskStatus, Variant, new_id,
};
use phoenix_store::{Error as StoreError, PhaseEffects, Store, TaskTransition};
use phoenix_tasks::TaskQueue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Parameters for creating an experiment.
#[derive(Debug, Clone)]
pub struct CreateExperiment {
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Owning operator.
    pub owner: String,
    /// Immutable configuration.
    pub config: ExperimentConfig,
    /// Create even when the host set overlaps a non-terminal peer. The
    /// overlap is re-verified when the experiment starts.
    pub force: bool,
}

/// Parameters for promoting a finished experiment.
#[derive(Debug, Clone)]
pub struct PromoteRequest {
    /// The variant to deploy on the promotion scope.
    pub variant: Variant,
    /// Hosts to promote to; defaults to the experiment's target hosts.
    pub hosts: Option<Vec<HostId>>,
}

/// Owns every experiment and deployment mutation.
pub struct Controller {
    pub(crate) store: Arc<Store>,
    pub(crate) queue: Arc<TaskQueue>,
    analyzer: Arc<Analyzer>,
    settings: SchedulerSettings,
    /// Results produced by the analyzer but not yet committed with a phase
    /// write.
    pending_results: Mutex<HashMap<ExperimentId, ExperimentResult>>,
    /// Experiments with an analysis task in flight.
    analyses_running: Mutex<HashSet<ExperimentId>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a controller over the shared store and queue.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        analyzer: Arc<Analyzer>,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            analyzer,
            settings,
            pending_results: Mutex::new(HashMap::new()),
            analyses_running: Mutex::new(HashSet::new()),
            shutdown,
        })
    }

    // --- Operator actions -------------------------------------------------

    /// Creates an experiment in `pending`.
    ///
    /// # Errors
    ///
    /// Validation errors for a malformed config; [`Error::HostOverlap`] when
    /// the host set intersects a non-terminal peer and `force` is not set.
    /// The overlap check here is advisory (racy under concurrent creation)
    /// and re-verified at start.
    pub fn create(&self, params: CreateExperiment) -> Result<Experiment, Error> {
        let errors = params.config.validation_errors();
        if !errors.is_empty() {
            return Err(Error::Validation {
                entity: "experiment config",
                errors,
            });
        }
        if !params.force
            && let Some((conflicting, hosts)) = self
                .store
                .find_host_overlap(&params.config.target_hosts, None)
        {
            return Err(Error::HostOverlap { conflicting, hosts });
        }
        let now = Utc::now();
        let experiment = Experiment {
            id: new_id(),
            name: params.name,
            description: params.description,
            owner: params.owner,
            config: params.config,
            phase: ExperimentPhase::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            results: None,
            failure_reason: None,
            cancelled_at: None,
            cancelled_by: None,
        };
        Ok(self.store.create_experiment(experiment)?)
    }

    /// Starts a pending experiment: re-verifies host overlap, enqueues one
    /// deploy task per (host, variant), and enters `initializing`.
    pub fn start(&self, id: &ExperimentId) -> Result<Experiment, Error> {
        let exp = self.store.get_experiment(id)?;
        let effects = PhaseEffects {
            enqueue: deploy_tasks(&exp),
            check_host_overlap: true,
            events: vec![phase_event(&exp, ExperimentPhase::Initializing)],
            ..PhaseEffects::default()
        };
        let outcome = self.store.compare_and_swap_phase(
            id,
            exp.version,
            ExperimentPhase::Initializing,
            effects,
        )?;
        tracing::info!(experiment = %id, hosts = exp.config.target_hosts.len(), "experiment started");
        Ok(outcome.experiment)
    }

    /// Cancels an experiment on behalf of `actor`.
    ///
    /// Outstanding tasks are terminally failed; stop tasks for everything the
    /// experiment deployed are enqueued and continue past the terminal phase
    /// until the hosts acknowledge them.
    pub fn stop(&self, id: &ExperimentId, actor: &str) -> Result<Experiment, Error> {
        let exp = self.store.get_experiment(id)?;
        let effects = PhaseEffects {
            enqueue: teardown_tasks(&exp),
            cancelled_by: Some(actor.to_owned()),
            cancel_outstanding: Some("experiment cancelled".to_owned()),
            events: vec![phase_event(&exp, ExperimentPhase::Cancelled)],
            ..PhaseEffects::default()
        };
        let outcome = self.store.compare_and_swap_phase(
            id,
            exp.version,
            ExperimentPhase::Cancelled,
            effects,
        )?;
        tracing::info!(experiment = %id, actor, "experiment cancelled");
        Ok(outcome.experiment)
    }

    /// Promotes the chosen variant of a completed experiment to the given
    /// scope (the experiment's own hosts when unspecified).
    pub fn promote(&self, id: &ExperimentId, request: PromoteRequest) -> Result<Experiment, Error> {
        let exp = self.store.get_experiment(id)?;
        let scope: Vec<HostId> = match request.hosts {
            Some(hosts) if !hosts.is_empty() => hosts,
            _ => exp.config.target_hosts.iter().cloned().collect(),
        };
        let (pipeline, parameters) = match request.variant {
            Variant::Baseline => (
                exp.config.baseline_pipeline.clone(),
                exp.config.baseline_params.clone(),
            ),
            Variant::Candidate => (
                exp.config.candidate_pipeline.clone(),
                exp.config.candidate_params.clone(),
            ),
        };
        let enqueue = scope
            .into_iter()
            .map(|host| {
                NewTask::for_experiment(
                    id.clone(),
                    host,
                    TaskAction::DeployPipeline {
                        pipeline: pipeline.clone(),
                        // Promotion deploys carry no variant tag: they are the
                        // new steady state, not an experiment arm.
                        variant: None,
                        parameters: parameters.clone(),
                    },
                )
            })
            .collect();
        let effects = PhaseEffects {
            enqueue,
            events: vec![phase_event(&exp, ExperimentPhase::Promoting)],
            ..PhaseEffects::default()
        };
        let outcome = self.store.compare_and_swap_phase(
            id,
            exp.version,
            ExperimentPhase::Promoting,
            effects,
        )?;
        tracing::info!(experiment = %id, variant = %request.variant, "promotion started");
        Ok(outcome.experiment)
    }

    /// Reads an experiment.
    pub fn get(&self, id: &ExperimentId) -> Result<Experiment, Error> {
        Ok(self.store.get_experiment(id)?)
    }

    /// The stored analysis result of an experiment.
    ///
    /// # Errors
    ///
    /// [`Error::AnalysisNotReady`] until the result was committed with a
    /// terminal or completed phase.
    pub fn analysis(&self, id: &ExperimentId) -> Result<ExperimentResult, Error> {
        let exp = self.store.get_experiment(id)?;
        exp.results.ok_or(Error::AnalysisNotReady {
            id: id.clone(),
            phase: exp.phase,
        })
    }

    // --- Reconciliation ---------------------------------------------------

    /// Advances every non-terminal experiment and deployment by at most one
    /// transition each. Called by the scheduler tick.
    pub fn tick(self: &Arc<Self>) {
        for exp in self.store.non_terminal_experiments() {
            if let Err(e) = self.reconcile_experiment(&exp.id) {
                match &e {
                    Error::Store(StoreError::VersionConflict { .. }) => {
                        tracing::debug!(experiment = %exp.id, "reconcile lost a concurrent transition");
                    }
                    _ => tracing::warn!(experiment = %exp.id, error = %e, "reconcile failed"),
                }
            }
        }
        self.reconcile_deployments();
    }

    /// Routes an agent task transition into reconciliation.
    pub fn on_task_transition(self: &Arc<Self>, transition: &TaskTransition) {
        let task = transition.task();
        if let Some(experiment) = &task.experiment {
            if let Err(e) = self.reconcile_experiment(experiment) {
                tracing::debug!(experiment = %experiment, error = %e, "post-report reconcile");
            }
        } else if let Some(deployment) = &task.deployment
            && let Err(e) = self.reconcile_deployment(deployment)
        {
            tracing::debug!(deployment = %deployment, error = %e, "post-report reconcile");
        }
    }

    /// Reconciles one experiment, committing at most one transition.
    /// Returns the updated experiment when a transition was taken.
    pub fn reconcile_experiment(
        self: &Arc<Self>,
        id: &ExperimentId,
    ) -> Result<Option<Experiment>, Error> {
        let exp = self.store.get_experiment(id)?;
        let now = Utc::now();
        match exp.phase {
            ExperimentPhase::Initializing => self.reconcile_initializing(&exp, now),
            ExperimentPhase::WarmingUp => {
                if exp.warmup_deadline().is_some_and(|d| now >= d) {
                    let effects = PhaseEffects {
                        events: vec![phase_event(&exp, ExperimentPhase::Running)],
                        ..PhaseEffects::default()
                    };
                    let outcome = self.store.compare_and_swap_phase(
                        id,
                        exp.version,
                        ExperimentPhase::Running,
                        effects,
                    )?;
                    return Ok(Some(outcome.experiment));
                }
                Ok(None)
            }
            ExperimentPhase::Running => {
                if exp.duration_deadline().is_some_and(|d| now >= d) {
                    let outcome = self.enter_analyzing(&exp)?;
                    return Ok(Some(outcome));
                }
                Ok(None)
            }
            ExperimentPhase::Analyzing => self.reconcile_analyzing(&exp),
            ExperimentPhase::Promoting => self.reconcile_promoting(&exp),
            ExperimentPhase::Pending
            | ExperimentPhase::Completed
            | ExperimentPhase::Failed
            | ExperimentPhase::Cancelled
            | ExperimentPhase::Promoted => Ok(None),
        }
    }

    fn reconcile_initializing(
        self: &Arc<Self>,
        exp: &Experiment,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<Experiment>, Error> {
        let tasks = self.queue.by_experiment(&exp.id);
        let deploys: Vec<&Task> = tasks
            .iter()
            .filter(|t| matches!(&t.action, TaskAction::DeployPipeline { variant: Some(_), .. }))
            .collect();

        if let Some(abandoned) = deploys.iter().find(|t| t.status == TaskStatus::Abandoned) {
            let reason = format!(
                "deploy task {} abandoned on host {} after {} attempts: {}",
                abandoned.id,
                abandoned.host,
                abandoned.attempts,
                abandoned.last_error.as_deref().unwrap_or("unknown error"),
            );
            return self.fail_experiment(exp, reason).map(Some);
        }

        let all_confirmed = !deploys.is_empty()
            && deploys.iter().all(|t| t.status == TaskStatus::Completed);
        if all_confirmed {
            let effects = PhaseEffects {
                events: vec![phase_event(exp, ExperimentPhase::WarmingUp)],
                ..PhaseEffects::default()
            };
            let outcome = self.store.compare_and_swap_phase(
                &exp.id,
                exp.version,
                ExperimentPhase::WarmingUp,
                effects,
            )?;
            return Ok(Some(outcome.experiment));
        }

        let timed_out = exp
            .started_at
            .is_some_and(|s| now.signed_duration_since(s).to_std().unwrap_or_default()
                >= self.settings.init_timeout);
        if timed_out {
            return self
                .fail_experiment(exp, "initialization timeout exceeded".to_owned())
                .map(Some);
        }
        Ok(None)
    }

    /// Takes `running -> analyzing`: stop the candidate (and any load
    /// simulation) everywhere, then kick off the analyzer.
    fn enter_analyzing(self: &Arc<Self>, exp: &Experiment) -> Result<Experiment, Error> {
        let mut enqueue = Vec::new();
        for host in &exp.config.target_hosts {
            enqueue.push(NewTask::for_experiment(
                exp.id.clone(),
                host.clone(),
                TaskAction::StopPipeline {
                    pipeline: exp.config.candidate_pipeline.clone(),
                    variant: Some(Variant::Candidate),
                },
            ));
            if exp.config.load_profile.is_some() {
                enqueue.push(NewTask::for_experiment(
                    exp.id.clone(),
                    host.clone(),
                    TaskAction::StopLoadSim,
                ));
            }
        }
        let effects = PhaseEffects {
            enqueue,
            events: vec![phase_event(exp, ExperimentPhase::Analyzing)],
            ..PhaseEffects::default()
        };
        let outcome = self.store.compare_and_swap_phase(
            &exp.id,
            exp.version,
            ExperimentPhase::Analyzing,
            effects,
        )?;
        self.ensure_analysis(&outcome.experiment);
        Ok(outcome.experiment)
    }

    fn reconcile_analyzing(self: &Arc<Self>, exp: &Experiment) -> Result<Option<Experiment>, Error> {
        self.ensure_analysis(exp);

        let tasks = self.queue.by_experiment(&exp.id);
        let stops: Vec<&Task> = tasks
            .iter()
            .filter(|t| {
                matches!(
                    &t.action,
                    TaskAction::StopPipeline { variant: Some(Variant::Candidate), .. }
                )
            })
            .collect();

        if let Some(abandoned) = stops.iter().find(|t| t.status == TaskStatus::Abandoned) {
            let reason = format!(
                "stop task {} abandoned on host {}",
                abandoned.id, abandoned.host
            );
            return self.fail_experiment(exp, reason).map(Some);
        }

        let stops_done = !stops.is_empty() && stops.iter().all(|t| t.status == TaskStatus::Completed);
        let result = self.pending_results.lock().get(&exp.id).cloned();
        if let Some(result) = result
            && stops_done
        {
            let events = vec![
                phase_event(exp, ExperimentPhase::Completed),
                (
                    experiment_topic(&exp.id),
                    Event::result_ready(&exp.id, &result),
                ),
            ];
            let effects = PhaseEffects {
                result: Some(result),
                events,
                ..PhaseEffects::default()
            };
            let outcome = self.store.compare_and_swap_phase(
                &exp.id,
                exp.version,
                ExperimentPhase::Completed,
                effects,
            )?;
            let _ = self.pending_results.lock().remove(&exp.id);
            tracing::info!(
                experiment = %exp.id,
                verdict = %outcome.experiment.results.as_ref().map(|r| r.verdict.to_string()).unwrap_or_default(),
                "experiment completed"
            );
            return Ok(Some(outcome.experiment));
        }
        Ok(None)
    }

    fn reconcile_promoting(self: &Arc<Self>, exp: &Experiment) -> Result<Option<Experiment>, Error> {
        let tasks = self.queue.by_experiment(&exp.id);
        let promo: Vec<&Task> = tasks
            .iter()
            .filter(|t| matches!(&t.action, TaskAction::DeployPipeline { variant: None, .. }))
            .collect();

        if let Some(abandoned) = promo.iter().find(|t| t.status == TaskStatus::Abandoned) {
            let reason = format!(
                "promotion deploy {} abandoned on host {}",
                abandoned.id, abandoned.host
            );
            return self.fail_experiment(exp, reason).map(Some);
        }
        let all_done = !promo.is_empty() && promo.iter().all(|t| t.status == TaskStatus::Completed);
        if all_done {
            let effects = PhaseEffects {
                events: vec![phase_event(exp, ExperimentPhase::Promoted)],
                ..PhaseEffects::default()
            };
            let outcome = self.store.compare_and_swap_phase(
                &exp.id,
                exp.version,
                ExperimentPhase::Promoted,
                effects,
            )?;
            return Ok(Some(outcome.experiment));
        }
        Ok(None)
    }

    /// Fails an experiment: records the reason, terminally fails outstanding
    /// tasks, and enqueues teardown for whatever the experiment deployed. A
    /// result produced by the analyzer before the failure is committed with
    /// the phase write.
    fn fail_experiment(
        self: &Arc<Self>,
        exp: &Experiment,
        reason: String,
    ) -> Result<Experiment, Error> {
        let result = self.pending_results.lock().get(&exp.id).cloned();
        let effects = PhaseEffects {
            enqueue: teardown_tasks(exp),
            result,
            failure_reason: Some(reason.clone()),
            cancel_outstanding: Some(reason.clone()),
            events: vec![phase_event(exp, ExperimentPhase::Failed)],
            ..PhaseEffects::default()
        };
        let outcome =
            self.store
                .compare_and_swap_phase(&exp.id, exp.version, ExperimentPhase::Failed, effects)?;
        let _ = self.pending_results.lock().remove(&exp.id);
        tracing::warn!(experiment = %exp.id, reason, "experiment failed");
        Ok(outcome.experiment)
    }

    /// Spawns the analysis task for an experiment in `analyzing`, once.
    fn ensure_analysis(self: &Arc<Self>, exp: &Experiment) {
        if exp.results.is_some() || self.pending_results.lock().contains_key(&exp.id) {
            return;
        }
        if !self.analyses_running.lock().insert(exp.id.clone()) {
            return;
        }
        let controller = Arc::clone(self);
        let snapshot = exp.clone();
        drop(tokio::spawn(async move {
            let outcome = controller
                .analyzer
                .analyze(&snapshot, &controller.shutdown)
                .await;
            let _ = controller.analyses_running.lock().remove(&snapshot.id);
            match outcome {
                Ok(result) => {
                    let _ = controller
                        .pending_results
                        .lock()
                        .insert(snapshot.id.clone(), result);
                    if let Err(e) = controller.reconcile_experiment(&snapshot.id) {
                        tracing::debug!(experiment = %snapshot.id, error = %e, "post-analysis reconcile");
                    }
                }
                Err(phoenix_analyzer::Error::Cancelled { .. }) => {
                    tracing::info!(experiment = %snapshot.id, "analysis cancelled");
                }
                Err(e) => {
                    tracing::error!(experiment = %snapshot.id, error = %e, "analysis failed");
                    if let Ok(current) = controller.store.get_experiment(&snapshot.id)
                        && current.phase == ExperimentPhase::Analyzing
                        && let Err(e) =
                            controller.fail_experiment(&current, format!("analyzer error: {e}"))
                    {
                        tracing::warn!(experiment = %snapshot.id, error = %e, "failing after analyzer error");
                    }
                }
            }
        }));
    }
}

/// One deploy task per (host, variant), plus load-simulation starts when the
/// config asks for them: exactly `2 x |hosts|` deploys.
fn deploy_tasks(exp: &Experiment) -> Vec<NewTask> {
    let mut tasks = Vec::with_capacity(exp.config.target_hosts.len() * 2);
    for host in &exp.config.target_hosts {
        tasks.push(NewTask::for_experiment(
            exp.id.clone(),
            host.clone(),
            TaskAction::DeployPipeline {
                pipeline: exp.config.baseline_pipeline.clone(),
                variant: Some(Variant::Baseline),
                parameters: exp.config.baseline_params.clone(),
            },
        ));
        tasks.push(NewTask::for_experiment(
            exp.id.clone(),
            host.clone(),
            TaskAction::DeployPipeline {
                pipeline: exp.config.candidate_pipeline.clone(),
                variant: Some(Variant::Candidate),
                parameters: exp.config.candidate_params.clone(),
            },
        ));
        if let Some(profile) = &exp.config.load_profile {
            tasks.push(NewTask::for_experiment(
                exp.id.clone(),
                host.clone(),
                TaskAction::StartLoadSim {
                    profile: profile.clone(),
                },
            ));
        }
    }
    tasks
}

/// Stop tasks for whatever the experiment still has deployed, decided by the
/// phase it is leaving. Before `analyzing` both variants are experiment
/// deployments; from `analyzing` on, the candidate stop was already issued
/// and the baseline has been adopted as the host's steady state.
fn teardown_tasks(exp: &Experiment) -> Vec<NewTask> {
    if !exp.phase.variants_live() {
        return Vec::new();
    }
    let mut tasks = Vec::new();
    for host in &exp.config.target_hosts {
        for (pipeline, variant) in [
            (&exp.config.baseline_pipeline, Variant::Baseline),
            (&exp.config.candidate_pipeline, Variant::Candidate),
        ] {
            tasks.push(NewTask::for_experiment(
                exp.id.clone(),
                host.clone(),
                TaskAction::StopPipeline {
                    pipeline: pipeline.clone(),
                    variant: Some(variant),
                },
            ));
        }
        if exp.config.load_profile.is_some() {
            tasks.push(NewTask::for_experiment(
                exp.id.clone(),
                host.clone(),
                TaskAction::StopLoadSim,
            ));
        }
    }
    tasks
}

fn phase_event(exp: &Experiment, to: ExperimentPhase) -> (String, Event) {
    (
        experiment_topic(&exp.id),
        Event::phase_changed(&exp.id, exp.phase, to),
    )
}
