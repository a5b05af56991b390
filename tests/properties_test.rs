// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Property-style checks over the experiment lifecycle.
//!
//! Rather than sampling random traces, these tests enumerate every sequence
//! of operator and agent actions up to a fixed depth against a fresh control
//! plane, and assert the invariants on each step:
//!
//! - every observed phase history is a path in the lifecycle graph;
//! - terminal tasks never change status or attempts again;
//! - every task delivered by a poll is `assigned` with a live lease;
//! - the set of initialization deploys is exactly hosts x variants.

use phoenix_analyzer::{Analyzer, Matrix, MetricsQuery, QueryError, QueryValue};
use phoenix_config::{ControlPlaneSettings, TaskQueueSettings};
use phoenix_events::EventBus;
use phoenix_lifecycle::{Controller, CreateExperiment};
use phoenix_model::{
    Experiment, ExperimentConfig, ExperimentPhase, SuccessCriteria, TaskStatus, Variant,
};
use phoenix_store::Store;
use phoenix_tasks::TaskQueue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct EmptyBackend;

#[async_trait::async_trait]
impl MetricsQuery for EmptyBackend {
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
        _step: Duration,
    ) -> Result<Matrix, QueryError> {
        Ok(Vec::new())
    }
}

/// One action an operator or agent can take against the plane.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Start,
    Stop,
    /// Claim one task for h1 and report it completed.
    CompleteNext,
    /// Claim one task for h1 and report it failed.
    FailNext,
    /// A scheduler pass.
    Tick,
    /// A lease-expiry sweep at a far-future instant (expires everything).
    ExpireAll,
}

const ALPHABET: [Action; 6] = [
    Action::Start,
    Action::Stop,
    Action::CompleteNext,
    Action::FailNext,
    Action::Tick,
    Action::ExpireAll,
];

struct Plane {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    controller: Arc<Controller>,
}

fn plane() -> Plane {
    let settings = ControlPlaneSettings::default();
    let store = Arc::new(Store::new(EventBus::new(64)));
    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        TaskQueueSettings::default(),
    ));
    let analyzer = Arc::new(Analyzer::new(Arc::new(EmptyBackend), settings.analyzer));
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        analyzer,
        settings.scheduler,
        CancellationToken::new(),
    );
    Plane {
        store,
        queue,
        controller,
    }
}

fn experiment_params(hosts: &[&str]) -> CreateExperiment {
    CreateExperiment {
        name: "property".to_owned(),
        description: String::new(),
        owner: "op".to_owned(),
        config: ExperimentConfig {
            target_hosts: hosts.iter().map(|h| (*h).to_owned()).collect(),
            baseline_pipeline: "p-base".to_owned(),
            candidate_pipeline: "p-cand".to_owned(),
            baseline_params: BTreeMap::new(),
            candidate_params: BTreeMap::new(),
            duration: Duration::from_secs(3600),
            warmup: Duration::from_secs(600),
            success_criteria: SuccessCriteria {
                min_cardinality_reduction: 40.0,
                max_cpu_overhead: 10.0,
                max_memory_overhead: 10.0,
                min_critical_coverage: 95.0,
            },
            load_profile: None,
        },
        force: false,
    }
}

/// Enumerates every action sequence of the given depth.
fn sequences(depth: usize) -> Vec<Vec<Action>> {
    let mut all: Vec<Vec<Action>> = vec![Vec::new()];
    for _ in 0..depth {
        all = all
            .into_iter()
            .flat_map(|seq| {
                ALPHABET.iter().map(move |a| {
                    let mut next = seq.clone();
                    next.push(*a);
                    next
                })
            })
            .collect();
    }
    all
}

/// Snapshot of a task used for the terminal-immutability check.
#[derive(Debug, Clone, PartialEq)]
struct TaskSnapshot {
    status: TaskStatus,
    attempts: u32,
}

struct TraceChecker {
    phases: Vec<ExperimentPhase>,
    terminal_tasks: HashMap<String, TaskSnapshot>,
}

impl TraceChecker {
    fn new(initial: ExperimentPhase) -> Self {
        Self {
            phases: vec![initial],
            terminal_tasks: HashMap::new(),
        }
    }

    fn observe(&mut self, plane: &Plane, exp: &Experiment, seq: &[Action]) {
        // Phase histories only move along permitted edges.
        let last = *self.phases.last().expect("non-empty history");
        let current = plane.controller.get(&exp.id).expect("get").phase;
        if current != last {
            assert!(
                last.permits(current),
                "forbidden edge {last} -> {current} observed under {seq:?}"
            );
            self.phases.push(current);
        }

        // Terminal tasks are frozen.
        for task in plane.store.tasks_for_experiment(&exp.id) {
            let snapshot = TaskSnapshot {
                status: task.status,
                attempts: task.attempts,
            };
            if let Some(frozen) = self.terminal_tasks.get(&task.id) {
                assert_eq!(
                    frozen, &snapshot,
                    "terminal task {} changed under {seq:?}",
                    task.id
                );
            } else if task.status.is_terminal() {
                let _ = self.terminal_tasks.insert(task.id.clone(), snapshot);
            }
        }
    }
}

fn apply(plane: &Plane, exp: &Experiment, action: Action) {
    match action {
        Action::Start => {
            let _ = plane.controller.start(&exp.id);
        }
        Action::Stop => {
            let _ = plane.controller.stop(&exp.id, "op");
        }
        Action::CompleteNext | Action::FailNext => {
            let claimed = plane.queue.claim_for_host(&"h1".to_owned(), 1);
            for task in &claimed {
                // Delivered tasks are live assignments with a future lease.
                assert_eq!(task.status, TaskStatus::Assigned);
                assert!(task.assigned_at.is_some());
                assert!(
                    task.lease_deadline.is_some_and(|d| d > chrono::Utc::now()),
                    "delivered task must hold a live lease"
                );
            }
            if let Some(task) = claimed.first() {
                let status = if action == Action::CompleteNext {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                if let Ok(transition) = plane.queue.update_status(
                    &task.id,
                    &"h1".to_owned(),
                    status,
                    Some("injected".to_owned()),
                ) {
                    plane.controller.on_task_transition(&transition);
                }
            }
        }
        Action::Tick => plane.controller.tick(),
        Action::ExpireAll => {
            let _ = plane
                .queue
                .expire_leases(chrono::Utc::now() + chrono::Duration::days(1));
        }
    }
}

/// Exhaustive four-step exploration of the action alphabet on a single-host
/// experiment. Every interleaving of operator actions, agent reports, lease
/// expiry, and scheduler passes must keep the invariants.
#[tokio::test]
async fn every_action_sequence_preserves_invariants() {
    for seq in sequences(4) {
        let p = plane();
        let exp = p
            .controller
            .create(experiment_params(&["h1"]))
            .expect("create");
        let mut checker = TraceChecker::new(ExperimentPhase::Pending);
        for action in &seq {
            apply(&p, &exp, *action);
            checker.observe(&p, &exp, &seq);
        }
    }
}

/// The deploy fan-out at start is exactly hosts x variants, for several host
/// set sizes.
#[tokio::test]
async fn initialization_fanout_is_hosts_times_variants() {
    for hosts in [vec!["h1"], vec!["h1", "h2"], vec!["h1", "h2", "h3", "h4"]] {
        let p = plane();
        let exp = p.controller.create(experiment_params(&hosts)).expect("create");
        let _ = p.controller.start(&exp.id).expect("start");

        let tasks = p.store.tasks_for_experiment(&exp.id);
        assert_eq!(tasks.len(), hosts.len() * 2);
        for host in &hosts {
            for variant in [Variant::Baseline, Variant::Candidate] {
                assert_eq!(
                    tasks
                        .iter()
                        .filter(|t| t.host == *host && t.action.variant() == Some(variant))
                        .count(),
                    1,
                    "exactly one deploy for ({host}, {variant})"
                );
            }
        }
    }
}

/// Attempt counters never exceed the retry ceiling, across an adversarial
/// claim/fail/expire loop.
#[tokio::test]
async fn attempts_never_exceed_the_ceiling() {
    let p = plane();
    let exp = p
        .controller
        .create(experiment_params(&["h1"]))
        .expect("create");
    let _ = p.controller.start(&exp.id).expect("start");
    let ceiling = p.queue.retry_ceiling();

    for round in 0..10 {
        let claimed = p.queue.claim_for_host(&"h1".to_owned(), 8);
        for task in claimed {
            let _ = p.queue.update_status(
                &task.id,
                &"h1".to_owned(),
                TaskStatus::Failed,
                Some(format!("round {round}")),
            );
        }
        let _ = p
            .queue
            .expire_leases(chrono::Utc::now() + chrono::Duration::days(1));
        for task in p.store.tasks_for_experiment(&exp.id) {
            assert!(
                task.attempts <= ceiling,
                "task {} exceeded the ceiling: {} > {ceiling}",
                task.id,
                task.attempts
            );
        }
    }

    // Nothing claimable remains once everything is abandoned.
    assert!(
        p.store
            .tasks_for_experiment(&exp.id)
            .iter()
            .filter(|t| t.action.variant().is_some())
            .all(|t| t.status == TaskStatus::Abandoned),
        "all deploys must end abandoned under persistent failure"
    );
    assert!(p.queue.claim_for_host(&"h1".to_owned(), 8).is_empty());
}
