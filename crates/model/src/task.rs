// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Tasks: single directives issued to exactly one host.
//!
//! The dispatcher is payload-agnostic and forwards actions to agents as JSON;
//! the state machine is the only in-core producer and only ever enqueues kinds
//! it knows. Delivery is at-least-once under the lease + retry discipline, so
//! agents must treat every action as idempotent.

use crate::{DeploymentId, ExperimentId, HostId, PipelineId, TaskId, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by its target host.
    Pending,
    /// Claimed by the host, lease active, execution not yet reported.
    Assigned,
    /// The agent reported execution in progress.
    Running,
    /// The agent reported success.
    Completed,
    /// Terminally failed without exhausting the retry ceiling (superseded by
    /// experiment teardown, or rejected as unexecutable).
    Failed,
    /// The retry ceiling was exhausted.
    Abandoned,
}

impl TaskStatus {
    /// Returns true when the status can never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Abandoned
        )
    }

    /// Returns true while the task counts against a host's outstanding work.
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        !self.is_terminal()
    }
}

/// The action a task instructs its host to perform.
///
/// Serialized with an explicit `kind` tag so agents can dispatch on it without
/// understanding every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    /// Deploy a pipeline configuration.
    DeployPipeline {
        /// Pipeline to deploy.
        pipeline: PipelineId,
        /// Variant role within an experiment, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<Variant>,
        /// Template parameters.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, String>,
    },
    /// Stop a deployed pipeline.
    StopPipeline {
        /// Pipeline to stop.
        pipeline: PipelineId,
        /// Variant role within an experiment, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<Variant>,
    },
    /// Roll a host back to its pre-deployment pipeline state.
    RollbackPipeline {
        /// Pipeline to roll back.
        pipeline: PipelineId,
    },
    /// Start a synthetic load profile.
    StartLoadSim {
        /// Name of the load profile to run.
        profile: String,
    },
    /// Stop the running load profile.
    StopLoadSim,
    /// Capture a point-in-time diagnostic snapshot.
    CollectSnapshot,
}

impl TaskAction {
    /// Returns the wire name of this action kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            TaskAction::DeployPipeline { .. } => "deploy_pipeline",
            TaskAction::StopPipeline { .. } => "stop_pipeline",
            TaskAction::RollbackPipeline { .. } => "rollback_pipeline",
            TaskAction::StartLoadSim { .. } => "start_load_sim",
            TaskAction::StopLoadSim => "stop_load_sim",
            TaskAction::CollectSnapshot => "collect_snapshot",
        }
    }

    /// Returns the experiment variant this action targets, if any.
    #[must_use]
    pub const fn variant(&self) -> Option<Variant> {
        match self {
            TaskAction::DeployPipeline { variant, .. }
            | TaskAction::StopPipeline { variant, .. } => *variant,
            _ => None,
        }
    }
}

/// A single directive issued to exactly one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Server-assigned identifier.
    pub id: TaskId,
    /// Owning experiment, when issued on its behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentId>,
    /// Owning standalone deployment, when issued on its behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentId>,
    /// Target host.
    pub host: HostId,
    /// The action to perform.
    pub action: TaskAction,
    /// Execution status.
    pub status: TaskStatus,
    /// Number of times the task has been issued to its host.
    pub attempts: u32,
    /// Error reported by the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Claim priority; higher first.
    pub priority: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// While in the future and status is assigned/running, the task is owned
    /// by the claiming host and not re-dispatchable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns true when the lease has lapsed at `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::Running)
            && self.lease_deadline.is_some_and(|d| d <= now)
    }

    /// Returns true when the task may be handed to a polling host at `now`.
    #[must_use]
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.lease_deadline.is_none_or(|d| d <= now)
    }
}

/// Specification of a task to enqueue.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Owning experiment, if any.
    pub experiment: Option<ExperimentId>,
    /// Owning standalone deployment, if any.
    pub deployment: Option<DeploymentId>,
    /// Target host.
    pub host: HostId,
    /// The action to perform.
    pub action: TaskAction,
    /// Claim priority; higher first.
    pub priority: i32,
}

impl NewTask {
    /// A task owned by an experiment, at default priority.
    #[must_use]
    pub fn for_experiment(experiment: ExperimentId, host: HostId, action: TaskAction) -> Self {
        Self {
            experiment: Some(experiment),
            deployment: None,
            host,
            action,
            priority: 0,
        }
    }

    /// A task owned by a standalone deployment, at default priority.
    #[must_use]
    pub fn for_deployment(deployment: DeploymentId, host: HostId, action: TaskAction) -> Self {
        Self {
            experiment: None,
            deployment: Some(deployment),
            host,
            action,
            priority: 0,
        }
    }

    /// Overrides the claim priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_tags_match_wire_names() {
        let action = TaskAction::DeployPipeline {
            pipeline: "p-cand".to_owned(),
            variant: Some(Variant::Candidate),
            parameters: BTreeMap::new(),
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["kind"], "deploy_pipeline");
        assert_eq!(json["variant"], "candidate");
        assert_eq!(action.kind(), "deploy_pipeline");
    }

    #[test]
    fn terminal_statuses_are_closed() {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Abandoned] {
            assert!(status.is_terminal());
            assert!(!status.is_outstanding());
        }
        for status in [TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Running] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn claimable_respects_parked_lease() {
        let now = Utc::now();
        let task = Task {
            id: "t1".to_owned(),
            experiment: None,
            deployment: None,
            host: "h1".to_owned(),
            action: TaskAction::CollectSnapshot,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            priority: 0,
            created_at: now,
            assigned_at: None,
            completed_at: None,
            lease_deadline: Some(now + chrono::Duration::seconds(60)),
        };
        assert!(!task.claimable(now));
        assert!(task.claimable(now + chrono::Duration::seconds(61)));
    }
}
