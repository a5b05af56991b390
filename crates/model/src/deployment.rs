// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Standalone pipeline deployments.
//!
//! The control plane owns this lifecycle like an experiment variant, but with
//! no A/B semantics. Deployment tasks share the unified task queue with
//! experiment tasks.

use crate::{DeploymentId, HostId, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a standalone deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, deploy tasks not yet issued.
    Pending,
    /// Deploy tasks outstanding on at least one host.
    Deploying,
    /// All hosts confirmed the deployment.
    Active,
    /// At least one host abandoned its deploy task.
    Degraded,
    /// Rollback tasks issued and confirmed.
    RolledBack,
    /// Deleted by the operator.
    Deleted,
}

impl DeploymentStatus {
    /// Returns true when no further status change is expected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::RolledBack | DeploymentStatus::Deleted)
    }
}

/// Selects which hosts a deployment targets.
///
/// Exactly one selection mode is used: an explicit host list, or a label
/// match against registered hosts (all labels must match).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSelector {
    /// An explicit, non-empty host list.
    Hosts(Vec<HostId>),
    /// All registered hosts carrying every given label.
    Labels(BTreeMap<String, String>),
}

impl HostSelector {
    /// Validates the selector, returning every violation found.
    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            HostSelector::Hosts(hosts) => {
                if hosts.is_empty() {
                    errors.push("host_selector.hosts must not be empty".to_owned());
                }
                if hosts.iter().any(|h| h.is_empty()) {
                    errors.push("host_selector.hosts must not contain empty identifiers".to_owned());
                }
            }
            HostSelector::Labels(labels) => {
                if labels.is_empty() {
                    errors.push("host_selector.labels must not be empty".to_owned());
                }
            }
        }
        errors
    }
}

/// A pipeline rollout outside any experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    /// Server-assigned identifier.
    pub id: DeploymentId,
    /// Operator-supplied display name.
    pub name: String,
    /// The pipeline being deployed.
    pub pipeline: PipelineId,
    /// Target host selection.
    pub host_selector: HostSelector,
    /// Template parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Lifecycle status.
    pub status: DeploymentStatus,
    /// Hosts the selector resolved to when deploy tasks were issued.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_hosts: Vec<HostId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}
