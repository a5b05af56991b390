// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Phoenix control plane domain model.
//!
//! Data Model:
//! - experiments
//!   - per-host tasks (one per host/variant pair while initializing)
//!   - analysis result (written once, atomically with the terminal phase)
//! - standalone pipeline deployments (share the task model, no A/B semantics)
//! - hosts (self-registered through agent heartbeats)
//!
//! An experiment compares a baseline telemetry pipeline against a candidate on
//! the same host set. All identifiers exchanged with collaborators (hosts,
//! pipelines) are opaque strings; server-assigned identifiers are UUIDs.

use serde::{Deserialize, Serialize};

pub mod deployment;
pub mod error;
pub mod experiment;
pub mod host;
pub mod result;
pub mod task;

pub use deployment::{DeploymentStatus, HostSelector, PipelineDeployment};
pub use error::ErrorKind;
pub use experiment::{Experiment, ExperimentConfig, ExperimentPhase, SuccessCriteria};
pub use host::{Host, HostHealth, ResourceUsage};
pub use result::{
    CriterionOutcome, CriterionStatus, ExperimentResult, KpiDeltas, KpiSnapshot, Verdict,
};
pub use task::{NewTask, Task, TaskAction, TaskStatus};

/// The id of an experiment. Server-assigned, globally unique.
pub type ExperimentId = String;

/// The id of a task. Server-assigned.
pub type TaskId = String;

/// The id of a host. Opaque, client-supplied.
pub type HostId = String;

/// The id of a pipeline configuration. Opaque to the control plane.
pub type PipelineId = String;

/// The id of a standalone pipeline deployment. Server-assigned.
pub type DeploymentId = String;

/// The two pipeline variants compared within one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// The current production behaviour.
    Baseline,
    /// The proposed optimization under test.
    Candidate,
}

impl Variant {
    /// Returns the wire name of this variant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates a fresh server-assigned identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
