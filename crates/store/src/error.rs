// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the store crate.

use phoenix_model::{
    DeploymentId, ErrorKind, ExperimentId, ExperimentPhase, HostId, TaskId, TaskStatus,
};
use thiserror::Error;

/// Errors that can occur while reading or mutating stored entities.
#[derive(Error, Debug)]
pub enum Error {
    /// The referenced experiment does not exist.
    #[error("Experiment '{id}' not found")]
    ExperimentNotFound {
        /// The unknown experiment id.
        id: ExperimentId,
    },

    /// An entity with this id already exists.
    #[error("Entity '{id}' already exists")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// The referenced task does not exist.
    #[error("Task '{id}' not found")]
    TaskNotFound {
        /// The unknown task id.
        id: TaskId,
    },

    /// The referenced deployment does not exist.
    #[error("Deployment '{id}' not found")]
    DeploymentNotFound {
        /// The unknown deployment id.
        id: DeploymentId,
    },

    /// The experiment version did not match the expected value; a concurrent
    /// transition won. Retryable by re-reading the experiment.
    #[error("Experiment '{id}' version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// The experiment id.
        id: ExperimentId,
        /// The version the caller expected.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// The requested phase edge is not in the lifecycle graph.
    #[error("Experiment '{id}' cannot transition from {from} to {to}")]
    IllegalTransition {
        /// The experiment id.
        id: ExperimentId,
        /// The current phase.
        from: ExperimentPhase,
        /// The requested phase.
        to: ExperimentPhase,
    },

    /// The experiment's host set intersects another non-terminal experiment.
    #[error("Experiment '{id}' host set overlaps non-terminal experiment '{conflicting}' on {hosts:?}")]
    HostOverlap {
        /// The experiment attempting to start.
        id: ExperimentId,
        /// The non-terminal experiment already holding the hosts.
        conflicting: ExperimentId,
        /// The intersecting host identifiers.
        hosts: Vec<HostId>,
    },

    /// A status report arrived from a host the task is not assigned to.
    #[error("Task '{task}' is bound to host '{expected}', report came from '{caller}'")]
    TaskHostMismatch {
        /// The task id.
        task: TaskId,
        /// The host the task is assigned to.
        expected: HostId,
        /// The host that sent the report.
        caller: HostId,
    },

    /// A status report arrived for a task already in a terminal status.
    #[error("Task '{task}' is terminal ({status:?}) and cannot change")]
    TaskTerminal {
        /// The task id.
        task: TaskId,
        /// The terminal status.
        status: TaskStatus,
    },

    /// The reported status is not one an agent may set.
    #[error("Task '{task}': agents cannot report status {status:?}")]
    InvalidStatusReport {
        /// The task id.
        task: TaskId,
        /// The rejected status.
        status: TaskStatus,
    },

    /// A pagination cursor could not be decoded.
    #[error("Invalid pagination cursor: {details}")]
    InvalidCursor {
        /// Why the cursor was rejected.
        details: String,
    },
}

impl Error {
    /// Classifies this error for HTTP mapping and retry decisions.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::ExperimentNotFound { .. }
            | Error::TaskNotFound { .. }
            | Error::DeploymentNotFound { .. } => ErrorKind::NotFound,
            Error::DuplicateId { .. }
            | Error::VersionConflict { .. }
            | Error::HostOverlap { .. } => ErrorKind::Conflict,
            Error::IllegalTransition { .. } | Error::TaskTerminal { .. } => ErrorKind::Precondition,
            Error::TaskHostMismatch { .. }
            | Error::InvalidStatusReport { .. }
            | Error::InvalidCursor { .. } => ErrorKind::Validation,
        }
    }
}
