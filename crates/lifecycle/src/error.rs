// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the lifecycle crate.

use phoenix_model::{ErrorKind, ExperimentId, ExperimentPhase, HostId};
use thiserror::Error;

/// Errors that can occur while driving experiment and deployment lifecycles.
#[derive(Error, Debug)]
pub enum Error {
    /// Client-supplied entity failed validation.
    #[error("Invalid {entity}: {errors:?}")]
    Validation {
        /// What was being validated (e.g. "experiment config").
        entity: &'static str,
        /// Every violation found.
        errors: Vec<String>,
    },

    /// The experiment's host set intersects a non-terminal peer at creation
    /// time. Overridable with `force`; the start transition re-checks.
    #[error("Host set overlaps non-terminal experiment '{conflicting}' on {hosts:?}")]
    HostOverlap {
        /// The experiment already holding the hosts.
        conflicting: ExperimentId,
        /// The intersecting host identifiers.
        hosts: Vec<HostId>,
    },

    /// Analysis results were requested before the analyzer produced them.
    #[error("Experiment '{id}' has no analysis result in phase {phase}")]
    AnalysisNotReady {
        /// The experiment id.
        id: ExperimentId,
        /// The phase the experiment is in.
        phase: ExperimentPhase,
    },

    /// A deployment in a terminal status cannot be modified.
    #[error("Deployment '{id}' is {status:?} and cannot be modified")]
    DeploymentTerminal {
        /// The deployment id.
        id: String,
        /// The terminal status.
        status: phoenix_model::DeploymentStatus,
    },

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] phoenix_store::Error),

    /// The analyzer failed without producing a result.
    #[error(transparent)]
    Analyzer(#[from] phoenix_analyzer::Error),
}

impl Error {
    /// Classifies this error for HTTP mapping and retry decisions.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::HostOverlap { .. } => ErrorKind::Conflict,
            Error::AnalysisNotReady { .. } | Error::DeploymentTerminal { .. } => {
                ErrorKind::Precondition
            }
            Error::Store(e) => e.kind(),
            Error::Analyzer(e) => e.kind(),
        }
    }
}
