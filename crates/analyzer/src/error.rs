// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the analyzer crate.

use phoenix_model::{ErrorKind, ExperimentId};
use thiserror::Error;

/// Errors that can occur while analyzing an experiment.
///
/// Unavailable KPIs are not errors: they surface as an `inconclusive`
/// verdict with rationale. An error here means no result could be produced
/// at all.
#[derive(Error, Debug)]
pub enum Error {
    /// The experiment has no start timestamp, so there is no analysis window.
    #[error("Experiment '{id}' has not started; nothing to analyze")]
    NotStarted {
        /// The experiment id.
        id: ExperimentId,
    },

    /// Analysis was cancelled before completion.
    #[error("Analysis of experiment '{id}' was cancelled")]
    Cancelled {
        /// The experiment id.
        id: ExperimentId,
    },
}

impl Error {
    /// Classifies this error for HTTP mapping and retry decisions.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::NotStarted { .. } => ErrorKind::Precondition,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}
