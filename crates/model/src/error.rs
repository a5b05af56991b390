// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared error classification.
//!
//! Every subsystem error carries one of these kinds; the HTTP layer maps kinds
//! to status codes and the `error.code` field of error bodies. Only
//! `TransientBackend` is ever retried inside the control plane.

use serde::{Deserialize, Serialize};

/// Classification of control plane errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Client-supplied data fails a schema, range, or reference check.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// Phase/version/host-overlap clash with concurrent or existing state.
    Conflict,
    /// The operation is not legal in the entity's current state.
    Precondition,
    /// A temporary backend failure (store, metrics). Retryable.
    TransientBackend,
    /// A retry ceiling was hit.
    Exhausted,
    /// The operation was cancelled before completion.
    Cancelled,
    /// An internal invariant was violated. Callers see a generic failure.
    Internal,
}

impl ErrorKind {
    /// Returns the stable machine-readable code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Precondition => "precondition",
            ErrorKind::TransientBackend => "transient_backend",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Returns true when a local retry may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientBackend)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
