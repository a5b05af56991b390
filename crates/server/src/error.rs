// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Server errors and the HTTP mapping of the error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use phoenix_model::ErrorKind;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while running the HTTP server itself.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured bind address is invalid and could not be parsed.
    #[error("Invalid bind address '{bind_address}': {details}")]
    InvalidBindAddress {
        /// The bind address that failed to parse.
        bind_address: String,
        /// Human-readable details of the parsing failure.
        details: String,
    },

    /// Failed to bind the TCP listener on the given address.
    #[error("Failed to bind API server on '{addr}': {details}")]
    BindFailed {
        /// The address we attempted to bind to.
        addr: String,
        /// Human-readable details of the bind failure.
        details: String,
    },

    /// The HTTP server encountered a fatal error while serving.
    #[error("API server error on '{addr}': {details}")]
    ServerError {
        /// The address the server was bound to.
        addr: String,
        /// Human-readable details of the server failure.
        details: String,
    },
}

/// A request failure mapped onto the error taxonomy.
///
/// Responds with the stable status-code mapping and a machine-readable
/// `error.code` body.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A `validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// The taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    const fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Precondition => StatusCode::CONFLICT,
            ErrorKind::TransientBackend | ErrorKind::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Serialize)]
struct ErrorDetails {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.kind {
            // Internal faults stay internal.
            ErrorKind::Internal => "internal error".to_owned(),
            _ => self.message,
        };
        (
            status,
            Json(ErrorBody {
                error: ErrorDetails {
                    code: self.kind.code(),
                    message,
                },
            }),
        )
            .into_response()
    }
}

impl From<phoenix_lifecycle::Error> for ApiError {
    fn from(e: phoenix_lifecycle::Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<phoenix_store::Error> for ApiError {
    fn from(e: phoenix_store::Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<phoenix_analyzer::QueryError> for ApiError {
    fn from(e: phoenix_analyzer::QueryError) -> Self {
        Self::new(ErrorKind::TransientBackend, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_stable_status_codes() {
        let cases = [
            (ErrorKind::Validation, StatusCode::BAD_REQUEST),
            (ErrorKind::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::Conflict, StatusCode::CONFLICT),
            (ErrorKind::Precondition, StatusCode::CONFLICT),
            (ErrorKind::TransientBackend, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::Exhausted, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::Cancelled, StatusCode::REQUEST_TIMEOUT),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            assert_eq!(ApiError::new(kind, "x").status(), status, "{kind}");
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let response = ApiError::new(ErrorKind::Internal, "lock poisoned at store.rs:42")
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
