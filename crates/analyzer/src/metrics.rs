// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The metrics adapter seams.
//!
//! [`MetricsQuery`] is the read side against the external TSDB; expressions
//! are opaque strings the analyzer's catalogue produces. [`MetricsIngest`] is
//! the write side the agent surface forwards samples to; the control plane
//! never stores samples itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Failure of a metrics backend call. Always classified transient; the
/// analyzer's backoff schedule decides when to give up.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// The backend rejected or failed the call.
    #[error("Metrics backend error: {details}")]
    Backend {
        /// Human-readable details of the failure.
        details: String,
    },
}

/// One labelled value from an instant query.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Series labels.
    pub labels: BTreeMap<String, String>,
    /// The value.
    pub value: f64,
}

/// Result of an instant query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// A single scalar.
    Scalar(f64),
    /// A labelled vector.
    Vector(Vec<Sample>),
}

impl QueryValue {
    /// Collapses the result to one number: the scalar itself, or the value of
    /// a single-sample vector. `None` for empty or multi-sample vectors.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            QueryValue::Scalar(v) => Some(*v),
            QueryValue::Vector(samples) if samples.len() == 1 => Some(samples[0].value),
            QueryValue::Vector(_) => None,
        }
    }

    /// The number of samples carried.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            QueryValue::Scalar(_) => 1,
            QueryValue::Vector(samples) => samples.len(),
        }
    }

    /// True when the result carries no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One series of a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Series labels.
    pub labels: BTreeMap<String, String>,
    /// Timestamped values, ascending.
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// Result of a range query.
pub type Matrix = Vec<Series>;

/// Read-only interface to the external metrics time-series backend.
#[async_trait]
pub trait MetricsQuery: Send + Sync {
    /// Evaluates `expr` at one instant.
    async fn query_instant(&self, expr: &str, at: DateTime<Utc>)
    -> Result<QueryValue, QueryError>;

    /// Evaluates `expr` over `[start, end]` at `step` resolution.
    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Matrix, QueryError>;
}

/// One metric sample pushed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,
    /// The value.
    pub value: f64,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Series labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Write-side adapter forwarding agent samples to the external ingest path.
#[async_trait]
pub trait MetricsIngest: Send + Sync {
    /// Forwards a batch of samples.
    async fn ingest(&self, samples: Vec<MetricSample>) -> Result<(), QueryError>;
}

/// Ingest adapter that drops samples, for deployments where agents write to
/// the TSDB directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardIngest;

#[async_trait]
impl MetricsIngest for DiscardIngest {
    async fn ingest(&self, samples: Vec<MetricSample>) -> Result<(), QueryError> {
        tracing::debug!(count = samples.len(), "discarding forwarded samples");
        Ok(())
    }
}
