// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Analysis results: per-variant KPI snapshots, derived deltas, and the
//! verdict with its per-criterion rationale.
//!
//! A result is written exactly once, atomically with the phase transition that
//! publishes it, and is immutable afterwards. Repeat reads return the stored
//! value unchanged.

use serde::{Deserialize, Serialize};

/// Outcome of the analyzer for one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every success criterion was met.
    Pass,
    /// At least one criterion was violated.
    Fail,
    /// At least one KPI could not be computed.
    Inconclusive,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Inconclusive => "inconclusive",
        };
        f.write_str(s)
    }
}

/// How a single criterion fared against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    /// Observed value satisfies the threshold.
    Pass,
    /// Observed value violates the threshold.
    Fail,
    /// The KPI could not be computed.
    Unavailable,
}

/// One line of the verdict rationale: criterion, observed value, threshold,
/// and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionOutcome {
    /// Name of the criterion (e.g. `cardinality_reduction`).
    pub criterion: String,
    /// Observed KPI value, percent. Absent when the KPI was unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    /// Configured threshold, percent.
    pub threshold: f64,
    /// Whether the criterion passed.
    pub outcome: CriterionStatus,
    /// Extra detail, e.g. why a KPI was unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregated measurements for one variant over the analysis window.
///
/// Fields are absent when the underlying query failed beyond retry or
/// returned no samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KpiSnapshot {
    /// Total distinct series produced by the variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<f64>,
    /// CPU-time consumed by the collecting process, normalized per host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Resident-memory peak, 99th percentile across hosts, bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    /// Fraction of critical processes with at least one series observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_fraction: Option<f64>,
}

/// Derived comparison KPIs, percent. Absent entries could not be computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KpiDeltas {
    /// `(B.cardinality - C.cardinality) / B.cardinality x 100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality_reduction: Option<f64>,
    /// `(C.cpu - B.cpu) / B.cpu x 100`. Negative when the candidate is cheaper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_overhead: Option<f64>,
    /// `(C.memory - B.memory) / B.memory x 100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_overhead: Option<f64>,
    /// `C.critical_fraction x 100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_coverage: Option<f64>,
}

/// The analyzer's full output for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Baseline KPI snapshot.
    pub baseline: KpiSnapshot,
    /// Candidate KPI snapshot.
    pub candidate: KpiSnapshot,
    /// Derived deltas.
    pub kpis: KpiDeltas,
    /// Final verdict.
    pub verdict: Verdict,
    /// Per-criterion rationale, in a stable order.
    pub verdict_rationale: Vec<CriterionOutcome>,
    /// Start of the analysis window.
    pub window_start: chrono::DateTime<chrono::Utc>,
    /// End of the analysis window.
    pub window_end: chrono::DateTime<chrono::Utc>,
}
