// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Experiments and their lifecycle phases.
//!
//! An experiment owns an immutable configuration, a phase advanced only
//! through the edges of [`ExperimentPhase::permits`], and a monotonically
//! increasing version counter used for optimistic concurrency on every
//! transition.

use crate::result::ExperimentResult;
use crate::{ExperimentId, HostId, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Lifecycle phase of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    /// Created, not yet started.
    Pending,
    /// Deploy tasks issued, waiting for per-host confirmation.
    Initializing,
    /// Both variants live, metrics not yet counted.
    WarmingUp,
    /// Both variants live, metrics counted.
    Running,
    /// Candidate being stopped while the analyzer runs over collected data.
    Analyzing,
    /// Analyzer produced a verdict.
    Completed,
    /// Unrecoverable failure.
    Failed,
    /// Operator-stopped.
    Cancelled,
    /// Winning variant being deployed on the promotion scope.
    Promoting,
    /// Terminal, promotion acknowledged fleet-wide.
    Promoted,
}

impl ExperimentPhase {
    /// Returns true when no further transition is permitted out of this phase.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentPhase::Failed | ExperimentPhase::Cancelled | ExperimentPhase::Promoted
        )
    }

    /// Returns true for the phases during which both variants are expected to
    /// be deployed on every target host.
    #[must_use]
    pub const fn variants_live(self) -> bool {
        matches!(
            self,
            ExperimentPhase::Initializing | ExperimentPhase::WarmingUp | ExperimentPhase::Running
        )
    }

    /// Returns true when the edge `self -> next` is in the transition graph.
    ///
    /// Edges not listed here are forbidden; attempted transitions over them
    /// must fail without mutating the experiment.
    #[must_use]
    pub const fn permits(self, next: ExperimentPhase) -> bool {
        use ExperimentPhase as P;
        matches!(
            (self, next),
            (P::Pending, P::Initializing)
                | (P::Pending, P::Cancelled)
                | (P::Initializing, P::WarmingUp)
                | (P::Initializing, P::Failed)
                | (P::Initializing, P::Cancelled)
                | (P::WarmingUp, P::Running)
                | (P::WarmingUp, P::Cancelled)
                | (P::Running, P::Analyzing)
                | (P::Running, P::Cancelled)
                | (P::Analyzing, P::Completed)
                | (P::Analyzing, P::Failed)
                | (P::Completed, P::Promoting)
                | (P::Promoting, P::Promoted)
                | (P::Promoting, P::Failed)
        )
    }

    /// Returns the wire name of this phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ExperimentPhase::Pending => "pending",
            ExperimentPhase::Initializing => "initializing",
            ExperimentPhase::WarmingUp => "warming_up",
            ExperimentPhase::Running => "running",
            ExperimentPhase::Analyzing => "analyzing",
            ExperimentPhase::Completed => "completed",
            ExperimentPhase::Failed => "failed",
            ExperimentPhase::Cancelled => "cancelled",
            ExperimentPhase::Promoting => "promoting",
            ExperimentPhase::Promoted => "promoted",
        }
    }
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds a candidate must meet for a `pass` verdict.
///
/// All values are percentages. Overheads are ceilings, the other two are
/// floors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuccessCriteria {
    /// Minimum cardinality reduction achieved by the candidate.
    pub min_cardinality_reduction: f64,
    /// Maximum CPU overhead of the candidate over the baseline.
    pub max_cpu_overhead: f64,
    /// Maximum resident-memory overhead of the candidate over the baseline.
    pub max_memory_overhead: f64,
    /// Minimum fraction of critical processes whose series survive.
    pub min_critical_coverage: f64,
}

/// Immutable configuration of an experiment.
///
/// Changing any of this after creation requires creating a new experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Hosts the experiment runs on. Non-empty.
    pub target_hosts: BTreeSet<HostId>,
    /// Pipeline deployed as the baseline variant.
    pub baseline_pipeline: PipelineId,
    /// Pipeline deployed as the candidate variant.
    pub candidate_pipeline: PipelineId,
    /// Template parameters for the baseline pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baseline_params: BTreeMap<String, String>,
    /// Template parameters for the candidate pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub candidate_params: BTreeMap<String, String>,
    /// Total experiment duration, measured from the start of `warming_up`.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Leading slice of `duration` during which metrics are not counted.
    #[serde(with = "humantime_serde", default)]
    pub warmup: Duration,
    /// Verdict thresholds.
    pub success_criteria: SuccessCriteria,
    /// Optional load-simulation profile started alongside the variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_profile: Option<String>,
}

impl ExperimentConfig {
    /// Validates the configuration, returning every violation found.
    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.target_hosts.is_empty() {
            errors.push("target_hosts must not be empty".to_owned());
        }
        if self.target_hosts.iter().any(|h| h.is_empty()) {
            errors.push("target_hosts must not contain empty identifiers".to_owned());
        }
        if self.baseline_pipeline.is_empty() {
            errors.push("baseline_pipeline must not be empty".to_owned());
        }
        if self.candidate_pipeline.is_empty() {
            errors.push("candidate_pipeline must not be empty".to_owned());
        }
        if self.duration.is_zero() {
            errors.push("duration must be positive".to_owned());
        }
        if self.warmup >= self.duration && !self.duration.is_zero() {
            errors.push(format!(
                "warmup ({}) must be shorter than duration ({})",
                humantime::format_duration(self.warmup),
                humantime::format_duration(self.duration),
            ));
        }
        let c = &self.success_criteria;
        for (name, value) in [
            ("min_cardinality_reduction", c.min_cardinality_reduction),
            ("min_critical_coverage", c.min_critical_coverage),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("success_criteria.{name} must be within [0, 100]"));
            }
        }
        for (name, value) in [
            ("max_cpu_overhead", c.max_cpu_overhead),
            ("max_memory_overhead", c.max_memory_overhead),
        ] {
            if !value.is_finite() {
                errors.push(format!("success_criteria.{name} must be finite"));
            }
        }
        errors
    }
}

/// A controlled A/B comparison of two pipeline variants on a fixed host set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Server-assigned identifier.
    pub id: ExperimentId,
    /// Operator-supplied display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Opaque identifier of the owning operator.
    pub owner: String,
    /// Immutable configuration.
    pub config: ExperimentConfig,
    /// Current lifecycle phase.
    pub phase: ExperimentPhase,
    /// Monotonically increasing counter bumped by every transition.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Time the experiment entered `initializing`, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the experiment reached a terminal phase or `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Analysis outcome. Present only in `completed` and in `failed` when the
    /// analyzer ran at least once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ExperimentResult>,
    /// Why the experiment failed, when it failed before analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the experiment was cancelled, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Who cancelled the experiment, if it was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

impl Experiment {
    /// End of the warmup window: `started + warmup`. None before start.
    #[must_use]
    pub fn warmup_deadline(&self) -> Option<DateTime<Utc>> {
        let base = self.started_at?;
        Some(base + chrono::Duration::from_std(self.config.warmup).unwrap_or_default())
    }

    /// End of the measurement window: `started + duration`. None before start.
    #[must_use]
    pub fn duration_deadline(&self) -> Option<DateTime<Utc>> {
        let base = self.started_at?;
        Some(base + chrono::Duration::from_std(self.config.duration).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn criteria() -> SuccessCriteria {
        SuccessCriteria {
            min_cardinality_reduction: 40.0,
            max_cpu_overhead: 10.0,
            max_memory_overhead: 10.0,
            min_critical_coverage: 95.0,
        }
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            target_hosts: ["h1".to_owned(), "h2".to_owned()].into_iter().collect(),
            baseline_pipeline: "p-base".to_owned(),
            candidate_pipeline: "p-cand".to_owned(),
            baseline_params: BTreeMap::new(),
            candidate_params: BTreeMap::new(),
            duration: Duration::from_secs(120),
            warmup: Duration::from_secs(30),
            success_criteria: criteria(),
            load_profile: None,
        }
    }

    #[test]
    fn permitted_edges_match_lifecycle_graph() {
        use ExperimentPhase as P;
        let all = [
            P::Pending,
            P::Initializing,
            P::WarmingUp,
            P::Running,
            P::Analyzing,
            P::Completed,
            P::Failed,
            P::Cancelled,
            P::Promoting,
            P::Promoted,
        ];
        let edges = [
            (P::Pending, P::Initializing),
            (P::Pending, P::Cancelled),
            (P::Initializing, P::WarmingUp),
            (P::Initializing, P::Failed),
            (P::Initializing, P::Cancelled),
            (P::WarmingUp, P::Running),
            (P::WarmingUp, P::Cancelled),
            (P::Running, P::Analyzing),
            (P::Running, P::Cancelled),
            (P::Analyzing, P::Completed),
            (P::Analyzing, P::Failed),
            (P::Completed, P::Promoting),
            (P::Promoting, P::Promoted),
            (P::Promoting, P::Failed),
        ];
        for from in all {
            for to in all {
                let expected = edges.contains(&(from, to));
                assert_eq!(
                    from.permits(to),
                    expected,
                    "edge {from} -> {to} permission mismatch"
                );
            }
        }
    }

    #[test]
    fn terminal_phases_permit_nothing() {
        use ExperimentPhase as P;
        for phase in [P::Failed, P::Cancelled, P::Promoted] {
            assert!(phase.is_terminal());
            for next in [P::Pending, P::Running, P::Completed, P::Failed, P::Cancelled] {
                assert!(!phase.permits(next));
            }
        }
    }

    #[test]
    fn valid_config_has_no_errors() {
        assert!(config().validation_errors().is_empty());
    }

    #[test]
    fn config_validation_collects_all_violations() {
        let mut cfg = config();
        cfg.target_hosts.clear();
        cfg.warmup = Duration::from_secs(300);
        cfg.success_criteria.min_critical_coverage = 150.0;
        let errors = cfg.validation_errors();
        assert_eq!(errors.len(), 3, "unexpected errors: {errors:?}");
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&ExperimentPhase::WarmingUp).expect("serialize");
        assert_eq!(json, "\"warming_up\"");
    }
}
