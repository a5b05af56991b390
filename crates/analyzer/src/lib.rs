// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The KPI/cost analyzer.
//!
//! Pulls per-variant measurements from the metrics backend over the
//! experiment's running window `[started + warmup, started + duration]`,
//! derives the four comparison KPIs, and emits a verdict with per-criterion
//! rationale. Metrics queries retry with exponential backoff; a query that
//! fails beyond retry marks its KPI unavailable and the verdict becomes
//! `inconclusive` rather than an error.
//!
//! `analyze` is a pure read: it never writes the result. The state machine
//! commits the result atomically with the `analyzing -> completed` phase
//! write, which is what makes repeat reads bitwise-identical.

use chrono::{DateTime, Utc};
use phoenix_config::AnalyzerSettings;
use phoenix_model::{
    CriterionOutcome, CriterionStatus, Experiment, ExperimentResult, KpiDeltas, KpiSnapshot,
    Variant, Verdict,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod catalogue;
pub mod error;
pub mod metrics;

pub use error::Error;
pub use metrics::{
    DiscardIngest, Matrix, MetricSample, MetricsIngest, MetricsQuery, QueryError, QueryValue,
    Sample, Series,
};

/// Reason recorded when a KPI's queries failed beyond retry.
const UNAVAILABLE_DETAIL: &str = "metrics_unavailable";

/// The KPI/cost analyzer.
pub struct Analyzer {
    metrics: Arc<dyn MetricsQuery>,
    settings: AnalyzerSettings,
}

impl Analyzer {
    /// Creates an analyzer over the given metrics backend.
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricsQuery>, settings: AnalyzerSettings) -> Self {
        Self { metrics, settings }
    }

    /// Analyzes one experiment, producing the full result.
    ///
    /// Idempotent per experiment: with an unchanged backend the same window
    /// yields the same result, and callers return the stored result on
    /// repeat calls anyway.
    ///
    /// # Errors
    ///
    /// [`Error::NotStarted`] when the experiment has no window yet, and
    /// [`Error::Cancelled`] when `cancel` fires mid-analysis. Unavailable
    /// metrics are not errors; they yield an `inconclusive` verdict.
    pub async fn analyze(
        &self,
        experiment: &Experiment,
        cancel: &CancellationToken,
    ) -> Result<ExperimentResult, Error> {
        let started = experiment.started_at.ok_or_else(|| Error::NotStarted {
            id: experiment.id.clone(),
        })?;
        let window_start =
            started + chrono::Duration::from_std(experiment.config.warmup).unwrap_or_default();
        let window_end =
            started + chrono::Duration::from_std(experiment.config.duration).unwrap_or_default();
        let window = (window_end - window_start)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        tracing::info!(
            experiment = %experiment.id,
            window_start = %window_start,
            window_end = %window_end,
            "analysis started"
        );

        let baseline = self
            .snapshot(experiment, Variant::Baseline, window_start, window_end, window, cancel)
            .await?;
        let candidate = self
            .snapshot(experiment, Variant::Candidate, window_start, window_end, window, cancel)
            .await?;

        let (kpis, rationale, verdict) =
            evaluate(&baseline, &candidate, &experiment.config.success_criteria);

        tracing::info!(experiment = %experiment.id, %verdict, "analysis finished");
        Ok(ExperimentResult {
            baseline,
            candidate,
            kpis,
            verdict,
            verdict_rationale: rationale,
            window_start,
            window_end,
        })
    }

    /// Pulls the four KPI inputs for one variant. Each input fails soft: a
    /// query exhausted beyond retry leaves its field unset.
    async fn snapshot(
        &self,
        experiment: &Experiment,
        variant: Variant,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        window: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<KpiSnapshot, Error> {
        let id = &experiment.id;

        let cardinality = self
            .instant_kpi(id, &catalogue::cardinality(id, variant), window_end, cancel)
            .await?;
        let cpu = self
            .instant_kpi(id, &catalogue::cpu(id, variant, window), window_end, cancel)
            .await?;
        let memory = self
            .memory_peak_p99(id, variant, window_start, window_end, cancel)
            .await?;
        let critical_fraction = self
            .critical_fraction(id, variant, window_end, window, cancel)
            .await?;

        Ok(KpiSnapshot {
            cardinality,
            cpu,
            memory,
            critical_fraction,
        })
    }

    /// Runs one instant query, collapsing to a scalar. `None` when the query
    /// fails beyond retry or returns nothing.
    async fn instant_kpi(
        &self,
        experiment: &str,
        expr: &str,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, Error> {
        match self.query_instant_with_backoff(experiment, expr, at, cancel).await {
            Ok(value) => Ok(value.as_scalar()),
            Err(QueryError::Backend { details }) => {
                tracing::warn!(experiment, expr, details, "KPI query failed beyond retry");
                Ok(None)
            }
        }
    }

    /// Per-host resident-memory peak over the window, 99th percentile across
    /// hosts.
    async fn memory_peak_p99(
        &self,
        experiment: &str,
        variant: Variant,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, Error> {
        let expr = catalogue::memory(experiment, variant);
        let matrix = match self
            .query_range_with_backoff(experiment, &expr, start, end, cancel)
            .await
        {
            Ok(matrix) => matrix,
            Err(QueryError::Backend { details }) => {
                tracing::warn!(experiment, expr, details, "memory query failed beyond retry");
                return Ok(None);
            }
        };
        let mut peaks: Vec<f64> = matrix
            .iter()
            .filter_map(|series| {
                series
                    .points
                    .iter()
                    .map(|(_, v)| *v)
                    .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            })
            .collect();
        if peaks.is_empty() {
            return Ok(None);
        }
        peaks.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((peaks.len() as f64) * 0.99).ceil() as usize;
        Ok(Some(peaks[rank.clamp(1, peaks.len()) - 1]))
    }

    /// Fraction of configured critical processes whose series appeared at
    /// least once in the window. An empty critical list counts as full
    /// coverage.
    async fn critical_fraction(
        &self,
        experiment: &str,
        variant: Variant,
        at: DateTime<Utc>,
        window: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, Error> {
        let processes = &self.settings.critical_processes;
        if processes.is_empty() {
            return Ok(Some(1.0));
        }
        let expr = catalogue::critical_presence(experiment, variant, processes, window);
        match self.query_instant_with_backoff(experiment, &expr, at, cancel).await {
            Ok(QueryValue::Vector(samples)) => {
                let observed = processes
                    .iter()
                    .filter(|p| {
                        samples
                            .iter()
                            .any(|s| s.labels.get("process").is_some_and(|name| name == *p))
                    })
                    .count();
                Ok(Some(observed as f64 / processes.len() as f64))
            }
            Ok(QueryValue::Scalar(_)) => Ok(None),
            Err(QueryError::Backend { details }) => {
                tracing::warn!(experiment, expr, details, "critical-presence query failed");
                Ok(None)
            }
        }
    }

    async fn query_instant_with_backoff(
        &self,
        experiment: &str,
        expr: &str,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<QueryValue, QueryError> {
        self.with_backoff(experiment, cancel, || self.metrics.query_instant(expr, at))
            .await
            .map_err(|e| match e {
                BackoffFailure::Exhausted(e) => e,
                BackoffFailure::Cancelled => QueryError::Backend {
                    details: "cancelled".to_owned(),
                },
            })
    }

    async fn query_range_with_backoff(
        &self,
        experiment: &str,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Matrix, QueryError> {
        let step = self.settings.query_step;
        self.with_backoff(experiment, cancel, || {
            self.metrics.query_range(expr, start, end, step)
        })
        .await
        .map_err(|e| match e {
            BackoffFailure::Exhausted(e) => e,
            BackoffFailure::Cancelled => QueryError::Backend {
                details: "cancelled".to_owned(),
            },
        })
    }

    /// Retries `op` on transient failure with exponential backoff: base
    /// delay, fixed multiplier, capped, bounded attempts. Cancellation aborts
    /// between attempts.
    async fn with_backoff<T, F, Fut>(
        &self,
        experiment: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, BackoffFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let max_attempts = self.settings.retry_max_attempts.max(1);
        let mut delay = self.settings.retry_base;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(BackoffFailure::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt == max_attempts => {
                    return Err(BackoffFailure::Exhausted(e));
                }
                Err(e) => {
                    tracing::debug!(experiment, attempt, error = %e, "metrics query retry");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(BackoffFailure::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            delay = delay
                .mul_f64(self.settings.retry_multiplier)
                .min(self.settings.retry_cap);
        }
        Err(BackoffFailure::Cancelled)
    }
}

enum BackoffFailure {
    Exhausted(QueryError),
    Cancelled,
}

/// Derives the KPI deltas, rationale, and verdict from the two snapshots.
fn evaluate(
    baseline: &KpiSnapshot,
    candidate: &KpiSnapshot,
    criteria: &phoenix_model::SuccessCriteria,
) -> (KpiDeltas, Vec<CriterionOutcome>, Verdict) {
    let cardinality_reduction = match (baseline.cardinality, candidate.cardinality) {
        (Some(b), Some(c)) if b > 0.0 => Some((b - c) / b * 100.0),
        _ => None,
    };
    let cardinality_detail = match baseline.cardinality {
        Some(b) if b == 0.0 => Some("baseline cardinality is zero".to_owned()),
        None => Some(UNAVAILABLE_DETAIL.to_owned()),
        _ => candidate
            .cardinality
            .is_none()
            .then(|| UNAVAILABLE_DETAIL.to_owned()),
    };

    let cpu_overhead = match (baseline.cpu, candidate.cpu) {
        (Some(b), Some(c)) if b > 0.0 => Some((c - b) / b * 100.0),
        _ => None,
    };
    let memory_overhead = match (baseline.memory, candidate.memory) {
        (Some(b), Some(c)) if b > 0.0 => Some((c - b) / b * 100.0),
        _ => None,
    };
    let critical_coverage = candidate.critical_fraction.map(|f| f * 100.0);

    let deltas = KpiDeltas {
        cardinality_reduction,
        cpu_overhead,
        memory_overhead,
        critical_coverage,
    };

    let mut rationale = Vec::with_capacity(4);
    rationale.push(criterion(
        "cardinality_reduction",
        cardinality_reduction,
        criteria.min_cardinality_reduction,
        Bound::Floor,
        cardinality_detail,
    ));
    rationale.push(criterion(
        "cpu_overhead",
        cpu_overhead,
        criteria.max_cpu_overhead,
        Bound::Ceiling,
        cpu_overhead.is_none().then(|| UNAVAILABLE_DETAIL.to_owned()),
    ));
    rationale.push(criterion(
        "memory_overhead",
        memory_overhead,
        criteria.max_memory_overhead,
        Bound::Ceiling,
        memory_overhead
            .is_none()
            .then(|| UNAVAILABLE_DETAIL.to_owned()),
    ));
    rationale.push(criterion(
        "critical_coverage",
        critical_coverage,
        criteria.min_critical_coverage,
        Bound::Floor,
        critical_coverage
            .is_none()
            .then(|| UNAVAILABLE_DETAIL.to_owned()),
    ));

    let verdict = if rationale
        .iter()
        .any(|c| c.outcome == CriterionStatus::Unavailable)
    {
        Verdict::Inconclusive
    } else if rationale.iter().all(|c| c.outcome == CriterionStatus::Pass) {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    (deltas, rationale, verdict)
}

enum Bound {
    /// Observed must be at least the threshold.
    Floor,
    /// Observed must be at most the threshold.
    Ceiling,
}

fn criterion(
    name: &str,
    observed: Option<f64>,
    threshold: f64,
    bound: Bound,
    detail: Option<String>,
) -> CriterionOutcome {
    let outcome = match observed {
        None => CriterionStatus::Unavailable,
        Some(value) => {
            let ok = match bound {
                Bound::Floor => value >= threshold,
                Bound::Ceiling => value <= threshold,
            };
            if ok {
                CriterionStatus::Pass
            } else {
                CriterionStatus::Fail
            }
        }
    };
    CriterionOutcome {
        criterion: name.to_owned(),
        observed,
        threshold,
        outcome,
        detail,
    }
}
