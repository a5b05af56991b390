// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The analyzer's query-expression catalogue.
//!
//! Expressions are opaque to the rest of the core; only the analyzer knows
//! their shape. Each is parameterized by experiment identifier, variant, and
//! the analysis window.

use phoenix_model::Variant;
use std::time::Duration;

fn window_secs(window: Duration) -> u64 {
    window.as_secs().max(1)
}

/// Total distinct series produced by one variant, evaluated at window end.
#[must_use]
pub(crate) fn cardinality(experiment: &str, variant: Variant) -> String {
    format!(
        "count(count by (__name__, series_hash) \
         (phoenix_pipeline_output{{experiment_id=\"{experiment}\",variant=\"{variant}\"}}))"
    )
}

/// CPU time consumed by the collector over the window, averaged per host.
#[must_use]
pub(crate) fn cpu(experiment: &str, variant: Variant, window: Duration) -> String {
    format!(
        "avg(increase(phoenix_collector_cpu_seconds_total\
         {{experiment_id=\"{experiment}\",variant=\"{variant}\"}}[{}s]))",
        window_secs(window)
    )
}

/// Resident memory of the collector, one series per host. Evaluated as a
/// range query; the analyzer takes the per-host peak and the 99th percentile
/// across hosts.
#[must_use]
pub(crate) fn memory(experiment: &str, variant: Variant) -> String {
    format!(
        "max by (host) (phoenix_collector_memory_bytes\
         {{experiment_id=\"{experiment}\",variant=\"{variant}\"}})"
    )
}

/// Presence of critical-process series: one sample per critical process name
/// observed at least once in the window.
#[must_use]
pub(crate) fn critical_presence(
    experiment: &str,
    variant: Variant,
    processes: &[String],
    window: Duration,
) -> String {
    let matcher = processes.join("|");
    format!(
        "count by (process) (present_over_time(phoenix_process_series\
         {{experiment_id=\"{experiment}\",variant=\"{variant}\",process=~\"{matcher}\"}}[{}s]))",
        window_secs(window)
    )
}
