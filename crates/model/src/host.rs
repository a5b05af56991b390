// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Hosts and their derived health.
//!
//! Hosts self-register on first heartbeat and are never deleted by the core.
//! Identifiers are immutable; labels are add-only after registration.

use crate::HostId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Derived host health, computed from the last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    /// Heartbeat within the healthy window.
    Healthy,
    /// Heartbeat within three healthy windows.
    Stale,
    /// No heartbeat beyond three healthy windows.
    Offline,
}

impl std::fmt::Display for HostHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostHealth::Healthy => "healthy",
            HostHealth::Stale => "stale",
            HostHealth::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource usage reported by an agent heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceUsage {
    /// CPU utilisation of the host, percent.
    pub cpu_percent: f64,
    /// Memory utilisation of the host, percent.
    pub memory_percent: f64,
    /// Resident memory, bytes.
    pub memory_bytes: u64,
}

/// An execution environment an agent operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Opaque, client-supplied identifier. Immutable after registration.
    pub id: HostId,
    /// Add-only label set.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Agent version string from the most recent heartbeat.
    #[serde(default)]
    pub agent_version: String,
    /// Time of the most recent heartbeat or successful poll.
    pub last_heartbeat: DateTime<Utc>,
    /// Resource snapshot from the most recent heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
}

impl Host {
    /// Derives the health of this host at `now` given the healthy window.
    #[must_use]
    pub fn health(&self, now: DateTime<Utc>, healthy_window: Duration) -> HostHealth {
        let window = chrono::Duration::from_std(healthy_window).unwrap_or_default();
        let age = now.signed_duration_since(self.last_heartbeat);
        if age <= window {
            HostHealth::Healthy
        } else if age <= window * 3 {
            HostHealth::Stale
        } else {
            HostHealth::Offline
        }
    }

    /// Merges labels from a heartbeat. Existing labels are never removed or
    /// overwritten: only previously unknown keys are added.
    pub fn merge_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (key, value) in labels {
            let _ = self
                .labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last_heartbeat: DateTime<Utc>) -> Host {
        Host {
            id: "h1".to_owned(),
            labels: BTreeMap::new(),
            agent_version: "1.2.3".to_owned(),
            last_heartbeat,
            resources: None,
            registered_at: last_heartbeat,
        }
    }

    #[test]
    fn health_thresholds() {
        let now = Utc::now();
        let window = Duration::from_secs(60);
        assert_eq!(host(now).health(now, window), HostHealth::Healthy);
        let stale = host(now - chrono::Duration::seconds(90));
        assert_eq!(stale.health(now, window), HostHealth::Stale);
        let offline = host(now - chrono::Duration::seconds(200));
        assert_eq!(offline.health(now, window), HostHealth::Offline);
    }

    #[test]
    fn labels_are_add_only() {
        let mut h = host(Utc::now());
        let _ = h.labels.insert("zone".to_owned(), "eu-1".to_owned());
        let update: BTreeMap<String, String> = [
            ("zone".to_owned(), "us-2".to_owned()),
            ("rack".to_owned(), "r7".to_owned()),
        ]
        .into_iter()
        .collect();
        h.merge_labels(&update);
        assert_eq!(h.labels["zone"], "eu-1", "existing label must not change");
        assert_eq!(h.labels["rack"], "r7", "new label must be added");
    }
}
