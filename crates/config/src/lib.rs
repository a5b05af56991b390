// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the Phoenix control plane.
//!
//! All knobs have defaults suitable for development; production deployments
//! override them through a YAML settings file. Durations are written in
//! human-readable form (`30s`, `5m`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod io;

use crate::error::Error;

/// Root settings for the control plane process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ControlPlaneSettings {
    /// HTTP server settings.
    pub http: HttpSettings,
    /// Task queue lease and retry settings.
    pub queue: TaskQueueSettings,
    /// Agent long-poll dispatcher settings.
    pub dispatch: DispatchSettings,
    /// Host heartbeat health settings.
    pub heartbeat: HeartbeatSettings,
    /// Experiment scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Analyzer settings.
    pub analyzer: AnalyzerSettings,
    /// Event bus settings.
    pub events: EventBusSettings,
}

impl ControlPlaneSettings {
    /// Validates the whole settings tree, returning every violation found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] carrying the full violation list.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        if self.queue.lease.is_zero() {
            errors.push("queue.lease must be positive".to_owned());
        }
        if self.queue.retry_ceiling == 0 {
            errors.push("queue.retry_ceiling must be at least 1".to_owned());
        }
        if self
            .queue
            .expiry_tick
            .is_some_and(|tick| tick.is_zero() || tick > self.queue.lease)
        {
            errors.push("queue.expiry_tick must be positive and no longer than the lease".to_owned());
        }
        if self.dispatch.default_max_wait > self.dispatch.max_wait_ceiling {
            errors.push(format!(
                "dispatch.default_max_wait ({}) must not exceed dispatch.max_wait_ceiling ({})",
                humantime::format_duration(self.dispatch.default_max_wait),
                humantime::format_duration(self.dispatch.max_wait_ceiling),
            ));
        }
        if self.dispatch.max_tasks_ceiling == 0 {
            errors.push("dispatch.max_tasks_ceiling must be at least 1".to_owned());
        }
        if self.heartbeat.healthy_window.is_zero() {
            errors.push("heartbeat.healthy_window must be positive".to_owned());
        }
        if self.scheduler.tick_interval.is_zero() {
            errors.push("scheduler.tick_interval must be positive".to_owned());
        }
        if self.analyzer.retry_max_attempts == 0 {
            errors.push("analyzer.retry_max_attempts must be at least 1".to_owned());
        }
        if self.analyzer.retry_multiplier < 1.0 {
            errors.push("analyzer.retry_multiplier must be at least 1.0".to_owned());
        }
        if self.events.subscriber_buffer == 0 {
            errors.push("events.subscriber_buffer must be at least 1".to_owned());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidSettings { errors })
        }
    }
}

/// Configuration for the HTTP API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct HttpSettings {
    /// The address to bind the HTTP server to (e.g., "127.0.0.1:8080").
    pub bind_address: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_owned()
}

/// Lease and retry discipline for the task queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct TaskQueueSettings {
    /// How long a claimed task is owned by its host before it becomes
    /// re-dispatchable.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub lease: Duration,
    /// Maximum number of issuances before a task is abandoned.
    pub retry_ceiling: u32,
    /// Cadence of the lease-expiry worker. Defaults to a quarter of the lease.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub expiry_tick: Option<Duration>,
}

impl TaskQueueSettings {
    /// The effective expiry-worker cadence.
    #[must_use]
    pub fn effective_expiry_tick(&self) -> Duration {
        self.expiry_tick.unwrap_or(self.lease / 4)
    }
}

impl Default for TaskQueueSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5 * 60),
            retry_ceiling: 3,
            expiry_tick: None,
        }
    }
}

/// Clamps applied to agent long-poll requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct DispatchSettings {
    /// Wait applied when the agent does not request one.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub default_max_wait: Duration,
    /// Upper clamp on the agent-requested wait.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub max_wait_ceiling: Duration,
    /// Upper clamp on the agent-requested batch size.
    pub max_tasks_ceiling: usize,
    /// How long an idle per-host notification channel is kept before being
    /// dropped.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub idle_channel_ttl: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_max_wait: Duration::from_secs(30),
            max_wait_ceiling: Duration::from_secs(60),
            max_tasks_ceiling: 16,
            idle_channel_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Heartbeat-derived host health windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct HeartbeatSettings {
    /// A host is healthy while its last heartbeat is within this window,
    /// stale within three of them, offline beyond.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub healthy_window: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            healthy_window: Duration::from_secs(60),
        }
    }
}

/// Experiment scheduler cadence and guards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerSettings {
    /// Cadence of the tick advancing time-driven transitions.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub tick_interval: Duration,
    /// How long an experiment may stay in `initializing` before it fails.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub init_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            init_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Analyzer query retry schedule and KPI inputs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct AnalyzerSettings {
    /// Delay before the first metrics-query retry.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub retry_base: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub retry_multiplier: f64,
    /// Upper clamp on the retry delay.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub retry_cap: Duration,
    /// Total query attempts before a KPI is declared unavailable.
    pub retry_max_attempts: u32,
    /// Query resolution step for range queries.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub query_step: Duration,
    /// Process names whose telemetry must survive optimization.
    pub critical_processes: Vec<String>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_multiplier: 2.0,
            retry_cap: Duration::from_secs(30),
            retry_max_attempts: 5,
            query_step: Duration::from_secs(15),
            critical_processes: Vec::new(),
        }
    }
}

/// Event bus fan-out limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct EventBusSettings {
    /// Per-subscriber buffered event capacity; events beyond it are dropped
    /// for that subscriber.
    pub subscriber_buffer: usize,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 128,
        }
    }
}
