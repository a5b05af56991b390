// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! In-process pub/sub of state-change events.
//!
//! Topics are strings (`experiment.<id>`, `host.<id>`); subscription patterns
//! may end in `.*` to match a whole family, or be the lone `*` to match
//! everything. Delivery is best-effort and non-blocking: a subscriber whose
//! buffer is full misses the event, and publishers are never backpressured.
//! Subscribers see events strictly from subscription time forward.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use phoenix_model::{
    ExperimentId, ExperimentPhase, ExperimentResult, HostHealth, HostId, Task, Verdict,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod topic;

pub use topic::{experiment_topic, host_topic, topic_matches};

/// The kind of a bus event, as pushed on the realtime stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An experiment took a phase transition.
    ExperimentPhaseChanged,
    /// A task reported success.
    TaskCompleted,
    /// A task was abandoned or terminally failed.
    TaskFailed,
    /// A host's derived health changed.
    HostHealthChanged,
    /// An experiment's analysis result became available.
    ExperimentResultReady,
}

/// A single state-change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of the event.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// An experiment took the `from -> to` edge.
    #[must_use]
    pub fn phase_changed(
        experiment: &ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Self {
        Self::new(
            EventKind::ExperimentPhaseChanged,
            serde_json::json!({
                "experiment_id": experiment,
                "from": from,
                "to": to,
            }),
        )
    }

    /// A task reported success.
    #[must_use]
    pub fn task_completed(task: &Task) -> Self {
        Self::new(
            EventKind::TaskCompleted,
            serde_json::json!({
                "task_id": task.id,
                "experiment_id": task.experiment,
                "host": task.host,
                "kind": task.action.kind(),
            }),
        )
    }

    /// A task was abandoned or terminally failed.
    #[must_use]
    pub fn task_failed(task: &Task) -> Self {
        Self::new(
            EventKind::TaskFailed,
            serde_json::json!({
                "task_id": task.id,
                "experiment_id": task.experiment,
                "host": task.host,
                "kind": task.action.kind(),
                "status": task.status,
                "attempts": task.attempts,
                "last_error": task.last_error,
            }),
        )
    }

    /// A host's derived health changed.
    #[must_use]
    pub fn host_health_changed(host: &HostId, from: HostHealth, to: HostHealth) -> Self {
        Self::new(
            EventKind::HostHealthChanged,
            serde_json::json!({
                "host": host,
                "from": from,
                "to": to,
            }),
        )
    }

    /// An experiment's analysis result became available.
    #[must_use]
    pub fn result_ready(experiment: &ExperimentId, result: &ExperimentResult) -> Self {
        Self::new(
            EventKind::ExperimentResultReady,
            serde_json::json!({
                "experiment_id": experiment,
                "verdict": result.verdict,
            }),
        )
    }

    /// Convenience accessor for the verdict carried by a result event.
    #[must_use]
    pub fn verdict(&self) -> Option<Verdict> {
        serde_json::from_value(self.payload.get("verdict")?.clone()).ok()
    }
}

/// An event paired with the topic it was published on.
#[derive(Debug, Clone)]
pub struct Published {
    /// The topic the event was published on.
    pub topic: String,
    /// The event itself.
    pub event: Event,
}

struct SubscriberEntry {
    patterns: Vec<String>,
    tx: mpsc::Sender<Published>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<u64, SubscriberEntry>,
    next_id: u64,
    closed: bool,
}

/// Process-local event bus.
///
/// Cloning is cheap; all clones share the same subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    buffer: usize,
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `buffer` events each.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            buffer: buffer.max(1),
        }
    }

    /// Publishes an event on `topic`. Never blocks: subscribers with a full
    /// buffer miss the event.
    pub fn publish(&self, topic: &str, event: Event) {
        let state = self.state.lock();
        if state.closed {
            return;
        }
        for entry in state.subscribers.values() {
            if !entry.patterns.iter().any(|p| topic_matches(p, topic)) {
                continue;
            }
            let published = Published {
                topic: topic.to_owned(),
                event: event.clone(),
            };
            if entry.tx.try_send(published).is_err() {
                tracing::debug!(topic, "subscriber buffer full, event dropped");
            }
        }
    }

    /// Registers a subscriber with an initial pattern set.
    ///
    /// The subscription receives only events published after this call.
    #[must_use]
    pub fn subscribe(&self, patterns: Vec<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            let _ = state
                .subscribers
                .insert(id, SubscriberEntry { patterns, tx });
        }
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Closes the bus: all subscriptions end after draining their buffers,
    /// and further publishes are dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    fn add_pattern(&self, id: u64, pattern: String) {
        let mut state = self.state.lock();
        if let Some(entry) = state.subscribers.get_mut(&id)
            && !entry.patterns.contains(&pattern)
        {
            entry.patterns.push(pattern);
        }
    }

    fn remove_pattern(&self, id: u64, pattern: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.subscribers.get_mut(&id) {
            entry.patterns.retain(|p| p != pattern);
        }
    }

    fn drop_subscriber(&self, id: u64) {
        let mut state = self.state.lock();
        let _ = state.subscribers.remove(&id);
    }
}

/// A live subscription to the bus.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Published>,
    bus: EventBus,
}

impl Subscription {
    /// Receives the next matching event. Returns `None` once the bus is
    /// closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Published> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Published> {
        self.rx.try_recv().ok()
    }

    /// Adds a topic pattern to this subscription.
    pub fn subscribe_topic(&self, pattern: impl Into<String>) {
        self.bus.add_pattern(self.id, pattern.into());
    }

    /// Removes a topic pattern from this subscription.
    pub fn unsubscribe_topic(&self, pattern: &str) {
        self.bus.remove_pattern(self.id, pattern);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.drop_subscriber(self.id);
    }
}
