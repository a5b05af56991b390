// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-host wake-up channels for the long-poll dispatcher.
//!
//! One channel exists per host with an active poller or recent activity.
//! Channels are created lazily on first use and dropped by a periodic sweep
//! once the host has had no poller and no pending tasks for the configured
//! idle interval. Task history is unaffected by the sweep; only the wake-up
//! primitive is reclaimed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use phoenix_model::HostId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Wake-up channel for one host.
pub struct HostChannel {
    notify: Notify,
    pollers: AtomicUsize,
    last_activity: Mutex<DateTime<Utc>>,
}

impl HostChannel {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            notify: Notify::new(),
            pollers: AtomicUsize::new(0),
            last_activity: Mutex::new(now),
        }
    }

    /// The underlying notifier. Waiters must register interest before
    /// re-checking the queue to avoid lost wake-ups.
    #[must_use]
    pub fn notify(&self) -> &Notify {
        &self.notify
    }

    /// Wakes every registered poller.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Marks a poller as active for the duration of the returned guard.
    #[must_use]
    pub fn enter_poll(self: &Arc<Self>, now: DateTime<Utc>) -> PollGuard {
        let _ = self.pollers.fetch_add(1, Ordering::SeqCst);
        *self.last_activity.lock() = now;
        PollGuard {
            channel: Arc::clone(self),
        }
    }

    fn has_pollers(&self) -> bool {
        self.pollers.load(Ordering::SeqCst) > 0
    }

    fn idle_since(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }
}

/// RAII guard counting an active poller on a host channel.
pub struct PollGuard {
    channel: Arc<HostChannel>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let _ = self.channel.pollers.fetch_sub(1, Ordering::SeqCst);
        *self.channel.last_activity.lock() = Utc::now();
    }
}

/// Registry of per-host channels.
#[derive(Default)]
pub(crate) struct Notifiers {
    channels: Mutex<HashMap<HostId, Arc<HostChannel>>>,
}

impl Notifiers {
    /// Returns the channel for `host`, creating it if needed.
    pub(crate) fn channel(&self, host: &HostId, now: DateTime<Utc>) -> Arc<HostChannel> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(host.clone())
                .or_insert_with(|| Arc::new(HostChannel::new(now))),
        )
    }

    /// Wakes the pollers of `host`, if a channel exists.
    pub(crate) fn wake(&self, host: &HostId) {
        if let Some(channel) = self.channels.lock().get(host) {
            channel.wake_all();
        }
    }

    /// Drops channels idle longer than `ttl` with no active poller, unless
    /// `has_pending(host)` reports work still queued. Returns how many were
    /// reclaimed.
    pub(crate) fn sweep_idle(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
        has_pending: impl Fn(&HostId) -> bool,
    ) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|host, channel| {
            channel.has_pollers()
                || has_pending(host)
                || now.signed_duration_since(channel.idle_since()) < ttl
        });
        before - channels.len()
    }
}
