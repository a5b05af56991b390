// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The task distribution engine.
//!
//! [`TaskQueue`] owns the queue semantics (enqueue, claim, status reports,
//! lease expiry) on top of the store's per-host critical sections.
//! [`Dispatcher`] serves agent long polls: it blocks until tasks arrive for a
//! host or the wait lapses, and reverts claims whose caller went away before
//! delivery. [`LeaseExpiryWorker`] sweeps lapsed leases on a fixed cadence.
//!
//! Delivery is at-least-once: a claimed task whose host never reports back is
//! re-dispatched when its lease lapses, up to the retry ceiling, after which
//! it is abandoned and the owning workflow fails.

pub mod dispatch;
pub mod queue;
pub mod worker;

pub use dispatch::{ClaimedBatch, Dispatcher};
pub use queue::TaskQueue;
pub use worker::LeaseExpiryWorker;
