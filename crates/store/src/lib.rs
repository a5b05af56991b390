// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Entity persistence and optimistic state transitions.
//!
//! The store is the only shared durable state in the control plane; all
//! cross-component coordination passes through it. Locking discipline is
//! per-row optimistic: experiments carry a version counter checked by
//! [`Store::compare_and_swap_phase`], and task claims execute as a single
//! serialized critical section per host so claims for different hosts proceed
//! in parallel. There are no global locks on the hot paths.

pub mod cursor;
pub mod error;
pub mod notify;
pub mod store;
pub mod tasks;

pub use cursor::Page;
pub use error::Error;
pub use notify::HostChannel;
pub use store::{CasOutcome, HeartbeatOutcome, PhaseEffects, Store};
pub use tasks::{ExpiryOutcome, TaskOwner, TaskTransition};
