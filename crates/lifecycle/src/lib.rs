// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The experiment state machine and its scheduler.
//!
//! [`Controller`] owns every experiment and deployment mutation: operator
//! actions (create, start, stop, promote), agent-driven progress (deploy
//! confirmations, abandons), and time-driven edges (warmup end, duration
//! end, initialization timeout). Each transition is one optimistic
//! compare-and-swap through the store; concurrent attempts see one winner and
//! the losers observe a retryable conflict with no side effects.
//!
//! [`Scheduler`] is the periodic tick that re-reconciles every non-terminal
//! experiment and deployment, which is what advances the time-driven edges
//! and picks up task abandons detected by the lease-expiry worker.

pub mod controller;
pub mod deployments;
pub mod error;
pub mod scheduler;

pub use controller::{Controller, CreateExperiment, PromoteRequest};
pub use deployments::{CreateDeployment, DeploymentPatch};
pub use error::Error;
pub use scheduler::Scheduler;
