// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! The in-process data plane of the NRDOT+ agent.
//!
//! Four components implement the agent's bounded-resource guarantees:
//!
//! - [`apq::PriorityQueue`]: bounded multi-priority queue between
//!   admission and the sender.
//! - [`cardinality::CardinalityLimiter`]: bounds distinct attribute
//!   key-sets per sliding window.
//! - [`degradation::DegradationManager`]: observes resource pressure and
//!   moves the pipeline through discrete degradation levels.
//! - [`pipeline`]: wiring, admission entry and lifecycle for the core.
//!
//! Admission (`CardinalityLimiter::admit` + `PriorityQueue::enqueue`) is
//! non-blocking and never returns errors; failures become counter
//! increments so the hot path stays allocation-light.

pub mod apq;
pub mod cardinality;
pub mod control;
pub mod degradation;
pub mod error;
pub mod pipeline;

pub use apq::{Enqueue, PriorityQueue};
pub use cardinality::{Admission, CardinalityLimiter};
pub use control::{HealthState, LevelCell, OutageSwitch, RateWindow, SenderControls};
pub use degradation::{DegradationLevel, DegradationManager};
pub use error::CoreError;
pub use pipeline::{AdmitOutcome, Admitter, Core, TransformHook};
