// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # overload-shed
//!
//! Turns memory-pressure readings into targeted stream cancellation.
//!
//! The flow-control factory tracks every memory-heavy stream in
//! logarithmic size buckets; this crate supplies the policy side:
//!
//! - [`ResetStreamsAdapter`] — maps a pressure scalar onto the first
//!   bucket to reset, walking down from the heaviest bucket as pressure
//!   climbs between its configured limits.
//! - [`ShedController`] — the coordinator-side driver that feeds
//!   pressure readings through the adapter and runs the factory's
//!   shedding walk.
//!
//! # Example
//! ```
//! use flow_control::{FactoryConfig, WatermarkBufferFactory};
//! use overload_shed::{PressureState, ResetStreamsAdapter, ShedConfig, ShedController};
//!
//! let factory = WatermarkBufferFactory::new(FactoryConfig::default()).unwrap();
//! let adapter = ResetStreamsAdapter::new(ShedConfig {
//!     lower_limit_pct: 80.0,
//!     upper_limit_pct: 98.0,
//! })
//! .unwrap();
//! let controller = ShedController::new(adapter, factory);
//!
//! // Wire `controller.on_pressure(...)` to the overload monitor's
//! // periodic readings.
//! assert_eq!(controller.on_pressure(PressureState::new(0.5)), None);
//! ```

mod adapter;
mod controller;
mod error;

pub use adapter::{PressureState, ResetStreamsAdapter, ShedConfig};
pub use controller::ShedController;
pub use error::ShedError;
