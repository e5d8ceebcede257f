// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The coordinator that turns pressure readings into shedding walks.

use crate::{PressureState, ResetStreamsAdapter};
use flow_control::WatermarkBufferFactory;

/// Drives the factory's shedding walk from memory-pressure readings.
///
/// Runs on a coordinator thread; the factory handle is a cheap clone
/// sharing the bucket index with the workers. Reset handlers invoked by
/// the walk post cancellations onto each stream's own worker, so the
/// coordinator never executes stream teardown inline.
///
/// # Example
/// ```
/// use flow_control::{FactoryConfig, WatermarkBufferFactory};
/// use overload_shed::{PressureState, ResetStreamsAdapter, ShedConfig, ShedController};
///
/// let factory = WatermarkBufferFactory::new(FactoryConfig::default()).unwrap();
/// let adapter = ResetStreamsAdapter::new(ShedConfig {
///     lower_limit_pct: 50.0,
///     upper_limit_pct: 90.0,
/// })
/// .unwrap();
/// let controller = ShedController::new(adapter, factory);
///
/// // Idle: nothing tracked, nothing shed.
/// assert_eq!(controller.on_pressure(PressureState::new(0.2)), None);
/// assert_eq!(controller.on_pressure(PressureState::new(0.95)), Some(0));
/// ```
#[derive(Debug)]
pub struct ShedController {
    adapter: ResetStreamsAdapter,
    factory: WatermarkBufferFactory,
}

impl ShedController {
    pub fn new(adapter: ResetStreamsAdapter, factory: WatermarkBufferFactory) -> Self {
        Self { adapter, factory }
    }

    /// Feeds one pressure reading through the adapter and, when shedding
    /// is indicated, resets every account at or above the translated
    /// bucket. Returns the first bucket reset, if any.
    pub fn on_pressure(&self, state: PressureState) -> Option<u32> {
        let first_bucket = self.adapter.buckets_to_reset(state)?;
        tracing::info!(
            pressure = state.value(),
            first_bucket,
            tracked = self.factory.tracked_accounts(),
            "shedding streams under memory pressure"
        );
        self.factory
            .reset_accounts_in_buckets_at_or_above(first_bucket);
        Some(first_bucket)
    }
}
