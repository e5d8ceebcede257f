// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pressure-to-bucket translation.
//!
//! The factory sheds streams a bucket at a time; the overload monitor
//! reports pressure as a scalar. A [`ResetStreamsAdapter`] maps the
//! scalar onto a first-bucket-to-reset: as pressure climbs from the lower
//! limit toward the upper limit, the adapter walks down from the heaviest
//! bucket, resetting more and more of the tracked streams, until at the
//! upper limit everything tracked is shed.

use crate::ShedError;
use flow_control::NUM_BUCKETS;
use std::path::Path;

/// A memory-pressure reading, saturated into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureState(f64);

impl PressureState {
    /// Creates a pressure state, clamping out-of-range inputs.
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    /// The pressure as a fraction in `[0, 1]`.
    pub fn value(&self) -> f64 {
        self.0
    }
}

/// Shed limits, as percentages of full pressure.
///
/// # TOML Format
/// ```toml
/// lower_limit_pct = 50.0
/// upper_limit_pct = 90.0
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShedConfig {
    /// No shedding below this pressure percentage.
    pub lower_limit_pct: f64,
    /// At or above this pressure percentage, every tracked stream is shed.
    pub upper_limit_pct: f64,
}

impl ShedConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ShedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShedError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ShedError> {
        toml::from_str(toml_str).map_err(|e| ShedError::Config(format!("TOML parse error: {e}")))
    }
}

/// Maps pressure readings onto the first bucket to reset.
#[derive(Debug, Clone)]
pub struct ResetStreamsAdapter {
    lower_limit: f64,
    upper_limit: f64,
    /// Pressure band covered by each additional bucket of shedding.
    bucket_gradation: f64,
}

impl ResetStreamsAdapter {
    /// Builds an adapter from percentage limits.
    pub fn new(config: ShedConfig) -> Result<Self, ShedError> {
        let ShedConfig {
            lower_limit_pct: lower,
            upper_limit_pct: upper,
        } = config;
        if !(0.0..=100.0).contains(&lower) || !(0.0..=100.0).contains(&upper) || lower >= upper {
            return Err(ShedError::InvalidLimits { lower, upper });
        }
        Ok(Self {
            lower_limit: lower,
            upper_limit: upper,
            bucket_gradation: (upper - lower) / NUM_BUCKETS as f64,
        })
    }

    /// Translates a pressure reading into the first bucket to reset, or
    /// `None` when pressure is below the lower limit and nothing should
    /// be shed. Lower return values shed more streams; 0 sheds every
    /// tracked account.
    pub fn buckets_to_reset(&self, state: PressureState) -> Option<u32> {
        let current_pressure = state.value() * 100.0;

        if current_pressure < self.lower_limit {
            return None;
        }
        if current_pressure >= self.upper_limit {
            return Some(0);
        }

        let buckets_to_clear =
            ((current_pressure - self.lower_limit) / self.bucket_gradation).floor() as u32 + 1;
        Some(NUM_BUCKETS as u32 - buckets_to_clear)
    }
}
