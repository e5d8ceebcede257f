// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for shed configuration.

/// Errors raised while building a
/// [`ResetStreamsAdapter`](crate::ResetStreamsAdapter).
#[derive(Debug, thiserror::Error)]
pub enum ShedError {
    /// The pressure limits must satisfy `0 ≤ lower < upper ≤ 100`.
    #[error("invalid shed limits: lower {lower}% must be below upper {upper}% within [0, 100]")]
    InvalidLimits { lower: f64, upper: f64 },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}
