// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for flow-control configuration.
//!
//! The data path itself never returns errors: watermarks are a signalling
//! mechanism, and accounting bugs are assertions rather than recoverable
//! conditions. Only configuration loading is fallible.

/// Errors raised while building a [`WatermarkBufferFactory`](crate::WatermarkBufferFactory).
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The account tracking threshold must be zero (use the built-in
    /// default) or a power of two, so bucket classification stays a
    /// single shift.
    #[error("account tracking threshold must be zero or a power of two, got {bytes}")]
    InvalidTrackingThreshold { bytes: u64 },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}
