// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # flow-control
//!
//! Watermark buffers and per-stream memory accounting — the flow-control
//! core that sits on the hot path of every byte crossing the proxy.
//!
//! # Key Components
//!
//! - [`WatermarkBuffer`] — a byte buffer that fires back-pressure
//!   callbacks edge-triggered as its length crosses the low, high, and
//!   overflow thresholds.
//! - [`BufferMemoryAccount`] — a per-stream bytes-in-flight counter that
//!   classifies itself into one of [`NUM_BUCKETS`] logarithmic size
//!   buckets.
//! - [`WatermarkBufferFactory`] — creates buffers and accounts, keeps the
//!   bucket → account index, and cancels every stream at or above a given
//!   bucket when the proxy is under memory pressure.
//!
//! # Wiring
//!
//! A codec creates a buffer with its three flow-control callbacks, binds
//! the stream's account, and writes traffic through it:
//!
//! ```
//! use flow_control::{FactoryConfig, ResetReason, StreamResetHandler, WatermarkBufferFactory};
//! use std::sync::Arc;
//!
//! struct Stream;
//! impl StreamResetHandler for Stream {
//!     fn reset_stream(&self, reason: ResetReason) {
//!         // Post the cancellation to this stream's worker.
//!         let _ = reason;
//!     }
//! }
//!
//! let factory = WatermarkBufferFactory::new(FactoryConfig::default()).unwrap();
//! let account = factory.create_account(Arc::new(Stream));
//!
//! let mut body = factory.create_buffer(
//!     || { /* resume reading */ },
//!     || { /* pause reading */ },
//!     || { /* catastrophic buffering */ },
//! );
//! body.bind_account(account.clone());
//! body.set_watermarks(64 * 1024);
//!
//! body.add(b"request body bytes");
//! assert_eq!(account.balance(), 18);
//!
//! // Stream teardown.
//! drop(body);
//! account.clear_downstream();
//! ```
//!
//! # Threading
//!
//! Buffers and the mutation side of accounts are thread-affine: one
//! worker owns them for their whole lifetime, and watermark callbacks run
//! inline from the mutating call. Only the factory is shared across
//! threads; see [`WatermarkBufferFactory`] for its locking discipline.

mod account;
mod error;
mod factory;
mod watermark;

pub use account::{BufferMemoryAccount, ResetReason, StreamResetHandler, NUM_BUCKETS};
pub use error::FlowError;
pub use factory::{
    FactoryConfig, WatermarkBufferFactory, DEFAULT_TRACKING_THRESHOLD_BYTES,
};
pub use watermark::{ReadReservation, WatermarkBuffer};
