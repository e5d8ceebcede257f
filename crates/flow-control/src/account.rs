// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-stream memory accounting.
//!
//! A [`BufferMemoryAccount`] accumulates the bytes in flight across every
//! buffer a stream touches. On each balance change the account classifies
//! itself into a logarithmic size bucket and tells the factory when the
//! bucket changes, so an overload controller can cancel the heaviest
//! streams first.
//!
//! # Ownership
//!
//! ```text
//! stream ──strong──► account ◄──strong── bound buffers
//!                      │ ▲
//!          shared_this │ │ bucket-set entry
//!                      ▼ │
//!                   factory index
//! ```
//!
//! The account keeps a shared handle to itself while it is registered in
//! the factory index, so bucket sets can always reach it for shedding.
//! [`BufferMemoryAccount::clear_downstream`] breaks the cycle on stream
//! teardown.

use crate::factory::FactoryInner;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Number of logarithmic size classes accounts are tracked in.
pub const NUM_BUCKETS: usize = 8;

/// Why a stream is being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The overload controller is shedding memory-heavy streams.
    OverloadManager,
    /// The stream's own worker is tearing it down.
    LocalReset,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::OverloadManager => write!(f, "overload manager"),
            ResetReason::LocalReset => write!(f, "local reset"),
        }
    }
}

/// The stream-reset capability an account forwards cancellations to.
///
/// Implementations post the actual reset onto the stream's own worker;
/// they must not block the caller.
pub trait StreamResetHandler: Send + Sync {
    fn reset_stream(&self, reason: ResetReason);
}

/// Aggregate bytes-in-flight counter for one stream.
///
/// Buffers bind to an account with
/// [`WatermarkBuffer::bind_account`](crate::WatermarkBuffer::bind_account);
/// bytes charged to any bound buffer roll up here. Balance mutation is
/// thread-affine (the owning worker), but the factory's shedding walk may
/// concurrently read the balance and deliver resets, so the handler and
/// bucket state sit behind locks.
pub struct BufferMemoryAccount {
    /// Sum of charges minus credits across all bound buffers.
    balance: AtomicU64,
    /// Bucket the factory currently tracks this account in, if any.
    bucket: Mutex<Option<u32>>,
    reset_handler: Mutex<Option<Arc<dyn StreamResetHandler>>>,
    /// Self-handle held while registered in the factory index. Cleared by
    /// `clear_downstream`, which is what breaks the ownership cycle.
    shared_this: Mutex<Option<Arc<BufferMemoryAccount>>>,
    factory: Weak<FactoryInner>,
    /// Copied from the factory at creation: `log2` of the tracking
    /// threshold.
    bitshift: u32,
}

impl BufferMemoryAccount {
    pub(crate) fn new(
        factory: Weak<FactoryInner>,
        reset_handler: Arc<dyn StreamResetHandler>,
        bitshift: u32,
    ) -> Self {
        Self {
            balance: AtomicU64::new(0),
            bucket: Mutex::new(None),
            reset_handler: Mutex::new(Some(reset_handler)),
            shared_this: Mutex::new(None),
            factory,
            bitshift,
        }
    }

    pub(crate) fn set_shared_this(&self, this: Arc<BufferMemoryAccount>) {
        *self.shared_this.lock().expect("shared_this lock poisoned") = Some(this);
    }

    /// The outstanding balance in bytes.
    pub fn balance(&self) -> u64 {
        self.balance.load(Ordering::Acquire)
    }

    /// Adds `amount` bytes to the balance and reclassifies.
    ///
    /// # Panics
    /// Panics if the balance would overflow `u64` — more bytes in flight
    /// than the address space can hold is a caller bug.
    pub fn charge(&self, amount: u64) {
        let prev = self.balance.load(Ordering::Acquire);
        assert!(
            u64::MAX - prev >= amount,
            "account balance overflow: {prev} + {amount}"
        );
        self.balance.store(prev + amount, Ordering::Release);
        self.update_account_class();
    }

    /// Subtracts `amount` bytes from the balance and reclassifies.
    ///
    /// # Panics
    /// Panics if `amount` exceeds the balance: crediting bytes that were
    /// never charged is a caller bug.
    pub fn credit(&self, amount: u64) {
        let prev = self.balance.load(Ordering::Acquire);
        assert!(
            prev >= amount,
            "account credited {amount} bytes with only {prev} outstanding"
        );
        self.balance.store(prev - amount, Ordering::Release);
        self.update_account_class();
    }

    /// Forwards `reason` to the stream-reset handler, if the downstream
    /// has not been cleared. Best-effort: resetting an already-cleared
    /// account is a no-op.
    pub fn reset_downstream(&self, reason: ResetReason) {
        // Clone the handle out of the lock before invoking it: a handler
        // that tears the stream down re-enters `clear_downstream`, and a
        // concurrent clear must see either a delivered reset or nothing.
        let handler = self
            .reset_handler
            .lock()
            .expect("reset handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            handler.reset_stream(reason);
        }
    }

    /// Detaches the account from its stream: releases the reset handler,
    /// leaves the factory index, and drops the self-handle so the account
    /// can be collected once the last buffer lets go.
    pub fn clear_downstream(&self) {
        let had_handler = self
            .reset_handler
            .lock()
            .expect("reset handler lock poisoned")
            .take()
            .is_some();
        if !had_handler {
            return;
        }

        let mut bucket = self.bucket.lock().expect("bucket lock poisoned");
        let this = self
            .shared_this
            .lock()
            .expect("shared_this lock poisoned")
            .take();
        if let Some(this) = this {
            if let Some(factory) = self.factory.upgrade() {
                factory.unregister_account(&this, *bucket);
            }
        }
        *bucket = None;
    }

    /// The bucket the factory currently tracks this account in.
    pub fn bucket(&self) -> Option<u32> {
        *self.bucket.lock().expect("bucket lock poisoned")
    }

    /// Computes the intended bucket for the current balance.
    ///
    /// One bucket per power-of-two band above the tracking threshold,
    /// saturating at the last bucket; balances below the threshold are
    /// not worth tracking.
    fn balance_to_class_index(&self) -> Option<u32> {
        let shifted = self.balance.load(Ordering::Acquire) >> self.bitshift;
        if shifted == 0 {
            return None;
        }
        Some(shifted.ilog2().min(NUM_BUCKETS as u32 - 1))
    }

    /// Reclassifies after a balance change, moving the account between
    /// factory bucket sets when the class changed. Accounts that have
    /// given up their self-handle (downstream cleared) are no longer
    /// tracked.
    fn update_account_class(&self) {
        let new_class = self.balance_to_class_index();
        let mut bucket = self.bucket.lock().expect("bucket lock poisoned");
        if *bucket == new_class {
            return;
        }
        let this = self
            .shared_this
            .lock()
            .expect("shared_this lock poisoned")
            .clone();
        if let Some(this) = this {
            if let Some(factory) = self.factory.upgrade() {
                factory.update_account_class(&this, *bucket, new_class);
                *bucket = new_class;
            }
        }
    }

    /// Called by the factory when a shedding walk removes this account
    /// from its bucket set, before the reset is delivered.
    pub(crate) fn mark_untracked(&self) {
        *self.bucket.lock().expect("bucket lock poisoned") = None;
    }
}

impl Drop for BufferMemoryAccount {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.balance(),
                0,
                "account destroyed with {} bytes outstanding",
                self.balance()
            );
        }
    }
}

impl fmt::Debug for BufferMemoryAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMemoryAccount")
            .field("balance", &self.balance())
            .field("bucket", &self.bucket())
            .finish()
    }
}
