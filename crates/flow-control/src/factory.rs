// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The watermark buffer factory and its bucket index.
//!
//! The factory creates buffers and per-stream accounts, and maintains the
//! bucket → account-set index that makes targeted shedding possible:
//! `reset_accounts_in_buckets_at_or_above(k)` cancels every stream whose
//! account sits in bucket `k` or higher.
//!
//! # Threading
//! The factory is the only cross-thread object in this crate. Worker
//! threads move their own accounts between bucket sets as balances change;
//! a coordinator thread runs the shedding walk. A single mutex guards the
//! bucket index and is held only across index transitions — resets are
//! delivered after membership is updated, outside the lock.

use crate::account::{BufferMemoryAccount, ResetReason, StreamResetHandler, NUM_BUCKETS};
use crate::error::FlowError;
use crate::watermark::WatermarkBuffer;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Accounts below this balance are not worth tracking (unless a custom
/// threshold is configured).
pub const DEFAULT_TRACKING_THRESHOLD_BYTES: u64 = 256 * 1024;

/// Factory configuration.
///
/// # TOML Format
/// ```toml
/// account_tracking_threshold_bytes = 1048576
/// overflow_multiplier = 5
/// ```
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FactoryConfig {
    /// Minimum balance at which accounts enter the bucket index. Zero
    /// selects the built-in default of 256 KiB; any other value must be a
    /// power of two.
    #[serde(default)]
    pub account_tracking_threshold_bytes: u64,
    /// Multiplies each buffer's high watermark to produce its overflow
    /// watermark. Zero disables overflow firing.
    #[serde(default)]
    pub overflow_multiplier: u32,
}

impl FactoryConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FlowError> {
        toml::from_str(toml_str).map_err(|e| FlowError::Config(format!("TOML parse error: {e}")))
    }
}

/// Stable identity wrapper so bucket sets hash accounts by handle, not
/// contents.
#[derive(Clone)]
struct AccountHandle(Arc<BufferMemoryAccount>);

impl PartialEq for AccountHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AccountHandle {}

impl Hash for AccountHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Shared factory state. Accounts hold a `Weak` to this, so the destruction
/// check below still runs if the factory is dropped while streams live.
pub(crate) struct FactoryInner {
    bitshift: u32,
    overflow_multiplier: u32,
    buckets: Mutex<[HashSet<AccountHandle>; NUM_BUCKETS]>,
}

impl FactoryInner {
    /// Moves `account` between bucket sets. The classes must differ;
    /// either side may be untracked.
    pub(crate) fn update_account_class(
        &self,
        account: &Arc<BufferMemoryAccount>,
        current_class: Option<u32>,
        new_class: Option<u32>,
    ) {
        debug_assert_ne!(
            current_class, new_class,
            "account class update without a class change"
        );
        let handle = AccountHandle(account.clone());
        let mut buckets = self.buckets.lock().expect("bucket index lock poisoned");
        if let Some(current) = current_class {
            let removed = buckets[current as usize].remove(&handle);
            debug_assert!(removed, "account missing from its current bucket set");
        }
        if let Some(new) = new_class {
            let inserted = buckets[new as usize].insert(handle);
            debug_assert!(inserted, "account already present in its new bucket set");
        }
    }

    /// Removes `account` from its bucket set. A no-op for untracked
    /// accounts.
    pub(crate) fn unregister_account(
        &self,
        account: &Arc<BufferMemoryAccount>,
        current_class: Option<u32>,
    ) {
        if let Some(current) = current_class {
            let handle = AccountHandle(account.clone());
            let mut buckets = self.buckets.lock().expect("bucket index lock poisoned");
            let removed = buckets[current as usize].remove(&handle);
            debug_assert!(removed, "account missing from its current bucket set");
        }
    }
}

impl Drop for FactoryInner {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let buckets = self.buckets.lock().expect("bucket index lock poisoned");
            for (idx, set) in buckets.iter().enumerate() {
                debug_assert!(
                    set.is_empty(),
                    "factory destroyed with {} account(s) still tracked in bucket {idx}",
                    set.len()
                );
            }
        }
    }
}

/// Creates watermark buffers and memory accounts, and sheds the heaviest
/// streams on demand.
///
/// Cloning yields another handle to the same factory; clones share the
/// bucket index.
///
/// # Example
/// ```
/// use flow_control::{FactoryConfig, WatermarkBufferFactory};
///
/// let factory = WatermarkBufferFactory::new(FactoryConfig::default()).unwrap();
/// let mut buffer = factory.create_buffer(|| {}, || {}, || {});
/// buffer.set_watermarks(64 * 1024);
/// buffer.add(b"stream data");
/// ```
#[derive(Clone)]
pub struct WatermarkBufferFactory {
    inner: Arc<FactoryInner>,
}

impl WatermarkBufferFactory {
    /// Builds a factory from `config`.
    ///
    /// Fails if the tracking threshold is neither zero nor a power of two
    /// — classification must stay a single shift.
    pub fn new(config: FactoryConfig) -> Result<Self, FlowError> {
        let threshold = config.account_tracking_threshold_bytes;
        if threshold != 0 && !threshold.is_power_of_two() {
            return Err(FlowError::InvalidTrackingThreshold { bytes: threshold });
        }
        let bitshift = if threshold == 0 {
            DEFAULT_TRACKING_THRESHOLD_BYTES.trailing_zeros()
        } else {
            threshold.trailing_zeros()
        };
        Ok(Self {
            inner: Arc::new(FactoryInner {
                bitshift,
                overflow_multiplier: config.overflow_multiplier,
                buckets: Mutex::new(Default::default()),
            }),
        })
    }

    /// `log2` of the effective tracking threshold.
    pub fn bitshift(&self) -> u32 {
        self.inner.bitshift
    }

    /// Creates an unbound watermark buffer wired with the three
    /// flow-control callbacks and this factory's overflow multiplier.
    pub fn create_buffer(
        &self,
        below_low: impl FnMut() + 'static,
        above_high: impl FnMut() + 'static,
        above_overflow: impl FnMut() + 'static,
    ) -> WatermarkBuffer {
        WatermarkBuffer::with_overflow_multiplier(
            self.inner.overflow_multiplier,
            below_low,
            above_high,
            above_overflow,
        )
    }

    /// Creates an account wired to `reset_handler` and stamped with this
    /// factory's classification shift. The account registers itself in
    /// the bucket index as soon as its balance crosses the tracking
    /// threshold.
    pub fn create_account(
        &self,
        reset_handler: Arc<dyn StreamResetHandler>,
    ) -> Arc<BufferMemoryAccount> {
        let account = Arc::new(BufferMemoryAccount::new(
            Arc::downgrade(&self.inner),
            reset_handler,
            self.inner.bitshift,
        ));
        // The self-handle keeps the account reachable through bucket sets
        // until clear_downstream.
        account.set_shared_this(account.clone());
        account
    }

    /// Resets every stream whose account sits in bucket `first_bucket` or
    /// higher. Membership is updated before any reset is delivered, and
    /// the index lock is released before handlers run, so a handler that
    /// tears its stream down re-enters the factory safely.
    ///
    /// # Panics
    /// Panics if `first_bucket` is out of range.
    pub fn reset_accounts_in_buckets_at_or_above(&self, first_bucket: u32) {
        assert!(
            (first_bucket as usize) < NUM_BUCKETS,
            "bucket index {first_bucket} out of range"
        );

        let drained: Vec<(usize, Vec<Arc<BufferMemoryAccount>>)> = {
            let mut buckets = self.inner.buckets.lock().expect("bucket index lock poisoned");
            (first_bucket as usize..NUM_BUCKETS)
                .map(|idx| {
                    let accounts = std::mem::take(&mut buckets[idx])
                        .into_iter()
                        .map(|handle| handle.0)
                        .collect();
                    (idx, accounts)
                })
                .collect()
        };

        for (idx, accounts) in drained {
            tracing::info!("resetting {} stream(s) in bucket {idx}", accounts.len());
            for account in accounts {
                account.mark_untracked();
                account.reset_downstream(ResetReason::OverloadManager);
            }
        }
    }

    /// Number of accounts currently tracked in `bucket`.
    pub fn accounts_in_bucket(&self, bucket: u32) -> usize {
        let buckets = self.inner.buckets.lock().expect("bucket index lock poisoned");
        buckets[bucket as usize].len()
    }

    /// Total accounts currently tracked across all buckets.
    pub fn tracked_accounts(&self) -> usize {
        let buckets = self.inner.buckets.lock().expect("bucket index lock poisoned");
        buckets.iter().map(HashSet::len).sum()
    }
}

impl std::fmt::Debug for WatermarkBufferFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkBufferFactory")
            .field("bitshift", &self.inner.bitshift)
            .field("overflow_multiplier", &self.inner.overflow_multiplier)
            .field("tracked_accounts", &self.tracked_accounts())
            .finish()
    }
}
