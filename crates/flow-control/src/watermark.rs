// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Watermark buffers: the flow-control primitive under every stream.
//!
//! A [`WatermarkBuffer`] wraps an [`OwnedBuffer`] and re-checks three
//! byte-length thresholds after every mutation:
//!
//! - crossing **above high** fires `above_high` once (edge-triggered);
//! - draining back **to or below low** (`high / 2`) fires `below_low` once;
//! - crossing **above overflow** (`multiplier × high`) fires
//!   `above_overflow` at most once in the buffer's lifetime.
//!
//! Callbacks are invoked inline from the mutating operation. They must be
//! cheap — post work to the stream's scheduler rather than doing it here —
//! and must not mutate the buffer that fired them.
//!
//! With no call to [`set_watermarks`](WatermarkBuffer::set_watermarks)
//! (or after `set_watermarks(0)`) the buffer is a plain byte buffer and
//! never fires.

use crate::account::BufferMemoryAccount;
use buffer_core::{
    round_up_to_multiple, OwnedBuffer, SliceData, DEFAULT_READ_RESERVATION_SIZE,
    DEFAULT_SLICE_SIZE,
};
use std::fmt;
use std::sync::Arc;

/// The three flow-control callbacks wired at construction.
struct Callbacks {
    below_low: Box<dyn FnMut()>,
    above_high: Box<dyn FnMut()>,
    above_overflow: Box<dyn FnMut()>,
}

/// Threshold configuration and edge-trigger state.
struct WatermarkState {
    /// 0 disables watermarking entirely.
    high: u32,
    /// Always `high / 2`.
    low: u32,
    /// `overflow_multiplier × high`; 0 disables overflow firing.
    overflow: u32,
    overflow_multiplier: u32,
    /// True between an `above_high` firing and the next `below_low`.
    above_high_fired: bool,
    /// Latched on the first overflow firing, never cleared.
    above_overflow_fired: bool,
}

impl WatermarkState {
    fn new(overflow_multiplier: u32) -> Self {
        Self {
            high: 0,
            low: 0,
            overflow: 0,
            overflow_multiplier,
            above_high_fired: false,
            above_overflow_fired: false,
        }
    }

    /// Run after any operation that can grow the buffer.
    fn check_high_and_overflow(&mut self, length: u64, callbacks: &mut Callbacks) {
        if self.high == 0 || length <= u64::from(self.high) {
            return;
        }

        if !self.above_high_fired {
            self.above_high_fired = true;
            (callbacks.above_high)();
        }

        if self.overflow != 0 && !self.above_overflow_fired && length > u64::from(self.overflow) {
            self.above_overflow_fired = true;
            (callbacks.above_overflow)();
        }
    }

    /// Run after any operation that can shrink the buffer.
    ///
    /// The `high == 0` arm lets `set_watermarks(0)` release a latched
    /// high state.
    fn check_low(&mut self, length: u64, callbacks: &mut Callbacks) {
        if !self.above_high_fired || (self.high != 0 && length > u64::from(self.low)) {
            return;
        }

        self.above_high_fired = false;
        (callbacks.below_low)();
    }
}

/// A byte buffer that raises back-pressure signals as it fills and drains.
///
/// # Example
/// ```
/// use flow_control::WatermarkBuffer;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let paused = Rc::new(Cell::new(false));
/// let (p1, p2) = (paused.clone(), paused.clone());
/// let mut buf = WatermarkBuffer::new(
///     move || p1.set(false), // below low: resume reading
///     move || p2.set(true),  // above high: pause reading
///     || {},                 // overflow: disabled without a multiplier
/// );
/// buf.set_watermarks(100);
///
/// buf.add(&[0u8; 150]);
/// assert!(paused.get());
/// buf.drain(120);
/// assert!(!paused.get());
/// ```
pub struct WatermarkBuffer {
    inner: OwnedBuffer,
    state: WatermarkState,
    callbacks: Callbacks,
    account: Option<Arc<BufferMemoryAccount>>,
}

impl WatermarkBuffer {
    /// Creates a buffer with watermarking disabled until
    /// [`set_watermarks`](Self::set_watermarks) is called.
    pub fn new(
        below_low: impl FnMut() + 'static,
        above_high: impl FnMut() + 'static,
        above_overflow: impl FnMut() + 'static,
    ) -> Self {
        Self::with_overflow_multiplier(0, below_low, above_high, above_overflow)
    }

    /// Like [`new`](Self::new), with the overflow watermark set to
    /// `multiplier × high`. A zero multiplier disables overflow firing.
    pub fn with_overflow_multiplier(
        multiplier: u32,
        below_low: impl FnMut() + 'static,
        above_high: impl FnMut() + 'static,
        above_overflow: impl FnMut() + 'static,
    ) -> Self {
        Self {
            inner: OwnedBuffer::new(),
            state: WatermarkState::new(multiplier),
            callbacks: Callbacks {
                below_low: Box::new(below_low),
                above_high: Box::new(above_high),
                above_overflow: Box::new(above_overflow),
            },
            account: None,
        }
    }

    /// Current byte count.
    pub fn length(&self) -> u64 {
        self.inner.length()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The configured high watermark; 0 means watermarking is disabled.
    pub fn high_watermark(&self) -> u32 {
        self.state.high
    }

    /// True if the high-watermark callback has fired more recently than
    /// the low-watermark callback.
    pub fn high_watermark_triggered(&self) -> bool {
        self.state.above_high_fired
    }

    /// Binds `account`: from here on, growth charges it and shrinkage
    /// credits it. Bytes already buffered are charged immediately.
    ///
    /// # Panics
    /// Panics if the buffer is already bound — a buffer binds at most one
    /// account in its lifetime.
    pub fn bind_account(&mut self, account: Arc<BufferMemoryAccount>) {
        assert!(
            self.account.is_none(),
            "buffer is already bound to an account"
        );
        let length = self.inner.length();
        if length > 0 {
            account.charge(length);
        }
        self.account = Some(account);
    }

    /// Sets the high watermark; low is derived as `high / 2` and overflow
    /// as `multiplier × high`. All three conditions are re-evaluated
    /// immediately, so a buffer already past the new thresholds fires now,
    /// and `set_watermarks(0)` releases a latched high state.
    pub fn set_watermarks(&mut self, high_watermark: u32) {
        let mut multiplier = self.state.overflow_multiplier;
        if multiplier > 0 && u64::from(multiplier) * u64::from(high_watermark) > u64::from(u32::MAX)
        {
            tracing::debug!(
                multiplier,
                high_watermark,
                "overflow multiplier times high watermark exceeds the u32 range; \
                 disabling the overflow watermark for this buffer"
            );
            multiplier = 0;
        }
        self.state.low = high_watermark / 2;
        self.state.high = high_watermark;
        self.state.overflow = multiplier * high_watermark;
        self.check_high_and_overflow();
        self.check_low();
    }

    /// Appends `data` to the back of the buffer.
    pub fn add(&mut self, data: impl AsRef<[u8]>) {
        let old = self.inner.length();
        self.inner.add(data.as_ref());
        self.settle_account(old);
        self.check_high_and_overflow();
    }

    /// Appends a copy of `other`'s contents.
    pub fn add_buffer(&mut self, other: &OwnedBuffer) {
        let old = self.inner.length();
        self.inner.add_buffer(other);
        self.settle_account(old);
        self.check_high_and_overflow();
    }

    /// Inserts `data` at the front of the buffer.
    pub fn prepend(&mut self, data: impl AsRef<[u8]>) {
        let old = self.inner.length();
        self.inner.prepend(data.as_ref());
        self.settle_account(old);
        self.check_high_and_overflow();
    }

    /// Splices the contents of `other` to the front of this buffer,
    /// draining it.
    pub fn prepend_buffer(&mut self, other: &mut OwnedBuffer) {
        let old = self.inner.length();
        self.inner.prepend_buffer(other);
        self.settle_account(old);
        self.check_high_and_overflow();
    }

    /// Removes `size` bytes from the front.
    ///
    /// # Panics
    /// Panics if `size` exceeds the buffer length.
    pub fn drain(&mut self, size: u64) {
        let old = self.inner.length();
        self.inner.drain(size);
        self.settle_account(old);
        self.check_low();
    }

    /// Moves all of `other`'s contents to the back of this buffer. Bytes
    /// leave `other`'s account (if bound) and are charged to this
    /// buffer's account; both buffers re-check their watermarks.
    pub fn move_all_from(&mut self, other: &mut WatermarkBuffer) {
        let old_self = self.inner.length();
        let old_other = other.inner.length();
        self.inner.move_all_from(&mut other.inner);
        other.settle_account(old_other);
        self.settle_account(old_self);
        other.check_low();
        self.check_high_and_overflow();
    }

    /// Moves up to `size` bytes from the front of `other` to the back of
    /// this buffer.
    pub fn move_from(&mut self, other: &mut WatermarkBuffer, size: u64) {
        let old_self = self.inner.length();
        let old_other = other.inner.length();
        self.inner.move_from(&mut other.inner, size);
        other.settle_account(old_other);
        self.settle_account(old_self);
        other.check_low();
        self.check_high_and_overflow();
    }

    /// Detaches the front slice, or `None` if the buffer is empty.
    pub fn extract_front_slice(&mut self) -> Option<SliceData> {
        let old = self.inner.length();
        let slice = self.inner.extract_front_slice();
        self.settle_account(old);
        self.check_low();
        slice
    }

    /// Re-checks the low watermark without changing the buffer. Codecs
    /// call this after handing slices onward outside the usual drain
    /// path.
    pub fn post_process(&mut self) {
        self.check_low();
    }

    /// Reserves scratch space for a scatter read, bounded by the headroom
    /// below the high watermark so a full read does not blow far past it.
    ///
    /// The reservation is never empty: at or above the high watermark it
    /// still spans one slice, since the underlying API forbids zero-length
    /// reservations.
    pub fn reserve_for_read(&mut self) -> ReadReservation<'_> {
        let adjusted = self.adjusted_reservation_length();
        let WatermarkBuffer {
            inner,
            state,
            callbacks,
            account,
        } = self;
        ReadReservation {
            reservation: inner.reserve_with_max_length(adjusted),
            state,
            callbacks,
            account: account.as_ref(),
        }
    }

    fn adjusted_reservation_length(&self) -> u64 {
        let preferred = DEFAULT_READ_RESERVATION_SIZE;
        if self.state.high == 0 || preferred == 0 {
            return preferred;
        }
        let current = self.inner.length();
        let high = u64::from(self.state.high);
        if current >= high {
            DEFAULT_SLICE_SIZE as u64
        } else {
            round_up_to_multiple(high - current, DEFAULT_SLICE_SIZE as u64).min(preferred)
        }
    }

    /// Copies the contents into a contiguous vector, for tests and
    /// diagnostics.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.to_vec()
    }

    /// Charges or credits the bound account with the length delta of the
    /// mutation that just ran. Delta accounting is what makes untagged
    /// bytes become tagged the moment they enter a bound buffer.
    fn settle_account(&mut self, old_length: u64) {
        let new_length = self.inner.length();
        if let Some(account) = &self.account {
            if new_length > old_length {
                account.charge(new_length - old_length);
            } else if old_length > new_length {
                account.credit(old_length - new_length);
            }
        }
    }

    fn check_high_and_overflow(&mut self) {
        let length = self.inner.length();
        self.state
            .check_high_and_overflow(length, &mut self.callbacks);
    }

    fn check_low(&mut self) {
        let length = self.inner.length();
        self.state.check_low(length, &mut self.callbacks);
    }
}

impl Drop for WatermarkBuffer {
    fn drop(&mut self) {
        // The buffer's contribution goes back to the account before the
        // reference is released.
        if let Some(account) = self.account.take() {
            let length = self.inner.length();
            if length > 0 {
                account.credit(length);
            }
        }
    }
}

impl fmt::Debug for WatermarkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkBuffer")
            .field("length", &self.length())
            .field("high_watermark", &self.state.high)
            .field("high_watermark_triggered", &self.state.above_high_fired)
            .field("bound", &self.account.is_some())
            .finish()
    }
}

/// A scatter-read reservation against a [`WatermarkBuffer`].
///
/// Committing re-checks the high and overflow watermarks and charges the
/// bound account, exactly as a direct `add` would.
pub struct ReadReservation<'a> {
    reservation: buffer_core::Reservation<'a>,
    state: &'a mut WatermarkState,
    callbacks: &'a mut Callbacks,
    account: Option<&'a Arc<BufferMemoryAccount>>,
}

impl ReadReservation<'_> {
    /// Total writable capacity.
    pub fn capacity(&self) -> u64 {
        self.reservation.capacity()
    }

    /// The writable slabs.
    pub fn slabs_mut(&mut self) -> &mut [Vec<u8>] {
        self.reservation.slabs_mut()
    }

    /// Fills the reservation sequentially from `reader`; see
    /// [`buffer_core::Reservation::read_from`].
    pub fn read_from<R: std::io::Read>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        self.reservation.read_from(reader)
    }

    /// Commits the first `length` reserved bytes into the buffer.
    pub fn commit(self, length: u64) {
        let new_length = self.reservation.commit(length);
        if length > 0 {
            if let Some(account) = self.account {
                account.charge(length);
            }
        }
        self.state.check_high_and_overflow(new_length, self.callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FireCounts {
        low: Rc<Cell<u32>>,
        high: Rc<Cell<u32>>,
        overflow: Rc<Cell<u32>>,
    }

    fn counting_buffer(multiplier: u32) -> (WatermarkBuffer, FireCounts) {
        let counts = FireCounts {
            low: Rc::new(Cell::new(0)),
            high: Rc::new(Cell::new(0)),
            overflow: Rc::new(Cell::new(0)),
        };
        let (low, high, overflow) = (
            counts.low.clone(),
            counts.high.clone(),
            counts.overflow.clone(),
        );
        let buf = WatermarkBuffer::with_overflow_multiplier(
            multiplier,
            move || low.set(low.get() + 1),
            move || high.set(high.get() + 1),
            move || overflow.set(overflow.get() + 1),
        );
        (buf, counts)
    }

    #[test]
    fn test_high_low_cycle() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(100); // low = 50.

        buf.add(vec![0u8; 120]); // 120: crosses high.
        assert_eq!(counts.high.get(), 1);
        assert!(buf.high_watermark_triggered());

        buf.add(vec![0u8; 10]); // 130: still latched, no refire.
        assert_eq!(counts.high.get(), 1);

        buf.drain(75); // 55: above low.
        assert_eq!(counts.low.get(), 0);

        buf.drain(10); // 45: at or below low.
        assert_eq!(counts.low.get(), 1);
        assert!(!buf.high_watermark_triggered());

        buf.add(vec![0u8; 60]); // 105: crosses high again.
        assert_eq!(counts.high.get(), 2);
        assert_eq!(counts.overflow.get(), 0);
    }

    #[test]
    fn test_exactly_at_high_does_not_fire() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(100);
        buf.add(vec![0u8; 100]);
        assert_eq!(counts.high.get(), 0);
        buf.add(b"x");
        assert_eq!(counts.high.get(), 1);
    }

    #[test]
    fn test_exactly_at_low_releases() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(100);
        buf.add(vec![0u8; 101]);
        assert_eq!(counts.high.get(), 1);
        buf.drain(51); // Exactly 50 = low.
        assert_eq!(counts.low.get(), 1);
    }

    #[test]
    fn test_overflow_fires_once_and_latches() {
        let (mut buf, counts) = counting_buffer(3);
        buf.set_watermarks(100); // overflow = 300.

        buf.add(vec![0u8; 350]);
        assert_eq!(counts.high.get(), 1);
        assert_eq!(counts.overflow.get(), 1);

        buf.drain(300); // 50: releases high.
        assert_eq!(counts.low.get(), 1);

        buf.add(vec![0u8; 400]); // 450: high refires, overflow stays latched.
        assert_eq!(counts.high.get(), 2);
        assert_eq!(counts.overflow.get(), 1);
    }

    #[test]
    fn test_disabled_watermarks_never_fire() {
        let (mut buf, counts) = counting_buffer(3);
        buf.add(vec![0u8; 1 << 20]);
        buf.drain(1 << 20);
        assert_eq!(counts.low.get(), 0);
        assert_eq!(counts.high.get(), 0);
        assert_eq!(counts.overflow.get(), 0);
    }

    #[test]
    fn test_set_watermarks_zero_releases_latched_high() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(10);
        buf.add(vec![0u8; 20]);
        assert_eq!(counts.high.get(), 1);

        buf.set_watermarks(0);
        assert_eq!(counts.low.get(), 1);
        assert!(!buf.high_watermark_triggered());

        // Fully disabled from here on.
        buf.add(vec![0u8; 1000]);
        assert_eq!(counts.high.get(), 1);
    }

    #[test]
    fn test_set_watermarks_below_current_length_fires_immediately() {
        let (mut buf, counts) = counting_buffer(0);
        buf.add(vec![0u8; 80]);
        assert_eq!(counts.high.get(), 0);
        buf.set_watermarks(50);
        assert_eq!(counts.high.get(), 1);
    }

    #[test]
    fn test_multiplier_overflow_disables_overflow_watermark() {
        let (mut buf, counts) = counting_buffer(u32::MAX);
        buf.set_watermarks(u32::MAX);

        // High still works; overflow was disabled rather than wrapping.
        buf.add(vec![0u8; 1]);
        assert_eq!(counts.overflow.get(), 0);
        assert_eq!(counts.high.get(), 0);
    }

    #[test]
    fn test_multiplier_one_times_max_high_is_kept() {
        let (mut buf, counts) = counting_buffer(1);
        buf.set_watermarks(1000);
        buf.add(vec![0u8; 1001]);
        assert_eq!(counts.high.get(), 1);
        assert_eq!(counts.overflow.get(), 1);
    }

    #[test]
    fn test_prepend_checks_high() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(10);
        buf.prepend(vec![0u8; 20]);
        assert_eq!(counts.high.get(), 1);
    }

    #[test]
    fn test_move_transfers_and_checks_both_sides() {
        let (mut src, src_counts) = counting_buffer(0);
        let (mut dst, dst_counts) = counting_buffer(0);
        src.set_watermarks(100);
        dst.set_watermarks(100);

        src.add(vec![0u8; 150]);
        assert_eq!(src_counts.high.get(), 1);

        dst.move_all_from(&mut src);
        assert!(src.is_empty());
        assert_eq!(src_counts.low.get(), 1);
        assert_eq!(dst_counts.high.get(), 1);
        assert_eq!(dst.length(), 150);
    }

    #[test]
    fn test_move_from_partial() {
        let (mut src, _) = counting_buffer(0);
        let (mut dst, _) = counting_buffer(0);
        src.add(b"abcdef");
        dst.move_from(&mut src, 4);
        assert_eq!(dst.to_vec(), b"abcd");
        assert_eq!(src.to_vec(), b"ef");
    }

    #[test]
    fn test_extract_front_slice_checks_low() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(100);
        buf.prepend(vec![0u8; 10]);
        buf.prepend(vec![0u8; 120]);
        assert_eq!(counts.high.get(), 1);

        let front = buf.extract_front_slice().unwrap();
        assert_eq!(front.len(), 120);
        assert_eq!(counts.low.get(), 1);
    }

    #[test]
    fn test_post_process_checks_low() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(100);
        buf.add(vec![0u8; 150]);
        buf.post_process(); // Still above low: nothing.
        assert_eq!(counts.low.get(), 0);

        buf.drain(150);
        assert_eq!(counts.low.get(), 1);
        buf.post_process(); // Already released: nothing.
        assert_eq!(counts.low.get(), 1);
    }

    #[test]
    fn test_reservation_sized_to_headroom() {
        const KIB: u64 = 1024;
        let (mut buf, _) = counting_buffer(0);
        buf.set_watermarks(16 * KIB as u32);
        buf.add(vec![0u8; 12 * KIB as usize]);

        // Headroom is 4 KiB; preferred (64 KiB) is clamped down to it.
        let reservation = buf.reserve_for_read();
        assert_eq!(reservation.capacity(), 4 * KIB);
    }

    #[test]
    fn test_reservation_over_high_still_spans_one_slice() {
        let (mut buf, _) = counting_buffer(0);
        buf.set_watermarks(1000);
        buf.add(vec![0u8; 2000]);

        let reservation = buf.reserve_for_read();
        assert_eq!(reservation.capacity(), DEFAULT_SLICE_SIZE as u64);
    }

    #[test]
    fn test_reservation_without_watermarks_uses_preferred() {
        let (mut buf, _) = counting_buffer(0);
        let reservation = buf.reserve_for_read();
        assert_eq!(reservation.capacity(), DEFAULT_READ_RESERVATION_SIZE);
    }

    #[test]
    fn test_reservation_commit_fires_high() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(1000);

        let mut reservation = buf.reserve_for_read();
        let n = reservation
            .read_from(&mut &vec![9u8; 1500][..])
            .unwrap();
        reservation.commit(n as u64);

        assert!(buf.length() > 1000);
        assert_eq!(counts.high.get(), 1);
    }

    #[test]
    fn test_reservation_drop_without_commit_is_inert() {
        let (mut buf, counts) = counting_buffer(0);
        buf.set_watermarks(10);
        {
            let _reservation = buf.reserve_for_read();
        }
        assert_eq!(buf.length(), 0);
        assert_eq!(counts.high.get(), 0);
    }
}
