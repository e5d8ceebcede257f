// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reservation/commit protocol for scatter reads.
//!
//! A [`Reservation`] is pre-allocated, not-yet-committed scratch space.
//! The caller writes into the reserved slabs (typically from a socket
//! read), then calls [`commit`](Reservation::commit) with the number of
//! bytes actually produced. Only committed bytes enter the buffer;
//! dropping a reservation without committing discards it.

use crate::{OwnedBuffer, DEFAULT_SLICE_SIZE};

/// Writable scratch space reserved against an [`OwnedBuffer`].
///
/// # Example
/// ```
/// use buffer_core::OwnedBuffer;
///
/// let mut buf = OwnedBuffer::new();
/// let mut reservation = buf.reserve_with_max_length(100);
/// let n = reservation.read_from(&mut &b"from the wire"[..]).unwrap();
/// reservation.commit(n as u64);
/// assert_eq!(buf.to_vec(), b"from the wire");
/// ```
#[derive(Debug)]
pub struct Reservation<'a> {
    buffer: &'a mut OwnedBuffer,
    /// Zero-filled blocks of `DEFAULT_SLICE_SIZE` bytes each.
    slabs: Vec<Vec<u8>>,
    capacity: u64,
}

impl<'a> Reservation<'a> {
    pub(crate) fn new(buffer: &'a mut OwnedBuffer, max_length: u64) -> Self {
        // Reservations are never empty: round up to whole slices and keep
        // at least one.
        let num_slabs = (max_length.div_ceil(DEFAULT_SLICE_SIZE as u64)).max(1);
        let slabs = (0..num_slabs)
            .map(|_| vec![0u8; DEFAULT_SLICE_SIZE])
            .collect();
        Self {
            buffer,
            slabs,
            capacity: num_slabs * DEFAULT_SLICE_SIZE as u64,
        }
    }

    /// Total writable capacity across all slabs.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The writable slabs, for scatter-read APIs that want raw blocks.
    pub fn slabs_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.slabs
    }

    /// Fills the reservation sequentially from `reader`, returning the
    /// total number of bytes read. Stops at end-of-input or when the
    /// reservation is full.
    pub fn read_from<R: std::io::Read>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        let mut total = 0;
        for slab in &mut self.slabs {
            let mut filled = 0;
            while filled < slab.len() {
                let n = reader.read(&mut slab[filled..])?;
                if n == 0 {
                    return Ok(total + filled);
                }
                filled += n;
            }
            total += filled;
        }
        Ok(total)
    }

    /// Commits the first `length` reserved bytes to the buffer, consuming
    /// the reservation. Returns the buffer's new length.
    ///
    /// # Panics
    /// Panics if `length` exceeds [`capacity()`](Self::capacity).
    pub fn commit(self, length: u64) -> u64 {
        assert!(
            length <= self.capacity,
            "commit of {length} bytes exceeds reserved capacity {}",
            self.capacity
        );
        let mut remaining = length as usize;
        for mut slab in self.slabs {
            if remaining == 0 {
                break;
            }
            if remaining < slab.len() {
                slab.truncate(remaining);
            }
            remaining -= slab.len();
            self.buffer.append_filled_block(slab);
        }
        self.buffer.length()
    }
}
