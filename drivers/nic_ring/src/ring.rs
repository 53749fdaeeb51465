// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Head/tail accounting of a descriptor ring.
//!
//! [`DescRing`] owns no memory; it only decides which slots software may
//! write. Slots are handed out as borrowed [`Slot`] tokens that live no
//! longer than the [`Reservation`] (producer side) or [`Retired`] batch
//! (consumer side) that created them, so a descriptor is only ever written
//! while software provably owns it.
//!
//! The ring keeps `gap` slots permanently unused. With at most
//! `size - gap` slots in flight, `head == tail` always means "empty".

use core::marker::PhantomData;

use log::trace;
use nic_base::{NicError, NicResult};

use crate::desc::RingPos;

/// Largest supported ring size; indices are carried in 16-bit fields.
pub const MAX_RING_SIZE: usize = 1 << 15;

/// Ownership token for one descriptor slot.
#[derive(Debug)]
pub struct Slot<'a> {
    index: usize,
    _owner: PhantomData<&'a ()>,
}

impl Slot<'_> {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A run of consecutive slots, starting at `start` and wrapping at the ring
/// size.
#[derive(Debug)]
struct Run {
    start: usize,
    count: usize,
    mask: usize,
}

impl Run {
    fn slot(&self, i: usize) -> Option<Slot<'_>> {
        (i < self.count).then(|| Slot {
            index: (self.start + i) & self.mask,
            _owner: PhantomData,
        })
    }

    fn slots(&self) -> impl Iterator<Item = Slot<'_>> + '_ {
        (0..self.count).filter_map(|i| self.slot(i))
    }
}

/// Slots claimed for writing but not yet handed to the device.
///
/// Consumed by [`DescRing::commit`]. Dropping it instead abandons the claim.
#[derive(Debug)]
#[must_use]
pub struct Reservation(Run);

impl Reservation {
    /// Number of slots claimed.
    pub fn len(&self) -> usize {
        self.0.count
    }

    pub fn is_empty(&self) -> bool {
        self.0.count == 0
    }

    /// The `i`-th claimed slot.
    pub fn slot(&self, i: usize) -> Option<Slot<'_>> {
        self.0.slot(i)
    }

    /// All claimed slots in ring order.
    pub fn slots(&self) -> impl Iterator<Item = Slot<'_>> + '_ {
        self.0.slots()
    }
}

/// Slots the device has finished with and software may reclaim.
#[derive(Debug)]
pub struct Retired(Run);

impl Retired {
    /// Number of slots retired.
    pub fn len(&self) -> usize {
        self.0.count
    }

    pub fn is_empty(&self) -> bool {
        self.0.count == 0
    }

    /// All retired slots in ring order.
    pub fn slots(&self) -> impl Iterator<Item = Slot<'_>> + '_ {
        self.0.slots()
    }
}

/// Index state of one descriptor ring.
#[derive(Debug, Clone)]
pub struct DescRing {
    size: usize,
    gap: usize,
    head: usize,
    tail: usize,
    wrap: bool,
    in_use: usize,
}

impl DescRing {
    /// Creates an empty ring of `size` slots (a power of two) that keeps
    /// `gap` slots unused.
    pub fn new(size: usize, gap: usize) -> NicResult<Self> {
        if !size.is_power_of_two() || !(2..=MAX_RING_SIZE).contains(&size) {
            return Err(NicError::InvalidInput);
        }
        if gap == 0 || gap >= size {
            return Err(NicError::InvalidInput);
        }
        Ok(Self {
            size,
            gap,
            head: 0,
            tail: 0,
            wrap: false,
            in_use: 0,
        })
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn gap(&self) -> usize {
        self.gap
    }

    #[inline]
    const fn mask(&self) -> usize {
        self.size - 1
    }

    /// Oldest slot still owned by the device.
    #[inline]
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Next slot software will fill.
    #[inline]
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Tail and wrap bit, as carried by the doorbell.
    #[inline]
    pub fn tail_pos(&self) -> RingPos {
        RingPos {
            index: self.tail as u16,
            wrap: self.wrap,
        }
    }

    /// Slots handed to the device and not yet retired.
    #[inline]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Whether no further slot can be reserved.
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.in_use == self.size - self.gap
    }

    /// Slots that can still be reserved.
    #[inline]
    pub const fn free_slots(&self) -> usize {
        self.size - self.gap - self.in_use
    }

    /// Distance from `from` forward to `to`.
    #[inline]
    pub const fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from) & self.mask()
    }

    /// The slot after `index`.
    #[inline]
    pub const fn next(&self, index: usize) -> usize {
        (index + 1) & self.mask()
    }

    /// Claims `count` slots at the tail.
    ///
    /// Fails with [`NicError::WouldBlock`] when fewer than `count` slots are
    /// free beyond the reserved gap.
    pub fn reserve(&self, count: usize) -> NicResult<Reservation> {
        if count == 0 {
            return Err(NicError::InvalidInput);
        }
        if count > self.free_slots() {
            return Err(NicError::WouldBlock);
        }
        Ok(Reservation(Run {
            start: self.tail,
            count,
            mask: self.mask(),
        }))
    }

    /// Hands reserved slots to the device and returns the new tail.
    pub fn commit(&mut self, reservation: Reservation) -> NicResult<RingPos> {
        let Run { start, count, .. } = reservation.0;
        if start != self.tail || count > self.free_slots() {
            return Err(NicError::BadState);
        }
        let end = self.tail + count;
        if end >= self.size {
            self.wrap = !self.wrap;
        }
        self.tail = end & self.mask();
        self.in_use += count;
        trace!("ring commit {count} tail {} in_use {}", self.tail, self.in_use);
        Ok(self.tail_pos())
    }

    /// Retires every slot from the current head up to (not including)
    /// `new_head`, as reported by the device.
    ///
    /// A head outside the in-flight window is rejected with
    /// [`NicError::BadState`] and leaves the ring untouched.
    pub fn retire_to(&mut self, new_head: usize) -> NicResult<Retired> {
        if new_head >= self.size {
            return Err(NicError::BadState);
        }
        let count = self.distance(self.head, new_head);
        self.retire(count)
    }

    /// Retires the `count` oldest in-flight slots.
    pub fn retire(&mut self, count: usize) -> NicResult<Retired> {
        if count > self.in_use {
            return Err(NicError::BadState);
        }
        let run = Run {
            start: self.head,
            count,
            mask: self.mask(),
        };
        self.head = (self.head + count) & self.mask();
        self.in_use -= count;
        Ok(Retired(run))
    }

    /// Forgets all in-flight slots and rewinds both indices to zero.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.wrap = false;
        self.in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        assert!(DescRing::new(6, 1).is_err());
        assert!(DescRing::new(8, 0).is_err());
        assert!(DescRing::new(8, 8).is_err());
        assert!(DescRing::new(1 << 16, 1).is_err());
        assert!(DescRing::new(8, 1).is_ok());
    }

    #[test]
    fn eighth_send_on_ring_of_eight_is_backpressured() {
        let mut ring = DescRing::new(8, 1).unwrap();
        for _ in 0..7 {
            let res = ring.reserve(1).unwrap();
            ring.commit(res).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.reserve(1).err(), Some(NicError::WouldBlock));
        assert_ne!(ring.head(), ring.tail());
    }

    #[test]
    fn wrap_bit_toggles_on_each_pass() {
        let mut ring = DescRing::new(4, 1).unwrap();
        let mut wraps = 0;
        for _ in 0..12 {
            let res = ring.reserve(1).unwrap();
            let before = ring.tail_pos().wrap;
            let pos = ring.commit(res).unwrap();
            if pos.wrap != before {
                wraps += 1;
                assert_eq!(pos.index, 0);
            }
            let tail = ring.tail();
            ring.retire_to(tail).unwrap();
        }
        assert_eq!(wraps, 3);
    }

    #[test]
    fn reservation_slots_wrap() {
        let mut ring = DescRing::new(8, 1).unwrap();
        let res = ring.reserve(6).unwrap();
        ring.commit(res).unwrap();
        ring.retire(6).unwrap();
        let res = ring.reserve(4).unwrap();
        let idx: std::vec::Vec<usize> = res.slots().map(|s| s.index()).collect();
        assert_eq!(idx, [6, 7, 0, 1]);
        let pos = ring.commit(res).unwrap();
        assert_eq!(pos, RingPos { index: 2, wrap: true });
    }

    #[test]
    fn head_outside_window_is_rejected() {
        let mut ring = DescRing::new(8, 1).unwrap();
        let res = ring.reserve(3).unwrap();
        ring.commit(res).unwrap();
        assert_eq!(ring.retire_to(5).err(), Some(NicError::BadState));
        assert_eq!(ring.retire_to(9).err(), Some(NicError::BadState));
        assert_eq!(ring.in_use(), 3);
        let retired = ring.retire_to(2).unwrap();
        assert_eq!(retired.len(), 2);
        assert_eq!(ring.in_use(), 1);
    }

    #[test]
    fn stale_reservation_cannot_commit() {
        let mut ring = DescRing::new(8, 1).unwrap();
        let stale = ring.reserve(2).unwrap();
        let fresh = ring.reserve(1).unwrap();
        ring.commit(fresh).unwrap();
        assert_eq!(ring.commit(stale).err(), Some(NicError::BadState));
    }

    #[test]
    fn occupancy_bound_holds_under_random_traffic() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut ring = DescRing::new(64, 4).unwrap();
        for _ in 0..10_000 {
            if rng.bool() {
                let want = rng.usize(1..8);
                match ring.reserve(want) {
                    Ok(res) => {
                        ring.commit(res).unwrap();
                    }
                    Err(err) => {
                        assert_eq!(err, NicError::WouldBlock);
                        assert!(ring.free_slots() < want);
                    }
                }
            } else {
                let done = rng.usize(0..=ring.in_use());
                let new_head = (ring.head() + done) % ring.size();
                ring.retire_to(new_head).unwrap();
            }
            let occupied = ring.distance(ring.head(), ring.tail());
            assert_eq!(occupied, ring.in_use());
            assert!(occupied <= ring.size() - ring.gap());
            assert_eq!(ring.is_empty(), ring.head() == ring.tail());
        }
    }
}
