// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Descriptor rings and the software state that shadows them.
//!
//! - [`desc`]: bit-exact transmit descriptors, receive buffer and
//!   completion entries, and doorbell words.
//! - [`DescRing`]: head/tail accounting with a reserved gap, handing out
//!   per-slot ownership tokens.
//! - [`ControlBlockPool`]: free/work lists of per-buffer metadata.
//! - [`RxBufPool`] / [`RxBuf`]: reference-counted receive buffers that can be
//!   loaned to upper layers.
//! - [`DescArray`]: a DMA region viewed as an array of 64-bit descriptors.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod buf;
mod cb;
pub mod desc;
mod ring;

use core::sync::atomic::{Ordering, fence};

use nic_base::{DmaRegion, NicHal, NicResult, PhysAddr};

pub use self::{
    buf::{RxBuf, RxBufPool},
    cb::{CbList, Completed, ControlBlockPool},
    ring::{DescRing, MAX_RING_SIZE, Reservation, Retired, Slot},
};

/// Alignment of every descriptor array.
pub const DESC_ALIGN: usize = 64;

/// A DMA region viewed as `len` 64-bit descriptors.
///
/// Writes require a [`Slot`] token, so software only writes descriptors it
/// owns. Reads of device-written entries go through [`DescArray::read_acquire`]
/// after the producer index has been observed.
pub struct DescArray {
    region: DmaRegion,
    len: usize,
}

impl DescArray {
    /// Allocates a zeroed array of `len` descriptors.
    pub fn new(hal: &alloc::sync::Arc<dyn NicHal>, len: usize) -> NicResult<Self> {
        let region = DmaRegion::new(hal, len * 8, DESC_ALIGN)?;
        Ok(Self { region, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of descriptor 0.
    pub fn paddr(&self) -> PhysAddr {
        self.region.paddr()
    }

    /// Writes the descriptor at an owned slot.
    #[inline]
    pub fn write(&mut self, slot: &Slot<'_>, value: u64) {
        self.region.write_u64(slot.index(), value);
    }

    /// Reads a descriptor software wrote itself.
    #[inline]
    pub fn read(&self, index: usize) -> u64 {
        self.region.read_u64(index)
    }

    /// Reads a device-written entry. The acquire fence orders it after the
    /// register read that published the producer index.
    #[inline]
    pub fn read_acquire(&self, index: usize) -> u64 {
        fence(Ordering::Acquire);
        self.region.read_u64(index)
    }

    /// Zeroes every descriptor.
    pub fn zero(&mut self) {
        self.region.zero();
    }

    /// Orders descriptor writes before the doorbell that publishes them.
    #[inline]
    pub fn publish(&self) {
        fence(Ordering::Release);
    }
}
