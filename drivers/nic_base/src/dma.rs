// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Scoped ownership of DMA memory.

use alloc::sync::Arc;
use core::ptr::NonNull;

use log::trace;

use crate::{DmaDirection, NicError, NicHal, NicResult, PhysAddr};

/// A RAII block of device-coherent memory.
///
/// The memory is zeroed on allocation and returned to the platform when the
/// region is dropped, so a failed bring-up releases exactly the regions that
/// were already acquired.
pub struct DmaRegion {
    paddr: PhysAddr,
    vaddr: NonNull<u8>,
    size: usize,
    align: usize,
    hal: Arc<dyn NicHal>,
}

// The region is plain memory owned exclusively by this value.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocates `size` zeroed bytes aligned to `align`.
    pub fn new(hal: &Arc<dyn NicHal>, size: usize, align: usize) -> NicResult<Self> {
        if size == 0 || !align.is_power_of_two() {
            return Err(NicError::InvalidInput);
        }
        let (paddr, vaddr) = hal.dma_alloc(size, align).ok_or(NicError::NoMemory)?;
        trace!("dma region {paddr:#x} size {size:#x}");
        Ok(Self {
            paddr,
            vaddr,
            size,
            align,
            hal: Arc::clone(hal),
        })
    }

    /// Bus address of the first byte.
    pub const fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Always false; zero-sized regions cannot be created.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The platform that owns this memory.
    pub fn hal(&self) -> &Arc<dyn NicHal> {
        &self.hal
    }

    /// The whole region as bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.vaddr.as_ptr(), self.size) }
    }

    /// The whole region as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.vaddr.as_ptr(), self.size) }
    }

    /// Zeroes the region.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Number of 64-bit words in the region.
    pub const fn words(&self) -> usize {
        self.size / 8
    }

    /// Volatile read of the `index`-th 64-bit word.
    ///
    /// Panics if `index` is out of range.
    pub fn read_u64(&self, index: usize) -> u64 {
        assert!(index < self.words(), "dma word {index} out of range");
        unsafe { self.vaddr.cast::<u64>().add(index).read_volatile() }
    }

    /// Volatile write of the `index`-th 64-bit word.
    ///
    /// Panics if `index` is out of range.
    pub fn write_u64(&mut self, index: usize, value: u64) {
        assert!(index < self.words(), "dma word {index} out of range");
        unsafe { self.vaddr.cast::<u64>().add(index).write_volatile(value) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        trace!("dma region {:#x} released", self.paddr);
        unsafe {
            self.hal
                .dma_dealloc(self.paddr, self.vaddr, self.size, self.align)
        };
    }
}

/// A RAII streaming mapping of a buffer owned elsewhere.
///
/// The mapping ends when this value is dropped; the owner of the buffer
/// must keep it alive at least that long.
pub struct DmaMapping {
    paddr: PhysAddr,
    buffer: NonNull<[u8]>,
    direction: DmaDirection,
    hal: Arc<dyn NicHal>,
}

unsafe impl Send for DmaMapping {}
unsafe impl Sync for DmaMapping {}

impl DmaMapping {
    /// Maps `buffer` for the device.
    ///
    /// # Safety
    ///
    /// `buffer` must stay alive and unmoved until the mapping is dropped.
    pub unsafe fn new(
        hal: &Arc<dyn NicHal>,
        buffer: &[u8],
        direction: DmaDirection,
    ) -> NicResult<Self> {
        let buffer = NonNull::from(buffer);
        let paddr = unsafe { hal.map(buffer, direction)? };
        Ok(Self {
            paddr,
            buffer,
            direction,
            hal: Arc::clone(hal),
        })
    }

    /// Bus address of the mapped buffer.
    pub const fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Length of the mapped buffer.
    pub const fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the mapped buffer is empty.
    pub const fn is_empty(&self) -> bool {
        self.buffer.len() == 0
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        unsafe { self.hal.unmap(self.paddr, self.buffer, self.direction) };
    }
}
