// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Hardware seams: register access and DMA memory.

use core::ptr::NonNull;

use crate::NicResult;

/// A bus address as seen by the device.
pub type PhysAddr = u64;

/// The direction of a streaming DMA mapping.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DmaDirection {
    /// The device reads the buffer (transmit).
    ToDevice,
    /// The device writes the buffer (receive).
    FromDevice,
}

/// MMIO register access for one function's register window.
///
/// Offsets are byte offsets from the start of the window. Implementations
/// perform volatile accesses with the ordering the bus requires.
pub trait RegisterIo: Send + Sync {
    /// Reads a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Writes a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Reads a 64-bit register.
    fn read64(&self, offset: usize) -> u64;

    /// Writes a 64-bit register.
    fn write64(&self, offset: usize, value: u64);
}

/// DMA memory management and timing primitives provided by the platform.
///
/// # Safety
///
/// `dma_alloc` must return zeroed memory that stays valid and is not
/// handed out again until it is passed back to `dma_dealloc`. `map` must
/// return a bus address through which the device can access exactly the
/// given buffer until `unmap` is called.
pub unsafe trait DmaHal: Send + Sync {
    /// Allocates `size` bytes of zeroed, device-coherent memory aligned to
    /// `align`. Returns the bus address and the CPU pointer.
    fn dma_alloc(&self, size: usize, align: usize) -> Option<(PhysAddr, NonNull<u8>)>;

    /// Frees memory returned by [`DmaHal::dma_alloc`].
    ///
    /// # Safety
    ///
    /// The arguments must be exactly those of a previous successful
    /// allocation, and the memory must not be used afterwards.
    unsafe fn dma_dealloc(&self, paddr: PhysAddr, vaddr: NonNull<u8>, size: usize, align: usize);

    /// Makes `buffer` visible to the device and returns its bus address.
    ///
    /// # Safety
    ///
    /// The buffer must stay alive and unmoved until it is unmapped.
    unsafe fn map(&self, buffer: NonNull<[u8]>, direction: DmaDirection) -> NicResult<PhysAddr>;

    /// Ends a mapping created by [`DmaHal::map`].
    ///
    /// # Safety
    ///
    /// `paddr` and `buffer` must come from the same successful `map` call.
    unsafe fn unmap(&self, paddr: PhysAddr, buffer: NonNull<[u8]>, direction: DmaDirection);

    /// Busy-waits for at least `us` microseconds.
    fn delay_us(&self, us: u64);

    /// A monotonic millisecond clock.
    fn now_ms(&self) -> u64;
}

/// Everything a channel needs from the platform.
pub trait NicHal: RegisterIo + DmaHal {}

impl<T: RegisterIo + DmaHal> NicHal for T {}
