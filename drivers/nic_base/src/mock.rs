// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A software platform for unit testing NIC drivers on the host.
//!
//! Registers are a sparse map of 64-bit values. A register can be declared
//! self-clearing (written bits never read back) or write-one-to-clear
//! (writing a 1 clears the bit, everything else is preserved). Hooks run
//! after a write and play the role of the device reacting to it.
//!
//! DMA memory comes from the host heap, but the device sees it through a
//! small bus address space starting at [`IOVA_BASE`], the way it would
//! behind an IOMMU. Device models reach the memory with
//! [`MockPlatform::read_dma`] and friends.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc},
    boxed::Box,
    collections::BTreeMap,
    vec::Vec,
};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::{DmaDirection, DmaHal, NicError, NicResult, PhysAddr, RegisterIo};

type WriteHook = Box<dyn Fn(&MockPlatform, u64) + Send + Sync>;

/// First bus address handed out. Everything stays well below 2^40.
pub const IOVA_BASE: PhysAddr = 0x10_0000_0000;

// Bus addresses are never reused, so a stale descriptor cannot reach a
// later allocation.
struct IovaSpace {
    next: PhysAddr,
    // bus address -> (host address, length)
    windows: BTreeMap<PhysAddr, (usize, usize)>,
}

impl IovaSpace {
    fn assign(&mut self, host: usize, len: usize, align: usize) -> PhysAddr {
        let base = self.next.next_multiple_of(align.max(8) as u64);
        self.next = base + len.max(1) as PhysAddr;
        self.windows.insert(base, (host, len));
        base
    }

    fn host(&self, paddr: PhysAddr, len: usize) -> Option<usize> {
        let (&base, &(host, size)) = self.windows.range(..=paddr).next_back()?;
        let off = (paddr - base) as usize;
        (off + len <= size).then_some(host + off)
    }
}

/// Register file plus DMA allocator backed by the heap.
pub struct MockPlatform {
    regs: Mutex<BTreeMap<usize, u64>>,
    self_clearing: Mutex<BTreeMap<usize, u64>>,
    write_one_to_clear: Mutex<BTreeMap<usize, u64>>,
    hooks: Mutex<BTreeMap<usize, Vec<WriteHook>>>,
    writes: Mutex<Vec<(usize, u64)>>,
    clock_us: AtomicU64,
    live_regions: AtomicUsize,
    live_mappings: AtomicUsize,
    alloc_budget: AtomicUsize,
    map_budget: AtomicUsize,
    iova: Mutex<IovaSpace>,
}

impl MockPlatform {
    /// Creates an empty platform with unlimited DMA memory.
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(BTreeMap::new()),
            self_clearing: Mutex::new(BTreeMap::new()),
            write_one_to_clear: Mutex::new(BTreeMap::new()),
            hooks: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            clock_us: AtomicU64::new(0),
            live_regions: AtomicUsize::new(0),
            live_mappings: AtomicUsize::new(0),
            alloc_budget: AtomicUsize::new(usize::MAX),
            map_budget: AtomicUsize::new(usize::MAX),
            iova: Mutex::new(IovaSpace {
                next: IOVA_BASE,
                windows: BTreeMap::new(),
            }),
        }
    }

    /// Declares bits of `offset` that the device clears as soon as they are
    /// written.
    pub fn self_clearing(&self, offset: usize, mask: u64) {
        *self.self_clearing.lock().entry(offset).or_default() |= mask;
    }

    /// Declares bits of `offset` that are cleared by writing a 1.
    pub fn write_one_to_clear(&self, offset: usize, mask: u64) {
        *self.write_one_to_clear.lock().entry(offset).or_default() |= mask;
    }

    /// Runs `hook` with the written value after every driver write to
    /// `offset`.
    ///
    /// Hooks must only use the device-side setters (`set_reg`, `set_bits`,
    /// `clear_bits`); driver-side writes from a hook would deadlock.
    pub fn on_write(&self, offset: usize, hook: impl Fn(&MockPlatform, u64) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .entry(offset)
            .or_default()
            .push(Box::new(hook));
    }

    /// Device-side store, bypassing register behaviours and the write log.
    pub fn set_reg(&self, offset: usize, value: u64) {
        self.regs.lock().insert(offset, value);
    }

    /// Device-side read-modify-write that sets `mask`.
    pub fn set_bits(&self, offset: usize, mask: u64) {
        *self.regs.lock().entry(offset).or_default() |= mask;
    }

    /// Device-side read-modify-write that clears `mask`.
    pub fn clear_bits(&self, offset: usize, mask: u64) {
        *self.regs.lock().entry(offset).or_default() &= !mask;
    }

    /// Current value of a register.
    pub fn reg(&self, offset: usize) -> u64 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Every value the driver wrote to `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u64> {
        self.writes
            .lock()
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, val)| *val)
            .collect()
    }

    /// Forgets the write log.
    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Advances the clock.
    pub fn advance_ms(&self, ms: u64) {
        self.clock_us.fetch_add(ms * 1000, Ordering::Relaxed);
    }

    /// Lets only the next `count` DMA allocations succeed.
    pub fn set_alloc_budget(&self, count: usize) {
        self.alloc_budget.store(count, Ordering::Relaxed);
    }

    /// Lets only the next `count` streaming mappings succeed.
    pub fn set_map_budget(&self, count: usize) {
        self.map_budget.store(count, Ordering::Relaxed);
    }

    /// Host address behind `len` bytes at bus address `paddr`, if the range
    /// lies inside one live allocation or mapping.
    pub fn translate(&self, paddr: PhysAddr, len: usize) -> Option<NonNull<u8>> {
        let host = self.iova.lock().host(paddr, len)?;
        NonNull::new(host as *mut u8)
    }

    fn dma_ptr(&self, paddr: PhysAddr, len: usize) -> *mut u8 {
        match self.translate(paddr, len) {
            Some(ptr) => ptr.as_ptr(),
            None => panic!("device access to unmapped bus address {paddr:#x}+{len:#x}"),
        }
    }

    /// Device-side read of a 64-bit word of DMA memory.
    ///
    /// Panics if the address is not mapped, as an IOMMU fault would stop
    /// the device.
    pub fn read_dma(&self, paddr: PhysAddr) -> u64 {
        // SAFETY: the range lies inside a live allocation or mapping.
        unsafe { (self.dma_ptr(paddr, 8) as *const u64).read_unaligned() }
    }

    /// Device-side write of a 64-bit word of DMA memory.
    pub fn write_dma(&self, paddr: PhysAddr, value: u64) {
        // SAFETY: as in `read_dma`.
        unsafe { (self.dma_ptr(paddr, 8) as *mut u64).write_unaligned(value) }
    }

    /// Device-side copy out of DMA memory.
    pub fn read_dma_bytes(&self, paddr: PhysAddr, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        // SAFETY: as in `read_dma`.
        unsafe { core::slice::from_raw_parts(self.dma_ptr(paddr, len), len).to_vec() }
    }

    /// Device-side copy into DMA memory.
    pub fn write_dma_bytes(&self, paddr: PhysAddr, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let dst = self.dma_ptr(paddr, data.len());
        // SAFETY: as in `read_dma`.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) }
    }

    /// Number of coherent regions not yet freed.
    pub fn live_dma_regions(&self) -> usize {
        self.live_regions.load(Ordering::Relaxed)
    }

    /// Number of streaming mappings not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::Relaxed)
    }

    fn store(&self, offset: usize, value: u64) {
        self.writes.lock().push((offset, value));
        let sc = self.self_clearing.lock().get(&offset).copied().unwrap_or(0);
        let w1c = self.write_one_to_clear.lock().get(&offset).copied();
        {
            let mut regs = self.regs.lock();
            let old = regs.get(&offset).copied().unwrap_or(0);
            let new = match w1c {
                Some(mask) => old & !(value & mask),
                None => value,
            };
            regs.insert(offset, new & !sc);
        }
        let hooks = self.hooks.lock();
        if let Some(list) = hooks.get(&offset) {
            for hook in list {
                hook(self, value);
            }
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for MockPlatform {
    fn read32(&self, offset: usize) -> u32 {
        self.reg(offset) as u32
    }

    fn write32(&self, offset: usize, value: u32) {
        self.store(offset, value as u64);
    }

    fn read64(&self, offset: usize) -> u64 {
        self.reg(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.store(offset, value);
    }
}

unsafe impl DmaHal for MockPlatform {
    fn dma_alloc(&self, size: usize, align: usize) -> Option<(PhysAddr, NonNull<u8>)> {
        let budget = self.alloc_budget.load(Ordering::Relaxed);
        if budget == 0 {
            return None;
        }
        if budget != usize::MAX {
            self.alloc_budget.store(budget - 1, Ordering::Relaxed);
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        let paddr = self.iova.lock().assign(ptr.as_ptr() as usize, size, align);
        self.live_regions.fetch_add(1, Ordering::Relaxed);
        Some((paddr, ptr))
    }

    unsafe fn dma_dealloc(&self, paddr: PhysAddr, vaddr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(size, align) {
            self.iova.lock().windows.remove(&paddr);
            unsafe { dealloc(vaddr.as_ptr(), layout) };
            self.live_regions.fetch_sub(1, Ordering::Relaxed);
        }
    }

    unsafe fn map(&self, buffer: NonNull<[u8]>, _direction: DmaDirection) -> NicResult<PhysAddr> {
        let budget = self.map_budget.load(Ordering::Relaxed);
        if budget == 0 {
            return Err(NicError::NoMemory);
        }
        if budget != usize::MAX {
            self.map_budget.store(budget - 1, Ordering::Relaxed);
        }
        let host = buffer.cast::<u8>().as_ptr() as usize;
        let paddr = self.iova.lock().assign(host, buffer.len(), 8);
        self.live_mappings.fetch_add(1, Ordering::Relaxed);
        Ok(paddr)
    }

    unsafe fn unmap(&self, paddr: PhysAddr, _buffer: NonNull<[u8]>, _direction: DmaDirection) {
        if self.iova.lock().windows.remove(&paddr).is_some() {
            self.live_mappings.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn delay_us(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::Relaxed);
    }

    fn now_ms(&self) -> u64 {
        self.clock_us.load(Ordering::Relaxed) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_behaviours() {
        let mock = MockPlatform::new();
        mock.self_clearing(0x10, 1 << 31);
        mock.write64(0x10, (1 << 31) | 0x5);
        assert_eq!(mock.read64(0x10), 0x5);

        mock.write_one_to_clear(0x20, 0b1100);
        mock.set_reg(0x20, 0b1111);
        mock.write64(0x20, 0b0100);
        assert_eq!(mock.read64(0x20), 0b1011);
        assert_eq!(mock.writes_to(0x20), [0b0100]);
    }

    #[test]
    fn hooks_react_to_writes() {
        let mock = MockPlatform::new();
        mock.on_write(0x8, |dev, val| dev.set_bits(0x18, val << 1));
        mock.write32(0x8, 1);
        assert_eq!(mock.read32(0x18), 2);
    }

    #[test]
    fn dma_is_reached_through_bus_addresses() {
        let mock = MockPlatform::new();
        let (paddr, vaddr) = mock.dma_alloc(64, 64).unwrap();
        assert!(paddr >= IOVA_BASE && paddr < 1 << 40);
        assert_eq!(paddr % 64, 0);
        assert_eq!(mock.translate(paddr + 8, 8), NonNull::new(unsafe { vaddr.as_ptr().add(8) }));
        assert_eq!(mock.translate(paddr + 60, 8), None);

        mock.write_dma(paddr + 16, 0x1122_3344_5566_7788);
        assert_eq!(mock.read_dma(paddr + 16), 0x1122_3344_5566_7788);
        mock.write_dma_bytes(paddr, b"abc");
        assert_eq!(mock.read_dma_bytes(paddr, 3), b"abc");

        unsafe { mock.dma_dealloc(paddr, vaddr, 64, 64) };
        assert_eq!(mock.translate(paddr, 8), None);
        assert_eq!(mock.live_dma_regions(), 0);
    }

    #[test]
    fn mappings_get_fresh_bus_addresses() {
        let mock = MockPlatform::new();
        let data = [7u8; 10];
        let buf = NonNull::from(&data[..]);
        let a = unsafe { mock.map(buf, DmaDirection::ToDevice).unwrap() };
        let b = unsafe { mock.map(buf, DmaDirection::ToDevice).unwrap() };
        assert_ne!(a, b);
        assert_eq!(mock.read_dma_bytes(b, 10), data);
        unsafe { mock.unmap(a, buf, DmaDirection::ToDevice) };
        unsafe { mock.unmap(b, buf, DmaDirection::ToDevice) };
        assert_eq!(mock.live_mappings(), 0);

        mock.set_map_budget(0);
        let refused = unsafe { mock.map(buf, DmaDirection::ToDevice) };
        assert_eq!(refused, Err(NicError::NoMemory));
    }

    #[test]
    fn delay_advances_clock() {
        let mock = MockPlatform::new();
        mock.delay_us(2500);
        assert_eq!(mock.now_ms(), 2);
        mock.advance_ms(3);
        assert_eq!(mock.now_ms(), 5);
    }
}
