// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use alloc::{sync::Arc, vec::Vec};

use nic_base::{DmaRegion, NicError, NicHal, NicResult, PhysAddr};
use spin::Mutex;

const MIN_BUFFER_LEN: usize = 64;
const MAX_BUFFER_LEN: usize = 65536;
const BUFFER_ALIGN: usize = 64;

/// A pool of receive buffers carved out of one DMA region.
///
/// It divides a large memory into several equal parts for each buffer.
pub struct RxBufPool {
    slot_count: usize,
    buf_len: usize,
    region: DmaRegion,
    free_offsets: Mutex<Vec<usize>>,
}

impl RxBufPool {
    /// Creates a pool of `slot_count` buffers of `buf_len` bytes each.
    pub fn new(hal: &Arc<dyn NicHal>, slot_count: usize, buf_len: usize) -> NicResult<Arc<Self>> {
        if slot_count == 0 {
            return Err(NicError::InvalidInput);
        }
        if !(MIN_BUFFER_LEN..=MAX_BUFFER_LEN).contains(&buf_len) || buf_len % BUFFER_ALIGN != 0 {
            return Err(NicError::InvalidInput);
        }
        let region = DmaRegion::new(hal, slot_count * buf_len, BUFFER_ALIGN)?;
        let free_offsets = (0..slot_count).rev().map(|i| i * buf_len).collect();
        Ok(Arc::new(Self {
            slot_count,
            buf_len,
            region,
            free_offsets: Mutex::new(free_offsets),
        }))
    }

    /// Returns the capacity of the pool.
    pub const fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Returns the length of each buffer.
    pub const fn buffer_len(&self) -> usize {
        self.buf_len
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.free_offsets.lock().len()
    }

    /// Allocates a buffer from the pool.
    ///
    /// Returns `None` if no buffer is available.
    pub fn alloc(self: &Arc<Self>) -> Option<RxBuf> {
        let offset = self.free_offsets.lock().pop()?;
        Some(RxBuf(Arc::new(RxBufInner {
            offset,
            pool: Arc::clone(self),
        })))
    }

    /// Deallocates a buffer at the given offset.
    ///
    /// `offset` must be a multiple of `buf_len`.
    fn release_offset(&self, offset: usize) {
        debug_assert_eq!(offset % self.buf_len, 0);
        self.free_offsets.lock().push(offset);
    }
}

struct RxBufInner {
    offset: usize,
    pool: Arc<RxBufPool>,
}

impl Drop for RxBufInner {
    /// Returns the buffer to its [`RxBufPool`].
    fn drop(&mut self) {
        self.pool.release_offset(self.offset);
    }
}

/// A reference-counted receive buffer.
///
/// Cloning a buffer loans it: the memory goes back to the pool only when
/// the ring and every borrower have dropped their handle.
#[derive(Clone)]
pub struct RxBuf(Arc<RxBufInner>);

impl RxBuf {
    /// Bus address of the buffer.
    pub fn paddr(&self) -> PhysAddr {
        self.0.pool.region.paddr() + self.0.offset as u64
    }

    /// Capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.0.pool.buf_len
    }

    /// `len` bytes starting at `offset`, clamped to the buffer.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let cap = self.capacity();
        let start = offset.min(cap);
        let end = start.saturating_add(len).min(cap);
        let base = self.0.offset;
        &self.0.pool.region.as_slice()[base + start..base + end]
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl core::fmt::Debug for RxBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RxBuf")
            .field("paddr", &self.paddr())
            .field("refs", &self.ref_count())
            .finish()
    }
}
