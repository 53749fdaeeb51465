// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Bit-exact layouts of the hardware descriptors and doorbell words.
//!
//! Every record is a single little-endian 64-bit word. The layouts are a
//! binary contract with the device and must not be reordered.

use bit_field::BitField;
use bitflags::bitflags;
use nic_base::{NicError, NicResult, PhysAddr};

/// Number of address bits a descriptor can carry.
pub const DESC_ADDR_BITS: usize = 44;
/// Largest transfer length a single transmit descriptor can describe.
pub const TX_DESC_MAX_LEN: usize = (1 << 13) - 1;
/// Largest pointer count the first descriptor of a packet can announce.
pub const TX_MAX_PTRS: usize = (1 << 4) - 1;

const ADDR: core::ops::Range<usize> = 0..DESC_ADDR_BITS;

bitflags! {
    /// Control bits of a transmit descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxFlags: u64 {
        /// Hardware computes the L4 checksum.
        const CKSUM = 1 << 57;
        /// Raise a completion interrupt for this packet.
        const MARK = 1 << 62;
        /// First descriptor of a packet.
        const SOP = 1 << 63;
    }
}

fn check_addr(paddr: PhysAddr) -> NicResult<u64> {
    if paddr >> DESC_ADDR_BITS != 0 {
        return Err(NicError::InvalidInput);
    }
    Ok(paddr)
}

/// A transmit descriptor.
///
/// | bits   | field                                  |
/// |--------|----------------------------------------|
/// | 0..44  | buffer address                         |
/// | 44..57 | transfer length                        |
/// | 57     | checksum enable                        |
/// | 58..62 | pointer count (first descriptor only)  |
/// | 62     | mark                                   |
/// | 63     | start of packet                        |
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TxDesc(pub u64);

impl TxDesc {
    /// Builds a descriptor. `nptrs` is only meaningful with [`TxFlags::SOP`].
    pub fn new(paddr: PhysAddr, len: usize, nptrs: usize, flags: TxFlags) -> NicResult<Self> {
        if len == 0 || len > TX_DESC_MAX_LEN || nptrs > TX_MAX_PTRS {
            return Err(NicError::InvalidInput);
        }
        let mut raw = flags.bits();
        raw.set_bits(ADDR, check_addr(paddr)?);
        raw.set_bits(44..57, len as u64);
        raw.set_bits(58..62, nptrs as u64);
        Ok(Self(raw))
    }

    #[inline]
    pub fn addr(&self) -> PhysAddr {
        self.0.get_bits(ADDR)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.get_bits(44..57) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn nptrs(&self) -> usize {
        self.0.get_bits(58..62) as usize
    }

    #[inline]
    pub fn flags(&self) -> TxFlags {
        TxFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_sop(&self) -> bool {
        self.0.get_bit(63)
    }
}

/// A receive buffer entry posted to the device.
///
/// | bits   | field          |
/// |--------|----------------|
/// | 0..44  | buffer address |
/// | 48..64 | slot index     |
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RxBufEntry(pub u64);

impl RxBufEntry {
    pub fn new(paddr: PhysAddr, slot: usize) -> NicResult<Self> {
        let slot = u16::try_from(slot).map_err(|_| NicError::InvalidInput)?;
        let mut raw = 0u64;
        raw.set_bits(ADDR, check_addr(paddr)?);
        raw.set_bits(48..64, slot as u64);
        Ok(Self(raw))
    }

    #[inline]
    pub fn addr(&self) -> PhysAddr {
        self.0.get_bits(ADDR)
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.0.get_bits(48..64) as usize
    }
}

/// A receive completion entry written by the device.
///
/// | bits   | field                              |
/// |--------|------------------------------------|
/// | 0..16  | segment length                     |
/// | 16..32 | slot index of the consumed buffer  |
/// | 32..36 | packet type                        |
/// | 36..39 | error code, non-zero on error      |
/// | 39     | more segments follow               |
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RxCompletion(pub u64);

impl RxCompletion {
    /// Builds an entry the way the device would.
    pub fn new(len: usize, slot: usize, errors: u8, more: bool) -> Self {
        let mut raw = 0u64;
        raw.set_bits(0..16, (len & 0xffff) as u64);
        raw.set_bits(16..32, (slot & 0xffff) as u64);
        raw.set_bits(36..39, (errors & 0x7) as u64);
        raw.set_bit(39, more);
        Self(raw)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.get_bits(0..16) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.0.get_bits(16..32) as usize
    }

    #[inline]
    pub fn packet_type(&self) -> u8 {
        self.0.get_bits(32..36) as u8
    }

    #[inline]
    pub fn errors(&self) -> u8 {
        self.0.get_bits(36..39) as u8
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.errors() != 0
    }

    #[inline]
    pub fn more(&self) -> bool {
        self.0.get_bit(39)
    }
}

/// A ring position as announced to the device: index plus wrap bit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingPos {
    pub index: u16,
    pub wrap: bool,
}

impl RingPos {
    #[inline]
    pub fn encode(self) -> u64 {
        let mut raw = 0u64;
        raw.set_bits(0..16, self.index as u64);
        raw.set_bit(16, self.wrap);
        raw
    }

    #[inline]
    pub fn decode(raw: u64) -> Self {
        Self {
            index: raw.get_bits(0..16) as u16,
            wrap: raw.get_bit(16),
        }
    }
}

/// Transmit doorbell: new tail in bits 0..16, wrap in bit 16.
pub type TxKick = RingPos;

/// Receive doorbell. Each half is applied by the device only when its
/// valid bit is set.
///
/// | bits   | field                  |
/// |--------|------------------------|
/// | 0..16  | buffer ring tail       |
/// | 16     | buffer ring wrap       |
/// | 17     | buffer tail valid      |
/// | 32..48 | completion ring head   |
/// | 48     | completion ring wrap   |
/// | 49     | completion head valid  |
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxKick {
    pub buf_tail: Option<RingPos>,
    pub cpl_head: Option<RingPos>,
}

impl RxKick {
    pub fn encode(self) -> u64 {
        let mut raw = 0u64;
        if let Some(pos) = self.buf_tail {
            raw.set_bits(0..17, pos.encode());
            raw.set_bit(17, true);
        }
        if let Some(pos) = self.cpl_head {
            raw.set_bits(32..49, pos.encode());
            raw.set_bit(49, true);
        }
        raw
    }

    pub fn decode(raw: u64) -> Self {
        Self {
            buf_tail: raw
                .get_bit(17)
                .then(|| RingPos::decode(raw.get_bits(0..17))),
            cpl_head: raw
                .get_bit(49)
                .then(|| RingPos::decode(raw.get_bits(32..49))),
        }
    }
}
