// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-channel register map.
//!
//! Transmit channels start at [`TX_BASE`], receive channels at [`RX_BASE`],
//! each channel occupying [`CHANNEL_STRIDE`] bytes.

use bit_field::BitField;
use bitflags::bitflags;
use nic_base::PhysAddr;

pub const TX_BASE: usize = 0x0000;
pub const RX_BASE: usize = 0x8000;
pub const CHANNEL_STRIDE: usize = 0x200;

/// Ring base address and length.
pub const TDC_RNG_CFG: usize = 0x00;
/// Device-maintained head: index in bits 0..16, wrap in bit 16.
pub const TDC_RNG_HEAD: usize = 0x08;
/// Doorbell.
pub const TDC_KICK: usize = 0x10;
/// Error status, write-one-to-clear.
pub const TDC_CS: usize = 0x18;
pub const TDC_INTR_MASK: usize = 0x20;
/// Writing error bits here makes the device raise them in [`TDC_CS`].
pub const TDC_INTR_DBG: usize = 0x28;
pub const TDC_CTL: usize = 0x30;

pub const RDC_BUF_CFG: usize = 0x00;
pub const RDC_CPL_CFG: usize = 0x08;
pub const RDC_KICK: usize = 0x10;
/// Completion tail in bits 0..16, buffer head in bits 16..32, error bits
/// above (write-one-to-clear).
pub const RDC_CTL_STAT: usize = 0x18;
pub const RDC_INTR_MASK: usize = 0x20;
pub const RDC_INTR_DBG: usize = 0x28;
pub const RDC_CTL: usize = 0x30;
/// Buffer size in bits 0..16, bytes the device skips before the frame in
/// bits 16..24.
pub const RDC_BUF_SIZE: usize = 0x38;

pub const INTR_MASK_ALL: u64 = u64::MAX;

/// Register offset of `reg` for transmit channel `index`.
#[inline]
pub const fn tx_reg(index: usize, reg: usize) -> usize {
    TX_BASE + index * CHANNEL_STRIDE + reg
}

/// Register offset of `reg` for receive channel `index`.
#[inline]
pub const fn rx_reg(index: usize, reg: usize) -> usize {
    RX_BASE + index * CHANNEL_STRIDE + reg
}

/// Encodes a ring configuration word: base address in bits 0..44, length
/// in units of eight descriptors in bits 48..64.
pub fn ring_cfg(paddr: PhysAddr, len: usize) -> u64 {
    let mut raw = paddr & ((1 << 44) - 1);
    raw.set_bits(48..64, ((len / 8) & 0xffff) as u64);
    raw
}

/// Inverse of [`ring_cfg`].
pub fn ring_cfg_decode(raw: u64) -> (PhysAddr, usize) {
    (raw.get_bits(0..44), raw.get_bits(48..64) as usize * 8)
}

bitflags! {
    /// Transmit channel control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxCtl: u64 {
        /// Set by the device once it has stopped fetching descriptors.
        const STOP_DONE = 1 << 27;
        /// Stop processing the ring.
        const STOP = 1 << 28;
        /// Reset the channel; self-clearing when done.
        const RST = 1 << 31;
    }
}

bitflags! {
    /// Transmit error status bits of [`TDC_CS`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxErr: u64 {
        const PKT_PRT_ERR = 1 << 0;
        const CONF_PART_ERR = 1 << 1;
        const NACK_PKT_RD = 1 << 2;
        const NACK_PREF = 1 << 3;
        const PREF_BUF_PAR_ERR = 1 << 4;
        const TX_RING_OFLOW = 1 << 5;
        const PKT_SIZE_ERR = 1 << 6;
        const MBOX_ERR = 1 << 7;
        const DESC_NPTR_ERR = 1 << 8;
        const DESC_LEN_ERR = 1 << 9;
        const PREM_SOP_ERR = 1 << 10;
        const SOP_BIT_ERR = 1 << 11;
        const REJ_RESP_ERR = 1 << 12;
    }
}

bitflags! {
    /// Receive channel control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxCtl: u64 {
        const ENABLE = 1 << 0;
        /// Set by the device once it has stopped after `ENABLE` was cleared.
        const QUIESCED = 1 << 1;
        /// Reset the channel; self-clearing when done.
        const RST = 1 << 31;
    }
}

bitflags! {
    /// Receive error status bits of [`RDC_CTL_STAT`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxErr: u64 {
        const DC_FIFO_ERR = 1 << 32;
        const RCR_SHADOW_FULL = 1 << 33;
        const RBR_REQ_REJ = 1 << 34;
        const RBR_TMOUT = 1 << 35;
        const RSP_DAT_ERR = 1 << 36;
        const RCR_ACK_ERR = 1 << 37;
        const RCR_SHA_PAR = 1 << 38;
        const RBR_PRE_PAR = 1 << 39;
        const RCR_UNDERFLOW = 1 << 40;
        const RBR_OVERFLOW = 1 << 41;
    }
}

/// Completion ring tail as published in [`RDC_CTL_STAT`].
#[inline]
pub fn rx_cpl_tail(ctl_stat: u64) -> usize {
    ctl_stat.get_bits(0..16) as usize
}

/// Buffer ring head as published in [`RDC_CTL_STAT`].
#[inline]
pub fn rx_buf_head(ctl_stat: u64) -> usize {
    ctl_stat.get_bits(16..32) as usize
}
