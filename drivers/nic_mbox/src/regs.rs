// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Mailbox register block, one per endpoint.

use bitflags::bitflags;

pub const MBX_BASE: usize = 0x1_0000;
pub const MBX_STRIDE: usize = 0x200;

pub const MBX_CTRL: usize = 0x00;
pub const MBX_STATUS: usize = 0x08;
pub const MBX_INTR_MASK: usize = 0x10;
/// Transmit and receive enable of the endpoint, written by the physical
/// function only.
pub const MBX_EP_ENABLE: usize = 0x18;
/// Outbound message window.
pub const MBX_OMB_DATA: usize = 0x40;
/// Reply to our outbound message.
pub const MBX_RSP_DATA: usize = 0x80;
/// Inbound message window.
pub const MBX_IMB_DATA: usize = 0xc0;
/// Our reply to the inbound message.
pub const MBX_RPL_DATA: usize = 0x100;

/// Register block of endpoint `index`.
#[inline]
pub const fn mbox_base(index: usize) -> usize {
    MBX_BASE + index * MBX_STRIDE
}

bitflags! {
    /// Commands, all self-clearing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MbxCtrl: u32 {
        /// Send the outbound window.
        const POST = 1 << 0;
        /// Send the reply window and release the inbound window.
        const REPLY = 1 << 1;
        /// Withdraw an outbound message nobody answered.
        const CANCEL = 1 << 2;
        /// Reset the mailbox function.
        const FUNC_RST = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MbxStatus: u32 {
        /// The outbound window is in use; device owned.
        const OMB_FULL = 1 << 0;
        /// The peer answered; reply in the response window.
        const ACKED = 1 << 1;
        /// The peer could not take the message.
        const FAILED = 1 << 2;
        /// A message waits in the inbound window.
        const IMB_FULL = 1 << 3;
        const FUNC_RST_DONE = 1 << 4;
    }
}

impl MbxStatus {
    /// Bits acknowledged by writing ones.
    pub const W1C: Self = Self::ACKED
        .union(Self::FAILED)
        .union(Self::IMB_FULL)
        .union(Self::FUNC_RST_DONE);
}

bitflags! {
    /// Enable bits of [`MBX_EP_ENABLE`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EpEnable: u32 {
        const TX = 1 << 0;
        const RX = 1 << 1;
    }
}

bitflags! {
    /// What a mailbox interrupt reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MboxEvents: u32 {
        const ACKED = 1 << 0;
        const FAILED = 1 << 1;
        const INBOUND = 1 << 2;
    }
}
