// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Hardware generations.
//!
//! A generation is chosen once from the device revision when a channel is
//! created. Channels copy the limits they need out of it, so the data path
//! never dispatches on the generation again.

use enum_dispatch::enum_dispatch;
use nic_base::{NicError, NicResult};
use nic_ring::desc::{TX_DESC_MAX_LEN, TX_MAX_PTRS};

use crate::{
    fault::{FaultBit, FaultKind},
    regs::{RxErr, TxErr},
};

/// What differs between hardware generations.
#[enum_dispatch]
pub trait ChannelCaps {
    fn name(&self) -> &'static str;

    /// Most descriptors one transmit packet may use.
    fn max_gather(&self) -> usize;

    /// Most bytes one transmit descriptor may carry.
    fn max_desc_len(&self) -> usize;

    /// Decoding table for the transmit status word.
    fn tx_faults(&self) -> &'static [FaultBit];

    /// Decoding table for the receive status word.
    fn rx_faults(&self) -> &'static [FaultBit];
}

/// First generation: shared partition logic, so partition and control FIFO
/// errors take the whole device down.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen1;

/// Second generation: per-channel FIFOs and partitions; only bus response
/// errors remain device-global.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen2;

/// The hardware generation of an adapter.
#[enum_dispatch(ChannelCaps)]
#[derive(Debug, Clone, Copy)]
pub enum Generation {
    Gen1,
    Gen2,
}

impl Generation {
    /// Selects the generation from the device revision id.
    pub fn from_revision(revision: u8) -> NicResult<Self> {
        match revision {
            0x00..=0x0f => Ok(Gen1.into()),
            0x10..=0x1f => Ok(Gen2.into()),
            _ => Err(NicError::Unsupported),
        }
    }
}

const fn tx(mask: TxErr) -> u64 {
    mask.bits()
}

const fn rx(mask: RxErr) -> u64 {
    mask.bits()
}

static GEN1_TX: [FaultBit; 13] = [
    FaultBit::local(tx(TxErr::REJ_RESP_ERR), FaultKind::PeuResponse),
    FaultBit::local(tx(TxErr::SOP_BIT_ERR), FaultKind::InvalidSop),
    FaultBit::local(tx(TxErr::PREM_SOP_ERR), FaultKind::PrematureSop),
    FaultBit::local(tx(TxErr::DESC_LEN_ERR), FaultKind::DescLength),
    FaultBit::local(tx(TxErr::DESC_NPTR_ERR), FaultKind::DescPointerCount),
    FaultBit::local(tx(TxErr::MBOX_ERR), FaultKind::MailboxWrite),
    FaultBit::local(tx(TxErr::PKT_SIZE_ERR), FaultKind::PacketSize),
    FaultBit::local(tx(TxErr::TX_RING_OFLOW), FaultKind::RingOverflow),
    FaultBit::local(tx(TxErr::PREF_BUF_PAR_ERR), FaultKind::PrefetchParity),
    FaultBit::local(tx(TxErr::NACK_PREF), FaultKind::PrefetchTimeout),
    FaultBit::local(tx(TxErr::NACK_PKT_RD), FaultKind::PacketReadNack),
    FaultBit::global(tx(TxErr::CONF_PART_ERR), FaultKind::ConfigPartition),
    FaultBit::global(tx(TxErr::PKT_PRT_ERR), FaultKind::PacketPartition),
];

static GEN2_TX: [FaultBit; 13] = [
    FaultBit::global(tx(TxErr::REJ_RESP_ERR), FaultKind::PeuResponse),
    FaultBit::local(tx(TxErr::SOP_BIT_ERR), FaultKind::InvalidSop),
    FaultBit::local(tx(TxErr::PREM_SOP_ERR), FaultKind::PrematureSop),
    FaultBit::local(tx(TxErr::DESC_LEN_ERR), FaultKind::DescLength),
    FaultBit::local(tx(TxErr::DESC_NPTR_ERR), FaultKind::DescPointerCount),
    FaultBit::local(tx(TxErr::MBOX_ERR), FaultKind::MailboxWrite),
    FaultBit::local(tx(TxErr::PKT_SIZE_ERR), FaultKind::PacketSize),
    FaultBit::local(tx(TxErr::TX_RING_OFLOW), FaultKind::RingOverflow),
    FaultBit::local(tx(TxErr::PREF_BUF_PAR_ERR), FaultKind::PrefetchParity),
    FaultBit::local(tx(TxErr::NACK_PREF), FaultKind::PrefetchTimeout),
    FaultBit::local(tx(TxErr::NACK_PKT_RD), FaultKind::PacketReadNack),
    FaultBit::local(tx(TxErr::CONF_PART_ERR), FaultKind::ConfigPartition),
    FaultBit::local(tx(TxErr::PKT_PRT_ERR), FaultKind::PacketPartition),
];

static GEN1_RX: [FaultBit; 10] = [
    FaultBit::global(rx(RxErr::DC_FIFO_ERR), FaultKind::ControlFifoEcc),
    FaultBit::local(rx(RxErr::RCR_SHADOW_FULL), FaultKind::CompletionShadowFull),
    FaultBit::local(rx(RxErr::RBR_REQ_REJ), FaultKind::BufferRequestRejected),
    FaultBit::local(rx(RxErr::RBR_TMOUT), FaultKind::BufferTimeout),
    FaultBit::local(rx(RxErr::RSP_DAT_ERR), FaultKind::ResponseData),
    FaultBit::local(rx(RxErr::RCR_ACK_ERR), FaultKind::CompletionAck),
    FaultBit::local(rx(RxErr::RCR_SHA_PAR), FaultKind::CompletionShadowParity),
    FaultBit::local(rx(RxErr::RBR_PRE_PAR), FaultKind::BufferPrefetchParity),
    FaultBit::local(rx(RxErr::RCR_UNDERFLOW), FaultKind::CompletionUnderflow),
    FaultBit::local(rx(RxErr::RBR_OVERFLOW), FaultKind::BufferOverflow),
];

static GEN2_RX: [FaultBit; 10] = [
    FaultBit::local(rx(RxErr::DC_FIFO_ERR), FaultKind::ControlFifoEcc),
    FaultBit::local(rx(RxErr::RCR_SHADOW_FULL), FaultKind::CompletionShadowFull),
    FaultBit::local(rx(RxErr::RBR_REQ_REJ), FaultKind::BufferRequestRejected),
    FaultBit::local(rx(RxErr::RBR_TMOUT), FaultKind::BufferTimeout),
    FaultBit::global(rx(RxErr::RSP_DAT_ERR), FaultKind::ResponseData),
    FaultBit::local(rx(RxErr::RCR_ACK_ERR), FaultKind::CompletionAck),
    FaultBit::local(rx(RxErr::RCR_SHA_PAR), FaultKind::CompletionShadowParity),
    FaultBit::local(rx(RxErr::RBR_PRE_PAR), FaultKind::BufferPrefetchParity),
    FaultBit::local(rx(RxErr::RCR_UNDERFLOW), FaultKind::CompletionUnderflow),
    FaultBit::local(rx(RxErr::RBR_OVERFLOW), FaultKind::BufferOverflow),
];

impl ChannelCaps for Gen1 {
    fn name(&self) -> &'static str {
        "gen1"
    }

    fn max_gather(&self) -> usize {
        8
    }

    fn max_desc_len(&self) -> usize {
        4076
    }

    fn tx_faults(&self) -> &'static [FaultBit] {
        &GEN1_TX
    }

    fn rx_faults(&self) -> &'static [FaultBit] {
        &GEN1_RX
    }
}

impl ChannelCaps for Gen2 {
    fn name(&self) -> &'static str {
        "gen2"
    }

    fn max_gather(&self) -> usize {
        TX_MAX_PTRS
    }

    fn max_desc_len(&self) -> usize {
        TX_DESC_MAX_LEN
    }

    fn tx_faults(&self) -> &'static [FaultBit] {
        &GEN2_TX
    }

    fn rx_faults(&self) -> &'static [FaultBit] {
        &GEN2_RX
    }
}
