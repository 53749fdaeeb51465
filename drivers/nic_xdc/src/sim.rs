// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Software model of the channel hardware, driven from tests.
//!
//! Bus addresses found in registers and descriptors are resolved through
//! [`MockPlatform`], so a descriptor pointing outside a live allocation or
//! mapping stops the test.

use alloc::{sync::Arc, vec::Vec};

use nic_base::{NicError, NicResult, PhysAddr, mock::MockPlatform};
use nic_ring::desc::{RingPos, RxBufEntry, RxCompletion, RxKick, TxDesc};

use crate::regs::{self, RxCtl, RxErr, TxCtl, TxErr, rx_reg, tx_reg};

fn word(base: PhysAddr, index: usize) -> PhysAddr {
    base + 8 * index as PhysAddr
}

/// Transmit side of one channel.
pub struct TxDevice {
    mock: Arc<MockPlatform>,
    index: usize,
}

impl TxDevice {
    /// Installs the register behaviour of transmit channel `index`. Call
    /// before creating the channel.
    pub fn attach(mock: &Arc<MockPlatform>, index: u16) -> Self {
        let index = index as usize;
        let ctl = tx_reg(index, regs::TDC_CTL);
        let head = tx_reg(index, regs::TDC_RNG_HEAD);
        let cs = tx_reg(index, regs::TDC_CS);
        mock.self_clearing(ctl, TxCtl::RST.bits());
        mock.write_one_to_clear(cs, TxErr::all().bits());
        mock.on_write(ctl, move |dev, value| {
            if value & TxCtl::STOP.bits() != 0 {
                dev.set_bits(ctl, TxCtl::STOP_DONE.bits());
            } else {
                dev.clear_bits(ctl, TxCtl::STOP_DONE.bits());
            }
            if value & TxCtl::RST.bits() != 0 {
                dev.set_reg(head, 0);
            }
        });
        mock.on_write(tx_reg(index, regs::TDC_INTR_DBG), move |dev, value| {
            dev.set_bits(cs, value);
        });
        Self {
            mock: Arc::clone(mock),
            index,
        }
    }

    fn reg(&self, reg: usize) -> usize {
        tx_reg(self.index, reg)
    }

    /// Ring base and length as programmed.
    pub fn ring(&self) -> (PhysAddr, usize) {
        regs::ring_cfg_decode(self.mock.reg(self.reg(regs::TDC_RNG_CFG)))
    }

    /// Tail from the last doorbell.
    pub fn tail(&self) -> RingPos {
        RingPos::decode(self.mock.reg(self.reg(regs::TDC_KICK)))
    }

    pub fn head(&self) -> RingPos {
        RingPos::decode(self.mock.reg(self.reg(regs::TDC_RNG_HEAD)))
    }

    /// Descriptors announced but not yet consumed.
    pub fn pending(&self) -> usize {
        let (_, size) = self.ring();
        (self.tail().index as usize + size - self.head().index as usize) % size
    }

    pub fn desc(&self, index: usize) -> TxDesc {
        TxDesc(self.mock.read_dma(word(self.ring().0, index)))
    }

    /// Consumes `n` descriptors.
    pub fn complete(&self, n: usize) {
        let (_, size) = self.ring();
        let head = self.head();
        let next = head.index as usize + n;
        let pos = RingPos {
            index: (next % size) as u16,
            wrap: head.wrap ^ (next >= size),
        };
        self.mock.set_reg(self.reg(regs::TDC_RNG_HEAD), pos.encode());
    }

    /// Consumes everything announced.
    pub fn complete_all(&self) {
        self.mock
            .set_reg(self.reg(regs::TDC_RNG_HEAD), self.tail().encode());
    }

    /// Frames between head and tail, reassembled from their descriptors.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        let (_, size) = self.ring();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut at = self.head().index as usize;
        for _ in 0..self.pending() {
            let desc = self.desc(at);
            let bytes = self.mock.read_dma_bytes(desc.addr(), desc.len());
            match frames.last_mut() {
                Some(frame) if !desc.is_sop() => frame.extend_from_slice(&bytes),
                _ => frames.push(bytes),
            }
            at = (at + 1) % size;
        }
        frames
    }

    /// Raises status bits as the hardware would.
    pub fn raise(&self, bits: TxErr) {
        self.mock.set_bits(self.reg(regs::TDC_CS), bits.bits());
    }
}

/// Receive side of one channel.
pub struct RxDevice {
    mock: Arc<MockPlatform>,
    index: usize,
}

impl RxDevice {
    /// Installs the register behaviour of receive channel `index`. Call
    /// before creating the channel.
    pub fn attach(mock: &Arc<MockPlatform>, index: u16) -> Self {
        let index = index as usize;
        let ctl = rx_reg(index, regs::RDC_CTL);
        let stat = rx_reg(index, regs::RDC_CTL_STAT);
        mock.self_clearing(ctl, RxCtl::RST.bits());
        mock.write_one_to_clear(stat, RxErr::all().bits());
        mock.on_write(ctl, move |dev, value| {
            if value & RxCtl::ENABLE.bits() == 0 {
                dev.set_bits(ctl, RxCtl::QUIESCED.bits());
            } else {
                dev.clear_bits(ctl, RxCtl::QUIESCED.bits());
            }
            if value & RxCtl::RST.bits() != 0 {
                dev.clear_bits(stat, 0xffff_ffff);
            }
        });
        mock.on_write(rx_reg(index, regs::RDC_INTR_DBG), move |dev, value| {
            dev.set_bits(stat, value);
        });
        Self {
            mock: Arc::clone(mock),
            index,
        }
    }

    fn reg(&self, reg: usize) -> usize {
        rx_reg(self.index, reg)
    }

    /// `(buffer size, leading offset)` as programmed.
    pub fn buffer_layout(&self) -> (usize, usize) {
        let raw = self.mock.reg(self.reg(regs::RDC_BUF_SIZE));
        ((raw & 0xffff) as usize, ((raw >> 16) & 0xff) as usize)
    }

    fn rings(&self) -> ((PhysAddr, usize), (PhysAddr, usize)) {
        (
            regs::ring_cfg_decode(self.mock.reg(self.reg(regs::RDC_BUF_CFG))),
            regs::ring_cfg_decode(self.mock.reg(self.reg(regs::RDC_CPL_CFG))),
        )
    }

    fn cursors(&self) -> (usize, usize) {
        let stat = self.mock.reg(self.reg(regs::RDC_CTL_STAT));
        (regs::rx_buf_head(stat), regs::rx_cpl_tail(stat))
    }

    /// Buffers posted and not yet filled.
    pub fn posted(&self) -> usize {
        let ((_, size), _) = self.rings();
        let kick = RxKick::decode(self.mock.reg(self.reg(regs::RDC_KICK)));
        let tail = kick.buf_tail.map_or(0, |p| p.index as usize);
        let (head, _) = self.cursors();
        (tail + size - head) % size
    }

    /// Completion ring head from the last doorbell.
    pub fn consumed_to(&self) -> Option<RingPos> {
        RxKick::decode(self.mock.reg(self.reg(regs::RDC_KICK))).cpl_head
    }

    pub fn is_enabled(&self) -> bool {
        self.mock.reg(self.reg(regs::RDC_CTL)) & RxCtl::ENABLE.bits() != 0
    }

    fn put(&self, data: &[u8], errors: u8, first: bool, more: bool) -> NicResult {
        let ((buf_base, buf_size), (cpl_base, cpl_size)) = self.rings();
        let (len, offset) = self.buffer_layout();
        let skip = if first { offset } else { 0 };
        if skip + data.len() > len {
            return Err(NicError::InvalidInput);
        }
        let (head, tail) = self.cursors();
        let entry = RxBufEntry(self.mock.read_dma(word(buf_base, head)));
        self.mock.write_dma_bytes(entry.addr() + skip as PhysAddr, data);
        let cpl = RxCompletion::new(skip + data.len(), entry.slot(), errors, more);
        self.mock.write_dma(word(cpl_base, tail), cpl.0);

        let stat = self.reg(regs::RDC_CTL_STAT);
        let next = ((head + 1) % buf_size) << 16 | (tail + 1) % cpl_size;
        let old = self.mock.reg(stat);
        self.mock.set_reg(stat, (old & !0xffff_ffff) | next as u64);
        Ok(())
    }

    /// Writes one frame as the given segments, one buffer per segment.
    pub fn receive_segments(&self, segments: &[&[u8]]) -> NicResult {
        if !self.is_enabled() {
            return Err(NicError::BadState);
        }
        if self.posted() < segments.len() {
            return Err(NicError::NoSpace);
        }
        for (i, seg) in segments.iter().enumerate() {
            self.put(seg, 0, i == 0, i + 1 < segments.len())?;
        }
        Ok(())
    }

    /// Writes one frame, split over as many buffers as it needs.
    pub fn receive(&self, frame: &[u8]) -> NicResult<usize> {
        let (len, offset) = self.buffer_layout();
        let (head, rest) = frame.split_at(frame.len().min(len - offset));
        let mut segments = alloc::vec![head];
        segments.extend(rest.chunks(len));
        self.receive_segments(&segments)?;
        Ok(segments.len())
    }

    /// Fills one buffer with an entry carrying `code` as its error.
    pub fn receive_error(&self, code: u8) -> NicResult {
        if self.posted() == 0 {
            return Err(NicError::NoSpace);
        }
        self.put(&[], code, true, false)
    }

    pub fn raise(&self, bits: RxErr) {
        self.mock.set_bits(self.reg(regs::RDC_CTL_STAT), bits.bits());
    }
}
