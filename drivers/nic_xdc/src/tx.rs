// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Transmit DMA channel.
//!
//! A packet takes one of two paths:
//!
//! - **copy**: a single fragment no longer than `copy_max` is copied into
//!   the per-slot scratch buffer of the slot it lands in and described by
//!   one descriptor. The packet is released immediately.
//! - **gather**: every fragment is mapped for the device and described by as
//!   many descriptors as its length needs. The packet and its mappings stay
//!   attached to the control block of the packet's last descriptor until
//!   the device head moves past it.
//!
//! There is one control block per descriptor slot, so the free list shrinks
//! by exactly the number of descriptors a send consumes and grows by exactly
//! the number a reclaim retires.

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{Ordering, fence};

use log::{debug, trace, warn};
use nic_base::{DmaDirection, DmaMapping, DmaRegion, NicError, NicHal, NicResult, PhysAddr};
use nic_ring::{
    ControlBlockPool, DescArray, DescRing, MAX_RING_SIZE, Reservation,
    desc::{RingPos, TxDesc, TxFlags},
};
use spin::{Mutex, MutexGuard};

use crate::{
    fault::{ChannelId, ChannelOps, ChannelState, Decoded, FaultBit, FaultHooks, FaultKind, FaultMonitor},
    generation::{ChannelCaps, Generation},
    regs::{self, INTR_MASK_ALL, TxCtl, TxErr},
    stats::{TxStats, add, bump},
};

/// Transmit channel tunables.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Descriptors in the ring; a power of two.
    pub ring_size: usize,
    /// Slots kept unused so that a full ring never looks empty.
    pub gap: usize,
    /// Largest single-fragment packet sent through the copy path.
    pub copy_max: usize,
    /// Sends between doorbells.
    pub kick_batch: usize,
    /// Free slots needed before a backpressured channel signals resume.
    pub resched_threshold: usize,
    pub max_frame: usize,
    /// Copy-path frames are zero-padded up to this length.
    pub min_frame: usize,
    pub quiesce_retries: u32,
    pub reset_retries: u32,
    pub poll_delay_us: u64,
    pub fault_window_ms: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            ring_size: 512,
            gap: 4,
            copy_max: 2048,
            kick_batch: 1,
            resched_threshold: 128,
            max_frame: 9216,
            min_frame: 60,
            quiesce_retries: 1000,
            reset_retries: 1000,
            poll_delay_us: 10,
            fault_window_ms: 1000,
        }
    }
}

impl TxConfig {
    pub fn validate(&self) -> NicResult {
        let size = self.ring_size;
        if !size.is_power_of_two() || !(8..=MAX_RING_SIZE).contains(&size) {
            return Err(NicError::InvalidInput);
        }
        if self.gap == 0 || self.gap >= size / 2 {
            return Err(NicError::InvalidInput);
        }
        if self.copy_max < self.min_frame || self.min_frame == 0 || self.max_frame < self.min_frame {
            return Err(NicError::InvalidInput);
        }
        if self.kick_batch == 0 || self.resched_threshold > size - self.gap {
            return Err(NicError::InvalidInput);
        }
        Ok(())
    }
}

/// Flow-control collaborator of a transmit channel.
pub trait FlowControl: Send + Sync {
    /// The channel started refusing sends.
    fn pause(&self, _channel: ChannelId) {}

    /// The channel has room again after refusing sends.
    fn resume(&self, channel: ChannelId);
}

/// An outbound frame made of one or more fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxPacket {
    frags: Vec<Vec<u8>>,
    cksum: bool,
}

impl TxPacket {
    pub fn new(frags: Vec<Vec<u8>>) -> Self {
        Self {
            frags,
            cksum: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(vec![data.to_vec()])
    }

    /// Requests checksum offload.
    pub fn with_checksum(mut self, on: bool) -> Self {
        self.cksum = on;
        self
    }

    pub fn wants_checksum(&self) -> bool {
        self.cksum
    }

    pub fn len(&self) -> usize {
        self.frags.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.frags
    }

    /// Non-empty fragments.
    pub fn frag_count(&self) -> usize {
        self.frags.iter().filter(|f| !f.is_empty()).count()
    }

    /// Descriptors the gather path needs when no descriptor may exceed
    /// `max_len` bytes.
    pub fn desc_count(&self, max_len: usize) -> usize {
        self.frags.iter().map(|f| f.len().div_ceil(max_len)).sum()
    }

    /// Merges all fragments into one.
    pub fn coalesce(&mut self) {
        if self.frags.len() > 1 {
            let mut merged = Vec::with_capacity(self.len());
            for frag in self.frags.drain(..) {
                merged.extend_from_slice(&frag);
            }
            self.frags.push(merged);
        }
    }

    fn flags(&self) -> TxFlags {
        let mut flags = TxFlags::SOP | TxFlags::MARK;
        flags.set(TxFlags::CKSUM, self.cksum);
        flags
    }
}

/// Result of a send that was not rejected as malformed.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Descriptors written and the tail advanced.
    Queued,
    /// Not enough room; the packet is handed back for a later retry.
    Retry(TxPacket),
}

// Field order matters: the mappings end before the buffers are freed.
struct TxPayload {
    _maps: Vec<DmaMapping>,
    _pkt: TxPacket,
}

struct TxInner {
    ring: DescRing,
    descs: DescArray,
    cbs: ControlBlockPool<TxPayload>,
    scratch: DmaRegion,
    unkicked: usize,
    blocked: bool,
}

/// One transmit DMA channel.
pub struct TxChannel {
    id: ChannelId,
    hal: Arc<dyn NicHal>,
    cfg: TxConfig,
    max_gather: usize,
    max_desc_len: usize,
    faults: &'static [FaultBit],
    inner: Mutex<TxInner>,
    monitor: FaultMonitor,
    stats: TxStats,
    flow: Option<Arc<dyn FlowControl>>,
}

impl TxChannel {
    /// Allocates the ring and scratch buffers, programs the hardware and
    /// starts the channel.
    pub fn new(
        index: u16,
        hal: &Arc<dyn NicHal>,
        generation: Generation,
        cfg: TxConfig,
        hooks: FaultHooks,
        flow: Option<Arc<dyn FlowControl>>,
    ) -> NicResult<Self> {
        cfg.validate()?;
        if cfg.copy_max > generation.max_desc_len() {
            return Err(NicError::InvalidInput);
        }
        let inner = TxInner {
            ring: DescRing::new(cfg.ring_size, cfg.gap)?,
            descs: DescArray::new(hal, cfg.ring_size)?,
            cbs: ControlBlockPool::new(cfg.ring_size),
            scratch: DmaRegion::new(hal, cfg.ring_size * cfg.copy_max, 64)?,
            unkicked: 0,
            blocked: false,
        };
        let channel = Self {
            id: ChannelId::tx(index),
            hal: Arc::clone(hal),
            max_gather: generation.max_gather(),
            max_desc_len: generation.max_desc_len(),
            faults: generation.tx_faults(),
            inner: Mutex::new(inner),
            monitor: FaultMonitor::new(hooks, cfg.fault_window_ms),
            stats: TxStats::default(),
            flow,
            cfg,
        };
        channel.program(&channel.inner.lock())?;
        channel.mask_interrupts(false);
        channel.monitor.start();
        debug!(
            "{}: {} descriptors, {} generation",
            channel.id,
            channel.cfg.ring_size,
            generation.name()
        );
        Ok(channel)
    }

    #[inline]
    fn reg(&self, reg: usize) -> usize {
        regs::tx_reg(self.id.index as usize, reg)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> &TxConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    pub fn monitor(&self) -> &FaultMonitor {
        &self.monitor
    }

    pub fn state(&self) -> ChannelState {
        self.monitor.state()
    }

    /// Descriptor slots that can still be filled.
    pub fn free_slots(&self) -> usize {
        self.inner.lock().ring.free_slots()
    }

    /// `(free, in flight)` control block counts.
    pub fn control_blocks(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.cbs.free_len(), inner.cbs.work_len())
    }

    /// Whether every control block is on exactly one list.
    pub fn control_blocks_consistent(&self) -> bool {
        self.inner.lock().cbs.is_consistent()
    }

    /// Queues `pkt` for transmission.
    ///
    /// Malformed packets (empty, longer than `max_frame`, or needing more
    /// descriptors than the hardware allows even after coalescing) are
    /// rejected with [`NicError::InvalidInput`]. A full ring, a refused
    /// mapping or a channel in recovery hands the packet back as
    /// [`SendOutcome::Retry`] and pauses the sender until there is room.
    pub fn send(&self, mut pkt: TxPacket) -> NicResult<SendOutcome> {
        let len = pkt.len();
        if len == 0 || len > self.cfg.max_frame {
            bump(&self.stats.oerrors);
            debug!("{}: dropping {len}-byte packet", self.id);
            return Err(NicError::InvalidInput);
        }

        let mut inner = self.inner.lock();
        if !self.monitor.is_running() {
            return Ok(self.backpressure(inner, pkt));
        }

        let mut copy = self.takes_copy_path(&pkt);
        if !copy && (pkt.desc_count(self.max_desc_len) > self.max_gather || len < self.cfg.min_frame)
        {
            pkt.coalesce();
            bump(&self.stats.coalesced);
            copy = self.takes_copy_path(&pkt);
            if !copy && pkt.desc_count(self.max_desc_len) > self.max_gather {
                bump(&self.stats.oerrors);
                warn!("{}: {len}-byte packet cannot be described", self.id);
                return Err(NicError::InvalidInput);
            }
        }
        let ndesc = if copy {
            1
        } else {
            pkt.desc_count(self.max_desc_len)
        };

        let res = match inner.ring.reserve(ndesc) {
            Ok(res) => res,
            Err(NicError::WouldBlock) => return Ok(self.backpressure(inner, pkt)),
            Err(err) => return Err(err),
        };
        let maps = if copy {
            Vec::new()
        } else {
            match self.map_fragments(&pkt) {
                Ok(maps) => maps,
                Err(NicError::NoMemory) => {
                    bump(&self.stats.map_failures);
                    return Ok(self.backpressure(inner, pkt));
                }
                Err(err) => return Err(err),
            }
        };

        let wire_len = if copy {
            self.fill_copy(&mut inner, &res, &pkt)?
        } else {
            self.fill_gather(&mut inner, &res, maps, pkt)?
        };
        inner.descs.publish();
        let tail = inner.ring.commit(res)?;
        inner.unkicked += 1;

        bump(&self.stats.opackets);
        add(&self.stats.obytes, wire_len as u64);
        if copy {
            bump(&self.stats.copied);
        }
        trace!("{}: queued {wire_len} bytes in {ndesc} descriptors", self.id);

        if inner.unkicked >= self.cfg.kick_batch {
            self.kick(&mut inner, tail);
        }
        Ok(SendOutcome::Queued)
    }

    /// Hands `pkt` back and pauses the sender, once per blocked period. The
    /// next reclaim with enough room, or a recovery, resumes it.
    fn backpressure(&self, mut inner: MutexGuard<'_, TxInner>, pkt: TxPacket) -> SendOutcome {
        bump(&self.stats.ofulls);
        let newly = !core::mem::replace(&mut inner.blocked, true);
        drop(inner);
        if newly {
            debug!("{}: backpressure", self.id);
            if let Some(flow) = &self.flow {
                flow.pause(self.id);
            }
        }
        SendOutcome::Retry(pkt)
    }

    fn takes_copy_path(&self, pkt: &TxPacket) -> bool {
        pkt.frag_count() <= 1 && pkt.len() <= self.cfg.copy_max
    }

    fn fill_copy(&self, inner: &mut TxInner, res: &Reservation, pkt: &TxPacket) -> NicResult<usize> {
        let slot = res.slot(0).ok_or(NicError::BadState)?;
        let offset = slot.index() * self.cfg.copy_max;
        let padded = pkt.len().max(self.cfg.min_frame);
        let desc = TxDesc::new(inner.scratch.paddr() + offset as u64, padded, 1, pkt.flags())?;

        let buf = &mut inner.scratch.as_mut_slice()[offset..offset + padded];
        let mut at = 0;
        for frag in pkt.fragments() {
            buf[at..at + frag.len()].copy_from_slice(frag);
            at += frag.len();
        }
        buf[at..].fill(0);

        inner.descs.write(&slot, desc.0);
        inner.cbs.acquire(slot.index(), 1, None)?;
        Ok(padded)
    }

    fn map_fragments(&self, pkt: &TxPacket) -> NicResult<Vec<DmaMapping>> {
        pkt.fragments()
            .iter()
            .filter(|f| !f.is_empty())
            // SAFETY: the fragment's heap buffer moves into the control block
            // together with its mapping and is freed only after it.
            .map(|frag| unsafe { DmaMapping::new(&self.hal, frag, DmaDirection::ToDevice) })
            .collect()
    }

    fn fill_gather(
        &self,
        inner: &mut TxInner,
        res: &Reservation,
        maps: Vec<DmaMapping>,
        pkt: TxPacket,
    ) -> NicResult<usize> {
        let mut flags = pkt.flags();
        let mut nptrs = res.len();
        let mut descs = Vec::with_capacity(res.len());
        for map in &maps {
            let mut done = 0;
            while done < map.len() {
                let chunk = (map.len() - done).min(self.max_desc_len);
                let addr: PhysAddr = map.paddr() + done as u64;
                descs.push(TxDesc::new(addr, chunk, nptrs, flags)?);
                flags.remove(TxFlags::SOP | TxFlags::CKSUM | TxFlags::MARK);
                nptrs = 0;
                done += chunk;
            }
        }
        if descs.len() != res.len() {
            return Err(NicError::BadState);
        }

        for (slot, desc) in res.slots().zip(&descs) {
            inner.descs.write(&slot, desc.0);
            inner.cbs.acquire(slot.index(), 0, None)?;
        }
        let len = pkt.len();
        inner.cbs.set_last_payload(
            TxPayload {
                _maps: maps,
                _pkt: pkt,
            },
            res.len(),
        )?;
        Ok(len)
    }

    fn kick(&self, inner: &mut TxInner, tail: RingPos) {
        self.hal.write64(self.reg(regs::TDC_KICK), tail.encode());
        inner.unkicked = 0;
        bump(&self.stats.kicks);
    }

    /// Rings the doorbell if sends are waiting for one.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        if inner.unkicked > 0 {
            let tail = inner.ring.tail_pos();
            self.kick(&mut inner, tail);
        }
    }

    /// Releases every descriptor the device has finished with, up to the
    /// head it reports. Returns the number of slots freed.
    pub fn reclaim(&self) -> NicResult<usize> {
        let mut inner = self.inner.lock();
        if !self.monitor.is_running() {
            return Ok(0);
        }
        if inner.unkicked > 0 {
            let tail = inner.ring.tail_pos();
            self.kick(&mut inner, tail);
        }

        let head = RingPos::decode(self.hal.read64(self.reg(regs::TDC_RNG_HEAD)));
        fence(Ordering::Acquire);
        let retired = inner.ring.retire_to(head.index as usize).inspect_err(|_| {
            warn!("{}: device head {} outside the ring window", self.id, head.index);
        })?;
        let freed = retired.len();
        for _ in retired.slots() {
            // Dropping the completed payload unmaps and frees the packet.
            if inner.cbs.complete().is_none() {
                return Err(NicError::BadState);
            }
        }
        add(&self.stats.reclaimed, freed as u64);

        let resume = inner.blocked && inner.ring.free_slots() >= self.cfg.resched_threshold;
        if resume {
            inner.blocked = false;
        }
        drop(inner);

        if freed > 0 {
            trace!("{}: reclaimed {freed} descriptors", self.id);
        }
        if resume {
            self.signal_resume();
        }
        Ok(freed)
    }

    fn signal_resume(&self) {
        bump(&self.stats.resumes);
        debug!("{}: resuming", self.id);
        if let Some(flow) = &self.flow {
            flow.resume(self.id);
        }
    }

    /// Decodes the status word; recovers or escalates as needed.
    pub fn check_faults(&self) -> NicResult<Option<Decoded>> {
        self.monitor.check(self)
    }

    /// Watchdog entry point: reinitializes the channel unconditionally.
    pub fn reset(&self) -> NicResult {
        self.monitor.request_reset(self)
    }

    /// Runs the recovery sequence if the channel is in `FaultDetected`.
    pub fn recover(&self) -> NicResult {
        self.monitor.recover(self)
    }

    /// Makes the device raise `kind` on this channel.
    pub fn inject_fault(&self, kind: FaultKind) -> NicResult {
        let row = self
            .faults
            .iter()
            .find(|r| r.kind == kind)
            .ok_or(NicError::Unsupported)?;
        self.hal.write64(self.reg(regs::TDC_INTR_DBG), row.mask);
        Ok(())
    }

    /// Stops the channel and abandons everything in flight.
    pub fn disable(&self) {
        self.monitor.disable();
        self.mask_interrupts(true);
        self.hal.write64(self.reg(regs::TDC_CTL), TxCtl::STOP.bits());
        let mut inner = self.inner.lock();
        let abandoned = inner.cbs.release_all().count();
        inner.ring.reset();
        inner.unkicked = 0;
        debug!("{}: disabled, {abandoned} descriptors abandoned", self.id);
    }

    fn wait_for(&self, reg: usize, mask: u64, set: bool, retries: u32) -> bool {
        for _ in 0..=retries {
            if (self.hal.read64(reg) & mask != 0) == set {
                return true;
            }
            self.hal.delay_us(self.cfg.poll_delay_us);
        }
        false
    }

    fn program(&self, inner: &TxInner) -> NicResult {
        let ctl = self.reg(regs::TDC_CTL);
        self.hal.write64(ctl, (TxCtl::STOP | TxCtl::RST).bits());
        if !self.wait_for(ctl, TxCtl::RST.bits(), false, self.cfg.reset_retries) {
            warn!("{}: reset did not complete", self.id);
            return Err(NicError::Timeout);
        }
        self.hal.write64(
            self.reg(regs::TDC_RNG_CFG),
            regs::ring_cfg(inner.descs.paddr(), self.cfg.ring_size),
        );
        self.hal.write64(self.reg(regs::TDC_KICK), 0);
        self.hal.write64(self.reg(regs::TDC_CS), TxErr::all().bits());
        self.hal.write64(ctl, 0);
        Ok(())
    }
}

impl ChannelOps for TxChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn hal(&self) -> &Arc<dyn NicHal> {
        &self.hal
    }

    fn fault_table(&self) -> &'static [FaultBit] {
        self.faults
    }

    fn read_status(&self) -> u64 {
        self.hal.read64(self.reg(regs::TDC_CS))
    }

    fn clear_status(&self, bits: u64) {
        self.hal.write64(self.reg(regs::TDC_CS), bits);
    }

    fn mask_interrupts(&self, masked: bool) {
        let mask = if masked { INTR_MASK_ALL } else { 0 };
        self.hal.write64(self.reg(regs::TDC_INTR_MASK), mask);
    }

    fn quiesce(&self) -> bool {
        let ctl = self.reg(regs::TDC_CTL);
        self.hal.write64(ctl, TxCtl::STOP.bits());
        self.wait_for(ctl, TxCtl::STOP_DONE.bits(), true, self.cfg.quiesce_retries)
    }

    fn reinit(&self) -> NicResult {
        let mut inner = self.inner.lock();
        let abandoned = inner.cbs.release_all().count();
        inner.descs.zero();
        inner.ring.reset();
        inner.unkicked = 0;
        let was_blocked = core::mem::take(&mut inner.blocked);
        self.program(&inner)?;
        drop(inner);
        debug!("{}: reinitialized, {abandoned} descriptors abandoned", self.id);
        if was_blocked {
            self.signal_resume();
        }
        Ok(())
    }
}

impl Drop for TxChannel {
    fn drop(&mut self) {
        if self.monitor.state() != ChannelState::Disabled {
            self.disable();
        }
    }
}
