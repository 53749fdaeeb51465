// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Receive DMA channel.
//!
//! Software posts empty buffers on the buffer ring; the device fills them
//! in posting order and reports each filled buffer with a completion entry.
//! A frame longer than one buffer spans several completion entries, all but
//! the last with the `more` bit set.
//!
//! Short single-segment frames are copied out and their buffer is reposted
//! at once. Anything else is loaned upward as-is and replaced with a fresh
//! buffer from the pool. If the pool is empty the slot stays unposted and
//! is filled on a later poll.

use alloc::{sync::Arc, vec::Vec};

use log::{debug, error, trace, warn};
use nic_base::{NicError, NicHal, NicResult};
use nic_ring::{
    ControlBlockPool, Completed, DescArray, DescRing, MAX_RING_SIZE, RxBuf, RxBufPool,
    desc::{RingPos, RxBufEntry, RxCompletion, RxKick},
};
use spin::Mutex;

use crate::{
    fault::{ChannelId, ChannelOps, ChannelState, Decoded, FaultBit, FaultHooks, FaultKind, FaultMonitor},
    generation::{ChannelCaps, Generation},
    regs::{self, INTR_MASK_ALL, RxCtl, RxErr},
    stats::{RxStats, add, bump},
};

/// Receive channel tunables.
#[derive(Debug, Clone)]
pub struct RxConfig {
    pub ring_size: usize,
    pub gap: usize,
    /// Bytes per receive buffer; a multiple of 64.
    pub buf_size: usize,
    /// Buffers in the pool, covering the ring plus those loaned upward.
    pub pool_bufs: usize,
    /// Single-segment frames up to this length are copied.
    pub copy_threshold: usize,
    /// Bytes the device leaves free before the first segment of a frame.
    pub offset: usize,
    pub quiesce_retries: u32,
    pub reset_retries: u32,
    pub poll_delay_us: u64,
    pub fault_window_ms: u64,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            ring_size: 512,
            gap: 4,
            buf_size: 2048,
            pool_bufs: 1024,
            copy_threshold: 256,
            offset: 0,
            quiesce_retries: 1000,
            reset_retries: 1000,
            poll_delay_us: 10,
            fault_window_ms: 1000,
        }
    }
}

impl RxConfig {
    pub fn validate(&self) -> NicResult {
        let size = self.ring_size;
        if !size.is_power_of_two() || !(8..=MAX_RING_SIZE).contains(&size) {
            return Err(NicError::InvalidInput);
        }
        if self.gap == 0 || self.gap >= size / 2 {
            return Err(NicError::InvalidInput);
        }
        if self.pool_bufs < size - self.gap {
            return Err(NicError::InvalidInput);
        }
        if self.offset > 0xff || self.offset >= self.buf_size || self.copy_threshold > self.buf_size {
            return Err(NicError::InvalidInput);
        }
        Ok(())
    }
}

/// One segment of a received frame.
#[derive(Debug)]
pub enum RxSegment {
    /// Bytes copied out of a buffer that went straight back to the ring.
    Copied(Vec<u8>),
    /// A ring buffer handed upward. It returns to the pool when dropped.
    Loaned { buf: RxBuf, offset: usize, len: usize },
}

impl RxSegment {
    pub fn len(&self) -> usize {
        match self {
            Self::Copied(data) => data.len(),
            Self::Loaned { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Copied(data) => data,
            Self::Loaned { buf, offset, len } => buf.bytes(*offset, *len),
        }
    }
}

/// A received frame.
#[derive(Debug)]
pub struct RxPacket {
    segments: Vec<RxSegment>,
    len: usize,
    generation: u32,
    packet_type: u8,
}

impl RxPacket {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ring generation the frame was received in. It changes every time the
    /// channel is reinitialized.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    pub fn segments(&self) -> &[RxSegment] {
        &self.segments
    }

    /// Whether any segment still holds a ring buffer.
    pub fn is_zero_copy(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, RxSegment::Loaned { .. }))
    }

    /// The whole frame in one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(seg.bytes());
        }
        out
    }
}

/// Upper-layer sink for received frames.
pub trait Deliver {
    fn deliver(&self, channel: ChannelId, packet: RxPacket);
}

struct RxInner {
    ring: DescRing,
    bufs: DescArray,
    cbs: ControlBlockPool<RxBuf>,
    cpl: DescArray,
    cpl_head: usize,
    cpl_wrap: bool,
    chain: Vec<RxSegment>,
    chain_len: usize,
    // Drop segments until the end of the current frame.
    chain_bad: bool,
    generation: u32,
}

/// One receive DMA channel.
pub struct RxChannel {
    id: ChannelId,
    hal: Arc<dyn NicHal>,
    cfg: RxConfig,
    faults: &'static [FaultBit],
    pool: Arc<RxBufPool>,
    inner: Mutex<RxInner>,
    monitor: FaultMonitor,
    stats: RxStats,
}

impl RxChannel {
    /// Allocates both rings and the buffer pool, posts a full set of
    /// buffers and enables the channel.
    pub fn new(
        index: u16,
        hal: &Arc<dyn NicHal>,
        generation: Generation,
        cfg: RxConfig,
        hooks: FaultHooks,
    ) -> NicResult<Self> {
        cfg.validate()?;
        let inner = RxInner {
            ring: DescRing::new(cfg.ring_size, cfg.gap)?,
            bufs: DescArray::new(hal, cfg.ring_size)?,
            cbs: ControlBlockPool::new(cfg.ring_size),
            cpl: DescArray::new(hal, cfg.ring_size)?,
            cpl_head: 0,
            cpl_wrap: false,
            chain: Vec::new(),
            chain_len: 0,
            chain_bad: false,
            generation: 0,
        };
        let channel = Self {
            id: ChannelId::rx(index),
            hal: Arc::clone(hal),
            faults: generation.rx_faults(),
            pool: RxBufPool::new(hal, cfg.pool_bufs, cfg.buf_size)?,
            inner: Mutex::new(inner),
            monitor: FaultMonitor::new(hooks, cfg.fault_window_ms),
            stats: RxStats::default(),
            cfg,
        };
        channel.program(&mut channel.inner.lock())?;
        channel.mask_interrupts(false);
        channel.monitor.start();
        debug!(
            "{}: {} entries, {}-byte buffers",
            channel.id, channel.cfg.ring_size, channel.cfg.buf_size
        );
        Ok(channel)
    }

    #[inline]
    fn reg(&self, reg: usize) -> usize {
        regs::rx_reg(self.id.index as usize, reg)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> &RxConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &RxStats {
        &self.stats
    }

    pub fn monitor(&self) -> &FaultMonitor {
        &self.monitor
    }

    pub fn state(&self) -> ChannelState {
        self.monitor.state()
    }

    /// Current ring generation.
    pub fn generation(&self) -> u32 {
        self.inner.lock().generation
    }

    /// Buffer slots waiting for a replacement buffer.
    pub fn pending_replenish(&self) -> usize {
        self.inner.lock().ring.free_slots()
    }

    /// Buffers posted to the device.
    pub fn posted(&self) -> usize {
        self.inner.lock().ring.in_use()
    }

    /// Buffers left in the pool.
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Starts a poll of at most `budget` frames.
    ///
    /// The returned iterator yields frames lazily and may be dropped at any
    /// point; frames not yet taken stay on the ring for the next poll.
    /// Dropping it replenishes the buffer ring and tells the device how far
    /// the completion ring was consumed.
    ///
    /// The channel lock is taken per frame, never across a yield. If the
    /// channel is reinitialized meanwhile, the poll ends.
    pub fn poll(&self, budget: usize) -> RxPoll<'_> {
        let inner = self.inner.lock();
        if !self.monitor.is_running() {
            return RxPoll::empty(self);
        }
        let producer = regs::rx_cpl_tail(self.hal.read64(self.reg(regs::RDC_CTL_STAT)));
        if producer >= inner.cpl.len() {
            warn!("{}: completion tail {producer} outside the ring", self.id);
            bump(&self.stats.ierrors);
            return RxPoll::empty(self);
        }
        RxPoll {
            ch: self,
            generation: inner.generation,
            producer,
            budget,
            touched: false,
            live: true,
        }
    }

    /// Polls and hands every frame to `sink`. Returns the number delivered.
    pub fn service(&self, budget: usize, sink: &dyn Deliver) -> usize {
        let mut n = 0;
        for pkt in self.poll(budget) {
            sink.deliver(self.id, pkt);
            n += 1;
        }
        n
    }

    fn post(&self, inner: &mut RxInner, buf: RxBuf) -> NicResult {
        let res = inner.ring.reserve(1)?;
        {
            let slot = res.slot(0).ok_or(NicError::BadState)?;
            let entry = RxBufEntry::new(buf.paddr(), slot.index())?;
            inner.bufs.write(&slot, entry.0);
            inner.cbs.acquire(slot.index(), 1, Some(buf))?;
        }
        inner.ring.commit(res)?;
        Ok(())
    }

    /// Posts fresh buffers into every free slot the pool can cover. An empty
    /// pool defers the remaining slots; a buffer that cannot be described is
    /// an error.
    fn fill(&self, inner: &mut RxInner) -> NicResult<usize> {
        let mut posted = 0;
        while inner.ring.free_slots() > 0 {
            let Some(buf) = self.pool.alloc() else {
                bump(&self.stats.ierrors_alloc);
                debug!("{}: pool empty, {} slots deferred", self.id, inner.ring.free_slots());
                break;
            };
            self.post(inner, buf)?;
            posted += 1;
        }
        Ok(posted)
    }

    fn recycle(&self, inner: &mut RxInner, buf: RxBuf) {
        if let Err(err) = self.post(inner, buf) {
            warn!("{}: cannot repost buffer: {err}", self.id);
        }
    }

    fn replace(&self, inner: &mut RxInner) {
        match self.pool.alloc() {
            Some(buf) => self.recycle(inner, buf),
            None => bump(&self.stats.ierrors_alloc),
        }
    }

    fn drop_chain(&self, inner: &mut RxInner) {
        inner.chain.clear();
        inner.chain_len = 0;
    }

    /// Consumes one completion entry. Returns a frame when the entry ends
    /// one.
    fn consume(&self, inner: &mut RxInner) -> Option<RxPacket> {
        let cpl = RxCompletion(inner.cpl.read_acquire(inner.cpl_head));
        inner.cpl_head += 1;
        if inner.cpl_head == inner.cpl.len() {
            inner.cpl_head = 0;
            inner.cpl_wrap = !inner.cpl_wrap;
        }

        let taken = match inner.ring.retire(1) {
            Ok(_) => inner.cbs.complete(),
            Err(_) => None,
        };
        let buf = match taken {
            Some(Completed {
                slot,
                payload: Some(buf),
                ..
            }) => {
                if slot != cpl.slot() {
                    warn!("{}: completion for slot {} at slot {slot}", self.id, cpl.slot());
                }
                buf
            }
            _ => {
                error!("{}: completion without a posted buffer", self.id);
                bump(&self.stats.ierrors);
                self.drop_chain(inner);
                return None;
            }
        };

        let first = inner.chain.is_empty();
        let skip = if first { self.cfg.offset } else { 0 };
        // Every segment carries at least one byte past the offset.
        let malformed = cpl.len() > buf.capacity() || cpl.len() <= skip;
        if cpl.has_error() || malformed {
            bump(&self.stats.ierrors);
            debug!("{}: error entry {:#x}", self.id, cpl.0);
            self.drop_chain(inner);
            inner.chain_bad = cpl.more();
            self.recycle(inner, buf);
            return None;
        }
        if inner.chain_bad {
            inner.chain_bad = cpl.more();
            self.recycle(inner, buf);
            return None;
        }

        let len = cpl.len() - skip;
        if first && !cpl.more() && len <= self.cfg.copy_threshold {
            let data = buf.bytes(skip, len).to_vec();
            self.recycle(inner, buf);
            bump(&self.stats.copied);
            inner.chain.push(RxSegment::Copied(data));
        } else {
            inner.chain.push(RxSegment::Loaned {
                buf,
                offset: skip,
                len,
            });
            bump(&self.stats.loaned);
            self.replace(inner);
        }
        inner.chain_len += len;
        if cpl.more() {
            return None;
        }

        let segments = core::mem::take(&mut inner.chain);
        let len = core::mem::take(&mut inner.chain_len);
        if segments.len() > 1 {
            bump(&self.stats.chained);
        }
        bump(&self.stats.ipackets);
        add(&self.stats.ibytes, len as u64);
        trace!("{}: {len}-byte frame in {} segments", self.id, segments.len());
        Some(RxPacket {
            segments,
            len,
            generation: inner.generation,
            packet_type: cpl.packet_type(),
        })
    }

    fn kick(&self, inner: &RxInner) {
        let kick = RxKick {
            buf_tail: Some(inner.ring.tail_pos()),
            cpl_head: Some(RingPos {
                index: inner.cpl_head as u16,
                wrap: inner.cpl_wrap,
            }),
        };
        self.hal.write64(self.reg(regs::RDC_KICK), kick.encode());
    }

    fn finish(&self, inner: &mut RxInner, touched: bool) {
        let refill = self.fill(inner);
        if let Err(err) = refill {
            error!("{}: cannot post buffers: {err}", self.id);
        }
        if touched || refill != Ok(0) {
            inner.bufs.publish();
            self.kick(inner);
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
        self.hal.write64(self.reg(regs::RDC_INTR_DBG), row.mask);
        Ok(())
    }

    /// Stops the channel and takes back every posted buffer.
    pub fn disable(&self) {
        self.monitor.disable();
        self.mask_interrupts(true);
        self.hal.write64(self.reg(regs::RDC_CTL), 0);
        let mut inner = self.inner.lock();
        let posted = inner.cbs.release_all().count();
        inner.ring.reset();
        self.drop_chain(&mut inner);
        debug!("{}: disabled, {posted} buffers released", self.id);
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

    fn program(&self, inner: &mut RxInner) -> NicResult {
        let ctl = self.reg(regs::RDC_CTL);
        self.hal.write64(ctl, RxCtl::RST.bits());
        if !self.wait_for(ctl, RxCtl::RST.bits(), false, self.cfg.reset_retries) {
            warn!("{}: reset did not complete", self.id);
            return Err(NicError::Timeout);
        }
        self.hal.write64(
            self.reg(regs::RDC_BUF_CFG),
            regs::ring_cfg(inner.bufs.paddr(), self.cfg.ring_size),
        );
        self.hal.write64(
            self.reg(regs::RDC_CPL_CFG),
            regs::ring_cfg(inner.cpl.paddr(), self.cfg.ring_size),
        );
        self.hal.write64(
            self.reg(regs::RDC_BUF_SIZE),
            (self.cfg.buf_size as u64 & 0xffff) | (self.cfg.offset as u64) << 16,
        );
        self.hal.write64(self.reg(regs::RDC_CTL_STAT), RxErr::all().bits());

        let posted = self.fill(inner)?;
        if posted == 0 {
            warn!("{}: no buffers to post", self.id);
            return Err(NicError::NoMemory);
        }
        inner.bufs.publish();
        self.kick(inner);
        self.hal.write64(ctl, RxCtl::ENABLE.bits());
        trace!("{}: {posted} buffers posted", self.id);
        Ok(())
    }
}

impl ChannelOps for RxChannel {
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
        self.hal.read64(self.reg(regs::RDC_CTL_STAT))
    }

    fn clear_status(&self, bits: u64) {
        self.hal.write64(self.reg(regs::RDC_CTL_STAT), bits);
    }

    fn mask_interrupts(&self, masked: bool) {
        let mask = if masked { INTR_MASK_ALL } else { 0 };
        self.hal.write64(self.reg(regs::RDC_INTR_MASK), mask);
    }

    fn quiesce(&self) -> bool {
        let ctl = self.reg(regs::RDC_CTL);
        self.hal.write64(ctl, 0);
        self.wait_for(ctl, RxCtl::QUIESCED.bits(), true, self.cfg.quiesce_retries)
    }

    fn reinit(&self) -> NicResult {
        let mut inner = self.inner.lock();
        let released = inner.cbs.release_all().count();
        self.drop_chain(&mut inner);
        inner.chain_bad = false;
        inner.bufs.zero();
        inner.cpl.zero();
        inner.ring.reset();
        inner.cpl_head = 0;
        inner.cpl_wrap = false;
        inner.generation = inner.generation.wrapping_add(1);
        self.program(&mut inner)?;
        debug!(
            "{}: reinitialized as generation {}, {released} buffers released",
            self.id, inner.generation
        );
        Ok(())
    }
}

impl Drop for RxChannel {
    fn drop(&mut self) {
        if self.monitor.state() != ChannelState::Disabled {
            self.disable();
        }
    }
}

/// A bounded, restartable receive poll. See [`RxChannel::poll`].
pub struct RxPoll<'a> {
    ch: &'a RxChannel,
    // Ring generation the poll started in.
    generation: u32,
    producer: usize,
    budget: usize,
    touched: bool,
    live: bool,
}

impl<'a> RxPoll<'a> {
    fn empty(ch: &'a RxChannel) -> Self {
        Self {
            ch,
            generation: 0,
            producer: 0,
            budget: 0,
            touched: false,
            live: false,
        }
    }

    /// Locks the channel if the ring is still the one this poll started on.
    fn lock(&mut self) -> Option<spin::MutexGuard<'a, RxInner>> {
        if !self.live {
            return None;
        }
        let ch: &'a RxChannel = self.ch;
        let inner = ch.inner.lock();
        if inner.generation != self.generation || !self.ch.monitor.is_running() {
            self.live = false;
            return None;
        }
        Some(inner)
    }
}

impl Iterator for RxPoll<'_> {
    type Item = RxPacket;

    fn next(&mut self) -> Option<RxPacket> {
        let mut inner = self.lock()?;
        while self.budget > 0 && inner.cpl_head != self.producer {
            self.touched = true;
            if let Some(pkt) = self.ch.consume(&mut inner) {
                self.budget -= 1;
                return Some(pkt);
            }
        }
        None
    }
}

impl Drop for RxPoll<'_> {
    fn drop(&mut self) {
        let touched = self.touched;
        if let Some(mut inner) = self.lock() {
            self.ch.finish(&mut inner, touched);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use core::sync::atomic::{AtomicUsize, Ordering};

    use nic_base::mock::MockPlatform;
    use spin::Mutex as SpinMutex;

    use super::*;
    use crate::{generation::Gen2, sim::RxDevice};

    struct Rig {
        dev: RxDevice,
        ch: RxChannel,
    }

    fn rig(cfg: RxConfig) -> Rig {
        let mock = Arc::new(MockPlatform::new());
        let dev = RxDevice::attach(&mock, 0);
        let hal: Arc<dyn NicHal> = mock;
        let ch = RxChannel::new(0, &hal, Gen2.into(), cfg, FaultHooks::default()).unwrap();
        Rig { dev, ch }
    }

    fn small() -> RxConfig {
        RxConfig {
            ring_size: 8,
            gap: 1,
            pool_bufs: 16,
            ..RxConfig::default()
        }
    }

    fn frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[test]
    fn init_posts_all_but_the_gap() {
        let r = rig(small());
        assert_eq!(r.dev.posted(), 7);
        assert_eq!(r.ch.posted(), 7);
        assert_eq!(r.ch.pool_available(), 9);
        assert!(r.dev.is_enabled());
    }

    #[test]
    fn short_frame_is_copied() {
        let r = rig(small());
        let data = frame(100, 1);
        r.dev.receive(&data).unwrap();
        let pkts: Vec<_> = r.ch.poll(16).collect();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].to_vec(), data);
        assert!(!pkts[0].is_zero_copy());
        assert_eq!(r.dev.posted(), 7);
        assert_eq!(r.ch.pool_available(), 9);
        assert_eq!(r.dev.consumed_to().map(|p| p.index), Some(1));
    }

    #[test]
    fn long_frame_is_loaned_until_dropped() {
        let r = rig(small());
        let data = frame(1500, 2);
        r.dev.receive(&data).unwrap();
        let pkt = r.ch.poll(16).next().unwrap();
        assert!(pkt.is_zero_copy());
        assert_eq!(pkt.to_vec(), data);
        assert_eq!(r.ch.pool_available(), 8);
        assert_eq!(r.dev.posted(), 7);
        drop(pkt);
        assert_eq!(r.ch.pool_available(), 9);
    }

    #[test]
    fn jumbo_frame_spans_three_buffers() {
        let r = rig(RxConfig {
            buf_size: 4096,
            ..small()
        });
        let data = frame(9000, 3);
        let segs: Vec<&[u8]> = data.chunks(3000).collect();
        r.dev.receive_segments(&segs).unwrap();

        let pkts: Vec<_> = r.ch.poll(16).collect();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].len(), 9000);
        assert_eq!(pkts[0].segments().len(), 3);
        assert_eq!(pkts[0].to_vec(), data);
        let stats = r.ch.stats().snapshot();
        assert_eq!((stats.ipackets, stats.ibytes, stats.chained), (1, 9000, 1));
        assert_eq!(r.dev.posted(), 7);
    }

    #[test]
    fn error_entry_is_counted_and_replenished() {
        let r = rig(small());
        r.dev.receive_error(2).unwrap();
        assert_eq!(r.ch.poll(16).count(), 0);
        let stats = r.ch.stats().snapshot();
        assert_eq!(stats.ierrors, 1);
        assert_eq!(stats.ipackets, 0);
        assert_eq!(r.dev.posted(), 7);
        assert_eq!(r.ch.pool_available(), 9);
    }

    #[test]
    fn poll_respects_budget_and_resumes() {
        let r = rig(small());
        for i in 0..5 {
            r.dev.receive(&frame(64, i)).unwrap();
        }
        assert_eq!(r.ch.poll(2).count(), 2);
        let first = r.ch.poll(10).next().unwrap();
        assert_eq!(first.to_vec(), frame(64, 2));
        let rest: Vec<_> = r.ch.poll(10).map(|p| p.to_vec()).collect();
        assert_eq!(rest, [frame(64, 3), frame(64, 4)]);
        assert_eq!(r.ch.poll(10).count(), 0);
    }

    #[test]
    fn empty_pool_defers_replenish() {
        let r = rig(RxConfig {
            pool_bufs: 8,
            ..small()
        });
        for i in 0..3 {
            r.dev.receive(&frame(1000, i)).unwrap();
        }
        let held: Vec<_> = r.ch.poll(16).collect();
        assert_eq!(held.len(), 3);
        assert_eq!(r.ch.pending_replenish(), 2);
        assert_eq!(r.ch.stats().snapshot().ierrors_alloc, 3);
        assert_eq!(r.dev.posted(), 5);

        drop(held);
        assert_eq!(r.ch.poll(16).count(), 0);
        assert_eq!(r.ch.pending_replenish(), 0);
        assert_eq!(r.dev.posted(), 7);
    }

    #[test]
    fn offset_is_stripped_from_the_first_segment() {
        let r = rig(RxConfig {
            offset: 2,
            ..small()
        });
        let data = frame(300, 4);
        r.dev.receive(&data).unwrap();
        let pkt = r.ch.poll(1).next().unwrap();
        assert_eq!(pkt.len(), 300);
        assert_eq!(pkt.to_vec(), data);
    }

    #[test]
    fn recovery_bumps_generation() {
        let r = rig(small());
        r.dev.receive(&frame(1200, 5)).unwrap();
        let old = r.ch.poll(1).next().unwrap();
        assert_eq!(old.generation(), 0);

        r.dev.raise(RxErr::RBR_PRE_PAR);
        r.ch.check_faults().unwrap();
        assert_eq!(r.ch.monitor().resets(), 1);
        assert_eq!(r.ch.generation(), 1);
        assert_eq!(r.dev.posted(), 7);

        r.dev.receive(&frame(64, 6)).unwrap();
        let new = r.ch.poll(1).next().unwrap();
        assert_eq!(new.generation(), 1);
        assert_eq!(old.to_vec(), frame(1200, 5));
    }

    #[test]
    fn service_hands_frames_to_the_sink() {
        struct Sink(SpinMutex<Vec<(ChannelId, usize)>>);
        impl Deliver for Sink {
            fn deliver(&self, channel: ChannelId, packet: RxPacket) {
                self.0.lock().push((channel, packet.len()));
            }
        }
        let r = rig(small());
        r.dev.receive(&frame(70, 7)).unwrap();
        r.dev.receive(&frame(700, 8)).unwrap();
        let sink = Sink(SpinMutex::new(Vec::new()));
        assert_eq!(r.ch.service(8, &sink), 2);
        assert_eq!(*sink.0.lock(), [(ChannelId::rx(0), 70), (ChannelId::rx(0), 700)]);
    }

    #[test]
    fn channel_is_usable_while_a_poll_is_live() {
        let r = rig(small());
        for i in 0..3 {
            r.dev.receive(&frame(64, i)).unwrap();
        }
        let mut poll = r.ch.poll(8);
        let first = poll.next().unwrap();
        assert_eq!(first.generation(), r.ch.generation());
        assert_eq!(r.ch.posted(), 7);

        // A fault recovered from another context ends the poll.
        r.dev.raise(RxErr::RBR_PRE_PAR);
        assert!(r.ch.check_faults().unwrap().is_some());
        assert!(poll.next().is_none());
        drop(poll);
        assert_eq!(r.ch.generation(), 1);
        assert_eq!(r.dev.posted(), 7);
        assert_eq!(r.ch.pool_available(), 9);
    }

    #[test]
    fn sink_may_inspect_the_channel() {
        struct Checker<'a> {
            ch: &'a RxChannel,
            current: AtomicUsize,
        }
        impl Deliver for Checker<'_> {
            fn deliver(&self, _channel: ChannelId, packet: RxPacket) {
                if packet.generation() == self.ch.generation() {
                    self.current.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let r = rig(small());
        r.dev.receive(&frame(80, 1)).unwrap();
        r.dev.receive(&frame(800, 2)).unwrap();
        let sink = Checker {
            ch: &r.ch,
            current: AtomicUsize::new(0),
        };
        assert_eq!(r.ch.service(8, &sink), 2);
        assert_eq!(sink.current.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn empty_completion_is_dropped() {
        let r = rig(small());
        let empty: &[u8] = &[];
        r.dev.receive_segments(&[empty]).unwrap();
        r.dev.receive(&frame(64, 9)).unwrap();
        let got: Vec<_> = r.ch.poll(8).map(|p| p.to_vec()).collect();
        assert_eq!(got, [frame(64, 9)]);
        let stats = r.ch.stats().snapshot();
        assert_eq!((stats.ierrors, stats.ipackets), (1, 1));
        assert_eq!(r.dev.posted(), 7);
    }

    #[test]
    fn reinit_without_buffers_fails_instead_of_enabling() {
        let r = rig(RxConfig {
            pool_bufs: 7,
            ..small()
        });
        for i in 0..7 {
            r.dev.receive(&frame(1000, i)).unwrap();
        }
        let held: Vec<_> = r.ch.poll(16).collect();
        assert_eq!(held.len(), 7);
        assert_eq!(r.ch.pool_available(), 0);

        assert_eq!(r.ch.reset(), Err(NicError::NoMemory));
        assert_eq!(r.ch.state(), ChannelState::Disabled);
        assert!(!r.dev.is_enabled());
        drop(held);
    }

    #[test]
    fn copied_segments_concatenate() {
        let pkt = RxPacket {
            segments: vec![RxSegment::Copied(vec![1, 2]), RxSegment::Copied(vec![3])],
            len: 3,
            generation: 7,
            packet_type: 0,
        };
        assert_eq!(pkt.to_vec(), [1, 2, 3]);
        assert!(!pkt.is_zero_copy());
        assert_eq!(pkt.generation(), 7);
    }

    #[test]
    fn config_validation() {
        assert!(RxConfig::default().validate().is_ok());
        let short_pool = RxConfig {
            pool_bufs: 16,
            ..RxConfig::default()
        };
        assert_eq!(short_pool.validate(), Err(NicError::InvalidInput));
        let big_offset = RxConfig {
            offset: 300,
            ..RxConfig::default()
        };
        assert!(big_offset.validate().is_err());
    }
}
