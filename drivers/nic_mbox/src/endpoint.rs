// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! One side of a mailbox.
//!
//! ```text
//! Idle ──post──▶ Posted ──▶ AwaitingAck ──▶ Acked | Failed | TimedOut ──▶ Idle
//! ```
//!
//! Only one post may be outstanding. The outcome of the latest post stays
//! readable through [`Mailbox::last_outcome`] after the endpoint went back
//! to `Idle`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use log::{debug, trace, warn};
use nic_base::{NicError, NicHal, NicResult};
use strum::{FromRepr, IntoStaticStr};

use crate::{
    msg::MboxMsg,
    regs::{self, MboxEvents, MbxCtrl, MbxStatus},
};

/// Polling bounds of a mailbox.
#[derive(Debug, Clone, Copy)]
pub struct MboxConfig {
    pub retries: u32,
    pub delay_us: u64,
}

impl Default for MboxConfig {
    fn default() -> Self {
        Self {
            retries: 100,
            delay_us: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum MboxState {
    Idle,
    Posted,
    AwaitingAck,
}

/// How a post ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum PostOutcome {
    Acked = 1,
    Failed,
    TimedOut,
}

/// A mailbox endpoint: the outbound and inbound windows of one
/// physical/virtual function pair, seen from one side.
pub struct Mailbox {
    index: usize,
    base: usize,
    hal: Arc<dyn NicHal>,
    cfg: MboxConfig,
    state: AtomicU8,
    outcome: AtomicU8,
    seq: AtomicU8,
    inbound: AtomicBool,
    posts: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    received: AtomicU64,
}

impl Mailbox {
    /// Endpoint `index` with its register block at `base`.
    pub fn new(hal: &Arc<dyn NicHal>, index: usize, base: usize, cfg: MboxConfig) -> Self {
        let mbox = Self {
            index,
            base,
            hal: Arc::clone(hal),
            cfg,
            state: AtomicU8::new(MboxState::Idle as u8),
            outcome: AtomicU8::new(0),
            seq: AtomicU8::new(0),
            inbound: AtomicBool::new(false),
            posts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            received: AtomicU64::new(0),
        };
        mbox.set_interrupts(true);
        mbox
    }

    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    fn reg(&self, reg: usize) -> usize {
        self.base + reg
    }

    fn status(&self) -> MbxStatus {
        MbxStatus::from_bits_truncate(self.hal.read32(self.reg(regs::MBX_STATUS)))
    }

    fn ack_status(&self, bits: MbxStatus) {
        self.hal.write32(self.reg(regs::MBX_STATUS), bits.bits());
    }

    fn command(&self, cmd: MbxCtrl) {
        self.hal.write32(self.reg(regs::MBX_CTRL), cmd.bits());
    }

    pub fn state(&self) -> MboxState {
        MboxState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(MboxState::Idle)
    }

    fn set_state(&self, state: MboxState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn last_outcome(&self) -> Option<PostOutcome> {
        PostOutcome::from_repr(self.outcome.load(Ordering::Acquire))
    }

    /// `(posts, failures, timeouts, inbound messages)`.
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.posts.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }

    pub fn set_interrupts(&self, enabled: bool) {
        let mask = if enabled { 0 } else { u32::MAX };
        self.hal.write32(self.reg(regs::MBX_INTR_MASK), mask);
    }

    /// Sends `msg` and waits, bounded, for the peer's reply.
    ///
    /// Fails at once with [`NicError::ResourceBusy`] if the outbound window
    /// is still full or another post is outstanding. A NACK reply is
    /// returned as the error it carries.
    pub fn post(&self, msg: &MboxMsg) -> NicResult<MboxMsg> {
        if self
            .state
            .compare_exchange(
                MboxState::Idle as u8,
                MboxState::Posted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(NicError::ResourceBusy);
        }
        if self.status().contains(MbxStatus::OMB_FULL) {
            self.set_state(MboxState::Idle);
            return Err(NicError::ResourceBusy);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut msg = *msg;
        msg.set_seq(seq);
        msg.write_to(&*self.hal, self.reg(regs::MBX_OMB_DATA));
        self.command(MbxCtrl::POST);
        self.posts.fetch_add(1, Ordering::Relaxed);
        self.set_state(MboxState::AwaitingAck);
        trace!("mbox{}: posted {:#010x}", self.index, msg.words()[0]);

        let (outcome, result) = self.await_reply(seq);
        match outcome {
            PostOutcome::Acked => {}
            PostOutcome::Failed => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            PostOutcome::TimedOut => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.outcome.store(outcome as u8, Ordering::Release);
        self.set_state(MboxState::Idle);
        let name: &'static str = outcome.into();
        debug!("mbox{}: post {seq} {name}", self.index);
        result
    }

    fn await_reply(&self, seq: u8) -> (PostOutcome, NicResult<MboxMsg>) {
        for _ in 0..=self.cfg.retries {
            let status = self.status();
            if status.contains(MbxStatus::ACKED) {
                self.ack_status(MbxStatus::ACKED);
                let rsp = MboxMsg::read_from(&*self.hal, self.reg(regs::MBX_RSP_DATA));
                let header = rsp.header();
                if !header.is_response() || header.seq != seq {
                    warn!("mbox{}: stray reply {:#010x}", self.index, rsp.words()[0]);
                    return (PostOutcome::Failed, Err(NicError::BadState));
                }
                if header.is_nack() {
                    let err = NicError::from_code(rsp.payload().first().copied().unwrap_or(0));
                    warn!("mbox{}: NACK: {err}", self.index);
                    return (PostOutcome::Failed, Err(err));
                }
                return (PostOutcome::Acked, Ok(rsp));
            }
            if status.contains(MbxStatus::FAILED) {
                self.ack_status(MbxStatus::FAILED);
                warn!("mbox{}: peer refused message", self.index);
                return (PostOutcome::Failed, Err(NicError::Nack));
            }
            self.hal.delay_us(self.cfg.delay_us);
        }
        self.command(MbxCtrl::CANCEL);
        warn!("mbox{}: no reply after {} polls", self.index, self.cfg.retries);
        (PostOutcome::TimedOut, Err(NicError::Timeout))
    }

    /// Reads the status once for the interrupt handler. Acknowledges an
    /// inbound message and remembers it for [`Mailbox::take_inbound`]; post
    /// completion bits are left to the posting context.
    pub fn service_interrupt(&self) -> MboxEvents {
        let status = self.status();
        let mut events = MboxEvents::empty();
        events.set(MboxEvents::ACKED, status.contains(MbxStatus::ACKED));
        events.set(MboxEvents::FAILED, status.contains(MbxStatus::FAILED));
        if status.contains(MbxStatus::IMB_FULL) {
            self.ack_status(MbxStatus::IMB_FULL);
            self.inbound.store(true, Ordering::Release);
            events |= MboxEvents::INBOUND;
        }
        events
    }

    /// Takes the message waiting in the inbound window, if any. Every
    /// message taken must be answered with [`Mailbox::reply`].
    pub fn take_inbound(&self) -> Option<MboxMsg> {
        let mut pending = self.inbound.swap(false, Ordering::AcqRel);
        if !pending && self.status().contains(MbxStatus::IMB_FULL) {
            self.ack_status(MbxStatus::IMB_FULL);
            pending = true;
        }
        if !pending {
            return None;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        Some(MboxMsg::read_from(&*self.hal, self.reg(regs::MBX_IMB_DATA)))
    }

    /// Answers the message last taken.
    pub fn reply(&self, msg: &MboxMsg) {
        msg.write_to(&*self.hal, self.reg(regs::MBX_RPL_DATA));
        self.command(MbxCtrl::REPLY);
    }

    /// Resets the mailbox function and forgets any outstanding work.
    pub fn function_reset(&self) -> NicResult {
        self.command(MbxCtrl::FUNC_RST);
        for _ in 0..=self.cfg.retries {
            if self.status().contains(MbxStatus::FUNC_RST_DONE) {
                self.ack_status(MbxStatus::FUNC_RST_DONE);
                self.inbound.store(false, Ordering::Release);
                self.set_state(MboxState::Idle);
                debug!("mbox{}: function reset", self.index);
                return Ok(());
            }
            self.hal.delay_us(self.cfg.delay_us);
        }
        warn!("mbox{}: function reset did not complete", self.index);
        Err(NicError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use nic_base::mock::MockPlatform;

    use super::*;
    use crate::{
        msg::{MsgFlags, MsgType},
        sim::Peer,
    };

    fn endpoint(retries: u32) -> (Arc<MockPlatform>, Peer, Mailbox) {
        let mock = Arc::new(MockPlatform::new());
        let peer = Peer::attach(&mock, regs::mbox_base(0));
        let hal: Arc<dyn NicHal> = mock.clone();
        let cfg = MboxConfig {
            retries,
            delay_us: 10,
        };
        (mock, peer, Mailbox::new(&hal, 0, regs::mbox_base(0), cfg))
    }

    #[test]
    fn acked_post_returns_the_reply() {
        let (_mock, peer, mbox) = endpoint(100);
        peer.respond_with(|req| Some(req.ack(&[9000], MsgFlags::empty()).unwrap()));
        let req = MboxMsg::request(MsgType::GetMtu, &[]).unwrap();
        let rsp = mbox.post(&req).unwrap();
        assert_eq!(rsp.payload(), [9000]);
        assert_eq!(mbox.state(), MboxState::Idle);
        assert_eq!(mbox.last_outcome(), Some(PostOutcome::Acked));
        assert_eq!(peer.received().len(), 1);
    }

    #[test]
    fn unanswered_post_times_out_and_returns_to_idle() {
        let (_mock, peer, mbox) = endpoint(20);
        let req = MboxMsg::request(MsgType::SetMtu, &[1500]).unwrap();
        assert_eq!(mbox.post(&req), Err(NicError::Timeout));
        assert_eq!(mbox.state(), MboxState::Idle);
        assert_eq!(mbox.last_outcome(), Some(PostOutcome::TimedOut));
        assert!(!peer.outbound_full());

        peer.respond_with(|req| Some(req.ack(&[], MsgFlags::empty()).unwrap()));
        assert!(mbox.post(&req).is_ok());
        assert_eq!(mbox.counters(), (2, 0, 1, 0));
    }

    #[test]
    fn full_outbound_window_fails_immediately() {
        let (_mock, peer, mbox) = endpoint(100);
        peer.hold_outbound();
        let req = MboxMsg::request(MsgType::Reset, &[]).unwrap();
        assert_eq!(mbox.post(&req), Err(NicError::ResourceBusy));
        assert_eq!(mbox.state(), MboxState::Idle);
        assert_eq!(mbox.counters().0, 0);
    }

    #[test]
    fn nack_and_refusal_are_failures() {
        let (_mock, peer, mbox) = endpoint(100);
        peer.respond_with(|req| Some(req.nack(NicError::NoSpace)));
        let req = MboxMsg::request(MsgType::AddVlan, &[5]).unwrap();
        assert_eq!(mbox.post(&req), Err(NicError::NoSpace));
        assert_eq!(mbox.last_outcome(), Some(PostOutcome::Failed));

        peer.refuse();
        assert_eq!(mbox.post(&req), Err(NicError::Nack));
        assert_eq!(mbox.counters().1, 2);
    }

    #[test]
    fn inbound_message_is_taken_once() {
        let (_mock, peer, mbox) = endpoint(100);
        assert!(mbox.take_inbound().is_none());
        let req = MboxMsg::request(MsgType::GetMtu, &[]).unwrap();
        peer.deliver(&req);
        assert!(mbox.service_interrupt().contains(MboxEvents::INBOUND));
        let got = mbox.take_inbound().unwrap();
        assert_eq!(got.header().msg_type(), Some(MsgType::GetMtu));
        assert!(mbox.take_inbound().is_none());

        mbox.reply(&got.ack(&[1], MsgFlags::empty()).unwrap());
        assert_eq!(peer.replies().len(), 1);
    }

    #[test]
    fn function_reset_handshake() {
        let (_mock, _peer, mbox) = endpoint(5);
        assert!(mbox.function_reset().is_ok());
    }
}
