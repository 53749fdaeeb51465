// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Virtual function side: the request surface, plus answers to the few
//! messages the physical function initiates.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use nic_base::{MacAddress, NicError, NicHal, NicResult};
use spin::Mutex;

use crate::{
    DeferredWork,
    endpoint::{Mailbox, MboxConfig},
    msg::{API_V1, API_V2, Caps, MAX_API, MboxMsg, MsgFlags, MsgType},
    regs::MboxEvents,
    shared::QueueAssignment,
};

/// MTU as reported by the physical function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuInfo {
    pub current: u32,
    pub min: u32,
    pub max: u32,
}

/// A virtual function talking to its physical function.
pub struct VfClient {
    mbox: Mailbox,
    api: AtomicU32,
    mac: Mutex<Option<MacAddress>>,
    reset_pending: AtomicBool,
    deferred: Option<Arc<dyn DeferredWork>>,
    acks: AtomicU64,
    nacks: AtomicU64,
}

impl VfClient {
    /// Inbound messages found by [`VfClient::service_interrupt`] go to
    /// `deferred` when given; otherwise they are answered on the spot.
    pub fn new(
        hal: &Arc<dyn NicHal>,
        base: usize,
        cfg: MboxConfig,
        deferred: Option<Arc<dyn DeferredWork>>,
    ) -> Self {
        Self {
            mbox: Mailbox::new(hal, 0, base, cfg),
            api: AtomicU32::new(API_V1),
            mac: Mutex::new(None),
            reset_pending: AtomicBool::new(false),
            deferred,
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mbox
    }

    /// Base address from the last successful reset.
    pub fn mac(&self) -> Option<MacAddress> {
        *self.mac.lock()
    }

    pub fn api(&self) -> u32 {
        self.api.load(Ordering::Relaxed)
    }

    /// Whether the physical function announced a reset we have not yet
    /// followed with [`VfClient::reset`].
    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    /// `(acks, nacks)` sent for inbound messages.
    pub fn inbound_counters(&self) -> (u64, u64) {
        (
            self.acks.load(Ordering::Relaxed),
            self.nacks.load(Ordering::Relaxed),
        )
    }

    fn handle(&self, msg: &MboxMsg) -> MboxMsg {
        let header = msg.header();
        let result = match header.msg_type() {
            _ if header.is_response() => Err(NicError::InvalidInput),
            Some(MsgType::PfControl) if header.len == 0 => {
                // Filters and the address go with the reset.
                self.reset_pending.store(true, Ordering::Release);
                *self.mac.lock() = None;
                msg.ack(&[], MsgFlags::empty())
            }
            _ => Err(NicError::InvalidInput),
        };
        match result {
            Ok(rsp) => {
                self.acks.fetch_add(1, Ordering::Relaxed);
                trace!("vf: {:#04x} acked", header.kind);
                rsp
            }
            Err(err) => {
                self.nacks.fetch_add(1, Ordering::Relaxed);
                warn!("vf: {:#04x} nacked: {err}", header.kind);
                msg.nack(err)
            }
        }
    }

    /// Answers the message in the inbound window, if any. Returns whether
    /// one was there.
    pub fn process_inbound(&self) -> NicResult<bool> {
        let Some(msg) = self.mbox.take_inbound() else {
            return Ok(false);
        };
        let rsp = self.handle(&msg);
        self.mbox.reply(&rsp);
        Ok(true)
    }

    /// Interrupt entry. Answering never waits, so without a deferred-work
    /// collaborator the inbound message is handled here.
    pub fn service_interrupt(&self) -> NicResult<MboxEvents> {
        let events = self.mbox.service_interrupt();
        if events.contains(MboxEvents::INBOUND) {
            match &self.deferred {
                Some(work) => work.schedule(0),
                None => {
                    debug!("vf: answering inbound message from interrupt");
                    self.process_inbound()?;
                }
            }
        }
        Ok(events)
    }

    fn request(&self, kind: MsgType, payload: &[u32]) -> NicResult<MboxMsg> {
        self.mbox.post(&MboxMsg::request(kind, payload)?)
    }

    fn reply_words<const N: usize>(rsp: &MboxMsg) -> NicResult<[u32; N]> {
        rsp.payload()
            .get(..N)
            .and_then(|p| p.try_into().ok())
            .ok_or(NicError::BadState)
    }

    /// Resets our function on the physical side and learns the base address.
    pub fn reset(&self) -> NicResult<MacAddress> {
        let rsp = self.request(MsgType::Reset, &[])?;
        if !rsp.header().flags.contains(MsgFlags::CTS) {
            return Err(NicError::BadState);
        }
        let mac = MacAddress::from_words(Self::reply_words(&rsp)?);
        *self.mac.lock() = Some(mac);
        self.api.store(API_V1, Ordering::Relaxed);
        self.reset_pending.store(false, Ordering::Release);
        info!("vf: reset, address {mac}");
        Ok(mac)
    }

    pub fn add_addr(&self, mac: MacAddress) -> NicResult {
        self.request(MsgType::AddAddr, &mac.to_words()).map(drop)
    }

    pub fn remove_addr(&self, mac: MacAddress) -> NicResult {
        self.request(MsgType::RemoveAddr, &mac.to_words()).map(drop)
    }

    pub fn add_multicast(&self, mac: MacAddress) -> NicResult {
        self.request(MsgType::AddMulticast, &mac.to_words()).map(drop)
    }

    pub fn remove_multicast(&self, mac: MacAddress) -> NicResult {
        self.request(MsgType::RemoveMulticast, &mac.to_words())
            .map(drop)
    }

    pub fn add_vlan(&self, vid: u16) -> NicResult {
        self.request(MsgType::AddVlan, &[vid as u32]).map(drop)
    }

    pub fn remove_vlan(&self, vid: u16) -> NicResult {
        self.request(MsgType::RemoveVlan, &[vid as u32]).map(drop)
    }

    pub fn get_mtu(&self) -> NicResult<MtuInfo> {
        let [current, min, max] = Self::reply_words(&self.request(MsgType::GetMtu, &[])?)?;
        Ok(MtuInfo { current, min, max })
    }

    pub fn set_mtu(&self, mtu: u32) -> NicResult {
        self.request(MsgType::SetMtu, &[mtu]).map(drop)
    }

    /// Agrees on the highest API version both sides speak.
    pub fn negotiate(&self) -> NicResult<(u32, Caps)> {
        let [api, caps] = Self::reply_words(&self.request(MsgType::QueryCaps, &[MAX_API])?)?;
        if !(API_V1..=MAX_API).contains(&api) {
            return Err(NicError::BadState);
        }
        self.api.store(api, Ordering::Relaxed);
        Ok((api, Caps::from_bits_truncate(caps)))
    }

    /// Needs API version 2; call [`VfClient::negotiate`] first.
    pub fn query_queues(&self) -> NicResult<QueueAssignment> {
        if self.api() < API_V2 {
            return Err(NicError::Unsupported);
        }
        let [tx, rx, default_queue] = Self::reply_words(&self.request(MsgType::QueryQueues, &[])?)?;
        Ok(QueueAssignment {
            tx,
            rx,
            default_queue,
        })
    }
}
