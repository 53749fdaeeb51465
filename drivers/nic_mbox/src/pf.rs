// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Physical function side: answers virtual function requests.
//!
//! Every inbound message gets exactly one reply. A message is looked up in
//! a fixed handler table by type; its payload length must match the table
//! entry, otherwise it is NACKed with [`NicError::InvalidInput`] without
//! touching any state.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace, warn};
use nic_base::{MacAddress, NicError, NicHal, NicResult};

use crate::{
    DeferredWork,
    endpoint::{Mailbox, MboxConfig},
    msg::{API_V1, API_V2, Caps, MAX_API, MboxMsg, MsgFlags, MsgType},
    regs::{self, EpEnable, MboxEvents},
    shared::AdapterShared,
};

type Handler = fn(&AdapterShared, usize, &MboxMsg) -> NicResult<MboxMsg>;

/// `(type, payload words, handler)`.
const HANDLERS: &[(MsgType, usize, Handler)] = &[
    (MsgType::Reset, 0, on_reset),
    (MsgType::AddAddr, 2, on_add_addr),
    (MsgType::RemoveAddr, 2, on_remove_addr),
    (MsgType::AddMulticast, 2, on_add_multicast),
    (MsgType::RemoveMulticast, 2, on_remove_multicast),
    (MsgType::AddVlan, 1, on_add_vlan),
    (MsgType::RemoveVlan, 1, on_remove_vlan),
    (MsgType::GetMtu, 0, on_get_mtu),
    (MsgType::SetMtu, 1, on_set_mtu),
    (MsgType::QueryCaps, 1, on_query_caps),
    (MsgType::QueryQueues, 0, on_query_queues),
];

fn mac_arg(msg: &MboxMsg) -> MacAddress {
    let p = msg.payload();
    MacAddress::from_words([p[0], p[1]])
}

fn vid_arg(msg: &MboxMsg) -> NicResult<u16> {
    u16::try_from(msg.payload()[0]).map_err(|_| NicError::InvalidInput)
}

fn done(msg: &MboxMsg) -> NicResult<MboxMsg> {
    msg.ack(&[], MsgFlags::empty())
}

fn on_reset(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    let mac = shared.reset_endpoint(ep)?;
    shared.set_enabled(ep, EpEnable::TX | EpEnable::RX)?;
    msg.ack(&mac.to_words(), MsgFlags::CTS)
}

fn on_add_addr(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.add_unicast(ep, mac_arg(msg))?;
    done(msg)
}

fn on_remove_addr(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.remove_unicast(ep, mac_arg(msg))?;
    done(msg)
}

fn on_add_multicast(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.add_multicast(ep, mac_arg(msg))?;
    done(msg)
}

fn on_remove_multicast(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.remove_multicast(ep, mac_arg(msg))?;
    done(msg)
}

fn on_add_vlan(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.add_vlan(ep, vid_arg(msg)?)?;
    done(msg)
}

fn on_remove_vlan(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.remove_vlan(ep, vid_arg(msg)?)?;
    done(msg)
}

fn on_get_mtu(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    let (cur, min, max) = shared.mtu(ep)?;
    msg.ack(&[cur, min, max], MsgFlags::empty())
}

fn on_set_mtu(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    shared.set_mtu(ep, msg.payload()[0])?;
    done(msg)
}

/// Capabilities offered at API version `api`.
pub fn caps_for(api: u32) -> Caps {
    let mut caps = Caps::MULTICAST | Caps::VLAN | Caps::MTU;
    if api >= API_V2 {
        caps |= Caps::QUEUES;
    }
    caps
}

fn on_query_caps(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    let requested = msg.payload()[0];
    if requested < API_V1 {
        return Err(NicError::InvalidInput);
    }
    let api = requested.min(MAX_API);
    shared.set_api(ep, api)?;
    debug!("ep{ep}: api {requested} -> {api}");
    msg.ack(&[api, caps_for(api).bits()], MsgFlags::empty())
}

fn on_query_queues(shared: &AdapterShared, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
    let (api, q) = shared.queues(ep)?;
    if api < API_V2 {
        return Err(NicError::Unsupported);
    }
    msg.ack(&[q.tx, q.rx, q.default_queue], MsgFlags::empty())
}

/// The physical function's view of its mailboxes, one per virtual function.
pub struct PfMailbox {
    shared: Arc<AdapterShared>,
    endpoints: Vec<Mailbox>,
    deferred: Option<Arc<dyn DeferredWork>>,
    acks: AtomicU64,
    nacks: AtomicU64,
}

impl PfMailbox {
    /// One mailbox per endpoint of `shared`, at [`regs::mbox_base`].
    pub fn new(
        hal: &Arc<dyn NicHal>,
        shared: Arc<AdapterShared>,
        cfg: MboxConfig,
        deferred: Option<Arc<dyn DeferredWork>>,
    ) -> Self {
        let endpoints = (0..shared.endpoints())
            .map(|ep| Mailbox::new(hal, ep, regs::mbox_base(ep), cfg))
            .collect();
        Self {
            shared,
            endpoints,
            deferred,
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
        }
    }

    pub fn shared(&self) -> &Arc<AdapterShared> {
        &self.shared
    }

    pub fn endpoint(&self, ep: usize) -> NicResult<&Mailbox> {
        self.endpoints.get(ep).ok_or(NicError::InvalidInput)
    }

    /// `(acked, nacked)` inbound messages.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.acks.load(Ordering::Relaxed),
            self.nacks.load(Ordering::Relaxed),
        )
    }

    /// Runs `msg` from endpoint `ep` through the handler table and builds
    /// the reply. The caller must hold the endpoint's transaction.
    fn handle(&self, ep: usize, msg: &MboxMsg) -> MboxMsg {
        let header = msg.header();
        let result = match HANDLERS
            .iter()
            .find(|(kind, ..)| Some(*kind) == header.msg_type())
        {
            _ if header.is_response() => Err(NicError::InvalidInput),
            None => Err(NicError::InvalidInput),
            Some((_, len, _)) if *len != header.len => Err(NicError::InvalidInput),
            Some((_, _, handler)) => handler(&self.shared, ep, msg),
        };
        match result {
            Ok(rsp) => {
                self.acks.fetch_add(1, Ordering::Relaxed);
                trace!("ep{ep}: {:#04x} acked", header.kind);
                rsp
            }
            Err(err) => {
                self.nacks.fetch_add(1, Ordering::Relaxed);
                warn!("ep{ep}: {:#04x} nacked: {err}", header.kind);
                msg.nack(err)
            }
        }
    }

    /// Answers `msg` from endpoint `ep` inside a transaction.
    pub fn respond(&self, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
        let _tx = self.shared.begin(ep)?;
        Ok(self.handle(ep, msg))
    }

    /// Takes, answers and replies to the message waiting from `ep`. Returns
    /// whether there was one. Must not run in interrupt context.
    pub fn process_inbound(&self, ep: usize) -> NicResult<bool> {
        let mbox = self.endpoint(ep)?;
        let _tx = self.shared.begin(ep)?;
        let Some(msg) = mbox.take_inbound() else {
            return Ok(false);
        };
        let rsp = self.handle(ep, &msg);
        mbox.reply(&rsp);
        Ok(true)
    }

    /// Interrupt entry for endpoint `ep`. Inbound work is handed to the
    /// deferred-work collaborator.
    pub fn service_interrupt(&self, ep: usize) -> NicResult<MboxEvents> {
        let events = self.endpoint(ep)?.service_interrupt();
        if events.contains(MboxEvents::INBOUND) {
            match &self.deferred {
                Some(work) => work.schedule(ep),
                None => debug!("ep{ep}: inbound message left for polling"),
            }
        }
        Ok(events)
    }

    /// Sends a physical-function initiated message to `ep`.
    pub fn notify(&self, ep: usize, msg: &MboxMsg) -> NicResult<MboxMsg> {
        let mbox = self.endpoint(ep)?;
        let _tx = self.shared.begin(ep)?;
        mbox.post(msg)
    }

    /// Resets the mailbox function of `ep` and forgets its filters.
    pub fn function_reset(&self, ep: usize) -> NicResult {
        let mbox = self.endpoint(ep)?;
        let _tx = self.shared.begin(ep)?;
        mbox.function_reset()?;
        self.shared.reset_endpoint(ep)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;

    use nic_base::mock::MockPlatform;

    use super::*;
    use crate::{
        msg::MsgHeader,
        shared::{EndpointSetup, FilterLimits, QueueAssignment},
        sim::Peer,
    };

    const VF0: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x10]);

    #[derive(Default)]
    struct Recorder(AtomicUsize);

    impl DeferredWork for Recorder {
        fn schedule(&self, _endpoint: usize) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pf(deferred: Option<Arc<dyn DeferredWork>>) -> (Arc<MockPlatform>, Peer, PfMailbox) {
        let mock = Arc::new(MockPlatform::new());
        let peer = Peer::attach(&mock, regs::mbox_base(0));
        let hal: Arc<dyn NicHal> = mock.clone();
        let eps = [EndpointSetup {
            mac: VF0,
            queues: QueueAssignment {
                tx: 4,
                rx: 4,
                default_queue: 1,
            },
        }];
        let cfg = MboxConfig::default();
        let shared = AdapterShared::new(&hal, &eps, FilterLimits::default(), cfg).unwrap();
        let pf = PfMailbox::new(&hal, Arc::new(shared), cfg, deferred);
        (mock, peer, pf)
    }

    fn req(kind: MsgType, payload: &[u32]) -> MboxMsg {
        MboxMsg::request(kind, payload).unwrap()
    }

    #[test]
    fn reset_returns_base_address_and_enables() {
        let (mock, _peer, pf) = pf(None);
        pf.shared().add_vlan(0, 10).unwrap();
        let rsp = pf.respond(0, &req(MsgType::Reset, &[])).unwrap();
        let h = rsp.header();
        assert!(h.flags.contains(MsgFlags::ACK | MsgFlags::CTS));
        assert_eq!(MacAddress::from_words([rsp.payload()[0], rsp.payload()[1]]), VF0);
        assert!(pf.shared().filters(0).unwrap().vlans.is_empty());
        assert_eq!(
            mock.reg(regs::mbox_base(0) + regs::MBX_EP_ENABLE),
            (EpEnable::TX | EpEnable::RX).bits() as u64
        );
    }

    #[test]
    fn length_mismatch_is_nacked_without_side_effects() {
        let (_mock, _peer, pf) = pf(None);
        let rsp = pf.respond(0, &req(MsgType::AddVlan, &[5, 6])).unwrap();
        assert!(rsp.header().is_nack());
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::InvalidInput);
        assert!(pf.shared().filters(0).unwrap().vlans.is_empty());
        assert_eq!(pf.counters(), (0, 1));
    }

    #[test]
    fn unknown_type_and_stray_response_are_nacked() {
        let (_mock, _peer, pf) = pf(None);
        let unknown = MboxMsg::from_words({
            let mut w = [0; 16];
            w[0] = MsgHeader {
                kind: 0x7f,
                ..MsgHeader::default()
            }
            .encode();
            w
        });
        assert!(pf.respond(0, &unknown).unwrap().header().is_nack());
        let stray = req(MsgType::GetMtu, &[])
            .ack(&[], MsgFlags::empty())
            .unwrap();
        assert!(pf.respond(0, &stray).unwrap().header().is_nack());
    }

    #[test]
    fn filter_errors_map_to_nack_codes() {
        let (_mock, _peer, pf) = pf(None);
        let mcast = MacAddress([0x01, 0, 0x5e, 0, 0, 9]).to_words();
        let rsp = pf.respond(0, &req(MsgType::RemoveMulticast, &mcast)).unwrap();
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::NotFound);
        let rsp = pf.respond(0, &req(MsgType::AddAddr, &mcast)).unwrap();
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::InvalidInput);
        let rsp = pf.respond(0, &req(MsgType::SetMtu, &[20])).unwrap();
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::InvalidInput);
        let rsp = pf.respond(0, &req(MsgType::AddVlan, &[0x1_0000])).unwrap();
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::InvalidInput);
    }

    #[test]
    fn api_negotiation_gates_queue_query() {
        let (_mock, _peer, pf) = pf(None);
        let rsp = pf.respond(0, &req(MsgType::QueryQueues, &[])).unwrap();
        assert_eq!(NicError::from_code(rsp.payload()[0]), NicError::Unsupported);

        let rsp = pf.respond(0, &req(MsgType::QueryCaps, &[7])).unwrap();
        assert_eq!(rsp.payload()[0], MAX_API);
        assert!(Caps::from_bits_truncate(rsp.payload()[1]).contains(Caps::QUEUES));

        let rsp = pf.respond(0, &req(MsgType::QueryQueues, &[])).unwrap();
        assert_eq!(rsp.payload(), [4, 4, 1]);

        let rsp = pf.respond(0, &req(MsgType::QueryCaps, &[0])).unwrap();
        assert!(rsp.header().is_nack());
    }

    #[test]
    fn inbound_message_is_deferred_then_answered_once() {
        let work = Arc::new(Recorder::default());
        let (_mock, peer, pf) = pf(Some(work.clone()));
        peer.deliver(&req(MsgType::GetMtu, &[]));

        let events = pf.service_interrupt(0).unwrap();
        assert!(events.contains(MboxEvents::INBOUND));
        assert_eq!(work.0.load(Ordering::Relaxed), 1);
        assert!(peer.replies().is_empty());

        assert_eq!(pf.process_inbound(0), Ok(true));
        assert_eq!(pf.process_inbound(0), Ok(false));
        let replies = peer.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload(), [1500, 68, 9000]);
        assert!(!pf.shared().in_flight(0));
    }

    #[test]
    fn busy_endpoint_defers_inbound_processing() {
        let (_mock, peer, pf) = pf(None);
        peer.deliver(&req(MsgType::GetMtu, &[]));
        pf.service_interrupt(0).unwrap();
        {
            let _held = pf.shared().begin(0).unwrap();
            assert_eq!(pf.process_inbound(0), Err(NicError::ResourceBusy));
        }
        // The message was not lost.
        assert_eq!(pf.process_inbound(0), Ok(true));
        assert_eq!(peer.replies().len(), 1);
    }

    #[test]
    fn notify_posts_through_the_gate() {
        let (_mock, peer, pf) = pf(None);
        peer.respond_with(|m| Some(m.ack(&[], MsgFlags::empty()).unwrap()));
        assert!(pf.notify(0, &req(MsgType::Reset, &[])).is_ok());
        assert_eq!(peer.received().len(), 1);
        assert_eq!(pf.notify(3, &req(MsgType::Reset, &[])).err(), Some(NicError::InvalidInput));
    }

    #[test]
    fn function_reset_clears_the_endpoint() {
        let (_mock, _peer, pf) = pf(None);
        pf.shared().set_mtu(0, 3000).unwrap();
        pf.function_reset(0).unwrap();
        assert_eq!(pf.shared().mtu(0).unwrap().0, 1500);
    }
}
