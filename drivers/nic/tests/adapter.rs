// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use nic::{
    Adapter, AdapterConfig, AdapterReset, ChannelId, ChannelState, Collaborators, DeferredWork,
    DriverOps, EndpointSetup, FaultKind, FaultSet, IrqSource, MacAddress, NicError, NicHal,
    QueueAssignment, Role, SendOutcome, TxPacket,
};
use nic_base::mock::MockPlatform;
use nic_mbox::{
    MboxMsg, MsgFlags, MsgType,
    regs::{self as mbx, mbox_base},
    sim::Peer,
};
use nic_xdc::{
    regs::{self as xdc, RxCtl},
    sim::{RxDevice, TxDevice},
};

const GEN1: u8 = 0x02;
const GEN2: u8 = 0x11;

fn small() -> AdapterConfig {
    AdapterConfig {
        tx_channels: 2,
        rx_channels: 2,
        tx_ring_size: 16,
        rx_ring_size: 16,
        ..AdapterConfig::default()
    }
}

struct Rig {
    mock: Arc<MockPlatform>,
    hal: Arc<dyn NicHal>,
    tx: Vec<TxDevice>,
    rx: Vec<RxDevice>,
}

fn rig(cfg: &AdapterConfig) -> Rig {
    let mock = Arc::new(MockPlatform::new());
    let tx = (0..cfg.tx_channels)
        .map(|i| TxDevice::attach(&mock, i))
        .collect();
    let rx = (0..cfg.rx_channels)
        .map(|i| RxDevice::attach(&mock, i))
        .collect();
    let hal: Arc<dyn NicHal> = mock.clone();
    Rig { mock, hal, tx, rx }
}

#[derive(Default)]
struct Escalations(Mutex<Vec<ChannelId>>);

impl AdapterReset for Escalations {
    fn escalate(&self, channel: ChannelId, _faults: FaultSet) {
        self.0.lock().unwrap().push(channel);
    }
}

#[derive(Default)]
struct Work(AtomicUsize);

impl DeferredWork for Work {
    fn schedule(&self, _endpoint: usize) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn frames_flow_on_every_channel() {
    let cfg = small();
    let r = rig(&cfg);
    let nic = Adapter::new(
        "nic0",
        &r.hal,
        GEN2,
        cfg,
        Role::Standalone,
        Collaborators::default(),
    )
    .unwrap()
    .with_irq(42);
    assert_eq!(nic.name(), "nic0");
    assert_eq!(nic.irq(), Some(42));
    assert_eq!((nic.tx_channels(), nic.rx_channels()), (2, 2));

    let ch = nic.select_tx(7);
    assert_eq!(ch, 1);
    for n in 0..3u8 {
        let out = nic.send(ch, TxPacket::from_slice(&[n; 128])).unwrap();
        assert_eq!(out, SendOutcome::Queued);
    }
    assert_eq!(r.tx[1].frames().len(), 3);
    assert_eq!(r.tx[0].pending(), 0);
    r.tx[1].complete_all();
    nic.handle_irq(IrqSource::Tx(1)).unwrap();
    assert_eq!(nic.tx(1).unwrap().control_blocks(), (16, 0));

    let frame: Vec<u8> = (0..1000).map(|_| fastrand::u8(..)).collect();
    r.rx[0].receive(&frame).unwrap();
    r.rx[0].receive(&[0x55; 64]).unwrap();
    nic.handle_irq(IrqSource::Rx(0)).unwrap();
    let got: Vec<Vec<u8>> = nic.poll(0, 8).unwrap().map(|p| p.to_vec()).collect();
    assert_eq!(got, [frame, vec![0x55; 64]]);

    let stats = nic.stats();
    assert_eq!(stats.tx[1].1.opackets, 3);
    assert_eq!(stats.tx[1].1.reclaimed, 3);
    assert_eq!(stats.rx[0].1.ipackets, 2);
    assert_eq!(stats.rx[1].1.ipackets, 0);
    assert_eq!(nic.send(9, TxPacket::from_slice(&[0; 64])).err(), Some(NicError::InvalidInput));
}

#[test]
fn failed_bring_up_releases_what_was_acquired() {
    let cfg = AdapterConfig {
        reset_retries: 5,
        ..small()
    };
    let mock = Arc::new(MockPlatform::new());
    TxDevice::attach(&mock, 0);
    TxDevice::attach(&mock, 1);
    RxDevice::attach(&mock, 0);
    // The second receive channel never leaves reset.
    mock.set_reg(xdc::rx_reg(1, xdc::RDC_CTL), RxCtl::RST.bits());
    let hal: Arc<dyn NicHal> = mock.clone();

    let res = Adapter::new("nic0", &hal, GEN1, cfg, Role::Standalone, Collaborators::default());
    assert_eq!(res.err(), Some(NicError::Timeout));
    assert_eq!(mock.live_dma_regions(), 0);
    assert_eq!(mock.live_mappings(), 0);
}

#[test]
fn bad_revision_or_config_is_refused_before_touching_hardware() {
    let r = rig(&small());
    let res = Adapter::new("x", &r.hal, 0x40, small(), Role::Standalone, Collaborators::default());
    assert_eq!(res.err(), Some(NicError::Unsupported));
    let bad = AdapterConfig {
        tx_ring_size: 24,
        ..small()
    };
    let res = Adapter::new("x", &r.hal, GEN1, bad, Role::Standalone, Collaborators::default());
    assert_eq!(res.err(), Some(NicError::InvalidInput));
    assert_eq!(r.mock.live_dma_regions(), 0);
}

#[test]
fn device_fault_waits_for_the_reset_collaborator() {
    let cfg = small();
    let r = rig(&cfg);
    let esc = Arc::new(Escalations::default());
    let collab = Collaborators {
        reset: Some(esc.clone()),
        ..Collaborators::default()
    };
    let nic = Adapter::new("nic0", &r.hal, GEN2, cfg, Role::Standalone, collab).unwrap();

    nic.tx(0).unwrap().inject_fault(FaultKind::PeuResponse).unwrap();
    nic.handle_irq(IrqSource::Tx(0)).unwrap();
    assert_eq!(*esc.0.lock().unwrap(), [ChannelId::tx(0)]);
    assert_eq!(nic.tx(0).unwrap().state(), ChannelState::FaultDetected);
    let out = nic.send(0, TxPacket::from_slice(&[1; 64])).unwrap();
    assert!(matches!(out, SendOutcome::Retry(_)));
    // The sibling keeps running.
    assert_eq!(nic.tx(1).unwrap().state(), ChannelState::Running);

    nic.reset_channel(ChannelId::tx(0)).unwrap();
    assert_eq!(nic.tx(0).unwrap().state(), ChannelState::Running);
    assert_eq!(nic.tx(0).unwrap().monitor().resets(), 1);
    let out = nic.send(0, TxPacket::from_slice(&[1; 64])).unwrap();
    assert_eq!(out, SendOutcome::Queued);
}

#[test]
fn periodic_check_recovers_local_faults() {
    let cfg = small();
    let r = rig(&cfg);
    let nic = Adapter::new("nic0", &r.hal, GEN1, cfg, Role::Standalone, Collaborators::default())
        .unwrap();
    assert!(nic.check_faults().is_empty());

    nic.rx(1)
        .unwrap()
        .inject_fault(FaultKind::CompletionShadowFull)
        .unwrap();
    let found = nic.check_faults();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, ChannelId::rx(1));
    let rx = nic.rx(1).unwrap();
    assert_eq!(rx.state(), ChannelState::Running);
    assert_eq!(rx.generation(), 1);
    assert_eq!(rx.posted(), 12);
    assert!(r.rx[1].is_enabled());

    // A watchdog reset of a running channel goes through the same path.
    nic.reset_channel(ChannelId::rx(0)).unwrap();
    assert_eq!(nic.rx(0).unwrap().generation(), 1);
    assert_eq!(
        nic.rx(0).unwrap().monitor().fault_count(FaultKind::Watchdog),
        1
    );
}

const VF0: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x01, 0x00]);
const VF1: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x01, 0x01]);

fn endpoints() -> Vec<EndpointSetup> {
    vec![
        EndpointSetup {
            mac: VF0,
            queues: QueueAssignment {
                tx: 1,
                rx: 1,
                default_queue: 0,
            },
        },
        EndpointSetup {
            mac: VF1,
            queues: QueueAssignment {
                tx: 2,
                rx: 2,
                default_queue: 1,
            },
        },
    ]
}

#[test]
fn pf_answers_inbound_reset_from_deferred_work() {
    let cfg = small();
    let r = rig(&cfg);
    let peer = Peer::attach(&r.mock, mbox_base(1));
    let work = Arc::new(Work::default());
    let collab = Collaborators {
        deferred: Some(work.clone()),
        ..Collaborators::default()
    };
    let nic = Adapter::new("pf0", &r.hal, GEN2, cfg, Role::Physical(endpoints()), collab).unwrap();
    assert_eq!(nic.endpoint_mac(1), Ok(VF1));

    peer.deliver(&MboxMsg::request(MsgType::Reset, &[]).unwrap());
    nic.handle_irq(IrqSource::Mailbox(1)).unwrap();
    assert_eq!(work.0.load(Ordering::Relaxed), 1);
    assert!(peer.replies().is_empty());

    assert_eq!(nic.process_mailbox(1), Ok(true));
    let reply = peer.replies()[0];
    assert!(reply.header().flags.contains(MsgFlags::ACK | MsgFlags::CTS));
    assert_eq!(
        MacAddress::from_words([reply.payload()[0], reply.payload()[1]]),
        VF1
    );
    assert_eq!(r.mock.reg(mbox_base(1) + mbx::MBX_EP_ENABLE), 3);
    assert_eq!(nic.process_mailbox(1), Ok(false));
    assert_eq!(nic.pf().unwrap().counters(), (1, 0));
}

#[test]
fn vf_configures_itself_through_the_pf() {
    let cfg = small();
    let pf_rig = rig(&cfg);
    let pf = Arc::new(
        Adapter::new(
            "pf0",
            &pf_rig.hal,
            GEN2,
            cfg.clone(),
            Role::Physical(endpoints()),
            Collaborators::default(),
        )
        .unwrap(),
    );

    let vf_rig = rig(&cfg);
    let wire = Peer::attach(&vf_rig.mock, mbox_base(0));
    let answering = Arc::clone(&pf);
    wire.respond_with(move |msg| answering.pf()?.respond(1, &msg).ok());
    let vf_nic = Adapter::new(
        "vf1",
        &vf_rig.hal,
        GEN2,
        cfg,
        Role::Virtual,
        Collaborators::default(),
    )
    .unwrap();
    let vf = vf_nic.vf().unwrap();

    assert_eq!(vf.reset(), Ok(VF1));
    vf.add_vlan(100).unwrap();
    vf.add_multicast(MacAddress([0x01, 0x00, 0x5e, 0, 0, 1]))
        .unwrap();
    vf.set_mtu(9000).unwrap();
    assert_eq!(vf.set_mtu(60), Err(NicError::InvalidInput));
    assert_eq!(vf.remove_addr(VF0), Err(NicError::NotFound));
    let (api, _) = vf.negotiate().unwrap();
    assert_eq!(api, 2);
    assert_eq!(vf.query_queues().unwrap().default_queue, 1);

    let table = pf.pf().unwrap().shared().filters(1).unwrap();
    assert_eq!(table.vlans, [100]);
    assert_eq!(table.mtu, 9000);
    assert!(pf.pf().unwrap().shared().filters(0).unwrap().vlans.is_empty());
    assert_eq!(vf_nic.process_mailbox(0), Ok(false));
    assert_eq!(vf_nic.process_mailbox(1), Err(NicError::InvalidInput));
}

#[test]
fn vf_answers_pf_messages_from_its_interrupt() {
    let cfg = small();
    let r = rig(&cfg);
    let wire = Peer::attach(&r.mock, mbox_base(0));
    let vf_nic = Adapter::new(
        "vf1",
        &r.hal,
        GEN2,
        cfg,
        Role::Virtual,
        Collaborators::default(),
    )
    .unwrap();

    wire.deliver(&MboxMsg::request(MsgType::Reset, &[]).unwrap());
    vf_nic.handle_irq(IrqSource::Mailbox(0)).unwrap();
    wire.deliver(&MboxMsg::request(MsgType::PfControl, &[]).unwrap());
    vf_nic.handle_irq(IrqSource::Mailbox(0)).unwrap();

    let replies = wire.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies[0].header().is_nack(), "not a message a PF sends");
    assert!(replies[1].header().flags.contains(MsgFlags::ACK));
    let vf = vf_nic.vf().unwrap();
    assert!(vf.reset_pending());
    assert_eq!(vf.inbound_counters(), (1, 1));
    assert_eq!(
        vf_nic.handle_irq(IrqSource::Mailbox(1)),
        Err(NicError::InvalidInput)
    );
}

#[test]
fn vf_inbound_goes_to_deferred_work_when_present() {
    let cfg = small();
    let r = rig(&cfg);
    let wire = Peer::attach(&r.mock, mbox_base(0));
    let work = Arc::new(Work::default());
    let collab = Collaborators {
        deferred: Some(work.clone()),
        ..Collaborators::default()
    };
    let vf_nic = Adapter::new("vf1", &r.hal, GEN2, cfg, Role::Virtual, collab).unwrap();

    wire.deliver(&MboxMsg::request(MsgType::PfControl, &[]).unwrap());
    vf_nic.handle_irq(IrqSource::Mailbox(0)).unwrap();
    assert_eq!(work.0.load(Ordering::Relaxed), 1);
    assert!(wire.replies().is_empty());

    assert_eq!(vf_nic.process_mailbox(0), Ok(true));
    assert_eq!(wire.replies().len(), 1);
    assert!(vf_nic.vf().unwrap().reset_pending());
}

#[test]
fn flow_hashes_stay_within_the_channels() {
    let cfg = AdapterConfig {
        tx_channels: 3,
        ..small()
    };
    let r = rig(&cfg);
    let nic = Adapter::new("nic0", &r.hal, GEN1, cfg, Role::Standalone, Collaborators::default())
        .unwrap();
    let hashes = [0, 2, 3, u32::MAX].into_iter();
    for hash in hashes.chain((0..64).map(|_| fastrand::u32(..))) {
        assert_eq!(u32::from(nic.select_tx(hash)), hash % 3);
    }
}

#[test]
fn standalone_adapter_has_no_mailbox() {
    let cfg = small();
    let r = rig(&cfg);
    let nic = Adapter::new("nic0", &r.hal, GEN1, cfg, Role::Standalone, Collaborators::default())
        .unwrap();
    assert!(nic.pf().is_none() && nic.vf().is_none());
    assert_eq!(
        nic.handle_irq(IrqSource::Mailbox(0)),
        Err(NicError::Unsupported)
    );
}
