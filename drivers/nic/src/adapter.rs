// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use alloc::{string::String, sync::Arc, vec::Vec};

use log::{debug, info, warn};
use nic_base::{DriverOps, MacAddress, NicError, NicHal, NicResult};
use nic_mbox::{
    AdapterShared, DeferredWork, EndpointSetup, MboxEvents, PfMailbox, VfClient, regs::mbox_base,
};
use nic_xdc::{
    AdapterReset, ChannelCaps, ChannelId, ChannelState, Decoded, Deliver, Direction, FaultHooks,
    FlowControl, Generation, HealthMonitor, RxChannel, RxPoll, RxSnapshot, SendOutcome, TxChannel,
    TxPacket, TxSnapshot,
};
use strum::IntoStaticStr;

use crate::config::AdapterConfig;

/// External collaborators of an adapter. All are optional.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Performs the full adapter reset on device-global faults.
    pub reset: Option<Arc<dyn AdapterReset>>,
    /// Is told about channels that keep faulting.
    pub health: Option<Arc<dyn HealthMonitor>>,
    /// Pauses and resumes senders on transmit backpressure.
    pub flow: Option<Arc<dyn FlowControl>>,
    /// Runs mailbox processing outside interrupt context.
    pub deferred: Option<Arc<dyn DeferredWork>>,
}

impl Collaborators {
    fn fault_hooks(&self) -> FaultHooks {
        FaultHooks {
            reset: self.reset.clone(),
            health: self.health.clone(),
        }
    }
}

/// The part this driver instance plays on a shared adapter.
#[derive(Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    /// Sole owner of the adapter; no mailbox.
    Standalone,
    /// Owns the adapter and answers the listed virtual functions.
    Physical(Vec<EndpointSetup>),
    /// A virtual function talking to its physical function.
    Virtual,
}

enum MailboxSide {
    None,
    Physical(PfMailbox),
    Virtual(VfClient),
}

/// What raised an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    Tx(u16),
    Rx(u16),
    Mailbox(usize),
}

/// Counters of every channel.
#[derive(Debug, Clone, Default)]
pub struct AdapterStats {
    pub tx: Vec<(ChannelId, TxSnapshot)>,
    pub rx: Vec<(ChannelId, RxSnapshot)>,
}

/// One NIC instance: its DMA channels, its mailbox side and its
/// collaborators.
///
/// Bring-up acquires channels and the mailbox in sequence; if a step fails
/// the pieces already built are dropped, which stops them and releases
/// their memory.
pub struct Adapter {
    name: String,
    irq: Option<usize>,
    generation: Generation,
    cfg: AdapterConfig,
    tx: Vec<TxChannel>,
    rx: Vec<RxChannel>,
    mbox: MailboxSide,
}

impl Adapter {
    pub fn new(
        name: &str,
        hal: &Arc<dyn NicHal>,
        revision: u8,
        cfg: AdapterConfig,
        role: Role,
        collab: Collaborators,
    ) -> NicResult<Self> {
        cfg.validate()?;
        let generation = Generation::from_revision(revision)?;
        let hooks = collab.fault_hooks();

        let tx = (0..cfg.tx_channels)
            .map(|i| {
                TxChannel::new(
                    i,
                    hal,
                    generation,
                    cfg.tx_config(),
                    hooks.clone(),
                    collab.flow.clone(),
                )
            })
            .collect::<NicResult<Vec<_>>>()?;
        let rx = (0..cfg.rx_channels)
            .map(|i| RxChannel::new(i, hal, generation, cfg.rx_config(), hooks.clone()))
            .collect::<NicResult<Vec<_>>>()?;

        let role_name: &'static str = (&role).into();
        let mbox = match role {
            Role::Standalone => MailboxSide::None,
            Role::Physical(endpoints) => {
                let shared = AdapterShared::new(
                    hal,
                    &endpoints,
                    cfg.filter_limits(),
                    cfg.mbox_config(),
                )?;
                MailboxSide::Physical(PfMailbox::new(
                    hal,
                    Arc::new(shared),
                    cfg.mbox_config(),
                    collab.deferred.clone(),
                ))
            }
            Role::Virtual => {
                MailboxSide::Virtual(VfClient::new(
                    hal,
                    mbox_base(0),
                    cfg.mbox_config(),
                    collab.deferred.clone(),
                ))
            }
        };

        info!(
            "{name}: {} generation, {} tx / {} rx channels, {role_name}",
            generation.name(),
            tx.len(),
            rx.len()
        );
        Ok(Self {
            name: name.into(),
            irq: None,
            generation,
            cfg,
            tx,
            rx,
            mbox,
        })
    }

    /// Records the interrupt line reported through [`DriverOps::irq`].
    pub fn with_irq(mut self, irq: usize) -> Self {
        self.irq = Some(irq);
        self
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.cfg
    }

    pub fn tx_channels(&self) -> usize {
        self.tx.len()
    }

    pub fn rx_channels(&self) -> usize {
        self.rx.len()
    }

    pub fn tx(&self, index: u16) -> NicResult<&TxChannel> {
        self.tx.get(index as usize).ok_or(NicError::InvalidInput)
    }

    pub fn rx(&self, index: u16) -> NicResult<&RxChannel> {
        self.rx.get(index as usize).ok_or(NicError::InvalidInput)
    }

    /// Transmit channel for a flow hash. Configuration guarantees at
    /// least one channel; an empty set still yields 0, which `send` rejects.
    pub fn select_tx(&self, hash: u32) -> u16 {
        (hash as usize).checked_rem(self.tx.len()).unwrap_or(0) as u16
    }

    pub fn send(&self, channel: u16, pkt: TxPacket) -> NicResult<SendOutcome> {
        self.tx(channel)?.send(pkt)
    }

    pub fn reclaim(&self, channel: u16) -> NicResult<usize> {
        self.tx(channel)?.reclaim()
    }

    pub fn poll(&self, channel: u16, budget: usize) -> NicResult<RxPoll<'_>> {
        Ok(self.rx(channel)?.poll(budget))
    }

    /// Polls receive channel `channel` into `sink`.
    pub fn service_rx(&self, channel: u16, budget: usize, sink: &dyn Deliver) -> NicResult<usize> {
        Ok(self.rx(channel)?.service(budget, sink))
    }

    /// Interrupt entry point.
    ///
    /// A transmit interrupt checks the channel status and reclaims. A
    /// receive interrupt only checks the status; frames are left for
    /// [`Adapter::poll`]. A mailbox interrupt acknowledges inbound work and
    /// hands it to the deferred-work collaborator. A virtual function
    /// without one answers the message right away.
    pub fn handle_irq(&self, source: IrqSource) -> NicResult {
        match source {
            IrqSource::Tx(i) => {
                let ch = self.tx(i)?;
                if ch.check_faults()?.is_none() {
                    ch.reclaim()?;
                }
            }
            IrqSource::Rx(i) => {
                self.rx(i)?.check_faults()?;
            }
            IrqSource::Mailbox(ep) => {
                let events = match &self.mbox {
                    MailboxSide::None => return Err(NicError::Unsupported),
                    MailboxSide::Physical(pf) => pf.service_interrupt(ep)?,
                    MailboxSide::Virtual(_) if ep != 0 => return Err(NicError::InvalidInput),
                    MailboxSide::Virtual(vf) => vf.service_interrupt()?,
                };
                if events.contains(MboxEvents::INBOUND) {
                    debug!("{}: mailbox {ep} inbound", self.name);
                }
            }
        }
        Ok(())
    }

    /// Checks the status word of every channel, as a periodic timer would
    /// when interrupts are unreliable. Returns the channels that reported a
    /// fault.
    pub fn check_faults(&self) -> Vec<(ChannelId, Decoded)> {
        let tx = self.tx.iter().map(|ch| (ch.id(), ch.check_faults()));
        let rx = self.rx.iter().map(|ch| (ch.id(), ch.check_faults()));
        tx.chain(rx)
            .filter_map(|(id, res)| match res {
                Ok(found) => found.map(|d| (id, d)),
                Err(err) => {
                    warn!("{id}: recovery failed: {err}");
                    None
                }
            })
            .collect()
    }

    fn state_of(&self, id: ChannelId) -> NicResult<ChannelState> {
        Ok(match id.dir {
            Direction::Tx => self.tx(id.index)?.state(),
            Direction::Rx => self.rx(id.index)?.state(),
        })
    }

    /// Reinitializes one channel. This is the entry point for the adapter
    /// reset collaborator and for stall detectors.
    ///
    /// A channel held after a device-global fault is taken through
    /// recovery; a running one is reset unconditionally.
    pub fn reset_channel(&self, id: ChannelId) -> NicResult {
        let held = self.state_of(id)? == ChannelState::FaultDetected;
        match (id.dir, held) {
            (Direction::Tx, true) => self.tx(id.index)?.recover(),
            (Direction::Tx, false) => self.tx(id.index)?.reset(),
            (Direction::Rx, true) => self.rx(id.index)?.recover(),
            (Direction::Rx, false) => self.rx(id.index)?.reset(),
        }
    }

    /// Physical function mailbox, if this instance is one.
    pub fn pf(&self) -> Option<&PfMailbox> {
        match &self.mbox {
            MailboxSide::Physical(pf) => Some(pf),
            _ => None,
        }
    }

    /// Virtual function client, if this instance is one.
    pub fn vf(&self) -> Option<&VfClient> {
        match &self.mbox {
            MailboxSide::Virtual(vf) => Some(vf),
            _ => None,
        }
    }

    /// Deferred mailbox work for endpoint `ep`. A virtual function only
    /// has endpoint 0. Returns whether a message was answered.
    pub fn process_mailbox(&self, ep: usize) -> NicResult<bool> {
        match &self.mbox {
            MailboxSide::None => Err(NicError::Unsupported),
            MailboxSide::Physical(pf) => pf.process_inbound(ep),
            MailboxSide::Virtual(_) if ep != 0 => Err(NicError::InvalidInput),
            MailboxSide::Virtual(vf) => vf.process_inbound(),
        }
    }

    /// Base address of endpoint `ep` as handed out by the physical function.
    pub fn endpoint_mac(&self, ep: usize) -> NicResult<MacAddress> {
        let pf = self.pf().ok_or(NicError::Unsupported)?;
        Ok(pf.shared().filters(ep)?.base_mac)
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            tx: self
                .tx
                .iter()
                .map(|ch| (ch.id(), ch.stats().snapshot()))
                .collect(),
            rx: self
                .rx
                .iter()
                .map(|ch| (ch.id(), ch.stats().snapshot()))
                .collect(),
        }
    }
}

impl DriverOps for Adapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn irq(&self) -> Option<usize> {
        self.irq
    }
}
