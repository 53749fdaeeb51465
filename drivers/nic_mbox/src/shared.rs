// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Adapter-wide state shared by every endpoint.
//!
//! Filter tables and the endpoint enable bits sit behind one lock. The same
//! lock holds the per-endpoint transaction flag that keeps at most one
//! mailbox exchange in flight for each physical/virtual function pair.

use alloc::{sync::Arc, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Waker},
};

use event_listener::{Event, listener};
use log::{debug, info, trace, warn};
use nic_base::{MacAddress, NicError, NicHal, NicResult};
use spin::Mutex;

use crate::{
    endpoint::MboxConfig,
    msg::API_V1,
    regs::{self, EpEnable},
};

/// Largest VLAN id.
pub const VLAN_MAX: u16 = 4095;
/// MTU an endpoint starts with and returns to on reset.
pub const DEFAULT_MTU: u32 = 1500;

/// Per-endpoint filter capacities and the allowed MTU range.
#[derive(Debug, Clone, Copy)]
pub struct FilterLimits {
    pub max_unicast: usize,
    pub max_multicast: usize,
    pub max_vlans: usize,
    pub mtu_min: u32,
    pub mtu_max: u32,
}

impl Default for FilterLimits {
    fn default() -> Self {
        Self {
            max_unicast: 16,
            max_multicast: 32,
            max_vlans: 32,
            mtu_min: 68,
            mtu_max: 9000,
        }
    }
}

/// Queues given to an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    pub tx: u32,
    pub rx: u32,
    pub default_queue: u32,
}

/// What the adapter hands out to one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointSetup {
    pub mac: MacAddress,
    pub queues: QueueAssignment,
}

/// Software filter state of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTable {
    pub base_mac: MacAddress,
    /// Station addresses added on top of `base_mac`.
    pub unicast: Vec<MacAddress>,
    pub multicast: Vec<MacAddress>,
    pub vlans: Vec<u16>,
    pub mtu: u32,
    pub enabled: EpEnable,
    pub api: u32,
    pub queues: QueueAssignment,
}

impl FilterTable {
    fn new(setup: &EndpointSetup) -> Self {
        Self {
            base_mac: setup.mac,
            unicast: Vec::new(),
            multicast: Vec::new(),
            vlans: Vec::new(),
            mtu: DEFAULT_MTU,
            enabled: EpEnable::empty(),
            api: API_V1,
            queues: setup.queues,
        }
    }

    fn clear(&mut self) {
        self.unicast.clear();
        self.multicast.clear();
        self.vlans.clear();
        self.mtu = DEFAULT_MTU;
        self.enabled = EpEnable::empty();
        self.api = API_V1;
    }
}

fn insert<T: PartialEq>(list: &mut Vec<T>, item: T, max: usize) -> NicResult {
    if list.contains(&item) {
        return Ok(());
    }
    if list.len() >= max {
        return Err(NicError::NoSpace);
    }
    list.push(item);
    Ok(())
}

fn remove<T: PartialEq>(list: &mut Vec<T>, item: &T) -> NicResult {
    let pos = list.iter().position(|x| x == item).ok_or(NicError::NotFound)?;
    list.swap_remove(pos);
    Ok(())
}

struct SharedState {
    tables: Vec<FilterTable>,
    in_flight: Vec<bool>,
}

/// The adapter context every mailbox component works against.
pub struct AdapterShared {
    hal: Arc<dyn NicHal>,
    limits: FilterLimits,
    gate: MboxConfig,
    state: Mutex<SharedState>,
    event: Event,
}

impl AdapterShared {
    pub fn new(
        hal: &Arc<dyn NicHal>,
        endpoints: &[EndpointSetup],
        limits: FilterLimits,
        gate: MboxConfig,
    ) -> NicResult<Self> {
        if limits.mtu_min == 0 || limits.mtu_min > limits.mtu_max {
            return Err(NicError::InvalidInput);
        }
        if endpoints.iter().any(|ep| !ep.mac.is_unicast()) {
            return Err(NicError::InvalidInput);
        }
        info!("mailbox: {} endpoints", endpoints.len());
        Ok(Self {
            hal: Arc::clone(hal),
            limits,
            gate,
            state: Mutex::new(SharedState {
                tables: endpoints.iter().map(FilterTable::new).collect(),
                in_flight: alloc::vec![false; endpoints.len()],
            }),
            event: Event::new(),
        })
    }

    pub fn endpoints(&self) -> usize {
        self.state.lock().tables.len()
    }

    pub fn limits(&self) -> &FilterLimits {
        &self.limits
    }

    fn with_table<R>(
        &self,
        ep: usize,
        f: impl FnOnce(&mut FilterTable, &FilterLimits) -> NicResult<R>,
    ) -> NicResult<R> {
        let mut state = self.state.lock();
        let table = state.tables.get_mut(ep).ok_or(NicError::InvalidInput)?;
        f(table, &self.limits)
    }

    /// A copy of the filter state of endpoint `ep`.
    pub fn filters(&self, ep: usize) -> NicResult<FilterTable> {
        self.with_table(ep, |t, _| Ok(t.clone()))
    }

    pub fn add_unicast(&self, ep: usize, mac: MacAddress) -> NicResult {
        if !mac.is_unicast() {
            return Err(NicError::InvalidInput);
        }
        self.with_table(ep, |t, l| {
            if mac == t.base_mac {
                return Ok(());
            }
            insert(&mut t.unicast, mac, l.max_unicast)
        })?;
        trace!("ep{ep}: +{mac}");
        Ok(())
    }

    /// The base address cannot be removed.
    pub fn remove_unicast(&self, ep: usize, mac: MacAddress) -> NicResult {
        self.with_table(ep, |t, _| {
            if mac == t.base_mac {
                return Err(NicError::InvalidInput);
            }
            remove(&mut t.unicast, &mac)
        })
    }

    pub fn add_multicast(&self, ep: usize, mac: MacAddress) -> NicResult {
        if !mac.is_multicast() {
            return Err(NicError::InvalidInput);
        }
        self.with_table(ep, |t, l| insert(&mut t.multicast, mac, l.max_multicast))
    }

    pub fn remove_multicast(&self, ep: usize, mac: MacAddress) -> NicResult {
        self.with_table(ep, |t, _| remove(&mut t.multicast, &mac))
    }

    pub fn add_vlan(&self, ep: usize, vid: u16) -> NicResult {
        if vid > VLAN_MAX {
            return Err(NicError::InvalidInput);
        }
        self.with_table(ep, |t, l| insert(&mut t.vlans, vid, l.max_vlans))
    }

    pub fn remove_vlan(&self, ep: usize, vid: u16) -> NicResult {
        if vid > VLAN_MAX {
            return Err(NicError::InvalidInput);
        }
        self.with_table(ep, |t, _| remove(&mut t.vlans, &vid))
    }

    /// `(current, min, max)`.
    pub fn mtu(&self, ep: usize) -> NicResult<(u32, u32, u32)> {
        self.with_table(ep, |t, l| Ok((t.mtu, l.mtu_min, l.mtu_max)))
    }

    pub fn set_mtu(&self, ep: usize, mtu: u32) -> NicResult {
        self.with_table(ep, |t, l| {
            if !(l.mtu_min..=l.mtu_max).contains(&mtu) {
                return Err(NicError::InvalidInput);
            }
            t.mtu = mtu;
            Ok(())
        })
    }

    /// Records the agreed API version of `ep`.
    pub fn set_api(&self, ep: usize, api: u32) -> NicResult {
        self.with_table(ep, |t, _| {
            t.api = api;
            Ok(())
        })
    }

    pub fn queues(&self, ep: usize) -> NicResult<(u32, QueueAssignment)> {
        self.with_table(ep, |t, _| Ok((t.api, t.queues)))
    }

    /// Drops every filter of `ep`, disables it, and returns its base
    /// address.
    pub fn reset_endpoint(&self, ep: usize) -> NicResult<MacAddress> {
        let mac = self.with_table(ep, |t, _| {
            t.clear();
            self.hal
                .write32(regs::mbox_base(ep) + regs::MBX_EP_ENABLE, 0);
            Ok(t.base_mac)
        })?;
        debug!("ep{ep}: reset, base address {mac}");
        Ok(mac)
    }

    /// Sets the transmit/receive enable bits of `ep`.
    pub fn set_enabled(&self, ep: usize, enable: EpEnable) -> NicResult {
        // The register write stays under the lock so the table and the
        // hardware never disagree.
        let mut state = self.state.lock();
        let table = state.tables.get_mut(ep).ok_or(NicError::InvalidInput)?;
        table.enabled = enable;
        self.hal
            .write32(regs::mbox_base(ep) + regs::MBX_EP_ENABLE, enable.bits());
        Ok(())
    }

    /// Whether a transaction with `ep` is in flight.
    pub fn in_flight(&self, ep: usize) -> bool {
        self.state.lock().in_flight.get(ep).copied().unwrap_or(false)
    }

    fn try_claim(&self, ep: usize) -> NicResult<bool> {
        let mut state = self.state.lock();
        let flag = state.in_flight.get_mut(ep).ok_or(NicError::InvalidInput)?;
        if *flag {
            return Ok(false);
        }
        *flag = true;
        Ok(true)
    }

    fn release(&self, ep: usize) {
        if let Some(flag) = self.state.lock().in_flight.get_mut(ep) {
            *flag = false;
        }
        self.event.notify(usize::MAX);
    }

    /// Claims the transaction slot of `ep`, waiting a bounded time for the
    /// current holder to release it.
    ///
    /// The wait listens for the release and polls the listener between
    /// delays, at most `retries` times in total.
    pub fn begin(&self, ep: usize) -> NicResult<Transaction<'_>> {
        let mut cx = Context::from_waker(Waker::noop());
        let mut polls = 0;
        loop {
            if self.try_claim(ep)? {
                return Ok(Transaction { shared: self, ep });
            }
            listener!(self.event => listener);
            if self.try_claim(ep)? {
                return Ok(Transaction { shared: self, ep });
            }
            while Pin::new(&mut listener).poll(&mut cx).is_pending() {
                if polls == self.gate.retries {
                    warn!("ep{ep}: mailbox transaction still in flight");
                    return Err(NicError::ResourceBusy);
                }
                polls += 1;
                self.hal.delay_us(self.gate.delay_us);
            }
            trace!("ep{ep}: transaction released, retrying");
        }
    }
}

/// An exchange with one endpoint; the slot is released on drop.
pub struct Transaction<'a> {
    shared: &'a AdapterShared,
    ep: usize,
}

impl Transaction<'_> {
    pub fn endpoint(&self) -> usize {
        self.ep
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.shared.release(self.ep);
    }
}
