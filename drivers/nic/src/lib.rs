// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A multi-channel NIC instance.
//!
//! [`Adapter`] ties together the DMA channels of [`nic_xdc`], the mailbox of
//! [`nic_mbox`] and the collaborators the host provides. It is the surface a
//! network stack binds to: send, poll, reclaim, interrupt dispatch, channel
//! reset and statistics.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod adapter;
pub mod config;

pub use self::{
    adapter::{Adapter, AdapterStats, Collaborators, IrqSource, Role},
    config::AdapterConfig,
};
#[doc(no_inline)]
pub use nic_base::{DriverOps, MacAddress, NicError, NicHal, NicResult};
#[doc(no_inline)]
pub use nic_mbox::{DeferredWork, EndpointSetup, PfMailbox, QueueAssignment, VfClient};
#[doc(no_inline)]
pub use nic_xdc::{
    AdapterReset, ChannelId, ChannelState, Deliver, FaultKind, FaultSet, FlowControl,
    HealthMonitor, RxPacket, SendOutcome, TxPacket,
};
